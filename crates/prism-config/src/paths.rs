use std::path::PathBuf;

use directories::ProjectDirs;

pub const CONFIG_FILE: &str = "config.toml";

/// Resolve the config file path.
///
/// A `config.toml` next to the executable wins (portable mode); otherwise
/// the platform config dir is used.
pub fn config_path() -> PathBuf {
    portable_path()
        .filter(|p| p.is_file())
        .unwrap_or_else(platform_path)
}

fn portable_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join(CONFIG_FILE))
}

fn platform_path() -> PathBuf {
    ProjectDirs::from("org", "prism", "prism-desktop").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push(CONFIG_FILE);
            p
        },
        |dirs| dirs.config_dir().join(CONFIG_FILE),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("prism-desktop");
    p
}
