mod cli;
mod commands;
mod error;
mod output;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use prism_config::{ConfigStore, KeyringStore};

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The guard flushes the log file on drop; keep it for the whole run.
    let _guard = match init_tracing(cli.global.verbose, cli.command.log_file()) {
        Ok(guard) => guard,
        Err(err) => exit_with(err),
    };

    if let Err(err) = run(cli).await {
        exit_with(err);
    }
}

fn exit_with(err: CliError) -> ! {
    let code = err.exit_code();
    eprintln!("{:?}", miette::Report::new(err));
    std::process::exit(code);
}

fn init_tracing(verbosity: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>, CliError> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let name = path.file_name().ok_or_else(|| CliError::Validation {
                field: "--log-file".into(),
                reason: format!("{} is not a file path", path.display()),
            })?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr)
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let store = match &cli.global.config {
        Some(path) => ConfigStore::new(path.clone(), Arc::new(KeyringStore::default())),
        None => ConfigStore::open_default(),
    };
    tracing::debug!(path = %store.path().display(), "dispatching command");

    match cli.command {
        // Offline commands only touch the config file
        Command::Config(args) => commands::config_cmd::handle(args, &store, &cli.global),
        Command::Layout(args) => commands::layout::handle(args, &store, &cli.global),
        Command::Shortcut(args) => commands::shortcut::handle(args, &store, &cli.global),

        // Live commands open a hub session
        Command::Watch(args) => commands::watch::handle(args, &store, &cli.global).await,
        Command::Press(args) => commands::press::handle(args, &store, &cli.global).await,
    }
}
