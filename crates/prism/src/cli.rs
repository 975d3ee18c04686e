//! Clap derive structures for the `prism` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// prism -- drive a Home Assistant dashboard from the terminal
#[derive(Debug, Parser)]
#[command(
    name = "prism",
    version,
    about = "Home Assistant dashboard from the command line",
    long_about = "Edit the Prism Desktop dashboard layout and shortcuts, watch hub state\n\
        and fire widgets without opening the desktop app.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file to use instead of the default location
    #[arg(long, env = "PRISM_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the config file and hub credentials
    Config(ConfigArgs),

    /// Show and edit the dashboard grid
    #[command(alias = "l")]
    Layout(LayoutArgs),

    /// Manage global keyboard shortcuts
    #[command(alias = "sc")]
    Shortcut(ShortcutArgs),

    /// Connect and log hub activity until Ctrl-C
    Watch(WatchArgs),

    /// Activate a widget (by id or shortcut) and report the outcome
    Press(PressArgs),
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a fresh config for a hub
    Init {
        /// Hub base URL, e.g. http://homeassistant.local:8123
        #[arg(long)]
        url: String,

        /// Long-lived access token (stored in the OS keyring)
        #[arg(long, env = "PRISM_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Replace an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the config with the token masked
    Show,

    /// Print the config file location
    Path,
}

// ── Layout ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct LayoutArgs {
    #[command(subcommand)]
    pub command: LayoutCommand,
}

#[derive(Debug, Subcommand)]
pub enum LayoutCommand {
    /// List widgets on the grid
    #[command(alias = "ls")]
    Show,

    /// Place a widget for an entity
    Add {
        /// Entity id, e.g. light.kitchen
        entity: String,
        col: u16,
        row: u16,
        #[arg(long, default_value_t = 1)]
        width: u16,
        #[arg(long, default_value_t = 1)]
        height: u16,
        /// Label shown instead of the entity name
        #[arg(long)]
        label: Option<String>,
    },

    /// Move a widget to another cell
    #[command(alias = "mv")]
    Move {
        /// Widget id or unique prefix
        widget: String,
        col: u16,
        row: u16,
    },

    /// Change a widget's span
    Resize {
        /// Widget id or unique prefix
        widget: String,
        width: u16,
        height: u16,
    },

    /// Remove a widget and its shortcut
    #[command(alias = "rm")]
    Remove {
        /// Widget id or unique prefix
        widget: String,
    },

    /// Copy a widget into the first free slot
    #[command(alias = "dup")]
    Duplicate {
        /// Widget id or unique prefix
        widget: String,
    },

    /// Resize the grid
    Grid { cols: u16, rows: u16 },

    /// Set a widget's label, or clear it when omitted
    Label {
        /// Widget id or unique prefix
        widget: String,
        label: Option<String>,
    },
}

// ── Shortcuts ────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ShortcutArgs {
    #[command(subcommand)]
    pub command: ShortcutCommand,
}

#[derive(Debug, Subcommand)]
pub enum ShortcutCommand {
    /// List bound shortcuts
    #[command(alias = "ls")]
    List,

    /// Bind a key combo to a widget
    Bind {
        /// Key combo, e.g. "<ctrl>+<alt>+h"
        combo: String,
        /// Widget id or unique prefix
        widget: String,
    },

    /// Remove a binding
    Unbind { combo: String },
}

// ── Live commands ────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Also append logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Log every entity instead of only those on the dashboard
    #[arg(long)]
    pub all: bool,

    /// Only log entities of this domain, e.g. light
    #[arg(long)]
    pub domain: Option<String>,
}

#[derive(Debug, Args)]
pub struct PressArgs {
    /// Widget id, unique id prefix, or a bound key combo
    pub target: String,

    /// Seconds to wait for the hub to go live
    #[arg(long, default_value_t = 15)]
    pub connect_timeout: u64,
}

impl Command {
    /// The log file `watch` was asked to write, if any.
    pub fn log_file(&self) -> Option<&std::path::Path> {
        match self {
            Self::Watch(args) => args.log_file.as_deref(),
            _ => None,
        }
    }
}
