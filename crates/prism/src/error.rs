//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use prism_config::ConfigError;
use prism_core::{CoreError, LayoutError};

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the hub: {reason}")]
    #[diagnostic(
        code(prism::connection_failed),
        help("Check that Home Assistant is running and the URL is right: prism config show")
    )]
    ConnectionFailed { reason: String },

    #[error("Hub is not live ({state})")]
    #[diagnostic(code(prism::not_live), help("Run prism watch -v to see the connection log."))]
    NotLive { state: String },

    // ── Authentication ───────────────────────────────────────────────
    #[error("The hub rejected the access token: {message}")]
    #[diagnostic(
        code(prism::auth_failed),
        help(
            "Create a long-lived access token in your Home Assistant profile, then run:\n\
             prism config init --url <url> --token <token> --force"
        )
    )]
    AuthFailed { message: String },

    #[error("No access token configured")]
    #[diagnostic(
        code(prism::no_credentials),
        help("Run: prism config init --url <url> --token <token>\nOr set PRISM_TOKEN.")
    )]
    NoCredentials,

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(prism::not_found),
        help("Run: prism {list_command} to see what exists")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("'{identifier}' matches {count} widgets")]
    #[diagnostic(
        code(prism::ambiguous),
        help("Use more characters of the widget id: {candidates}")
    )]
    Ambiguous {
        identifier: String,
        count: usize,
        candidates: String,
    },

    #[error(transparent)]
    #[diagnostic(code(prism::layout), help("Run: prism layout show"))]
    Layout(LayoutError),

    // ── Commands ─────────────────────────────────────────────────────
    #[error("The hub rejected the command: {reason}")]
    #[diagnostic(code(prism::rejected))]
    Rejected { reason: String },

    #[error("The hub did not confirm the command in time")]
    #[diagnostic(
        code(prism::timeout),
        help("Raise timing.command_timeout_ms in the config or check the device.")
    )]
    Timeout,

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(prism::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration file not found")]
    #[diagnostic(
        code(prism::no_config),
        help("Create one with: prism config init --url <url>\nExpected at: {path}")
    )]
    NoConfig { path: String },

    #[error("A config file already exists at {path}")]
    #[diagnostic(code(prism::config_exists), help("Pass --force to replace it."))]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(prism::config))]
    Config(ConfigError),

    #[error("{0}")]
    #[diagnostic(code(prism::internal))]
    Internal(String),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render JSON: {0}")]
    #[diagnostic(code(prism::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::NotLive { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials => exit_code::AUTH,
            Self::NotFound { .. } | Self::NoConfig { .. } => exit_code::NOT_FOUND,
            Self::Layout(LayoutError::Conflict { .. }) | Self::ConfigExists { .. } => {
                exit_code::CONFLICT
            }
            Self::Timeout => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::Ambiguous { .. } | Self::Layout(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::TransientConnection { reason } => Self::ConnectionFailed { reason },
            CoreError::NotLive { state, .. } => Self::NotLive {
                state: state.to_string(),
            },
            CoreError::CommandRejected { reason } => Self::Rejected { reason },
            CoreError::CommandTimedOut => Self::Timeout,
            CoreError::Layout(LayoutError::UnknownWidget { id }) => Self::NotFound {
                resource_type: "widget".into(),
                identifier: id.to_string(),
                list_command: "layout show".into(),
            },
            CoreError::Layout(e) => Self::Layout(e),
            CoreError::UnknownWidget { identifier } => Self::NotFound {
                resource_type: "widget".into(),
                identifier,
                list_command: "layout show".into(),
            },
            CoreError::UnknownShortcut { combo } => Self::NotFound {
                resource_type: "shortcut".into(),
                identifier: combo,
                list_command: "shortcut list".into(),
            },
            CoreError::InvalidShortcut { value, reason } => Self::Validation {
                field: format!("shortcut '{value}'"),
                reason,
            },
            CoreError::InvalidEntityId(e) => Self::Validation {
                field: "entity".into(),
                reason: e.to_string(),
            },
            CoreError::InvalidService { name } => Self::Validation {
                field: "service".into(),
                reason: format!("'{name}' is not domain.service"),
            },
            CoreError::UnsupportedIntent { domain } => Self::Validation {
                field: "widget".into(),
                reason: format!("{domain} entities cannot be pressed"),
            },
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::Persistence { message } | CoreError::Internal(message) => {
                Self::Internal(message)
            }
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials => Self::NoCredentials,
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::Io(e) => Self::Io(e),
            other => Self::Config(other),
        }
    }
}

impl From<LayoutError> for CliError {
    fn from(err: LayoutError) -> Self {
        CoreError::Layout(err).into()
    }
}
