// ── Core error types ──
//
// User-facing errors from prism-core. Consumers never see raw WebSocket
// or JSON failures; the `From<prism_api::Error>` impl translates
// transport-layer errors into domain-appropriate variants.

use std::time::Duration;

use prism_api::ConnectionState;
use thiserror::Error;

use crate::layout::LayoutError;
use crate::model::InvalidEntityId;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    /// The hub rejected the token. Retrying will not help; the user has
    /// to enter new credentials.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Connection to hub lost: {reason}")]
    TransientConnection { reason: String },

    /// Commands are only accepted while the link is live.
    #[error("Hub is not connected ({state})")]
    NotLive {
        state: ConnectionState,
        retry_after: Option<Duration>,
    },

    // ── Command errors ───────────────────────────────────────────────
    #[error("Command rejected by hub: {reason}")]
    CommandRejected { reason: String },

    #[error("Hub did not confirm the command in time")]
    CommandTimedOut,

    #[error("Invalid service '{name}'")]
    InvalidService { name: String },

    #[error("{domain} entities do not accept this command")]
    UnsupportedIntent { domain: String },

    // ── Layout errors ────────────────────────────────────────────────
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("Widget not found: {identifier}")]
    UnknownWidget { identifier: String },

    #[error("No widget bound to shortcut {combo}")]
    UnknownShortcut { combo: String },

    #[error("Invalid shortcut '{value}': {reason}")]
    InvalidShortcut { value: String, reason: String },

    #[error(transparent)]
    InvalidEntityId(#[from] InvalidEntityId),

    // ── Persistence errors ───────────────────────────────────────────
    /// Writing the dashboard document failed. The in-memory layout stays
    /// authoritative and the write is retried.
    #[error("Could not save dashboard: {message}")]
    Persistence { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Errors the user can only fix by changing credentials or config.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. } | Self::Config { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<prism_api::Error> for CoreError {
    fn from(err: prism_api::Error) -> Self {
        match err {
            prism_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            prism_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid hub URL: {e}"),
            },
            prism_api::Error::UnsupportedScheme(scheme) => CoreError::Config {
                message: format!("Unsupported hub URL scheme '{scheme}'"),
            },
            prism_api::Error::InvalidServiceName(name) => CoreError::InvalidService { name },
            prism_api::Error::LinkClosed => CoreError::NotLive {
                state: ConnectionState::Disconnected,
                retry_after: None,
            },
            e @ (prism_api::Error::WebSocketConnect(_)
            | prism_api::Error::WebSocketClosed { .. }
            | prism_api::Error::Transport(_)
            | prism_api::Error::HandshakeTimeout { .. }
            | prism_api::Error::Protocol(_)) => CoreError::TransientConnection {
                reason: e.to_string(),
            },
            prism_api::Error::Serialization(e) => {
                CoreError::Internal(format!("Serialization error: {e}"))
            }
        }
    }
}
