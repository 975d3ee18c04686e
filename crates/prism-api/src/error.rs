use thiserror::Error;

/// Top-level error type for the `prism-api` crate.
///
/// Covers every failure mode of the hub link: URL handling, transport,
/// the authentication handshake, and the message protocol.
/// `prism-core` maps these into the user-facing taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The hub rejected the access token (`auth_invalid`).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── URL ─────────────────────────────────────────────────────────
    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The configured URL uses a scheme we cannot map to a WebSocket.
    #[error("Unsupported URL scheme '{0}' (expected http, https, ws or wss)")]
    UnsupportedScheme(String),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed by the hub or the stream ended.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// Reading or writing a frame failed mid-session.
    #[error("WebSocket transport error: {0}")]
    Transport(String),

    /// A handshake step did not complete in time.
    #[error("Hub did not answer during {stage} within {timeout_ms}ms")]
    HandshakeTimeout { stage: &'static str, timeout_ms: u64 },

    // ── Protocol ────────────────────────────────────────────────────
    /// The hub sent something the session state machine did not expect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Domain or service name failed validation.
    #[error("Invalid service name '{0}'")]
    InvalidServiceName(String),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The background link task is gone.
    #[error("Hub link is shut down")]
    LinkClosed,
}

impl Error {
    /// Returns `true` if retrying the session cannot help and the user
    /// must fix credentials or configuration first.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::InvalidUrl(_) | Self::UnsupportedScheme(_)
        )
    }

    /// Returns `true` if this is a transient error worth reconnecting for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebSocketConnect(_)
                | Self::WebSocketClosed { .. }
                | Self::Transport(_)
                | Self::HandshakeTimeout { .. }
                | Self::Protocol(_)
        )
    }
}
