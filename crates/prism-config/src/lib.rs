//! Configuration for Prism Desktop.
//!
//! One versioned TOML document holds the hub URL, the dashboard layout,
//! shortcuts and timing knobs. The hub token lives in the OS keyring; a
//! plaintext token found in an older file is migrated there. Saves go
//! through a temp file and a rename so a crash never leaves half a file.

pub mod document;
pub mod error;
pub mod paths;
pub mod store;
pub mod token;

pub use document::{
    Appearance, CURRENT_VERSION, ConfigDocument, Connection, Theme, Timing, initial_document,
};
pub use error::ConfigError;
pub use paths::config_path;
pub use store::{
    ConfigStore, DashboardSink, Loaded, Settings, TOKEN_ENV, resolve_token, to_controller_config,
};
pub use token::{KeyringStore, MemoryTokenStore, TokenStore};
