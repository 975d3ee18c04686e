// ── Loading and saving ──
//
// The token is resolved from the keyring first. A plaintext token still
// sitting in the file is moved into the keyring and scrubbed from disk;
// saving never writes a token to the file, even when the keyring fails.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use prism_core::{ControllerConfig, CoreError, DashboardDocument, DocumentSink};

use crate::document::{CURRENT_VERSION, ConfigDocument, initial_document};
use crate::error::ConfigError;
use crate::paths::config_path;
use crate::token::{KeyringStore, TokenStore};

/// Environment variable that overrides the stored token.
pub const TOKEN_ENV: &str = "PRISM_TOKEN";

/// A loaded document plus the token that goes with it.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub document: ConfigDocument,
    pub token: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub enum Loaded {
    Existing(Settings),
    /// No config file yet.
    FirstRun(ConfigDocument),
}

impl Loaded {
    pub fn is_first_run(&self) -> bool {
        matches!(self, Self::FirstRun(_))
    }

    pub fn into_settings(self) -> Settings {
        match self {
            Self::Existing(settings) => settings,
            Self::FirstRun(document) => Settings {
                document,
                token: None,
            },
        }
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default = "current_version")]
    version: u32,
}

fn current_version() -> u32 {
    CURRENT_VERSION
}

// ── ConfigStore ─────────────────────────────────────────────────────

/// Reads and writes one config file and its keyring token.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    tokens: Arc<dyn TokenStore>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            path: path.into(),
            tokens,
        }
    }

    /// The platform (or portable) config file with the OS keyring.
    pub fn open_default() -> Self {
        Self::new(config_path(), Arc::new(KeyringStore::default()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file merged over defaults and `PRISM_`-prefixed env vars
    /// (`PRISM_TIMING__LONG_PRESS_MS=500`).
    pub fn load(&self) -> Result<Loaded, ConfigError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No config file, starting fresh");
                return Ok(Loaded::FirstRun(initial_document()));
            }
            Err(e) => return Err(e.into()),
        };

        let probe: VersionProbe = toml::from_str(&text)?;
        if probe.version > CURRENT_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: probe.version,
                supported: CURRENT_VERSION,
            });
        }

        let mut document: ConfigDocument = Figment::new()
            .merge(Serialized::defaults(ConfigDocument::default()))
            .merge(Toml::string(&text))
            .merge(Env::prefixed("PRISM_").split("__"))
            .extract()?;
        document.version = CURRENT_VERSION;

        let plaintext = document
            .connection
            .token
            .take()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);
        let stored = self.tokens.get().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read hub token from the keyring");
            None
        });

        let token = match (stored, plaintext) {
            (Some(stored), plaintext) => {
                if plaintext.is_some() {
                    self.scrub(&document);
                }
                Some(stored)
            }
            (None, Some(plaintext)) => {
                self.migrate(&plaintext, &document);
                Some(plaintext)
            }
            (None, None) => None,
        };

        debug!(
            path = %self.path.display(),
            widgets = document.layout.widgets.len(),
            "Config loaded"
        );
        Ok(Loaded::Existing(Settings { document, token }))
    }

    /// Store the token in the keyring and the rest in the file.
    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(token) = &settings.token {
            if let Err(e) = self.tokens.set(token) {
                // The file never gets the token; the user re-enters it.
                warn!(error = %e, "Could not store hub token in the keyring");
            }
        }
        self.write_document(&settings.document)
    }

    /// Remove the stored token.
    pub fn forget_token(&self) -> Result<(), ConfigError> {
        self.tokens.delete()
    }

    /// Write the document (never its token) to a temp file, fsync it and
    /// rename it over the old one.
    pub fn write_document(&self, document: &ConfigDocument) -> Result<(), ConfigError> {
        let mut document = document.clone();
        document.connection.token = None;
        let text = toml::to_string_pretty(&document)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Config written");
        Ok(())
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn migrate(&self, plaintext: &SecretString, document: &ConfigDocument) {
        let stored = self.tokens.set(plaintext).and_then(|()| self.tokens.get());
        match stored {
            Ok(Some(read_back)) if read_back.expose_secret() == plaintext.expose_secret() => {
                info!("Moved hub token from the config file to the keyring");
                self.scrub(document);
            }
            Ok(_) => warn!("Keyring did not keep the hub token; it stays in the config file"),
            Err(e) => {
                warn!(error = %e, "Could not move hub token to the keyring; it stays in the config file");
            }
        }
    }

    fn scrub(&self, document: &ConfigDocument) {
        if let Err(e) = self.write_document(document) {
            warn!(error = %e, "Could not remove plaintext token from the config file");
        }
    }
}

// ── Dashboard persistence ───────────────────────────────────────────

/// Checkpoint target for the controller: merges the dashboard into the
/// full document and rewrites the file.
pub struct DashboardSink {
    store: ConfigStore,
    document: Mutex<ConfigDocument>,
}

impl DashboardSink {
    pub fn new(store: ConfigStore, document: ConfigDocument) -> Self {
        Self {
            store,
            document: Mutex::new(document),
        }
    }
}

impl DocumentSink for DashboardSink {
    fn persist(&self, dashboard: &DashboardDocument) -> Result<(), CoreError> {
        let mut document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        document.set_dashboard(dashboard.clone());
        self.store
            .write_document(&document)
            .map_err(|e| CoreError::Persistence {
                message: e.to_string(),
            })
    }
}

// ── Controller config ───────────────────────────────────────────────

/// The token to use: `PRISM_TOKEN` first, then the stored one.
pub fn resolve_token(stored: Option<&SecretString>) -> Option<SecretString> {
    std::env::var(TOKEN_ENV)
        .ok()
        .filter(|t| !t.is_empty())
        .map(SecretString::from)
        .or_else(|| stored.cloned())
}

/// Build a `ControllerConfig` from loaded settings.
pub fn to_controller_config(settings: &Settings) -> Result<ControllerConfig, ConfigError> {
    let document = &settings.document;
    let raw = document
        .connection
        .url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ConfigError::Validation {
            field: "connection.url".into(),
            reason: "not set".into(),
        })?;
    let url = Url::parse(raw).map_err(|e| ConfigError::Validation {
        field: "connection.url".into(),
        reason: format!("{e}: {raw}"),
    })?;
    let token = resolve_token(settings.token.as_ref()).ok_or(ConfigError::NoCredentials)?;

    let timing = &document.timing;
    if timing.command_timeout_ms == 0 {
        return Err(ConfigError::Validation {
            field: "timing.command_timeout_ms".into(),
            reason: "must be greater than zero".into(),
        });
    }
    if timing.reconnect_initial_ms > timing.reconnect_max_ms {
        return Err(ConfigError::Validation {
            field: "timing.reconnect_initial_ms".into(),
            reason: "must not exceed reconnect_max_ms".into(),
        });
    }

    let mut config = ControllerConfig::new(url, token);
    config.command_timeout = timing.command_timeout();
    config.press = timing.press();
    config.hub.reconnect = timing.reconnect();
    config.hub.handshake_timeout = timing.handshake_timeout();
    Ok(config)
}
