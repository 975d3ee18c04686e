// ── Hub token storage ──

use std::sync::Mutex;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

pub const KEYRING_SERVICE: &str = "prism-desktop";
pub const KEYRING_USER: &str = "hub-token";

/// Where the hub token lives outside the config file.
pub trait TokenStore: Send + Sync {
    /// `Ok(None)` when nothing is stored.
    fn get(&self) -> Result<Option<SecretString>, ConfigError>;
    fn set(&self, token: &SecretString) -> Result<(), ConfigError>;
    fn delete(&self) -> Result<(), ConfigError>;
}

/// OS keyring (Keychain, Credential Manager, Secret Service).
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
    user: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, ConfigError> {
        Ok(keyring::Entry::new(&self.service, &self.user)?)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE, KEYRING_USER)
    }
}

impl TokenStore for KeyringStore {
    fn get(&self) -> Result<Option<SecretString>, ConfigError> {
        match self.entry()?.get_password() {
            Ok(secret) if secret.is_empty() => Ok(None),
            Ok(secret) => Ok(Some(SecretString::from(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, token: &SecretString) -> Result<(), ConfigError> {
        Ok(self.entry()?.set_password(token.expose_secret())?)
    }

    fn delete(&self) -> Result<(), ConfigError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process token store for tests and machines without a keyring.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
    read_only: bool,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: &str) -> Self {
        Self {
            token: Mutex::new(Some(token.to_owned())),
            read_only: false,
        }
    }

    /// A store whose writes always fail, like a locked keyring.
    pub fn read_only() -> Self {
        Self {
            token: Mutex::new(None),
            read_only: true,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn refuse(&self) -> Result<(), ConfigError> {
        if self.read_only {
            let locked = std::io::Error::other("store is read-only");
            return Err(keyring::Error::NoStorageAccess(Box::new(locked)).into());
        }
        Ok(())
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Result<Option<SecretString>, ConfigError> {
        Ok(self.slot().clone().map(SecretString::from))
    }

    fn set(&self, token: &SecretString) -> Result<(), ConfigError> {
        self.refuse()?;
        *self.slot() = Some(token.expose_secret().to_owned());
        Ok(())
    }

    fn delete(&self) -> Result<(), ConfigError> {
        self.refuse()?;
        *self.slot() = None;
        Ok(())
    }
}
