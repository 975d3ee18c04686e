// ── Runtime configuration ──
//
// How the controller connects and behaves. Carries the hub credentials
// but never touches disk; the config crate builds one from the stored
// document and hands it in.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use prism_api::{HubConfig, ReconnectConfig};

use crate::gesture::PressConfig;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub hub: HubConfig,
    /// How long an issued command may stay unconfirmed. Default: 10s.
    pub command_timeout: Duration,
    pub press: PressConfig,
    /// Backoff for failed dashboard saves.
    pub checkpoint_retry: ReconnectConfig,
}

impl ControllerConfig {
    pub fn new(url: Url, token: SecretString) -> Self {
        Self {
            hub: HubConfig::new(url, token),
            command_timeout: Duration::from_secs(10),
            press: PressConfig::default(),
            checkpoint_retry: ReconnectConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                max_retries: None,
            },
        }
    }
}
