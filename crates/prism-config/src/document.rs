// ── Config document ──
//
// Serialized shape of `config.toml`. Everything the user edits lives here
// except the hub token, which belongs in the keyring.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use prism_core::{
    DashboardDocument, DashboardLayout, KeyCombo, PressConfig, ReconnectConfig, WidgetId,
};

/// Highest document version this build reads and the one it writes.
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub version: u32,

    #[serde(default)]
    pub connection: Connection,

    #[serde(default)]
    pub appearance: Appearance,

    #[serde(default)]
    pub timing: Timing,

    #[serde(default)]
    pub layout: DashboardLayout,

    /// Combo → widget. Written last so the table keys stay readable.
    #[serde(default)]
    pub shortcuts: BTreeMap<KeyCombo, WidgetId>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            connection: Connection::default(),
            appearance: Appearance::default(),
            timing: Timing::default(),
            layout: DashboardLayout::default(),
            shortcuts: BTreeMap::new(),
        }
    }
}

impl ConfigDocument {
    /// The part the dashboard controller owns.
    pub fn dashboard(&self) -> DashboardDocument {
        DashboardDocument {
            layout: self.layout.clone(),
            shortcuts: self.shortcuts.clone(),
        }
    }

    pub fn set_dashboard(&mut self, dashboard: DashboardDocument) {
        self.layout = dashboard.layout;
        self.shortcuts = dashboard.shortcuts;
    }
}

/// Document handed out on first run.
pub fn initial_document() -> ConfigDocument {
    ConfigDocument::default()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Hub base URL, e.g. `http://homeassistant.local:8123`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Legacy plaintext token. Read for migration only, never written back.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Theme {
    #[default]
    System,
    Light,
    Dark,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appearance {
    #[serde(default)]
    pub theme: Theme,
}

/// Timing knobs, all in milliseconds (pixels for the drag threshold).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub command_timeout_ms: u64,
    pub long_press_ms: u64,
    pub drag_threshold_px: u32,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            long_press_ms: 300,
            drag_threshold_px: 10,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Timing {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn press(&self) -> PressConfig {
        PressConfig {
            long_press: Duration::from_millis(self.long_press_ms),
            drag_threshold: self.drag_threshold_px,
        }
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_retries: None,
        }
    }
}
