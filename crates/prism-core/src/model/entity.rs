// ── Entity state model ──
//
// Typed view of a hub entity. The raw attribute map is kept verbatim;
// `DomainAttributes` is re-derived from it after every replace or patch.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::entity_id::EntityId;

// ── Domain ──────────────────────────────────────────────────────────

/// Entity domain, derived from the id prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Light,
    Switch,
    Climate,
    Cover,
    Sensor,
    Scene,
    Script,
    Camera,
    Media,
    Weather,
    Automation,
    Printer,
    Other(String),
}

impl Domain {
    pub fn from_prefix(prefix: &str) -> Self {
        match prefix {
            "light" => Self::Light,
            "switch" | "input_boolean" | "fan" => Self::Switch,
            "climate" => Self::Climate,
            "cover" => Self::Cover,
            "sensor" | "binary_sensor" => Self::Sensor,
            "scene" => Self::Scene,
            "script" => Self::Script,
            "camera" | "image" => Self::Camera,
            "media_player" => Self::Media,
            "weather" => Self::Weather,
            "automation" => Self::Automation,
            "printer" => Self::Printer,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Read-only domains never dispatch commands.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Sensor | Self::Camera | Self::Weather | Self::Printer)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Light => "light",
            Self::Switch => "switch",
            Self::Climate => "climate",
            Self::Cover => "cover",
            Self::Sensor => "sensor",
            Self::Scene => "scene",
            Self::Script => "script",
            Self::Camera => "camera",
            Self::Media => "media",
            Self::Weather => "weather",
            Self::Automation => "automation",
            Self::Printer => "printer",
            Self::Other(name) => name,
        };
        f.write_str(name)
    }
}

// ── Domain attributes ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LightAttributes {
    /// 0-255 as reported by the hub.
    pub brightness: Option<u8>,
    pub color_temp_kelvin: Option<u32>,
    pub rgb_color: Option<[u8; 3]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClimateAttributes {
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub hvac_modes: Vec<String>,
    pub fan_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverAttributes {
    /// 0 (closed) to 100 (open).
    pub current_position: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorAttributes {
    pub unit_of_measurement: Option<String>,
    pub device_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaAttributes {
    pub media_title: Option<String>,
    pub media_artist: Option<String>,
    pub volume_level: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherAttributes {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub temperature_unit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationAttributes {
    pub last_triggered: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraAttributes {
    pub entity_picture: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterAttributes {
    /// Job progress in percent.
    pub progress: Option<f64>,
}

/// Fixed attribute set per domain; `Raw` for domains without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainAttributes {
    Light(LightAttributes),
    Climate(ClimateAttributes),
    Cover(CoverAttributes),
    Sensor(SensorAttributes),
    Media(MediaAttributes),
    Weather(WeatherAttributes),
    Automation(AutomationAttributes),
    Camera(CameraAttributes),
    Printer(PrinterAttributes),
    Raw,
}

impl DomainAttributes {
    /// Derive the typed attributes of `domain` from the raw map.
    /// Values of the wrong JSON type read as absent.
    pub fn derive(domain: &Domain, raw: &Map<String, Value>) -> Self {
        match domain {
            Domain::Light => Self::Light(LightAttributes {
                brightness: byte(raw, "brightness"),
                color_temp_kelvin: number(raw, "color_temp_kelvin")
                    .and_then(|v| to_u32(v.round())),
                rgb_color: raw.get("rgb_color").and_then(rgb),
            }),
            Domain::Climate => Self::Climate(ClimateAttributes {
                current_temperature: number(raw, "current_temperature"),
                target_temperature: number(raw, "temperature"),
                min_temp: number(raw, "min_temp"),
                max_temp: number(raw, "max_temp"),
                hvac_modes: raw
                    .get("hvac_modes")
                    .and_then(Value::as_array)
                    .map(|modes| {
                        modes
                            .iter()
                            .filter_map(|m| m.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default(),
                fan_mode: text(raw, "fan_mode"),
            }),
            Domain::Cover => Self::Cover(CoverAttributes {
                current_position: byte(raw, "current_position").map(|p| p.min(100)),
            }),
            Domain::Sensor => Self::Sensor(SensorAttributes {
                unit_of_measurement: text(raw, "unit_of_measurement"),
                device_class: text(raw, "device_class"),
            }),
            Domain::Media => Self::Media(MediaAttributes {
                media_title: text(raw, "media_title"),
                media_artist: text(raw, "media_artist"),
                volume_level: number(raw, "volume_level"),
            }),
            Domain::Weather => Self::Weather(WeatherAttributes {
                temperature: number(raw, "temperature"),
                humidity: number(raw, "humidity"),
                temperature_unit: text(raw, "temperature_unit"),
            }),
            Domain::Automation => Self::Automation(AutomationAttributes {
                last_triggered: text(raw, "last_triggered"),
            }),
            Domain::Camera => Self::Camera(CameraAttributes {
                entity_picture: text(raw, "entity_picture"),
            }),
            Domain::Printer => Self::Printer(PrinterAttributes {
                progress: number(raw, "progress"),
            }),
            Domain::Switch | Domain::Scene | Domain::Script | Domain::Other(_) => Self::Raw,
        }
    }
}

fn number(raw: &Map<String, Value>, key: &str) -> Option<f64> {
    raw.get(key).and_then(Value::as_f64).filter(|v| v.is_finite())
}

fn text(raw: &Map<String, Value>, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn byte(raw: &Map<String, Value>, key: &str) -> Option<u8> {
    number(raw, key).and_then(|v| to_u32(v.round())).and_then(|v| u8::try_from(v).ok())
}

fn rgb(value: &Value) -> Option<[u8; 3]> {
    let parts = value.as_array()?;
    let mut out = [0u8; 3];
    if parts.len() != 3 {
        return None;
    }
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::try_from(part.as_u64()?).ok()?;
    }
    Some(out)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
fn to_u32(v: f64) -> Option<u32> {
    (0.0..=f64::from(u32::MAX)).contains(&v).then_some(v as u32)
}

// ── EntityState ─────────────────────────────────────────────────────

/// Authoritative (or optimistic) state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    pub domain: Domain,
    pub state: String,
    pub attributes: DomainAttributes,
    pub raw_attributes: Map<String, Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl EntityState {
    pub fn new(
        id: EntityId,
        state: impl Into<String>,
        raw_attributes: Map<String, Value>,
        last_changed: DateTime<Utc>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        let domain = id.domain();
        let attributes = DomainAttributes::derive(&domain, &raw_attributes);
        Self {
            id,
            domain,
            state: state.into(),
            attributes,
            raw_attributes,
            last_changed,
            last_updated,
        }
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.raw_attributes.get("friendly_name").and_then(Value::as_str)
    }

    /// The hub reports the entity but cannot reach the device.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.state.as_str(), "unavailable" | "unknown")
    }

    pub fn is_on(&self) -> bool {
        matches!(self.state.as_str(), "on" | "open" | "playing")
    }

    /// Merge an attribute-level patch into this state.
    pub fn merge(&mut self, patch: &EntityPatch) {
        if let Some(state) = &patch.state {
            self.state.clone_from(state);
        }
        for (key, value) in &patch.set_attributes {
            self.raw_attributes.insert(key.clone(), value.clone());
        }
        for key in &patch.removed_attributes {
            self.raw_attributes.remove(key);
        }
        if let Some(ts) = patch.last_changed {
            self.last_changed = ts;
        }
        if let Some(ts) = patch.last_updated {
            self.last_updated = ts;
        }
        self.rederive();
    }

    fn rederive(&mut self) {
        self.attributes = DomainAttributes::derive(&self.domain, &self.raw_attributes);
    }
}

// ── Patches ─────────────────────────────────────────────────────────

/// Authoritative attribute-level change for an entity already in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPatch {
    pub id: EntityId,
    pub state: Option<String>,
    pub set_attributes: Map<String, Value>,
    pub removed_attributes: Vec<String>,
    pub last_changed: Option<DateTime<Utc>>,
    /// `None` when the hub sent no timestamp; the watermark is left alone.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Local expectation of a command's effect, layered over the
/// authoritative state until the hub confirms or the command fails.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptimisticPatch {
    pub state: Option<String>,
    pub attributes: Map<String, Value>,
}

impl OptimisticPatch {
    pub fn state(state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_owned(), value.into());
        self
    }

    /// Whether `state` already shows every value this patch predicts.
    pub fn matches(&self, state: &EntityState) -> bool {
        self.state.as_ref().is_none_or(|s| *s == state.state)
            && self.attributes.iter().all(|(key, want)| {
                state
                    .raw_attributes
                    .get(key)
                    .is_some_and(|have| same_value(have, want))
            })
    }

    /// Apply on top of `state`. Timestamps stay authoritative.
    pub fn apply(&self, state: &mut EntityState) {
        if let Some(s) = &self.state {
            state.state.clone_from(s);
        }
        for (key, value) in &self.attributes {
            state.raw_attributes.insert(key.clone(), value.clone());
        }
        state.rederive();
    }
}

/// Numbers compare by value, so `21` from the hub equals a predicted `21.0`.
fn same_value(have: &Value, want: &Value) -> bool {
    match (have.as_f64(), want.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => have == want,
    }
}
