// ── Command API ──
//
// User intents flow through the `Intent` enum. Each intent maps to one
// hub service call and, where the outcome is predictable, an optimistic
// patch shown until the hub confirms or the command fails.

mod dispatcher;

use serde_json::{Map, Value};
use uuid::Uuid;

use prism_api::ServiceCall;

use crate::error::CoreError;
use crate::model::{Domain, EntityId, EntityState, OptimisticPatch};

pub use dispatcher::{
    CommandDispatcher, CommandOutcome, CommandReport, Issued, PendingCommand, TimerVerdict,
};

/// Identity of one issued command. Doubles as the link's call tag.
pub type CommandId = Uuid;

/// Supersession bucket: a newer intent replaces an unconfirmed older one
/// of the same class on the same entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum IntentClass {
    Power,
    Brightness,
    Position,
    Setpoint,
    Service,
}

/// Something the user asked an entity to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Toggle,
    /// Scene or script `turn_on`.
    Activate,
    /// Percent, clamped to 0..=100. Zero turns the light off.
    SetBrightness(u8),
    /// Percent open, clamped to 0..=100.
    SetPosition(u8),
    SetTemperature(f64),
    /// Widget-configured override.
    Service {
        domain: String,
        service: String,
        data: Map<String, Value>,
    },
}

impl Intent {
    pub fn class(&self) -> IntentClass {
        match self {
            Self::Toggle | Self::Activate => IntentClass::Power,
            Self::SetBrightness(_) => IntentClass::Brightness,
            Self::SetPosition(_) => IntentClass::Position,
            Self::SetTemperature(_) => IntentClass::Setpoint,
            Self::Service { .. } => IntentClass::Service,
        }
    }

    /// Parse a `domain.service` override into a service intent.
    pub fn service(spec: &str) -> Result<Self, CoreError> {
        let invalid = || CoreError::InvalidService {
            name: spec.to_owned(),
        };
        let (domain, service) = spec.split_once('.').ok_or_else(invalid)?;
        if !prism_api::is_valid_service_name(domain) || !prism_api::is_valid_service_name(service)
        {
            return Err(invalid());
        }
        Ok(Self::Service {
            domain: domain.to_owned(),
            service: service.to_owned(),
            data: Map::new(),
        })
    }

    /// The hub service call for this intent on `entity`.
    pub fn to_call(&self, entity: &EntityId, tag: CommandId) -> Result<ServiceCall, CoreError> {
        let domain = entity.domain();
        let prefix = entity.domain_prefix();
        let unsupported = || CoreError::UnsupportedIntent {
            domain: domain.to_string(),
        };

        let call = match self {
            Self::Service {
                domain,
                service,
                data,
            } => {
                let mut call = ServiceCall::new(tag, domain.as_str(), service.as_str())?;
                call.data.clone_from(data);
                call
            }
            _ if domain.is_read_only() => return Err(unsupported()),
            Self::Toggle => match &domain {
                Domain::Light | Domain::Switch | Domain::Cover | Domain::Automation => {
                    ServiceCall::new(tag, prefix, "toggle")?
                }
                Domain::Media => ServiceCall::new(tag, "media_player", "media_play_pause")?,
                Domain::Scene | Domain::Script => ServiceCall::new(tag, prefix, "turn_on")?,
                _ => ServiceCall::new(tag, "homeassistant", "toggle")?,
            },
            Self::Activate => match &domain {
                Domain::Scene | Domain::Script => ServiceCall::new(tag, prefix, "turn_on")?,
                _ => ServiceCall::new(tag, "homeassistant", "turn_on")?,
            },
            Self::SetBrightness(pct) => match (&domain, (*pct).min(100)) {
                (Domain::Light, 0) => ServiceCall::new(tag, "light", "turn_off")?,
                (Domain::Light, pct) => {
                    ServiceCall::new(tag, "light", "turn_on")?.with_data("brightness_pct", pct)
                }
                _ => return Err(unsupported()),
            },
            Self::SetPosition(pct) => match &domain {
                Domain::Cover => ServiceCall::new(tag, "cover", "set_cover_position")?
                    .with_data("position", (*pct).min(100)),
                _ => return Err(unsupported()),
            },
            Self::SetTemperature(target) => match &domain {
                Domain::Climate if target.is_finite() => {
                    ServiceCall::new(tag, "climate", "set_temperature")?
                        .with_data("temperature", *target)
                }
                Domain::Climate => {
                    return Err(CoreError::CommandRejected {
                        reason: format!("temperature {target} is not a number"),
                    });
                }
                _ => return Err(unsupported()),
            },
        };

        Ok(call.with_target(entity.as_str()))
    }

    /// Expected effect on `current` (the effective state at issue time).
    /// `None` when the outcome cannot be predicted.
    pub fn optimistic(&self, current: &EntityState) -> Option<OptimisticPatch> {
        if current.is_unavailable() {
            return None;
        }
        match self {
            Self::Toggle => flipped(&current.state).map(OptimisticPatch::state),
            Self::SetBrightness(pct) => {
                let pct = (*pct).min(100);
                if pct == 0 {
                    return Some(OptimisticPatch::state("off"));
                }
                let level = (u16::from(pct) * 255 + 50) / 100;
                Some(OptimisticPatch::state("on").with_attribute("brightness", level))
            }
            Self::SetPosition(pct) => {
                let pct = (*pct).min(100);
                let state = if pct == 0 { "closed" } else { "open" };
                Some(OptimisticPatch::state(state).with_attribute("current_position", pct))
            }
            Self::SetTemperature(target) if target.is_finite() => {
                Some(OptimisticPatch::default().with_attribute("temperature", *target))
            }
            Self::SetTemperature(_) | Self::Activate | Self::Service { .. } => None,
        }
    }
}

fn flipped(state: &str) -> Option<&'static str> {
    match state {
        "on" => Some("off"),
        "off" => Some("on"),
        "open" => Some("closed"),
        "closed" => Some("open"),
        "playing" => Some("paused"),
        "paused" => Some("playing"),
        _ => None,
    }
}
