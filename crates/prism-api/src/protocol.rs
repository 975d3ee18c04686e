//! Wire types for the hub's WebSocket API.
//!
//! Outbound frames are JSON objects tagged by `type` and carrying a
//! per-connection message id. Inbound frames are either a single message
//! object or an array of them. Entity updates arrive through the
//! `subscribe_entities` subscription in the compressed form the hub uses:
//! `a` (full states), `c` (diffs with `+`/`-` parts) and `r` (removals).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Error;

// ── Outbound ─────────────────────────────────────────────────────────

/// A service call queued for the hub.
///
/// `tag` is chosen by the caller and comes back on the matching
/// [`CallOutcome`]; the wire message id is assigned by the link.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub tag: Uuid,
    pub domain: String,
    pub service: String,
    pub entity_id: Option<String>,
    pub data: Map<String, Value>,
}

impl ServiceCall {
    /// Build a call, validating the domain and service names.
    pub fn new(
        tag: Uuid,
        domain: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self, Error> {
        let domain = domain.into();
        let service = service.into();
        for name in [&domain, &service] {
            if !is_valid_service_name(name) {
                return Err(Error::InvalidServiceName(name.clone()));
            }
        }
        Ok(Self {
            tag,
            domain,
            service,
            entity_id: None,
            data: Map::new(),
        })
    }

    pub fn with_target(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_owned(), value.into());
        self
    }
}

/// Domain and service names are lowercase-ish identifiers: letters and `_`.
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphabetic() || c == '_')
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ServiceTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

/// Messages the client sends.
///
/// Deliberately not `Debug`: the auth variant carries the access token.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Auth {
        access_token: String,
    },
    SubscribeEntities {
        id: u64,
    },
    CallService {
        id: u64,
        domain: String,
        service: String,
        target: ServiceTarget,
        #[serde(skip_serializing_if = "Map::is_empty")]
        service_data: Map<String, Value>,
    },
}

impl OutboundMessage {
    pub fn call_service(id: u64, call: &ServiceCall) -> Self {
        Self::CallService {
            id,
            domain: call.domain.clone(),
            service: call.service.clone(),
            target: ServiceTarget {
                entity_id: call.entity_id.clone(),
            },
            service_data: call.data.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Error payload of a failed `result` message.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HubError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Messages the hub sends.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        error: Option<HubError>,
    },
    Event {
        id: u64,
        event: Value,
    },
    Pong {
        id: u64,
    },
    #[serde(other)]
    Unknown,
}

/// Parse a text frame into its messages (single object or array).
pub fn parse_frame(text: &str) -> Result<Vec<InboundMessage>, Error> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(Error::from))
            .collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

// ── Compressed entity states ─────────────────────────────────────────

/// Full state of one entity as sent in the `a` map.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CompressedState {
    #[serde(rename = "s")]
    pub state: String,
    #[serde(rename = "a", default)]
    pub attributes: Map<String, Value>,
    /// Epoch seconds.
    #[serde(rename = "lc", default)]
    pub last_changed: Option<f64>,
    /// Epoch seconds; the hub omits it when equal to `lc`.
    #[serde(rename = "lu", default)]
    pub last_updated: Option<f64>,
}

impl CompressedState {
    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated.or(self.last_changed).and_then(epoch_to_datetime)
    }

    pub fn last_changed_at(&self) -> Option<DateTime<Utc>> {
        self.last_changed.and_then(epoch_to_datetime)
    }
}

/// Changed fields of an entity (`+` part of a diff).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DiffAdditions {
    #[serde(rename = "s", default)]
    pub state: Option<String>,
    #[serde(rename = "a", default)]
    pub attributes: Map<String, Value>,
    #[serde(rename = "lc", default)]
    pub last_changed: Option<f64>,
    #[serde(rename = "lu", default)]
    pub last_updated: Option<f64>,
}

/// Removed attribute keys of an entity (`-` part of a diff).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DiffRemovals {
    #[serde(rename = "a", default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CompressedDiff {
    #[serde(rename = "+", default)]
    pub additions: Option<DiffAdditions>,
    #[serde(rename = "-", default)]
    pub removals: Option<DiffRemovals>,
}

impl CompressedDiff {
    /// Timestamp carried by the diff: `lu`, else `lc` (a state change bumps both).
    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        let add = self.additions.as_ref()?;
        add.last_updated.or(add.last_changed).and_then(epoch_to_datetime)
    }
}

/// Payload of a `subscribe_entities` event. Maps are ordered so that
/// converting an event into per-entity updates is deterministic.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EntitiesEvent {
    #[serde(rename = "a", default)]
    pub added: BTreeMap<String, CompressedState>,
    #[serde(rename = "c", default)]
    pub changed: BTreeMap<String, CompressedDiff>,
    #[serde(rename = "r", default)]
    pub removed: Vec<String>,
}

impl EntitiesEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Convert the hub's fractional epoch seconds to a UTC timestamp.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn epoch_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

// ── Tests ────────────────────────────────────────────────────────────
