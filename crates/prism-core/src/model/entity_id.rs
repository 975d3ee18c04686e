// ── Core identity types ──
//
// EntityId names a hub entity (`domain.object_id`); WidgetId names a
// dashboard tile. Both are plain values and cheap to clone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use super::entity::Domain;

// ── EntityId ────────────────────────────────────────────────────────

/// Rejected entity id, with the offending input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid entity id '{0}' (expected domain.object_id)")]
pub struct InvalidEntityId(pub String);

/// Identifier of a hub entity, e.g. `light.kitchen`.
///
/// The domain part is ASCII letters and `_`; the object id is ASCII
/// alphanumerics and `_`. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidEntityId> {
        let raw = raw.into();
        let valid = raw.split_once('.').is_some_and(|(domain, object)| {
            !domain.is_empty()
                && !object.is_empty()
                && domain.chars().all(|c| c.is_ascii_alphabetic() || c == '_')
                && object.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
        if valid {
            Ok(Self(raw))
        } else {
            Err(InvalidEntityId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The raw domain prefix as the hub spells it (`media_player`, `binary_sensor`).
    pub fn domain_prefix(&self) -> &str {
        self.0.split_once('.').map_or("", |(domain, _)| domain)
    }

    pub fn object_id(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, object)| object)
    }

    pub fn domain(&self) -> Domain {
        Domain::from_prefix(self.domain_prefix())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = InvalidEntityId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = InvalidEntityId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

// ── WidgetId ────────────────────────────────────────────────────────

/// Stable identity of a dashboard widget (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetId(Uuid);

impl WidgetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WidgetId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WidgetId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WidgetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
