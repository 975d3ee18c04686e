// ── Wire-to-domain conversions ──
//
// Bridges the hub's compressed entity payloads from `prism_api` into
// cache events. Malformed entity ids are dropped with a warning; a
// missing timestamp on a full state falls back to the Unix epoch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use prism_api::{CompressedDiff, CompressedState, EntitiesEvent};

use crate::model::{EntityId, EntityPatch, EntityState};
use crate::store::EntityEvent;

// ── Helpers ──────────────────────────────────────────────────────────

fn parse_id(raw: &str) -> Option<EntityId> {
    match EntityId::new(raw) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping entity with malformed id");
            None
        }
    }
}

fn full_state(id: EntityId, wire: CompressedState) -> EntityState {
    let last_changed = wire.last_changed_at().unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let last_updated = wire.last_updated_at().unwrap_or(last_changed);
    EntityState::new(id, wire.state, wire.attributes, last_changed, last_updated)
}

fn patch(id: EntityId, diff: CompressedDiff) -> EntityPatch {
    let last_updated = diff.last_updated_at();
    let removed_attributes = diff.removals.map(|r| r.attributes).unwrap_or_default();
    match diff.additions {
        Some(add) => EntityPatch {
            id,
            state: add.state,
            set_attributes: add.attributes,
            removed_attributes,
            last_changed: add.last_changed.and_then(prism_api::epoch_to_datetime),
            last_updated,
        },
        None => EntityPatch {
            id,
            state: None,
            set_attributes: serde_json::Map::new(),
            removed_attributes,
            last_changed: None,
            last_updated,
        },
    }
}

// ── Public conversions ───────────────────────────────────────────────

/// Initial entity set of a session, in id order.
pub fn snapshot_states(snapshot: BTreeMap<String, CompressedState>) -> Vec<EntityState> {
    snapshot
        .into_iter()
        .filter_map(|(raw, wire)| Some(full_state(parse_id(&raw)?, wire)))
        .collect()
}

/// Per-entity cache events for one update: full states, then diffs,
/// then removals.
pub fn entity_events(event: EntitiesEvent) -> Vec<EntityEvent> {
    let EntitiesEvent {
        added,
        changed,
        removed,
    } = event;

    let added = added
        .into_iter()
        .filter_map(|(raw, wire)| Some(EntityEvent::Replace(full_state(parse_id(&raw)?, wire))));
    let changed = changed
        .into_iter()
        .filter_map(|(raw, diff)| Some(EntityEvent::Patch(patch(parse_id(&raw)?, diff))));
    let removed = removed
        .iter()
        .filter_map(|raw| parse_id(raw).map(EntityEvent::Remove));

    added.chain(changed).chain(removed).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn snapshot_skips_malformed_ids() {
        let snapshot: BTreeMap<String, CompressedState> = serde_json::from_value(json!({
            "light.desk": {"s": "on", "a": {"brightness": 200}, "lc": 1_700_000_000.5},
            "not an id": {"s": "on"},
        }))
        .unwrap();

        let states = snapshot_states(snapshot);
        assert_eq!(states.len(), 1);
        let desk = &states[0];
        assert_eq!(desk.id.as_str(), "light.desk");
        assert_eq!(desk.last_updated, desk.last_changed);
        assert_eq!(desk.last_changed.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn missing_timestamps_fall_back_to_epoch() {
        let states = snapshot_states(BTreeMap::from([(
            "switch.fan".to_owned(),
            CompressedState {
                state: "off".into(),
                ..CompressedState::default()
            },
        )]));
        assert_eq!(states[0].last_updated, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn update_event_orders_replace_patch_remove() {
        let event: EntitiesEvent = serde_json::from_value(json!({
            "r": ["cover.garage"],
            "c": {"light.desk": {"+": {"s": "off", "lc": 20.0}, "-": {"a": ["brightness"]}}},
            "a": {"switch.fan": {"s": "on", "lc": 10.0, "lu": 12.0}},
        }))
        .unwrap();

        let events = entity_events(event);
        assert_eq!(events.len(), 3);
        let EntityEvent::Replace(fan) = &events[0] else {
            panic!("expected replace first");
        };
        assert_eq!(fan.last_updated.timestamp(), 12);
        assert_eq!(fan.last_changed.timestamp(), 10);

        let EntityEvent::Patch(desk) = &events[1] else {
            panic!("expected patch second");
        };
        assert_eq!(desk.state.as_deref(), Some("off"));
        assert_eq!(desk.removed_attributes, vec!["brightness".to_owned()]);
        assert_eq!(desk.last_updated.map(|t| t.timestamp()), Some(20));

        assert_eq!(
            events[2],
            EntityEvent::Remove(EntityId::new("cover.garage").unwrap())
        );
    }

    #[test]
    fn removal_only_diff_has_no_timestamp() {
        let event: EntitiesEvent = serde_json::from_value(json!({
            "c": {"sensor.temp": {"-": {"a": ["unit_of_measurement"]}}},
        }))
        .unwrap();
        let events = entity_events(event);
        let EntityEvent::Patch(patch) = &events[0] else {
            panic!("expected patch");
        };
        assert_eq!(patch.last_updated, None);
        assert_eq!(patch.state, None);
    }
}
