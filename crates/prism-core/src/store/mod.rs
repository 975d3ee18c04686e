// ── Entity state cache ──
//
// Local mirror of hub entity state. Exactly one writer (the reconciler)
// owns `EntityCache`; any number of readers hold a `CacheReader` for
// lock-free point lookups, whole-cache snapshots and change streams.

mod collection;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

pub use collection::CollectionSnapshot;
use collection::EntityCollection;

use crate::command::CommandId;
use crate::model::{EntityId, EntityPatch, EntityState, OptimisticPatch};
use crate::stream::EntityStream;

// ── Cached entries and views ─────────────────────────────────────────

/// One cache entry: the hub's view plus the view shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    pub authoritative: EntityState,
    /// `authoritative` with pending optimistic patches applied in issue order.
    pub effective: EntityState,
    pub optimistic: bool,
}

impl CachedEntity {
    fn settled(state: EntityState) -> Self {
        Self {
            effective: state.clone(),
            authoritative: state,
            optimistic: false,
        }
    }
}

/// What the UI should render for an entity id.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityView {
    Known {
        state: EntityState,
        optimistic: bool,
        /// The link is not live; the value may be out of date.
        stale: bool,
    },
    /// The hub has not reported this entity in the current session.
    Unavailable,
}

impl EntityView {
    pub fn state(&self) -> Option<&EntityState> {
        match self {
            Self::Known { state, .. } => Some(state),
            Self::Unavailable => None,
        }
    }
}

pub type EntitySnapshot = CollectionSnapshot<CachedEntity>;

// ── Events ───────────────────────────────────────────────────────────

/// Authoritative input to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    /// Full entity set at session start. Replaces everything.
    Resync(Vec<EntityState>),
    Replace(EntityState),
    Patch(EntityPatch),
    Remove(EntityId),
}

/// Result of applying events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    /// Entities whose authoritative state changed.
    pub changed: BTreeSet<EntityId>,
    /// Entities with an event that was dropped (older than the watermark,
    /// or a patch/removal for an unknown entity).
    pub discarded: BTreeSet<EntityId>,
}

type Staged = BTreeMap<EntityId, Option<Arc<CachedEntity>>>;

// ── EntityCache (writer) ─────────────────────────────────────────────

pub struct EntityCache {
    entities: Arc<EntityCollection<CachedEntity>>,
    stale: watch::Sender<bool>,
    /// Highest `last_updated` seen per entity this session. Survives
    /// removal so late events for a removed entity stay discarded.
    watermarks: HashMap<EntityId, DateTime<Utc>>,
    /// Optimistic layers per entity, in issue order.
    overlays: HashMap<EntityId, Vec<(CommandId, OptimisticPatch)>>,
}

impl EntityCache {
    pub fn new() -> Self {
        let (stale, _) = watch::channel(true);
        Self {
            entities: Arc::new(EntityCollection::new()),
            stale,
            watermarks: HashMap::new(),
            overlays: HashMap::new(),
        }
    }

    pub fn reader(&self) -> CacheReader {
        CacheReader {
            entities: Arc::clone(&self.entities),
            stale: self.stale.subscribe(),
        }
    }

    pub fn get(&self, id: &EntityId) -> EntityView {
        view(self.entities.get(id), *self.stale.borrow())
    }

    pub fn snapshot(&self) -> Arc<EntitySnapshot> {
        self.entities.snapshot()
    }

    /// The hub's last reported state, without optimistic layers.
    pub fn authoritative(&self, id: &EntityId) -> Option<EntityState> {
        self.entities.get(id).map(|entry| entry.authoritative.clone())
    }

    pub fn apply(&mut self, event: EntityEvent) -> Applied {
        self.apply_batch([event])
    }

    /// Apply events in order and publish a single snapshot for the batch
    /// (a `Resync` inside the batch publishes on its own).
    pub fn apply_batch(&mut self, events: impl IntoIterator<Item = EntityEvent>) -> Applied {
        let mut staged = Staged::new();
        let mut applied = Applied::default();

        for event in events {
            match event {
                EntityEvent::Resync(states) => {
                    self.entities.commit(std::mem::take(&mut staged));
                    self.resync(states, &mut applied);
                }
                EntityEvent::Replace(state) => self.replace(state, &mut staged, &mut applied),
                EntityEvent::Patch(patch) => self.patch(&patch, &mut staged, &mut applied),
                EntityEvent::Remove(id) => self.remove(id, &mut staged, &mut applied),
            }
        }

        self.entities.commit(staged);
        if !applied.discarded.is_empty() {
            tracing::debug!(count = applied.discarded.len(), "Discarded stale entity events");
        }
        applied
    }

    /// Flag the cache as possibly out of date (link left `Live`).
    pub fn mark_stale(&self) {
        self.stale.send_if_modified(|stale| !std::mem::replace(stale, true));
    }

    pub fn is_stale(&self) -> bool {
        *self.stale.borrow()
    }

    // ── Optimistic overlays ──────────────────────────────────────────

    /// Layer `patch` over the entity for `command_id`. Returns `false`
    /// (and stores nothing) if the entity is not in the cache.
    pub fn set_optimistic(
        &mut self,
        id: &EntityId,
        command_id: CommandId,
        patch: OptimisticPatch,
    ) -> bool {
        let Some(current) = self.entities.get(id) else {
            return false;
        };
        let layers = self.overlays.entry(id.clone()).or_default();
        if let Some(slot) = layers.iter_mut().find(|(c, _)| *c == command_id) {
            slot.1 = patch;
        } else {
            layers.push((command_id, patch));
        }
        self.publish_effective(id, &current);
        true
    }

    /// Drop the layer of `command_id`, restoring the state underneath.
    pub fn clear_optimistic(&mut self, id: &EntityId, command_id: CommandId) -> bool {
        let Some(layers) = self.overlays.get_mut(id) else {
            return false;
        };
        let before = layers.len();
        layers.retain(|(c, _)| *c != command_id);
        if layers.len() == before {
            return false;
        }
        if layers.is_empty() {
            self.overlays.remove(id);
        }
        if let Some(current) = self.entities.get(id) {
            self.publish_effective(id, &current);
        }
        true
    }

    pub fn overlay_count(&self, id: &EntityId) -> usize {
        self.overlays.get(id).map_or(0, Vec::len)
    }

    // ── Event handlers ───────────────────────────────────────────────

    fn resync(&mut self, states: Vec<EntityState>, applied: &mut Applied) {
        let previous = self.entities.snapshot();
        self.watermarks.clear();
        self.overlays.clear();

        let mut items = BTreeMap::new();
        for state in states {
            self.watermarks.insert(state.id.clone(), state.last_updated);
            items.insert(state.id.clone(), Arc::new(CachedEntity::settled(state)));
        }

        applied.changed.extend(previous.items.keys().cloned());
        applied.changed.extend(items.keys().cloned());
        tracing::info!(entities = items.len(), "Entity cache resynced");

        self.entities.replace_all(items);
        self.stale.send_replace(false);
    }

    fn replace(&mut self, state: EntityState, staged: &mut Staged, applied: &mut Applied) {
        if self.is_older(&state.id, state.last_updated) {
            applied.discarded.insert(state.id);
            return;
        }
        let id = state.id.clone();
        self.watermarks.insert(id.clone(), state.last_updated);
        self.overlays.remove(&id);
        staged.insert(id.clone(), Some(Arc::new(CachedEntity::settled(state))));
        applied.changed.insert(id);
    }

    fn patch(&mut self, patch: &EntityPatch, staged: &mut Staged, applied: &mut Applied) {
        let id = &patch.id;
        let Some(current) = self.current(staged, id) else {
            applied.discarded.insert(id.clone());
            return;
        };
        if patch.last_updated.is_some_and(|ts| self.is_older(id, ts)) {
            applied.discarded.insert(id.clone());
            return;
        }

        let mut state = current.authoritative.clone();
        state.merge(patch);
        if let Some(ts) = patch.last_updated {
            self.watermarks.insert(id.clone(), ts);
        }
        self.overlays.remove(id);
        staged.insert(id.clone(), Some(Arc::new(CachedEntity::settled(state))));
        applied.changed.insert(id.clone());
    }

    fn remove(&mut self, id: EntityId, staged: &mut Staged, applied: &mut Applied) {
        if self.current(staged, &id).is_none() {
            applied.discarded.insert(id);
            return;
        }
        self.overlays.remove(&id);
        staged.insert(id.clone(), None);
        applied.changed.insert(id);
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn current(&self, staged: &Staged, id: &EntityId) -> Option<Arc<CachedEntity>> {
        match staged.get(id) {
            Some(entry) => entry.clone(),
            None => self.entities.get(id),
        }
    }

    /// Strictly older than the watermark. Equal timestamps apply.
    fn is_older(&self, id: &EntityId, ts: DateTime<Utc>) -> bool {
        self.watermarks.get(id).is_some_and(|mark| ts < *mark)
    }

    fn publish_effective(&self, id: &EntityId, current: &CachedEntity) {
        let mut effective = current.authoritative.clone();
        let layers = self.overlays.get(id);
        for (_, patch) in layers.into_iter().flatten() {
            patch.apply(&mut effective);
        }
        let entry = CachedEntity {
            authoritative: current.authoritative.clone(),
            effective,
            optimistic: layers.is_some_and(|l| !l.is_empty()),
        };
        self.entities
            .commit(BTreeMap::from([(id.clone(), Some(Arc::new(entry)))]));
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

// ── CacheReader ──────────────────────────────────────────────────────

/// Read-only handle onto the cache, cheap to clone and share.
#[derive(Clone)]
pub struct CacheReader {
    entities: Arc<EntityCollection<CachedEntity>>,
    stale: watch::Receiver<bool>,
}

impl CacheReader {
    pub fn get(&self, id: &EntityId) -> EntityView {
        view(self.entities.get(id), *self.stale.borrow())
    }

    pub fn snapshot(&self) -> Arc<EntitySnapshot> {
        self.entities.snapshot()
    }

    pub fn subscribe(&self) -> EntityStream<CachedEntity> {
        EntityStream::new(self.entities.subscribe())
    }

    pub fn is_stale(&self) -> bool {
        *self.stale.borrow()
    }
}

fn view(entry: Option<Arc<CachedEntity>>, stale: bool) -> EntityView {
    entry.map_or(EntityView::Unavailable, |entry| EntityView::Known {
        state: entry.effective.clone(),
        optimistic: entry.optimistic,
        stale,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};
    use uuid::Uuid;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn id(raw: &str) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn state(raw_id: &str, value: &str, at: i64) -> EntityState {
        EntityState::new(id(raw_id), value, Map::new(), ts(at), ts(at))
    }

    fn patch(raw_id: &str, value: &str, at: Option<i64>) -> EntityPatch {
        EntityPatch {
            id: id(raw_id),
            state: Some(value.into()),
            set_attributes: Map::new(),
            removed_attributes: Vec::new(),
            last_changed: at.map(ts),
            last_updated: at.map(ts),
        }
    }

    fn current_state(cache: &EntityCache, raw_id: &str) -> Option<String> {
        cache.get(&id(raw_id)).state().map(|s| s.state.clone())
    }

    #[test]
    fn resync_replaces_everything_and_clears_stale() {
        let mut cache = EntityCache::new();
        assert!(cache.is_stale());
        cache.apply(EntityEvent::Resync(vec![state("light.a", "on", 1)]));
        let applied = cache.apply(EntityEvent::Resync(vec![state("switch.b", "off", 2)]));

        assert!(!cache.is_stale());
        assert_eq!(cache.get(&id("light.a")), EntityView::Unavailable);
        assert_eq!(current_state(&cache, "switch.b").as_deref(), Some("off"));
        assert!(applied.changed.contains(&id("light.a")));
        assert!(applied.changed.contains(&id("switch.b")));
    }

    #[test]
    fn older_events_are_discarded_equal_apply() {
        let mut cache = EntityCache::new();
        cache.apply(EntityEvent::Resync(vec![state("light.a", "on", 10)]));

        let applied = cache.apply(EntityEvent::Replace(state("light.a", "off", 9)));
        assert!(applied.discarded.contains(&id("light.a")));
        assert_eq!(current_state(&cache, "light.a").as_deref(), Some("on"));

        let applied = cache.apply(EntityEvent::Patch(patch("light.a", "off", Some(10))));
        assert!(applied.changed.contains(&id("light.a")));
        assert_eq!(current_state(&cache, "light.a").as_deref(), Some("off"));
    }

    #[test]
    fn patch_for_unknown_entity_is_discarded() {
        let mut cache = EntityCache::new();
        cache.apply(EntityEvent::Resync(Vec::new()));
        let applied = cache.apply(EntityEvent::Patch(patch("light.ghost", "on", Some(1))));
        assert_eq!(applied.discarded, BTreeSet::from([id("light.ghost")]));
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn removal_keeps_watermark_as_tombstone() {
        let mut cache = EntityCache::new();
        cache.apply(EntityEvent::Resync(vec![state("light.a", "on", 10)]));
        cache.apply(EntityEvent::Remove(id("light.a")));
        assert_eq!(cache.get(&id("light.a")), EntityView::Unavailable);

        // A delayed full state from before the removal must not resurrect it
        let applied = cache.apply(EntityEvent::Replace(state("light.a", "on", 5)));
        assert!(applied.discarded.contains(&id("light.a")));
        assert_eq!(cache.get(&id("light.a")), EntityView::Unavailable);

        // A newer one re-adds it
        cache.apply(EntityEvent::Replace(state("light.a", "off", 11)));
        assert_eq!(current_state(&cache, "light.a").as_deref(), Some("off"));
    }

    #[test]
    fn batch_publishes_one_snapshot() {
        let mut cache = EntityCache::new();
        cache.apply(EntityEvent::Resync(Vec::new()));
        let before = cache.snapshot().version;

        cache.apply_batch([
            EntityEvent::Replace(state("light.a", "on", 1)),
            EntityEvent::Replace(state("light.b", "on", 1)),
            EntityEvent::Patch(patch("light.a", "off", Some(2))),
        ]);

        let snap = cache.snapshot();
        assert_eq!(snap.version, before + 1);
        assert_eq!(snap.get(&id("light.a")).unwrap().authoritative.state, "off");
    }

    #[test]
    fn overlays_stack_in_issue_order_and_roll_back() {
        let mut cache = EntityCache::new();
        cache.apply(EntityEvent::Resync(vec![state("light.a", "off", 1)]));
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(cache.set_optimistic(&id("light.a"), first, OptimisticPatch::state("on")));
        assert!(cache.set_optimistic(
            &id("light.a"),
            second,
            OptimisticPatch::default().with_attribute("brightness", 128),
        ));

        let EntityView::Known {
            state, optimistic, ..
        } = cache.get(&id("light.a"))
        else {
            panic!("expected known entity");
        };
        assert!(optimistic);
        assert_eq!(state.state, "on");
        assert_eq!(state.raw_attributes["brightness"], json!(128));

        cache.clear_optimistic(&id("light.a"), first);
        assert_eq!(current_state(&cache, "light.a").as_deref(), Some("off"));
        cache.clear_optimistic(&id("light.a"), second);
        assert!(!cache.snapshot().get(&id("light.a")).unwrap().optimistic);
    }

    #[test]
    fn authoritative_event_clears_overlays() {
        let mut cache = EntityCache::new();
        cache.apply(EntityEvent::Resync(vec![state("switch.fan", "off", 1)]));
        cache.set_optimistic(&id("switch.fan"), Uuid::new_v4(), OptimisticPatch::state("on"));

        cache.apply(EntityEvent::Patch(patch("switch.fan", "off", Some(2))));
        assert_eq!(cache.overlay_count(&id("switch.fan")), 0);
        assert_eq!(current_state(&cache, "switch.fan").as_deref(), Some("off"));
    }

    #[test]
    fn optimistic_on_unknown_entity_is_refused() {
        let mut cache = EntityCache::new();
        assert!(!cache.set_optimistic(&id("light.x"), Uuid::new_v4(), OptimisticPatch::state("on")));
        assert_eq!(cache.overlay_count(&id("light.x")), 0);
    }

    #[test]
    fn replay_is_deterministic() {
        let events = vec![
            EntityEvent::Resync(vec![state("light.a", "on", 1), state("switch.b", "off", 1)]),
            EntityEvent::Patch(patch("light.a", "off", Some(3))),
            EntityEvent::Replace(state("light.a", "on", 2)),
            EntityEvent::Remove(id("switch.b")),
            EntityEvent::Replace(state("cover.c", "open", 4)),
        ];

        let run = || {
            let mut cache = EntityCache::new();
            for event in events.clone() {
                cache.apply(event);
            }
            cache.snapshot()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn mark_stale_is_visible_to_readers() {
        let mut cache = EntityCache::new();
        cache.apply(EntityEvent::Resync(vec![state("light.a", "on", 1)]));
        let reader = cache.reader();
        assert!(!reader.is_stale());

        cache.mark_stale();
        assert!(reader.is_stale());
        let EntityView::Known { stale, .. } = reader.get(&id("light.a")) else {
            panic!("expected known entity");
        };
        assert!(stale);
    }
}
