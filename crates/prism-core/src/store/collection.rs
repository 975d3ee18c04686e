// ── Reactive entity collection ──
//
// Lock-free point lookups plus a versioned, ordered whole-collection
// snapshot published through a `watch` channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::model::EntityId;

/// Consistent view of a collection at one version.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot<T> {
    /// Bumped once per committed batch.
    pub version: u64,
    pub items: BTreeMap<EntityId, Arc<T>>,
}

impl<T> CollectionSnapshot<T> {
    pub fn get(&self, id: &EntityId) -> Option<&Arc<T>> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for CollectionSnapshot<T> {
    fn default() -> Self {
        Self {
            version: 0,
            items: BTreeMap::new(),
        }
    }
}

/// A lock-free, reactive collection keyed by [`EntityId`].
///
/// Uses `DashMap` for O(1) concurrent lookups and a `watch` channel for
/// push-based change notification. Mutations go through [`commit`](Self::commit),
/// which applies a whole batch and publishes exactly one new snapshot.
pub(crate) struct EntityCollection<T: Send + Sync + 'static> {
    by_id: DashMap<EntityId, Arc<T>>,
    snapshot: watch::Sender<Arc<CollectionSnapshot<T>>>,
}

impl<T: Send + Sync + 'static> EntityCollection<T> {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(CollectionSnapshot::default()));
        Self {
            by_id: DashMap::new(),
            snapshot,
        }
    }

    /// Apply upserts (`Some`) and removals (`None`) as one batch.
    /// No-op batches publish nothing.
    pub(crate) fn commit(&self, changes: BTreeMap<EntityId, Option<Arc<T>>>) {
        if changes.is_empty() {
            return;
        }
        for (id, entry) in changes {
            match entry {
                Some(value) => {
                    self.by_id.insert(id, value);
                }
                None => {
                    self.by_id.remove(&id);
                }
            }
        }
        self.rebuild_snapshot();
    }

    /// Upsert everything in `items`, then prune keys not among them.
    /// Publishes one snapshot; readers never observe an empty interim state.
    pub(crate) fn replace_all(&self, items: BTreeMap<EntityId, Arc<T>>) {
        for (id, value) in &items {
            self.by_id.insert(id.clone(), Arc::clone(value));
        }
        self.by_id.retain(|id, _| items.contains_key(id));
        self.rebuild_snapshot();
    }

    pub(crate) fn get(&self, id: &EntityId) -> Option<Arc<T>> {
        self.by_id.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<CollectionSnapshot<T>> {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<CollectionSnapshot<T>>> {
        self.snapshot.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn rebuild_snapshot(&self) {
        let items: BTreeMap<EntityId, Arc<T>> = self
            .by_id
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| {
            let version = snap.version + 1;
            *snap = Arc::new(CollectionSnapshot { version, items });
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn id(raw: &str) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn batch(entries: &[(&str, Option<&str>)]) -> BTreeMap<EntityId, Option<Arc<String>>> {
        entries
            .iter()
            .map(|(k, v)| (id(k), v.map(|v| Arc::new(v.to_owned()))))
            .collect()
    }

    #[test]
    fn commit_publishes_once_per_batch() {
        let col: EntityCollection<String> = EntityCollection::new();
        col.commit(batch(&[("light.a", Some("on")), ("light.b", Some("off"))]));

        let snap = col.snapshot();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.len(), 2);
        assert_eq!(*col.get(&id("light.a")).unwrap(), "on");
    }

    #[test]
    fn commit_removes_entries() {
        let col: EntityCollection<String> = EntityCollection::new();
        col.commit(batch(&[("light.a", Some("on"))]));
        col.commit(batch(&[("light.a", None)]));

        assert!(col.get(&id("light.a")).is_none());
        assert!(col.snapshot().is_empty());
        assert_eq!(col.snapshot().version, 2);
    }

    #[test]
    fn empty_commit_is_silent() {
        let col: EntityCollection<String> = EntityCollection::new();
        let rx = col.subscribe();
        col.commit(BTreeMap::new());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn replace_all_prunes_missing_keys() {
        let col: EntityCollection<String> = EntityCollection::new();
        col.commit(batch(&[("light.a", Some("on")), ("light.b", Some("off"))]));

        let mut next = BTreeMap::new();
        next.insert(id("light.b"), Arc::new("on".to_owned()));
        next.insert(id("switch.c"), Arc::new("off".to_owned()));
        col.replace_all(next);

        assert_eq!(col.len(), 2);
        assert!(col.get(&id("light.a")).is_none());
        let keys: Vec<_> = col.snapshot().items.keys().cloned().collect();
        assert_eq!(keys, vec![id("light.b"), id("switch.c")]);
    }
}
