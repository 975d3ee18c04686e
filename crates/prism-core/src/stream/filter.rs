// ── Filter predicates for entity streams ──
//
// Used by consumers to narrow snapshots without touching the cache.

use crate::model::Domain;
use crate::store::CachedEntity;

/// Filter predicate over cached entities.
pub enum EntityFilter {
    All,
    ByDomain(Domain),
    /// Entities with a pending optimistic overlay.
    Optimistic,
    Unavailable,
    Custom(Box<dyn Fn(&CachedEntity) -> bool + Send + Sync>),
}

impl EntityFilter {
    pub fn matches(&self, entity: &CachedEntity) -> bool {
        match self {
            Self::All => true,
            Self::ByDomain(domain) => entity.effective.domain == *domain,
            Self::Optimistic => entity.optimistic,
            Self::Unavailable => entity.effective.is_unavailable(),
            Self::Custom(f) => f(entity),
        }
    }
}
