//! Dashboard core for Prism Desktop: everything between `prism-api` and the
//! widgets on screen.
//!
//! - **[`Controller`]**: facade owning the hub session, the layout and the
//!   shortcut table. [`connect()`](Controller::connect) spawns the link and
//!   a single reconcile task; every hub event, command result and gesture is
//!   applied there in arrival order.
//!
//! - **[`Reconciler`]**: the pure state machine behind that task. Feeds the
//!   [`EntityCache`] and the [`CommandDispatcher`] and answers with
//!   [`Effect`]s (send a call, arm a timer, publish an outcome).
//!
//! - **[`EntityCache`]**: authoritative hub state plus optimistic overlays.
//!   Readers get lock-free lookups and an [`EntityStream`] of versioned
//!   snapshots.
//!
//! - **[`LayoutEngine`]**: grid placement with conflict checks, drag and
//!   overlays. Edits are persisted through the [`CheckpointWriter`].
//!
//! - **[`ShortcutBinder`]**: global key combos bound to widgets.

pub mod checkpoint;
pub mod command;
pub mod config;
pub mod controller;
pub mod convert;
pub mod error;
pub mod gesture;
pub mod layout;
pub mod model;
pub mod reconcile;
pub mod shortcut;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use checkpoint::{CheckpointWriter, DashboardDocument, DocumentSink};
pub use command::{
    CommandDispatcher, CommandId, CommandOutcome, CommandReport, Intent, IntentClass,
};
pub use config::ControllerConfig;
pub use controller::{Controller, TapResult};
pub use error::CoreError;
pub use gesture::{Point, PressConfig, PressEvent, PressTracker, WidgetAction};
pub use layout::{LayoutEngine, LayoutError, LayoutReader};
pub use reconcile::{Effect, HubInput, Input, LinkFailure, Reconciler};
pub use shortcut::{KeyCombo, Registration, ShortcutBinder};
pub use store::{CacheReader, CachedEntity, EntityCache, EntityEvent, EntityView};
pub use stream::{EntityFilter, EntityStream};

pub use prism_api::{ConnectionState, ReconnectConfig};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    DashboardLayout, Domain, EntityId, EntityPatch, EntityState, GridPos, GridSize,
    OptimisticPatch, OverlayKind, Widget, WidgetEdit, WidgetId, WidgetStyle,
};
