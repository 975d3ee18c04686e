// ── Domain model ──
//
// Hub entities and the dashboard that displays them.

pub mod entity;
pub mod entity_id;
pub mod widget;

pub use entity::{
    AutomationAttributes, CameraAttributes, ClimateAttributes, CoverAttributes, Domain,
    DomainAttributes, EntityPatch, EntityState, LightAttributes, MediaAttributes,
    OptimisticPatch, PrinterAttributes, SensorAttributes, WeatherAttributes,
};
pub use entity_id::{EntityId, InvalidEntityId, WidgetId};
pub use widget::{
    BorderEffect, DEFAULT_COLS, DEFAULT_ROWS, DashboardLayout, GridPos, GridSize,
    MAX_WIDGET_HEIGHT, MAX_WIDGET_WIDTH, OverlayKind, Widget, WidgetEdit, WidgetStyle,
};
