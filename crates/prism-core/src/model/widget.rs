// ── Dashboard model ──
//
// Widgets and the grid they live on. These types are persisted in the
// config document, so field names are part of the on-disk format.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::entity_id::{EntityId, WidgetId};

/// Widest span a widget may take.
pub const MAX_WIDGET_WIDTH: u16 = 4;
/// Tallest span a widget may take.
pub const MAX_WIDGET_HEIGHT: u16 = 2;

pub const DEFAULT_COLS: u16 = 4;
pub const DEFAULT_ROWS: u16 = 2;

// ── Geometry ────────────────────────────────────────────────────────

/// Top-left cell of a widget (zero-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPos {
    pub col: u16,
    pub row: u16,
}

impl GridPos {
    pub const fn new(col: u16, row: u16) -> Self {
        Self { col, row }
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.col, self.row)
    }
}

/// Span of a widget in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSize {
    #[serde(rename = "width")]
    pub w: u16,
    #[serde(rename = "height")]
    pub h: u16,
}

impl GridSize {
    pub const ONE: Self = Self { w: 1, h: 1 };

    pub const fn new(w: u16, h: u16) -> Self {
        Self { w, h }
    }

    pub fn is_valid(self) -> bool {
        (1..=MAX_WIDGET_WIDTH).contains(&self.w) && (1..=MAX_WIDGET_HEIGHT).contains(&self.h)
    }

    pub fn fits_within(self, other: Self) -> bool {
        self.w <= other.w && self.h <= other.h
    }
}

impl Default for GridSize {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

// ── Styling ─────────────────────────────────────────────────────────

/// Animated border drawn while a widget is active.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BorderEffect {
    None,
    #[default]
    Rainbow,
    AuroraBorealis,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetStyle {
    /// `#rrggbb`; `None` uses the theme accent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub border_effect: BorderEffect,
}

/// Expanded control opened by a long press (or a tap on climate widgets).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverlayKind {
    Dimmer,
    Position,
    Thermostat,
}

// ── Widget ──────────────────────────────────────────────────────────

/// One tile on the dashboard, bound to a hub entity by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub id: WidgetId,
    pub entity_id: EntityId,
    pub position: GridPos,
    #[serde(default)]
    pub size: GridSize,
    #[serde(default)]
    pub style: WidgetStyle,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// `domain.service` to call on tap instead of the domain default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl Widget {
    pub fn new(entity_id: EntityId, position: GridPos) -> Self {
        Self {
            id: WidgetId::new(),
            entity_id,
            position,
            size: GridSize::ONE,
            style: WidgetStyle::default(),
            label: String::new(),
            icon: None,
            service: None,
        }
    }

    pub fn with_size(mut self, size: GridSize) -> Self {
        self.size = size;
        self
    }

    /// Label to show: the configured one, else the entity's object id.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            self.entity_id.object_id()
        } else {
            &self.label
        }
    }
}

/// Partial update for [`Widget`] presentation fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WidgetEdit {
    pub label: Option<String>,
    pub icon: Option<Option<String>>,
    pub style: Option<WidgetStyle>,
    pub service: Option<Option<String>>,
}

impl WidgetEdit {
    pub fn apply(&self, widget: &mut Widget) {
        if let Some(label) = &self.label {
            widget.label.clone_from(label);
        }
        if let Some(icon) = &self.icon {
            widget.icon.clone_from(icon);
        }
        if let Some(style) = &self.style {
            widget.style = style.clone();
        }
        if let Some(service) = &self.service {
            widget.service.clone_from(service);
        }
    }
}

// ── DashboardLayout ─────────────────────────────────────────────────

/// Grid dimensions plus widgets in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardLayout {
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub widgets: Vec<Widget>,
}

impl DashboardLayout {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            widgets: Vec::new(),
        }
    }

    pub fn widget(&self, id: WidgetId) -> Option<&Widget> {
        self.widgets.iter().find(|w| w.id == id)
    }

    pub fn widgets_for(&self, entity_id: &EntityId) -> impl Iterator<Item = &Widget> {
        self.widgets.iter().filter(move |w| &w.entity_id == entity_id)
    }
}

impl Default for DashboardLayout {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}
