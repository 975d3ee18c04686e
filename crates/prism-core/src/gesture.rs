// ── Press gestures ──
//
// Classifies a pointer press into tap, long press or drag start, and maps
// the result onto what a widget should do. Time is passed in so the
// classifier can be driven from tests without a clock.

use std::time::Duration;

use tokio::time::Instant;

use crate::command::Intent;
use crate::error::CoreError;
use crate::model::{Domain, OverlayKind, Widget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressConfig {
    /// Hold time after which a press becomes a long press. Default: 300ms.
    pub long_press: Duration,
    /// Manhattan distance in pixels that turns a press into a drag. Default: 10.
    pub drag_threshold: u32,
}

impl Default for PressConfig {
    fn default() -> Self {
        Self {
            long_press: Duration::from_millis(300),
            drag_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    fn manhattan(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).saturating_add(self.y.abs_diff(other.y))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressEvent {
    Tap,
    LongPress,
    DragStart,
}

#[derive(Debug, Clone, Copy)]
struct Press {
    origin: Point,
    started: Instant,
    long_fired: bool,
    dragging: bool,
}

impl Press {
    fn settled(&self) -> bool {
        self.long_fired || self.dragging
    }
}

/// Tracks one press at a time.
#[derive(Debug, Clone)]
pub struct PressTracker {
    config: PressConfig,
    active: Option<Press>,
}

impl PressTracker {
    pub fn new(config: PressConfig) -> Self {
        Self {
            config,
            active: None,
        }
    }

    /// Start tracking. A press already in progress is abandoned.
    pub fn press(&mut self, at: Point, now: Instant) {
        self.active = Some(Press {
            origin: at,
            started: now,
            long_fired: false,
            dragging: false,
        });
    }

    /// Pointer moved while pressed. Yields `DragStart` once.
    pub fn motion(&mut self, at: Point) -> Option<PressEvent> {
        let threshold = self.config.drag_threshold;
        let press = self.active.as_mut().filter(|p| !p.settled())?;
        if press.origin.manhattan(at) >= threshold {
            press.dragging = true;
            return Some(PressEvent::DragStart);
        }
        None
    }

    /// Check the hold timer. Yields `LongPress` once.
    pub fn poll(&mut self, now: Instant) -> Option<PressEvent> {
        let long_press = self.config.long_press;
        let press = self.active.as_mut().filter(|p| !p.settled())?;
        if now.saturating_duration_since(press.started) >= long_press {
            press.long_fired = true;
            return Some(PressEvent::LongPress);
        }
        None
    }

    /// Pointer released.
    pub fn release(&mut self, now: Instant) -> Option<PressEvent> {
        let press = self.active.take()?;
        if press.settled() {
            return None;
        }
        if now.saturating_duration_since(press.started) >= self.config.long_press {
            Some(PressEvent::LongPress)
        } else {
            Some(PressEvent::Tap)
        }
    }

    pub fn cancel(&mut self) {
        self.active = None;
    }

    /// When `poll` will next yield, if a press is pending.
    pub fn long_press_deadline(&self) -> Option<Instant> {
        self.active
            .filter(|p| !p.settled())
            .map(|p| p.started + self.config.long_press)
    }

    pub fn is_pressed(&self) -> bool {
        self.active.is_some()
    }
}

// ── Widget actions ───────────────────────────────────────────────────

/// What activating a widget does.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetAction {
    Dispatch(Intent),
    OpenOverlay(OverlayKind),
    Nothing,
}

/// Action for a tap (and for a keyboard shortcut).
pub fn tap_action(widget: &Widget) -> Result<WidgetAction, CoreError> {
    if let Some(service) = &widget.service {
        return Intent::service(service).map(WidgetAction::Dispatch);
    }
    Ok(match widget.entity_id.domain() {
        Domain::Climate => WidgetAction::OpenOverlay(OverlayKind::Thermostat),
        d if d.is_read_only() => WidgetAction::Nothing,
        Domain::Scene | Domain::Script => WidgetAction::Dispatch(Intent::Activate),
        _ => WidgetAction::Dispatch(Intent::Toggle),
    })
}

/// Action for a long press: the domain's overlay if it has one,
/// otherwise the tap action.
pub fn long_press_action(widget: &Widget) -> Result<WidgetAction, CoreError> {
    Ok(match widget.entity_id.domain() {
        Domain::Light => WidgetAction::OpenOverlay(OverlayKind::Dimmer),
        Domain::Cover => WidgetAction::OpenOverlay(OverlayKind::Position),
        Domain::Climate => WidgetAction::OpenOverlay(OverlayKind::Thermostat),
        _ => return tap_action(widget),
    })
}
