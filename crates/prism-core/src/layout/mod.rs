// ── Layout engine ──
//
// Owns the dashboard grid. Every operation validates against the current
// layout first and only then commits, so a failed call leaves nothing
// changed. Each commit publishes a fresh `Arc<DashboardLayout>` that
// readers load without locking.

mod grid;

use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::model::{
    DashboardLayout, EntityId, GridPos, GridSize, OverlayKind, Widget, WidgetEdit, WidgetId,
};

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("Target cells are occupied by widget {with}")]
    Conflict { with: WidgetId },

    #[error("{size} at {pos} does not fit on the grid")]
    OutOfBounds { pos: GridPos, size: GridSize },

    #[error("Invalid widget size {size}")]
    InvalidSize { size: GridSize },

    #[error("Invalid grid {cols}x{rows}")]
    InvalidGrid { cols: u16, rows: u16 },

    #[error("Widget not found: {id}")]
    UnknownWidget { id: WidgetId },

    #[error("Widget {id} already exists")]
    DuplicateWidget { id: WidgetId },

    #[error("Widget {id} is already being dragged")]
    DragInProgress { id: WidgetId },

    #[error("No drag in progress")]
    NoDrag,

    #[error("Dropped outside the grid")]
    DroppedOutside,

    #[error("No free space for a {size} widget")]
    NoFreeSlot { size: GridSize },
}

// ── Reader ───────────────────────────────────────────────────────────

/// Lock-free read handle onto the published layout.
#[derive(Clone)]
pub struct LayoutReader {
    published: Arc<ArcSwap<DashboardLayout>>,
}

impl LayoutReader {
    pub fn load(&self) -> Arc<DashboardLayout> {
        self.published.load_full()
    }
}

// ── Engine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Drag {
    widget: WidgetId,
    origin: GridPos,
}

pub struct LayoutEngine {
    layout: Arc<DashboardLayout>,
    published: Arc<ArcSwap<DashboardLayout>>,
    drag: Option<Drag>,
    overlay: Option<(WidgetId, OverlayKind)>,
}

impl LayoutEngine {
    /// Adopt a persisted layout. Widgets that are malformed, out of
    /// bounds or overlap an earlier widget are dropped with a warning.
    pub fn load(layout: DashboardLayout) -> Self {
        let mut cols = layout.cols;
        let mut rows = layout.rows;
        if cols == 0 || rows == 0 {
            tracing::warn!(cols, rows, "Stored grid is empty, using defaults");
            let default = DashboardLayout::default();
            cols = default.cols;
            rows = default.rows;
        }

        let mut clean = DashboardLayout::new(cols, rows);
        for widget in layout.widgets {
            match Self::check_placement(&clean, &widget) {
                Ok(()) => clean.widgets.push(widget),
                Err(e) => tracing::warn!(
                    widget_id = %widget.id,
                    entity_id = %widget.entity_id,
                    error = %e,
                    "Dropping stored widget"
                ),
            }
        }

        let layout = Arc::new(clean);
        Self {
            published: Arc::new(ArcSwap::new(Arc::clone(&layout))),
            layout,
            drag: None,
            overlay: None,
        }
    }

    pub fn reader(&self) -> LayoutReader {
        LayoutReader {
            published: Arc::clone(&self.published),
        }
    }

    pub fn layout(&self) -> Arc<DashboardLayout> {
        Arc::clone(&self.layout)
    }

    pub fn widget(&self, id: WidgetId) -> Result<&Widget, LayoutError> {
        self.layout.widget(id).ok_or(LayoutError::UnknownWidget { id })
    }

    // ── Placement ────────────────────────────────────────────────────

    pub fn move_widget(&mut self, id: WidgetId, pos: GridPos) -> Result<(), LayoutError> {
        let size = self.widget(id)?.size;
        self.check_free(pos, size, Some(id))?;
        self.commit(|layout| {
            if let Some(w) = layout.widgets.iter_mut().find(|w| w.id == id) {
                w.position = pos;
            }
        });
        Ok(())
    }

    pub fn resize(&mut self, id: WidgetId, size: GridSize) -> Result<(), LayoutError> {
        if !size.is_valid() {
            return Err(LayoutError::InvalidSize { size });
        }
        let pos = self.widget(id)?.position;
        self.check_free(pos, size, Some(id))?;
        self.commit(|layout| {
            if let Some(w) = layout.widgets.iter_mut().find(|w| w.id == id) {
                w.size = size;
            }
        });
        Ok(())
    }

    /// Place a new 1×1 widget for `entity_id`.
    pub fn add_widget(&mut self, entity_id: EntityId, pos: GridPos) -> Result<WidgetId, LayoutError> {
        self.insert_widget(Widget::new(entity_id, pos))
    }

    /// Place a fully specified widget.
    pub fn insert_widget(&mut self, widget: Widget) -> Result<WidgetId, LayoutError> {
        if self.layout.widget(widget.id).is_some() {
            return Err(LayoutError::DuplicateWidget { id: widget.id });
        }
        Self::check_placement(&self.layout, &widget)?;
        let id = widget.id;
        self.commit(|layout| layout.widgets.push(widget));
        Ok(id)
    }

    pub fn remove_widget(&mut self, id: WidgetId) -> Result<Widget, LayoutError> {
        let removed = self.widget(id)?.clone();
        if self.drag.is_some_and(|d| d.widget == id) {
            self.drag = None;
        }
        if self.overlay.is_some_and(|(w, _)| w == id) {
            self.overlay = None;
        }
        self.commit(|layout| layout.widgets.retain(|w| w.id != id));
        Ok(removed)
    }

    /// Copy a widget (new id, same entity and presentation) into the
    /// first free slot of the same size.
    pub fn duplicate_widget(&mut self, id: WidgetId) -> Result<WidgetId, LayoutError> {
        let source = self.widget(id)?;
        let size = source.size;
        let pos = self.first_free_slot(size).ok_or(LayoutError::NoFreeSlot { size })?;
        let copy = Widget {
            id: WidgetId::new(),
            position: pos,
            ..source.clone()
        };
        self.insert_widget(copy)
    }

    pub fn first_free_slot(&self, size: GridSize) -> Option<GridPos> {
        grid::first_free(&self.layout, size)
    }

    /// Change the grid dimensions. Rejected if any widget would fall off.
    pub fn set_grid(&mut self, cols: u16, rows: u16) -> Result<(), LayoutError> {
        if cols == 0 || rows == 0 {
            return Err(LayoutError::InvalidGrid { cols, rows });
        }
        if let Some(w) = self
            .layout
            .widgets
            .iter()
            .find(|w| !grid::in_bounds(w.position, w.size, cols, rows))
        {
            return Err(LayoutError::OutOfBounds {
                pos: w.position,
                size: w.size,
            });
        }
        self.commit(|layout| {
            layout.cols = cols;
            layout.rows = rows;
        });
        Ok(())
    }

    pub fn update_widget(&mut self, id: WidgetId, edit: &WidgetEdit) -> Result<(), LayoutError> {
        self.widget(id)?;
        self.commit(|layout| {
            if let Some(w) = layout.widgets.iter_mut().find(|w| w.id == id) {
                edit.apply(w);
            }
        });
        Ok(())
    }

    // ── Drag ─────────────────────────────────────────────────────────

    pub fn begin_drag(&mut self, id: WidgetId) -> Result<(), LayoutError> {
        if let Some(drag) = self.drag {
            return Err(LayoutError::DragInProgress { id: drag.widget });
        }
        let origin = self.widget(id)?.position;
        self.drag = Some(Drag { widget: id, origin });
        tracing::trace!(widget_id = %id, %origin, "Drag started");
        Ok(())
    }

    /// Drop the dragged widget. `None` means it was released outside the
    /// grid. On any error the widget stays at its origin. The drag ends
    /// either way.
    pub fn end_drag(&mut self, target: Option<GridPos>) -> Result<GridPos, LayoutError> {
        let drag = self.drag.take().ok_or(LayoutError::NoDrag)?;
        let pos = target.ok_or(LayoutError::DroppedOutside)?;
        match self.move_widget(drag.widget, pos) {
            Ok(()) => Ok(pos),
            Err(e) => {
                tracing::debug!(
                    widget_id = %drag.widget,
                    origin = %drag.origin,
                    error = %e,
                    "Drag snapped back"
                );
                Err(e)
            }
        }
    }

    /// Abandon the drag. Returns the origin the widget stays at.
    pub fn cancel_drag(&mut self) -> Option<GridPos> {
        self.drag.take().map(|d| d.origin)
    }

    pub fn dragging(&self) -> Option<WidgetId> {
        self.drag.map(|d| d.widget)
    }

    // ── Overlays ─────────────────────────────────────────────────────

    /// Open `kind` for a widget, replacing any open overlay.
    pub fn open_overlay(&mut self, id: WidgetId, kind: OverlayKind) -> Result<(), LayoutError> {
        self.widget(id)?;
        self.overlay = Some((id, kind));
        Ok(())
    }

    pub fn close_overlay(&mut self) -> Option<(WidgetId, OverlayKind)> {
        self.overlay.take()
    }

    pub fn overlay(&self) -> Option<(WidgetId, OverlayKind)> {
        self.overlay
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn check_free(
        &self,
        pos: GridPos,
        size: GridSize,
        ignore: Option<WidgetId>,
    ) -> Result<(), LayoutError> {
        if !grid::in_bounds(pos, size, self.layout.cols, self.layout.rows) {
            return Err(LayoutError::OutOfBounds { pos, size });
        }
        match grid::conflict(&self.layout, pos, size, ignore) {
            Some(with) => Err(LayoutError::Conflict { with }),
            None => Ok(()),
        }
    }

    fn check_placement(layout: &DashboardLayout, widget: &Widget) -> Result<(), LayoutError> {
        let (pos, size) = (widget.position, widget.size);
        if !size.is_valid() {
            return Err(LayoutError::InvalidSize { size });
        }
        if !grid::in_bounds(pos, size, layout.cols, layout.rows) {
            return Err(LayoutError::OutOfBounds { pos, size });
        }
        match grid::conflict(layout, pos, size, None) {
            Some(with) => Err(LayoutError::Conflict { with }),
            None => Ok(()),
        }
    }

    fn commit(&mut self, mutate: impl FnOnce(&mut DashboardLayout)) {
        let mut next = (*self.layout).clone();
        mutate(&mut next);
        self.layout = Arc::new(next);
        self.published.store(Arc::clone(&self.layout));
    }
}

impl Default for LayoutEngine {
    fn default() -> Self {
        Self::load(DashboardLayout::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entity(raw: &str) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn engine(cols: u16, rows: u16) -> LayoutEngine {
        LayoutEngine::load(DashboardLayout::new(cols, rows))
    }

    #[test]
    fn drag_onto_occupied_cell_conflicts_and_snaps_back() {
        let mut e = engine(6, 6);
        let dragged = e.add_widget(entity("light.a"), GridPos::new(2, 3)).unwrap();
        let blocker = e.add_widget(entity("light.b"), GridPos::new(4, 4)).unwrap();
        let before = e.layout();

        e.begin_drag(dragged).unwrap();
        let err = e.end_drag(Some(GridPos::new(4, 4))).unwrap_err();
        assert_eq!(err, LayoutError::Conflict { with: blocker });
        assert_eq!(e.widget(dragged).unwrap().position, GridPos::new(2, 3));
        assert_eq!(e.layout(), before);
        assert_eq!(e.dragging(), None);
    }

    #[test]
    fn drag_commits_to_free_cell() {
        let mut e = engine(4, 2);
        let id = e.add_widget(entity("light.a"), GridPos::new(0, 0)).unwrap();
        e.begin_drag(id).unwrap();
        assert_eq!(
            e.begin_drag(id).unwrap_err(),
            LayoutError::DragInProgress { id }
        );
        assert_eq!(e.end_drag(Some(GridPos::new(3, 1))).unwrap(), GridPos::new(3, 1));
        assert_eq!(e.reader().load().widget(id).unwrap().position, GridPos::new(3, 1));
    }

    #[test]
    fn drop_outside_and_cancel_keep_origin() {
        let mut e = engine(4, 2);
        let id = e.add_widget(entity("light.a"), GridPos::new(1, 1)).unwrap();
        e.begin_drag(id).unwrap();
        assert_eq!(e.end_drag(None).unwrap_err(), LayoutError::DroppedOutside);
        assert_eq!(e.end_drag(None).unwrap_err(), LayoutError::NoDrag);

        e.begin_drag(id).unwrap();
        assert_eq!(e.cancel_drag(), Some(GridPos::new(1, 1)));
        assert_eq!(e.widget(id).unwrap().position, GridPos::new(1, 1));
    }

    #[test]
    fn moves_never_overlap() {
        let mut e = engine(4, 2);
        let wide = e.add_widget(entity("light.a"), GridPos::new(0, 0)).unwrap();
        e.resize(wide, GridSize::new(2, 1)).unwrap();
        let small = e.add_widget(entity("light.b"), GridPos::new(2, 0)).unwrap();

        assert!(matches!(
            e.move_widget(small, GridPos::new(1, 0)),
            Err(LayoutError::Conflict { with }) if with == wide
        ));
        assert!(matches!(
            e.move_widget(small, GridPos::new(4, 0)),
            Err(LayoutError::OutOfBounds { .. })
        ));
        e.move_widget(wide, GridPos::new(0, 1)).unwrap();
        // Overlapping its own previous cells is fine
        e.move_widget(wide, GridPos::new(1, 1)).unwrap();
        assert_eq!(e.widget(wide).unwrap().position, GridPos::new(1, 1));
    }

    #[test]
    fn resize_shrinks_freely_and_rejects_growth_into_neighbours() {
        let mut e = engine(4, 2);
        let a = e.add_widget(entity("light.a"), GridPos::new(0, 0)).unwrap();
        e.add_widget(entity("light.b"), GridPos::new(2, 0)).unwrap();

        e.resize(a, GridSize::new(2, 2)).unwrap();
        assert!(matches!(
            e.resize(a, GridSize::new(3, 2)),
            Err(LayoutError::Conflict { .. })
        ));
        assert_eq!(
            e.resize(a, GridSize::new(5, 1)).unwrap_err(),
            LayoutError::InvalidSize {
                size: GridSize::new(5, 1)
            }
        );
        e.resize(a, GridSize::ONE).unwrap();
        assert_eq!(e.widget(a).unwrap().size, GridSize::ONE);
    }

    #[test]
    fn failed_add_leaves_layout_untouched() {
        let mut e = engine(4, 2);
        e.add_widget(entity("light.a"), GridPos::new(0, 0)).unwrap();
        let version = e.layout();
        assert!(e.add_widget(entity("light.b"), GridPos::new(0, 0)).is_err());
        assert!(Arc::ptr_eq(&version, &e.reader().load()));
    }

    #[test]
    fn duplicate_uses_first_free_slot() {
        let mut e = engine(4, 2);
        let a = e.add_widget(entity("light.a"), GridPos::new(0, 0)).unwrap();
        e.update_widget(
            a,
            &WidgetEdit {
                label: Some("Desk".into()),
                ..WidgetEdit::default()
            },
        )
        .unwrap();
        let copy = e.duplicate_widget(a).unwrap();
        let copy = e.widget(copy).unwrap();
        assert_eq!(copy.position, GridPos::new(1, 0));
        assert_eq!(copy.label, "Desk");

        let mut full = engine(1, 1);
        let only = full.add_widget(entity("light.a"), GridPos::new(0, 0)).unwrap();
        assert_eq!(
            full.duplicate_widget(only).unwrap_err(),
            LayoutError::NoFreeSlot {
                size: GridSize::ONE
            }
        );
    }

    #[test]
    fn shrinking_grid_must_keep_widgets_inside() {
        let mut e = engine(4, 2);
        e.add_widget(entity("light.a"), GridPos::new(3, 1)).unwrap();
        assert!(matches!(e.set_grid(3, 2), Err(LayoutError::OutOfBounds { .. })));
        assert_eq!(e.set_grid(0, 2).unwrap_err(), LayoutError::InvalidGrid { cols: 0, rows: 2 });
        e.set_grid(6, 3).unwrap();
        assert_eq!((e.layout().cols, e.layout().rows), (6, 3));
    }

    #[test]
    fn removal_closes_overlay_and_drag() {
        let mut e = engine(4, 2);
        let id = e.add_widget(entity("light.a"), GridPos::new(0, 0)).unwrap();
        e.open_overlay(id, OverlayKind::Dimmer).unwrap();
        e.begin_drag(id).unwrap();
        let removed = e.remove_widget(id).unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(e.overlay(), None);
        assert_eq!(e.dragging(), None);
        assert_eq!(e.remove_widget(id).unwrap_err(), LayoutError::UnknownWidget { id });
    }

    #[test]
    fn load_drops_overlapping_and_out_of_bounds_widgets() {
        let mut stored = DashboardLayout::new(4, 2);
        let keep = Widget::new(entity("light.a"), GridPos::new(0, 0));
        let overlap = Widget::new(entity("light.b"), GridPos::new(0, 0));
        let outside = Widget::new(entity("light.c"), GridPos::new(9, 9));
        stored.widgets = vec![keep.clone(), overlap, outside];

        let e = LayoutEngine::load(stored);
        assert_eq!(e.layout().widgets, vec![keep]);
    }
}
