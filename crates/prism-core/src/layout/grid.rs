// Grid geometry. Arithmetic is done in u32 so spans at the edge of a
// u16 grid cannot overflow.

use crate::model::{DashboardLayout, GridPos, GridSize, WidgetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    col: u32,
    row: u32,
    w: u32,
    h: u32,
}

impl Rect {
    fn new(pos: GridPos, size: GridSize) -> Self {
        Self {
            col: u32::from(pos.col),
            row: u32::from(pos.row),
            w: u32::from(size.w),
            h: u32::from(size.h),
        }
    }

    fn overlaps(self, other: Self) -> bool {
        self.col < other.col + other.w
            && other.col < self.col + self.w
            && self.row < other.row + other.h
            && other.row < self.row + self.h
    }
}

pub(super) fn in_bounds(pos: GridPos, size: GridSize, cols: u16, rows: u16) -> bool {
    let r = Rect::new(pos, size);
    r.col + r.w <= u32::from(cols) && r.row + r.h <= u32::from(rows)
}

/// First widget (other than `ignore`) covering any cell of the rectangle.
pub(super) fn conflict(
    layout: &DashboardLayout,
    pos: GridPos,
    size: GridSize,
    ignore: Option<WidgetId>,
) -> Option<WidgetId> {
    let target = Rect::new(pos, size);
    layout
        .widgets
        .iter()
        .filter(|w| Some(w.id) != ignore)
        .find(|w| Rect::new(w.position, w.size).overlaps(target))
        .map(|w| w.id)
}

/// Row-major scan for the first free rectangle of `size`.
pub(super) fn first_free(layout: &DashboardLayout, size: GridSize) -> Option<GridPos> {
    (0..layout.rows)
        .flat_map(|row| (0..layout.cols).map(move |col| GridPos::new(col, row)))
        .find(|&pos| {
            in_bounds(pos, size, layout.cols, layout.rows)
                && conflict(layout, pos, size, None).is_none()
        })
}
