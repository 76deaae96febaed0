// ============================================================================
// GEOMETRY: integer pixel rectangles
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::tile::{TILE_SIZE, tile_origin};

/// Axis-aligned pixel rectangle. `width`/`height` of zero (or less) is empty.
///
/// Coordinates are signed: devices extend in every direction. Edges
/// saturate at the `i32` range, so `i32::MAX` itself is never inside a rect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const EMPTY: Rect = Rect { x: 0, y: 0, width: 0, height: 0 };

    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle spanning `[x0, x1) × [y0, y1)`.
    pub fn from_coords(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.width as u64 * self.height as u64
        }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.is_empty()
            || (other.x >= self.x
                && other.y >= self.y
                && other.right() <= self.right()
                && other.bottom() <= self.bottom())
    }

    /// Smallest rectangle covering both. Empty operands are ignored.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::from_coords(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            Rect::EMPTY
        } else {
            Rect::from_coords(x0, y0, x1, y1)
        }
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Rect {
        if self.is_empty() {
            return Rect::EMPTY;
        }
        Rect::new(
            self.x.saturating_add(dx),
            self.y.saturating_add(dy),
            self.width,
            self.height,
        )
    }

    /// Grow the rectangle outwards to tile boundaries.
    pub fn tile_aligned(&self) -> Rect {
        if self.is_empty() {
            return Rect::EMPTY;
        }
        let x0 = tile_origin(self.x);
        let y0 = tile_origin(self.y);
        let x1 = tile_origin(self.right() - 1).saturating_add(TILE_SIZE);
        let y1 = tile_origin(self.bottom() - 1).saturating_add(TILE_SIZE);
        Rect::from_coords(x0, y0, x1, y1)
    }

    /// Origins of every tile intersecting this rectangle, row-major.
    pub fn tile_origins(&self) -> Vec<(i32, i32)> {
        if self.is_empty() {
            return Vec::new();
        }
        let aligned = self.tile_aligned();
        let cols = (aligned.width / TILE_SIZE) as usize;
        let rows = (aligned.height / TILE_SIZE) as usize;
        let mut out = Vec::with_capacity(cols * rows);
        for ty in (aligned.y..aligned.bottom()).step_by(TILE_SIZE as usize) {
            for tx in (aligned.x..aligned.right()).step_by(TILE_SIZE as usize) {
                out.push((tx, ty));
            }
        }
        out
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_ignores_empty() {
        let a = Rect::new(10, 10, 5, 5);
        assert_eq!(a.union(&Rect::EMPTY), a);
        assert_eq!(Rect::EMPTY.union(&a), a);
        assert_eq!(a.union(&Rect::new(0, 0, 1, 1)), Rect::new(0, 0, 15, 15));
    }

    #[test]
    fn disjoint_intersection_is_empty() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 10, 10);
        assert!(a.intersect(&b).is_empty());
        assert!(!a.intersects(&b));
        assert_eq!(a.intersect(&Rect::new(5, 5, 10, 10)), Rect::new(5, 5, 5, 5));
    }

    #[test]
    fn tile_alignment_handles_negative_coordinates() {
        let r = Rect::new(-1, -1, 2, 2);
        assert_eq!(r.tile_aligned(), Rect::new(-64, -64, 128, 128));
        assert_eq!(r.tile_origins(), vec![(-64, -64), (0, -64), (-64, 0), (0, 0)]);
    }

    #[test]
    fn edges_saturate_near_the_coordinate_limit() {
        let r = Rect::new(i32::MAX - 10, 0, 64, 64);
        assert_eq!(r.right(), i32::MAX);
        assert_eq!(r.translated(100, 0).x, i32::MAX);
        assert_eq!(
            Rect::new(0, 0, 1, 1).union(&r),
            Rect::new(0, 0, i32::MAX, 64)
        );
        let far = Rect::new(i32::MIN, 0, 1, 1).union(&r);
        assert_eq!(far.x, i32::MIN);
        assert_eq!(far.width, i32::MAX);
        assert_eq!(r.tile_origins(), vec![(i32::MAX - 63, 0)]);
    }

    #[test]
    fn zero_area_has_no_tiles() {
        assert!(Rect::new(5, 5, 0, 10).tile_origins().is_empty());
        assert_eq!(Rect::new(5, 5, 0, 10).area(), 0);
    }
}
