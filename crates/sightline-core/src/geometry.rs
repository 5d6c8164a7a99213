//! Screen geometry primitives.
//!
//! All coordinates are in pixels. `x`/`y` may be negative because windows
//! can sit partially off-screen on multi-monitor setups; widths and heights
//! are always non-negative.

use serde::{Deserialize, Serialize};

/// Padding (in pixels) added around a match to form its clickable region.
pub const CLICKABLE_PADDING: i32 = 5;

/// A point on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Offset this point by another point used as a delta.
    #[must_use]
    pub fn offset(self, delta: Point) -> Self {
        Self {
            x: self.x.saturating_add(delta.x),
            y: self.y.saturating_add(delta.y),
        }
    }

    /// Euclidean distance to another point.
    pub fn distance(self, other: Point) -> f64 {
        let dx = f64::from(self.x) - f64::from(other.x);
        let dy = f64::from(self.y) - f64::from(other.y);
        (dx * dx + dy * dy).sqrt()
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An axis-aligned rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Center point, rounded toward the top-left.
    pub fn center(&self) -> Point {
        Point {
            x: self.x.saturating_add((self.width / 2) as i32),
            y: self.y.saturating_add((self.height / 2) as i32),
        }
    }

    /// Grow the rectangle by `px` on every side (shrinks for negative values).
    #[must_use]
    pub fn padded(&self, px: i32) -> Rect {
        let width = (i64::from(self.width) + 2 * i64::from(px)).max(0);
        let height = (i64::from(self.height) + 2 * i64::from(px)).max(0);
        Rect {
            x: self.x.saturating_sub(px),
            y: self.y.saturating_sub(px),
            width: width.min(i64::from(u32::MAX)) as u32,
            height: height.min(i64::from(u32::MAX)) as u32,
        }
    }

    #[must_use]
    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            ..*self
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        let (px, py) = (i64::from(point.x), i64::from(point.y));
        px >= i64::from(self.x)
            && px < self.right()
            && py >= i64::from(self.y)
            && py < self.bottom()
    }

    /// Intersection of two rectangles, or `None` if they don't overlap.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x1 = i64::from(self.x.max(other.x));
        let y1 = i64::from(self.y.max(other.y));
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(Rect {
            x: x1 as i32,
            y: y1 as i32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }

    /// Smallest rectangle containing both.
    #[must_use]
    pub fn union(&self, other: &Rect) -> Rect {
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = self.right().max(other.right());
        let y2 = self.bottom().max(other.bottom());
        Rect {
            x: x1,
            y: y1,
            width: (x2 - i64::from(x1)).min(i64::from(u32::MAX)) as u32,
            height: (y2 - i64::from(y1)).min(i64::from(u32::MAX)) as u32,
        }
    }

    /// Intersection-over-union. Returns 0.0 when either rectangle is empty.
    pub fn iou(&self, other: &Rect) -> f64 {
        let Some(inter) = self.intersection(other) else {
            return 0.0;
        };
        let union_area = self.area() + other.area() - inter.area();
        if union_area == 0 {
            return 0.0;
        }
        inter.area() as f64 / union_area as f64
    }

    /// Clamp this rectangle to lie within `bounds`.
    pub fn clamp_to(&self, bounds: &Rect) -> Option<Rect> {
        self.intersection(bounds)
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{} {}x{}", self.x, self.y, self.width, self.height)
    }
}

/// Clamp a point into `bounds` (inclusive of the last pixel row/column).
pub fn clamp_point(point: Point, bounds: &Rect) -> Option<Point> {
    if bounds.is_empty() {
        return None;
    }
    let max_x = (bounds.right() - 1) as i32;
    let max_y = (bounds.bottom() - 1) as i32;
    Some(Point {
        x: point.x.clamp(bounds.x, max_x),
        y: point.y.clamp(bounds.y, max_y),
    })
}
