//! Geometry shared by cells, the block renderer and the collider.

mod intersect;
mod traversal;

pub use intersect::{
    from_point, from_shape, segment_triangle, shapes_intersect, to_point, to_shape, triangles_intersect, Triangle,
};
pub use traversal::GridTraversal;

use bevy::math::{bounding::Aabb3d, IVec2, Vec3, Vec3A};
use ndarray::{s, Ix2, SliceInfo, SliceInfoElem};
use serde::{Deserialize, Serialize};

/// A rectangular slice of a row major grid.
pub type GridSlice = SliceInfo<[SliceInfoElem; 2], Ix2, Ix2>;

/// A rectangle of grid samples.
///
/// `left` and `top` are inclusive, `right()` and `bottom()` are exclusive.
/// Rows (`top`) grow with the object space z axis.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl GridRect {
    pub const fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// The rectangle covering a whole `width` x `height` grid.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn right(&self) -> u32 {
        self.left.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.top.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.right() && y >= self.top && y < self.bottom()
    }

    pub fn intersects(&self, other: &GridRect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.left < other.right()
            && other.left < self.right()
            && self.top < other.bottom()
            && other.top < self.bottom()
    }

    /// Clips the rectangle to a `width` x `height` grid.
    pub fn clamp_to(self, width: u32, height: u32) -> Self {
        let left = self.left.min(width);
        let top = self.top.min(height);
        let right = self.right().min(width);
        let bottom = self.bottom().min(height);

        Self::new(left, top, right - left, bottom - top)
    }

    /// Grows the rectangle by `margin` samples on every side, clipped to a `width` x `height` grid.
    pub fn grow(self, margin: u32, width: u32, height: u32) -> Self {
        if self.is_empty() {
            return self;
        }

        let left = self.left.saturating_sub(margin);
        let top = self.top.saturating_sub(margin);
        let right = self.right().saturating_add(margin);
        let bottom = self.bottom().saturating_add(margin);

        Self::new(left, top, right - left, bottom - top).clamp_to(width, height)
    }

    /// Slices the rectangle out of an `ndarray` grid indexed `[row, column]`.
    pub fn slice(&self) -> GridSlice {
        s![
            self.top as usize..self.bottom() as usize,
            self.left as usize..self.right() as usize
        ]
    }

    /// The smallest rectangle containing both rectangles.
    pub fn union(self, other: GridRect) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }

        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());

        Self::new(left, top, right - left, bottom - top)
    }
}

/// One of the four edges of a cell or block.
///
/// `Top` faces the negative z axis (grid row zero), `Left` the negative x axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Top = 0,
    Right = 1,
    Bottom = 2,
    Left = 3,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::Top, Side::Right, Side::Bottom, Side::Left];

    pub fn opposite(self) -> Side {
        match self {
            Side::Top => Side::Bottom,
            Side::Right => Side::Left,
            Side::Bottom => Side::Top,
            Side::Left => Side::Right,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Direction of the side in grid space.
    pub fn offset(self) -> IVec2 {
        match self {
            Side::Top => IVec2::new(0, -1),
            Side::Right => IVec2::new(1, 0),
            Side::Bottom => IVec2::new(0, 1),
            Side::Left => IVec2::new(-1, 0),
        }
    }
}

/// Squared distance from `point` to the closest point of `bounds`, zero inside.
pub fn distance_squared(bounds: &Aabb3d, point: Vec3) -> f32 {
    let point = Vec3A::from(point);
    point.clamp(bounds.min, bounds.max).distance_squared(point)
}

/// The axis aligned box around `points`, or `None` if there are none.
pub fn bounds_of(points: impl IntoIterator<Item = Vec3>) -> Option<Aabb3d> {
    points.into_iter().fold(None, |bounds: Option<Aabb3d>, point| {
        let point = Vec3A::from(point);
        Some(match bounds {
            Some(bounds) => Aabb3d {
                min: bounds.min.min(point),
                max: bounds.max.max(point),
            },
            None => Aabb3d {
                min: point,
                max: point,
            },
        })
    })
}

pub fn bounds_overlap(a: &Aabb3d, b: &Aabb3d) -> bool {
    a.min.cmple(b.max).all() && b.min.cmple(a.max).all()
}
