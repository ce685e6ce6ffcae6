//! Triangle lists for blocks, stitched along edges that border coarser blocks.

use crate::math::Side;
use bevy::{prelude::*, utils::HashMap};
use bitflags::bitflags;
use itertools::iproduct;
use std::sync::Arc;

bitflags! {
    /// Sides of a block whose neighbor is one level coarser.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EdgeFlags: u8 {
        const TOP = 1 << 0;
        const RIGHT = 1 << 1;
        const BOTTOM = 1 << 2;
        const LEFT = 1 << 3;
    }
}

impl From<Side> for EdgeFlags {
    fn from(side: Side) -> Self {
        EdgeFlags::from_bits_truncate(1 << side.index())
    }
}

/// Corner, walking direction and inward direction of the border strip of each side.
///
/// Each strip is the top strip rotated, so all of them share its winding.
fn strip_frame(side: Side, resolution: i32) -> (IVec2, IVec2, IVec2) {
    let r = resolution;

    match side {
        Side::Top => (IVec2::new(0, 0), IVec2::new(1, 0), IVec2::new(0, 1)),
        Side::Right => (IVec2::new(r, 0), IVec2::new(0, 1), IVec2::new(-1, 0)),
        Side::Bottom => (IVec2::new(r, r), IVec2::new(-1, 0), IVec2::new(0, -1)),
        Side::Left => (IVec2::new(0, r), IVec2::new(0, -1), IVec2::new(1, 0)),
    }
}

/// Indices into the `(resolution + 1)^2` vertices of a block, row by row.
///
/// Every triangle faces up. Stitched sides skip every odd border vertex so
/// they match the vertices of the coarser neighbor.
#[derive(Clone, Debug, PartialEq, Eq, Deref)]
pub struct IndexBuffer(Vec<u32>);

impl IndexBuffer {
    pub fn new(resolution: u32, stitched: EdgeFlags) -> Self {
        let r = resolution as i32;
        let vertex = |position: IVec2| (position.y * (r + 1) + position.x) as u32;
        let mut indices = Vec::with_capacity((resolution * resolution * 6) as usize);

        for (y, x) in iproduct!(1..r - 1, 1..r - 1) {
            let corner = IVec2::new(x, y);
            let (right, down) = (corner + IVec2::X, corner + IVec2::Y);

            indices.extend([vertex(corner), vertex(down), vertex(right)]);
            indices.extend([vertex(right), vertex(down), vertex(corner + IVec2::ONE)]);
        }

        for side in Side::ALL {
            let (corner, direction, inward) = strip_frame(side, r);
            let outer = |k: i32| vertex(corner + direction * k);
            let inner = |k: i32| vertex(corner + direction * k + inward);
            let outer_step = if stitched.contains(side.into()) { 2 } else { 1 };

            let (mut o, mut i) = (0, 1);
            while o < r || i < r - 1 {
                let advance_outer = i >= r - 1 || (o < r && o + outer_step < i + 1);

                if advance_outer {
                    indices.extend([outer(o), inner(i), outer(o + outer_step)]);
                    o += outer_step;
                } else {
                    indices.extend([outer(o), inner(i), inner(i + 1)]);
                    i += 1;
                }
            }
        }

        Self(indices)
    }

    pub fn triangles(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        self.0.chunks_exact(3).map(|triangle| [triangle[0], triangle[1], triangle[2]])
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.0)
    }
}

/// Shares one index buffer per resolution and stitch mask.
#[derive(Default)]
pub struct IndexBufferCache {
    buffers: HashMap<(u32, EdgeFlags), Arc<IndexBuffer>>,
}

impl IndexBufferCache {
    pub fn get(&mut self, resolution: u32, stitched: EdgeFlags) -> Arc<IndexBuffer> {
        Arc::clone(
            self.buffers
                .entry((resolution, stitched))
                .or_insert_with(|| Arc::new(IndexBuffer::new(resolution, stitched))),
        )
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
