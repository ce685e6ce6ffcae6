use super::Cell;
use crate::math::GridRect;
use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use std::mem;

/// Write access to a rectangle of a cell's height grid.
///
/// The views are relative to the locked rectangle. Dropping the guard
/// recomputes the height range and queues a height update for the rectangle.
pub struct LockedHeightData<'a> {
    cell: &'a mut Cell,
    heights: Array2<f32>,
    rect: GridRect,
}

impl<'a> LockedHeightData<'a> {
    pub(super) fn new(cell: &'a mut Cell, heights: Array2<f32>, rect: GridRect) -> Self {
        Self {
            cell,
            heights,
            rect,
        }
    }

    pub fn rect(&self) -> GridRect {
        self.rect
    }

    pub fn data(&self) -> ArrayView2<'_, f32> {
        self.heights.slice(self.rect.slice())
    }

    pub fn data_mut(&mut self) -> ArrayViewMut2<'_, f32> {
        self.heights.slice_mut(self.rect.slice())
    }
}

impl Drop for LockedHeightData<'_> {
    fn drop(&mut self) {
        let heights = mem::take(&mut self.heights);
        self.cell.commit_heights(heights, self.rect);
    }
}

enum MaterialBuffer {
    /// The cell's own material map, borrowed for the lifetime of the lock.
    Persistent(Array2<u8>),
    /// A zeroed buffer the size of the locked rectangle.
    Scratch(Array2<u8>),
}

/// Write access to a rectangle of a cell's material index grid.
///
/// Dropping the guard queues a material update carrying the indices of the rectangle.
pub struct LockedMaterialData<'a> {
    cell: &'a mut Cell,
    buffer: MaterialBuffer,
    rect: GridRect,
}

impl<'a> LockedMaterialData<'a> {
    pub(super) fn new(cell: &'a mut Cell, persistent: Option<Array2<u8>>, rect: GridRect) -> Self {
        let buffer = match persistent {
            Some(map) => MaterialBuffer::Persistent(map),
            None => MaterialBuffer::Scratch(Array2::zeros((rect.height as usize, rect.width as usize))),
        };

        Self { cell, buffer, rect }
    }

    pub fn rect(&self) -> GridRect {
        self.rect
    }

    pub fn data(&self) -> ArrayView2<'_, u8> {
        match &self.buffer {
            MaterialBuffer::Persistent(map) => map.slice(self.rect.slice()),
            MaterialBuffer::Scratch(scratch) => scratch.view(),
        }
    }

    pub fn data_mut(&mut self) -> ArrayViewMut2<'_, u8> {
        match &mut self.buffer {
            MaterialBuffer::Persistent(map) => map.slice_mut(self.rect.slice()),
            MaterialBuffer::Scratch(scratch) => scratch.view_mut(),
        }
    }
}

impl Drop for LockedMaterialData<'_> {
    fn drop(&mut self) {
        let buffer = mem::replace(&mut self.buffer, MaterialBuffer::Scratch(Array2::zeros((0, 0))));

        let (persistent, indices) = match buffer {
            MaterialBuffer::Persistent(map) => {
                let indices = map.slice(self.rect.slice()).to_owned();
                (Some(map), indices)
            }
            MaterialBuffer::Scratch(scratch) => (None, scratch),
        };

        self.cell.commit_material(persistent, self.rect, indices);
    }
}
