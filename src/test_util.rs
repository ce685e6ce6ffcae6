//! Builders shared by the unit tests.

use crate::{
    cell::{Cell, CellConfig, CellId, CellLoadState},
    feeder::DataFeeder,
    material::MaterialPalette,
    math::GridRect,
};
use bevy::prelude::*;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

pub(crate) fn cell_config(position: Vec2, size: f32, grid: u32) -> CellConfig {
    CellConfig {
        position: position.to_array(),
        size: [size, 1.0, size],
        grid_width: grid,
        grid_height: grid,
        material_width: grid - 1,
        material_height: grid - 1,
        ..default()
    }
}

fn fill_heights(cell: &mut Cell, height: &dyn Fn(Vec2) -> f32) -> bool {
    let origin = cell.position();
    let spacing = cell.spacing();
    let rect = GridRect::full(cell.grid_width(), cell.grid_height());

    let Some(mut lock) = cell.lock_height_data(rect) else {
        return false;
    };

    for ((y, x), value) in lock.data_mut().indexed_iter_mut() {
        *value = height(origin + Vec2::new(x as f32, y as f32) * spacing);
    }

    true
}

/// A loaded cell whose heights are sampled from `height` at object space xz positions.
pub(crate) fn loaded_cell(id: u32, config: CellConfig, height: impl Fn(Vec2) -> f32) -> Cell {
    let mut cell = Cell::new(CellId(id), config);

    cell.allocate_buffers();
    fill_heights(&mut cell, &height);
    cell.take_updates();
    cell.set_load_state(CellLoadState::Loaded);
    cell
}

/// Counts feeder calls, shared with the test through `Arc`s.
#[derive(Clone, Default)]
pub(crate) struct FeederCalls {
    pub(crate) pre_loads: Arc<AtomicUsize>,
    pub(crate) loads: Arc<AtomicUsize>,
}

impl FeederCalls {
    pub(crate) fn pre_loads(&self) -> usize {
        self.pre_loads.load(Ordering::SeqCst)
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

/// Fills cells from a height function, or fails every call when `fail` is set.
pub(crate) struct FunctionFeeder {
    pub(crate) height: fn(Vec2) -> f32,
    pub(crate) fail: bool,
    pub(crate) calls: FeederCalls,
}

impl FunctionFeeder {
    pub(crate) fn new(height: fn(Vec2) -> f32) -> Self {
        Self {
            height,
            fail: false,
            calls: default(),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(|_| 0.0)
        }
    }
}

impl DataFeeder for FunctionFeeder {
    fn pre_load(&mut self, _cell: &mut Cell, _palette: &MaterialPalette) -> bool {
        self.calls.pre_loads.fetch_add(1, Ordering::SeqCst);
        !self.fail
    }

    fn load(&mut self, cell: &mut Cell, _palette: &MaterialPalette) -> bool {
        self.calls.loads.fetch_add(1, Ordering::SeqCst);
        !self.fail && fill_heights(cell, &self.height)
    }
}
