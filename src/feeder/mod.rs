//! Fills cells with height, material and alpha data.
//!
//! Loading is split in three steps so that the expensive middle one can run
//! off the main thread: [`FeederSnapshot::capture`] copies what is needed from
//! the cell, [`decode`] reads and converts the sources, and
//! [`StagedCellData::commit`] writes the result into the cell through its locks.

mod format;
mod job;
mod raster;
mod simple;
mod source;
mod threaded;

pub use format::HeightmapFormat;
pub use job::{Job, JobQueue};
pub use simple::SimpleDataFeeder;
pub use source::{DataSource, FileDataSource, MemoryDataSource};
pub use threaded::ThreadedDataFeeder;

use crate::{
    cell::{Cell, CellId},
    material::MaterialPalette,
    math::GridRect,
    properties::FeederProperties,
};
use anyhow::{anyhow, ensure, Result};
use bevy::prelude::*;
use ndarray::Array2;

/// Supplies cell data to a terrain.
///
/// Both calls report success as a boolean, a failed call leaves the cell
/// unloaded. Implementations are only driven from the thread owning the terrain.
pub trait DataFeeder: Send + Sync {
    /// Starts fetching the data of `cell`, whose grids were just allocated.
    fn pre_load(&mut self, cell: &mut Cell, palette: &MaterialPalette) -> bool;

    /// Fills the grids of `cell` through its locks, blocking until the data is available.
    fn load(&mut self, cell: &mut Cell, palette: &MaterialPalette) -> bool;
}

/// Everything the decode step needs to know about a cell.
#[derive(Clone, Debug)]
pub(crate) struct FeederSnapshot {
    cell: CellId,
    properties: FeederProperties,
    grid_size: UVec2,
    material_size: UVec2,
    height_scale: f32,
    /// Palette index and source of every alpha map with a known material.
    alpha_maps: Vec<(usize, String)>,
}

impl FeederSnapshot {
    pub(crate) fn capture(cell: &Cell, palette: &MaterialPalette) -> Self {
        let properties = cell.feeder_properties.clone();

        let alpha_maps = properties
            .alpha_maps
            .iter()
            .filter_map(|alpha_map| match palette.index_of(&alpha_map.material) {
                Some(index) => Some((index, alpha_map.source.clone())),
                None => {
                    warn!(
                        "Ignoring alpha map of {} for unknown material `{}`.",
                        cell.id(),
                        alpha_map.material
                    );
                    None
                }
            })
            .collect();

        Self {
            cell: cell.id(),
            properties,
            grid_size: UVec2::new(cell.grid_width(), cell.grid_height()),
            material_size: UVec2::new(cell.material_width(), cell.material_height()),
            height_scale: cell.size().y,
            alpha_maps,
        }
    }
}

/// Decoded cell data, ready to be written into the cell.
pub(crate) struct StagedCellData {
    heights: Array2<f32>,
    materials: Option<Array2<u8>>,
    alpha_masks: Vec<(usize, Array2<u8>)>,
}

/// Reads and converts all sources of a cell.
pub(crate) fn decode(snapshot: &FeederSnapshot, source: &dyn DataSource) -> Result<StagedCellData> {
    let properties = &snapshot.properties;
    let FeederSnapshot {
        grid_size,
        material_size,
        ..
    } = *snapshot;

    ensure!(
        !properties.heightmap_source.is_empty(),
        "{} has no heightmap source.",
        snapshot.cell
    );

    let bytes = source.read(&properties.heightmap_source)?;
    let mut heights = raster::decode_heightmap(
        &bytes,
        properties.heightmap_format,
        grid_size.x,
        grid_size.y,
    )?;

    if properties.smooth_heightmap {
        raster::smooth_heights(&mut heights);
    }

    let scale = properties.scale * snapshot.height_scale;
    heights.mapv_inplace(|value| properties.offset + value * scale);

    let materials = if properties.materialmap_source.is_empty() {
        None
    } else {
        let bytes = source.read(&properties.materialmap_source)?;
        Some(raster::decode_index_map(&bytes, material_size.x, material_size.y)?)
    };

    let alpha_masks = snapshot
        .alpha_maps
        .iter()
        .map(|(material, path)| {
            let bytes = source.read(path)?;
            Ok((
                *material,
                raster::decode_alpha_map(&bytes, material_size.x, material_size.y)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    debug!("Decoded the sources of {}.", snapshot.cell);

    Ok(StagedCellData {
        heights,
        materials,
        alpha_masks,
    })
}

impl StagedCellData {
    pub(crate) fn commit(self, cell: &mut Cell) -> Result<()> {
        let id = cell.id();
        let grid = GridRect::full(cell.grid_width(), cell.grid_height());
        let materials = GridRect::full(cell.material_width(), cell.material_height());

        {
            let mut lock = cell
                .lock_height_data(grid)
                .ok_or_else(|| anyhow!("{id} has no height grid."))?;

            ensure!(
                lock.data().dim() == self.heights.dim(),
                "Decoded heights do not match the grid of {id}."
            );
            lock.data_mut().assign(&self.heights);
        }

        if let Some(indices) = self.materials {
            let mut lock = cell
                .lock_material_data(materials)
                .ok_or_else(|| anyhow!("{id} has no material grid."))?;

            ensure!(
                lock.data().dim() == indices.dim(),
                "Decoded material map does not match the material grid of {id}."
            );
            lock.data_mut().assign(&indices);
        }

        for (material, alpha) in self.alpha_masks {
            cell.set_alpha_mask(material, materials, alpha);
        }

        Ok(())
    }
}

/// Runs all three load steps on the calling thread, logging failures.
fn load_now(cell: &mut Cell, palette: &MaterialPalette, source: &dyn DataSource) -> bool {
    let snapshot = FeederSnapshot::capture(cell, palette);
    finish_load(cell, decode(&snapshot, source))
}

fn finish_load(cell: &mut Cell, staged: Result<StagedCellData>) -> bool {
    match staged.and_then(|staged| staged.commit(cell)) {
        Ok(()) => true,
        Err(error) => {
            warn!("Failed to load {}: {error:#}", cell.id());
            false
        }
    }
}
