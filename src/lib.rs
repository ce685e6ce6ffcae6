//! This crate provides streamed heightfield terrains made of rectangular cells.
//!
//! # Overview
//! A [`TerrainSystem`](terrain::TerrainSystem) owns a list of [`Cell`](cell::Cell)s.
//! Each cell is an independently loadable tile with its own height, normal and
//! material grids. Cells move through the load states `NotLoaded`, `PreLoaded`
//! and `Loaded`. A [`DataFeeder`](feeder::DataFeeder) fills them, either on the
//! calling thread or with the decode work running in the background, and the
//! least recently used cells are evicted once too many are loaded.
//!
//! ## Rendering
//! The [`BlockRenderer`](render::BlockRenderer) covers every loaded cell with a
//! quadtree of fixed resolution blocks. Neighboring leaves never differ by more
//! than one level, so every block can be drawn with one of sixteen stitched index
//! buffers without cracks, also across the borders of adjacent cells. The
//! renderer emits engine agnostic [`RenderMesh`](render::RenderMesh) records, one
//! per visible block and material layer.
//!
//! ## Collision
//! The [`GridCollider`](collider::GridCollider) answers segment and triangle
//! queries by walking the quads of the height grid, and hands whole meshes to a
//! pluggable [`CollisionEngine`](collider::CollisionEngine). The default engine
//! searches a cached parry triangle mesh of each cell through its bounding
//! volume hierarchy.
//!
//! ## Engine integration
//! The [`TerrainPlugin`](plugin::TerrainPlugin) updates every terrain entity from
//! the positions of the [`TerrainView`](plugin::TerrainView)s each frame.

pub mod cell;
pub mod collider;
pub mod feeder;
pub mod material;
pub mod math;
pub mod plugin;
pub mod properties;
pub mod render;
pub mod terrain;

#[cfg(test)]
mod test_util;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        cell::{Cell, CellConfig, CellId, CellLoadState},
        collider::{GridCollider, SegmentHit, TerrainCollider, TriangleMesh},
        feeder::{DataFeeder, FileDataSource, HeightmapFormat, SimpleDataFeeder, ThreadedDataFeeder},
        material::{MaterialHandle, MaterialPalette},
        math::{GridRect, Side},
        plugin::{TerrainDrawList, TerrainPlugin, TerrainView},
        properties::Properties,
        render::{BlockRenderer, RenderBackend, RenderMesh, TerrainRenderView, TerrainRenderer},
        terrain::{CellHeightUpdateListener, CellKey, CellLoadListener, TerrainConfig, TerrainSystem},
    };
}
