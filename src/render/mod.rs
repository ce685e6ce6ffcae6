//! Turns loaded cells into draw records.
//!
//! The renderer keeps a quadtree of blocks per cell, refines it every frame
//! from the camera position and emits one [`RenderMesh`] per visible leaf and layer.
//! Drawing the records is left to a [`RenderBackend`].

mod block_renderer;
mod indices;
mod mask;
mod quadtree;

pub use block_renderer::{BlockRenderer, CellRenderData};
pub use indices::{EdgeFlags, IndexBuffer, IndexBufferCache};
pub use mask::AlphaMap;
pub use quadtree::{visit_order, Block, BlockArena, BlockHandle, LodPolicy};

use crate::{
    cell::{Cell, CellId},
    material::{MaterialHandle, MaterialPalette},
    math::{GridRect, Side},
};
use bevy::{
    math::{bounding::Aabb3d, Affine3A},
    prelude::*,
    render::primitives::{Aabb, Frustum},
};
use bytemuck::{Pod, Zeroable};
use ndarray::Array2;
use std::sync::Arc;

/// A block vertex in the object space of the terrain.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TerrainVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    /// Position within the cell, `[0, 1]` on both axes.
    pub texcoord: [f32; 2],
}

/// The `(resolution + 1)^2` vertices of a block, row by row.
#[derive(Clone, Debug)]
pub struct BlockGeometry {
    pub vertices: Vec<TerrainVertex>,
    pub resolution: u32,
    pub bounding_box: Aabb3d,
}

impl BlockGeometry {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn vertex(&self, x: u32, y: u32) -> Option<&TerrainVertex> {
        if x > self.resolution || y > self.resolution {
            return None;
        }

        self.vertices.get((y * (self.resolution + 1) + x) as usize)
    }
}

/// Which pass of the layered terrain shading a mesh belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RenderLayer {
    /// The opaque base, drawn first.
    Base,
    /// The cell wide alpha splat material.
    AlphaSplat,
    /// A palette material blended by its alpha mask.
    Splat(usize),
}

/// Material parameters that vary per draw.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShaderVariables {
    pub alpha_mask: Option<Arc<AlphaMap>>,
}

/// A draw record. Geometry, indices and variables are shared, not copied.
#[derive(Clone, Debug)]
pub struct RenderMesh {
    pub cell: CellId,
    pub block: BlockHandle,
    pub layer: RenderLayer,
    pub geometry: Arc<BlockGeometry>,
    pub indices: Arc<IndexBuffer>,
    pub material: MaterialHandle,
    pub variables: Arc<ShaderVariables>,
    pub bounding_box: Aabb3d,
    pub render_priority: i32,
}

/// Camera state of one render pass, in the object space of the terrain.
#[derive(Clone, Debug)]
pub struct TerrainRenderView {
    pub camera_position: Vec3,
    frustum: Option<Frustum>,
}

impl TerrainRenderView {
    /// A view that culls against the frustum of `clip_from_object`.
    pub fn new(camera_position: Vec3, clip_from_object: &Mat4) -> Self {
        Self {
            camera_position,
            frustum: Some(Frustum::from_clip_from_world(clip_from_object)),
        }
    }

    /// A view that considers every block visible.
    pub fn unculled(camera_position: Vec3) -> Self {
        Self {
            camera_position,
            frustum: None,
        }
    }

    pub fn is_visible(&self, bounds: &Aabb3d) -> bool {
        match &self.frustum {
            None => true,
            Some(frustum) => {
                let aabb = Aabb::from_min_max(bounds.min.into(), bounds.max.into());
                frustum.intersects_obb(&aabb, &Affine3A::IDENTITY, true, true)
            }
        }
    }
}

/// Receives the draw records of a render pass.
pub trait RenderBackend {
    fn draw_mesh(&mut self, mesh: &RenderMesh);
}

impl RenderBackend for Vec<RenderMesh> {
    fn draw_mesh(&mut self, mesh: &RenderMesh) {
        self.push(mesh.clone());
    }
}

/// The renderer seam of a terrain.
///
/// Cells are passed as the whole cell list plus an index where a hook may
/// need to look at other cells, for example to connect neighbors.
pub trait TerrainRenderer: Send + Sync {
    /// Creates the render state of a freshly loaded cell.
    fn on_cell_load(&mut self, cells: &mut [Cell], index: usize, palette: &MaterialPalette);

    /// Drops the render state of a cell that is about to unload.
    fn on_cell_unload(&mut self, cells: &mut [Cell], index: usize);

    fn on_height_update(&mut self, cell: &mut Cell, rect: GridRect);

    fn on_material_map_update(&mut self, cell: &mut Cell, rect: GridRect, indices: &Array2<u8>);

    fn on_alpha_mask_update(&mut self, cell: &mut Cell, material: usize, rect: GridRect, alpha: &Array2<u8>);

    fn on_material_palette_update(&mut self, cells: &mut [Cell], palette: &MaterialPalette);

    /// Joins the quadtrees of two adjacent cells along `side` of cell `a`.
    fn connect_cells(&mut self, cells: &mut [Cell], a: usize, b: usize, side: Side) -> bool;

    /// Refines the quadtrees of every loaded cell for a camera at `camera_position`.
    fn update_lod(&mut self, cells: &[Cell], camera_position: Vec3);

    /// Appends the draw records of every visible cell, back to front per cell.
    fn render(
        &mut self,
        cells: &mut [Cell],
        view: &TerrainRenderView,
        palette: &MaterialPalette,
        meshes: &mut Vec<RenderMesh>,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::math::Vec3A;

    #[test]
    fn frustum_culling() {
        let clip_from_view = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let view_from_object = Mat4::look_at_rh(Vec3::new(0.0, 10.0, 0.0), Vec3::new(0.0, 10.0, -1.0), Vec3::Y);
        let view = TerrainRenderView::new(Vec3::new(0.0, 10.0, 0.0), &(clip_from_view * view_from_object));

        let ahead = Aabb3d {
            min: Vec3A::new(-1.0, 0.0, -20.0),
            max: Vec3A::new(1.0, 10.0, -18.0),
        };
        let behind = Aabb3d {
            min: Vec3A::new(-1.0, 0.0, 18.0),
            max: Vec3A::new(1.0, 10.0, 20.0),
        };

        assert!(view.is_visible(&ahead));
        assert!(!view.is_visible(&behind));
        assert!(TerrainRenderView::unculled(Vec3::ZERO).is_visible(&behind));
    }

    #[test]
    fn vertex_layout() {
        assert_eq!(std::mem::size_of::<TerrainVertex>(), 32);
    }
}
