use super::{
    mask::MaterialMasks, visit_order, Block, BlockArena, BlockGeometry, BlockHandle, EdgeFlags,
    IndexBufferCache, LodPolicy, RenderLayer, RenderMesh, ShaderVariables, TerrainRenderView,
    TerrainRenderer, TerrainVertex,
};
use crate::{
    cell::Cell,
    material::{MaterialHandle, MaterialPalette},
    math::{self, GridRect, Side},
};
use bevy::prelude::*;
use itertools::iproduct;
use ndarray::Array2;
use std::sync::Arc;

/// The render slot of a loaded cell.
pub struct CellRenderData {
    root: BlockHandle,
    masks: MaterialMasks,
}

impl CellRenderData {
    pub fn root(&self) -> BlockHandle {
        self.root
    }
}

/// Renders cells as quadtrees of fixed resolution blocks.
///
/// All cells share one block arena, so blocks of connected cells link to
/// each other directly and splits propagate across cell borders.
pub struct BlockRenderer {
    blocks: BlockArena,
    indices: IndexBufferCache,
    base_variables: Arc<ShaderVariables>,
}

impl Default for BlockRenderer {
    fn default() -> Self {
        Self {
            blocks: default(),
            indices: default(),
            base_variables: Arc::new(default()),
        }
    }
}

impl BlockRenderer {
    pub fn blocks(&self) -> &BlockArena {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut BlockArena {
        &mut self.blocks
    }

    pub fn root_of(cell: &Cell) -> Option<BlockHandle> {
        cell.attachments().get::<CellRenderData>().map(CellRenderData::root)
    }

    fn create_render_data(&mut self, cell: &Cell, palette: &MaterialPalette) -> Option<CellRenderData> {
        if cell.grid_width() != cell.grid_height() {
            warn!("{} has a non square grid and is not rendered.", cell.id());
            return None;
        }

        let quads = cell.grid_width() - 1;
        let resolution = cell
            .render_properties
            .block_resolution
            .max(2)
            .next_power_of_two()
            .min(quads);
        let size = cell.size().xz();

        let root = self.blocks.insert(Block::root(
            cell.id(),
            cell.position() + size / 2.0,
            size,
            resolution,
            quads / resolution,
            Vec2::new(cell.min_height(), cell.max_height()),
        ));

        Some(CellRenderData {
            root,
            masks: MaterialMasks::new(cell.material_width(), cell.material_height(), palette.len()),
        })
    }

    /// Sides of a block bordering a coarser block.
    fn stitched_edges(&self, handle: BlockHandle) -> EdgeFlags {
        let Some(block) = self.blocks.get(handle) else {
            return EdgeFlags::empty();
        };

        Side::ALL
            .into_iter()
            .filter(|&side| {
                block
                    .neighbor(side)
                    .and_then(|neighbor| self.blocks.get(neighbor))
                    .is_some_and(|neighbor| neighbor.level < block.level)
            })
            .fold(EdgeFlags::empty(), |flags, side| flags | side.into())
    }

    fn collect_visible(&self, handle: BlockHandle, view: &TerrainRenderView, leaves: &mut Vec<BlockHandle>) {
        let Some(block) = self.blocks.get(handle) else {
            return;
        };

        if !view.is_visible(&block.conservative_bounds()) {
            return;
        }

        match block.children {
            None => leaves.push(handle),
            Some(children) => {
                for index in visit_order(block.center, view.camera_position) {
                    self.collect_visible(children[index], view, leaves);
                }
            }
        }
    }

    fn geometry(&mut self, handle: BlockHandle, cell: &mut Cell) -> Option<Arc<BlockGeometry>> {
        let block = self.blocks.get(handle)?;
        if let Some(geometry) = &block.geometry {
            return Some(Arc::clone(geometry));
        }

        let geometry = Arc::new(build_geometry(block, cell)?);
        if let Some(block) = self.blocks.get_mut(handle) {
            block.geometry = Some(Arc::clone(&geometry));
        }
        Some(geometry)
    }

    fn emit(
        &mut self,
        cell: &mut Cell,
        handle: BlockHandle,
        view: &TerrainRenderView,
        palette: &MaterialPalette,
        splats: &[(usize, Arc<ShaderVariables>)],
        meshes: &mut Vec<RenderMesh>,
    ) {
        let Some(geometry) = self.geometry(handle, cell) else {
            return;
        };

        if !view.is_visible(&geometry.bounding_box) {
            return;
        }

        let stitched = self.stitched_edges(handle);
        let indices = self.indices.get(geometry.resolution, stitched);
        let id = cell.id();
        let properties = &cell.render_properties;
        let splat_distance = properties.splat_distance;
        let near = math::distance_squared(&geometry.bounding_box, view.camera_position)
            <= splat_distance * splat_distance;

        let record = |layer, material: &MaterialHandle, variables: &Arc<ShaderVariables>, render_priority| RenderMesh {
            cell: id,
            block: handle,
            layer,
            geometry: Arc::clone(&geometry),
            indices: Arc::clone(&indices),
            material: material.clone(),
            variables: Arc::clone(variables),
            bounding_box: geometry.bounding_box,
            render_priority,
        };

        let base = if near {
            cell.splat_base_material.as_ref().or(cell.base_material.as_ref())
        } else {
            cell.base_material.as_ref()
        };

        if let Some(material) = base {
            meshes.push(record(RenderLayer::Base, material, &self.base_variables, 0));
        }

        if !near {
            return;
        }

        let priority = properties.splat_render_priority;

        if let Some(material) = &cell.alpha_splat_material {
            meshes.push(record(RenderLayer::AlphaSplat, material, &self.base_variables, priority));
        }

        for (index, variables) in splats {
            if let Some(material) = palette.get(*index) {
                meshes.push(record(RenderLayer::Splat(*index), material, variables, priority));
            }
        }
    }
}

fn build_geometry(block: &Block, cell: &mut Cell) -> Option<BlockGeometry> {
    let resolution = block.resolution;
    let extent = Vec2::new((cell.grid_width() - 1) as f32, (cell.grid_height() - 1) as f32);
    let mut vertices = Vec::with_capacity(((resolution + 1) * (resolution + 1)) as usize);

    for (j, i) in iproduct!(0..=resolution, 0..=resolution) {
        let x = block.left + i * block.step;
        let y = block.top + j * block.step;

        vertices.push(TerrainVertex {
            position: cell.grid_position(x, y)?.to_array(),
            normal: cell.normal(x, y)?.to_array(),
            texcoord: (Vec2::new(x as f32, y as f32) / extent).to_array(),
        });
    }

    let bounding_box = math::bounds_of(vertices.iter().map(|vertex| Vec3::from_array(vertex.position)))?;

    Some(BlockGeometry {
        vertices,
        resolution,
        bounding_box,
    })
}

impl TerrainRenderer for BlockRenderer {
    fn on_cell_load(&mut self, cells: &mut [Cell], index: usize, palette: &MaterialPalette) {
        let Some(cell) = cells.get(index) else {
            return;
        };
        if cell.attachments().contains::<CellRenderData>() {
            return;
        }
        let Some(data) = self.create_render_data(cell, palette) else {
            return;
        };

        cells[index].attachments_mut().insert(data);

        for other in 0..cells.len() {
            if other == index || !cells[other].is_loaded() {
                continue;
            }

            if let Some(side) = cells[index].adjacent_side(&cells[other]) {
                self.connect_cells(cells, index, other, side);
            }
        }
    }

    fn on_cell_unload(&mut self, cells: &mut [Cell], index: usize) {
        let Some(data) = cells
            .get_mut(index)
            .and_then(|cell| cell.attachments_mut().remove::<CellRenderData>())
        else {
            return;
        };

        for side in Side::ALL {
            let neighbor = self.blocks.get(data.root).and_then(|root| root.neighbor(side));

            if let Some(neighbor) = neighbor.filter(|&neighbor| self.blocks.contains(neighbor)) {
                self.blocks.unlink_edge(neighbor, side.opposite());
            }
        }

        self.blocks.free(data.root);
    }

    fn on_height_update(&mut self, cell: &mut Cell, rect: GridRect) {
        let Some(root) = Self::root_of(cell) else {
            return;
        };
        let height_range = Vec2::new(cell.min_height(), cell.max_height());
        // normals are central differences, so samples next to the rect change too
        let rect = rect.grow(1, cell.grid_width(), cell.grid_height());

        for handle in self.blocks.descendants(root) {
            let Some(block) = self.blocks.get_mut(handle) else {
                continue;
            };
            let covered = GridRect::new(block.left, block.top, block.span(), block.span());

            block.height_range = height_range;
            if covered.intersects(&rect) {
                block.geometry = None;
            }
        }
    }

    fn on_material_map_update(&mut self, cell: &mut Cell, rect: GridRect, indices: &Array2<u8>) {
        if let Some(data) = cell.attachments_mut().get_mut::<CellRenderData>() {
            data.masks.update_from_indices(rect, indices);
        }
    }

    fn on_alpha_mask_update(&mut self, cell: &mut Cell, material: usize, rect: GridRect, alpha: &Array2<u8>) {
        if let Some(data) = cell.attachments_mut().get_mut::<CellRenderData>() {
            data.masks.set_alpha(material, rect, alpha);
        }
    }

    fn on_material_palette_update(&mut self, cells: &mut [Cell], palette: &MaterialPalette) {
        for cell in cells {
            if let Some(data) = cell.attachments_mut().get_mut::<CellRenderData>() {
                data.masks.resize(palette.len());
            }
        }
    }

    fn connect_cells(&mut self, cells: &mut [Cell], a: usize, b: usize, side: Side) -> bool {
        let (Some(cell_a), Some(cell_b)) = (cells.get(a), cells.get(b)) else {
            return false;
        };
        let (Some(root_a), Some(root_b)) = (Self::root_of(cell_a), Self::root_of(cell_b)) else {
            return false;
        };

        if a == b || cell_a.adjacent_side(cell_b) != Some(side) {
            return false;
        }

        let (Some(block_a), Some(block_b)) = (self.blocks.get(root_a), self.blocks.get(root_b)) else {
            return false;
        };
        if cell_a.grid_width() != cell_b.grid_width()
            || block_a.resolution != block_b.resolution
            || block_a.step != block_b.step
        {
            warn!(
                "Cannot connect {} and {}, their grids or block resolutions differ.",
                cell_a.id(),
                cell_b.id()
            );
            return false;
        }

        if block_a.neighbor(side) == Some(root_b) {
            return true;
        }

        let refined = [root_a, root_b].map(|root| (root, self.blocks.get(root).is_some_and(|block| !block.is_leaf())));

        self.blocks.merge(root_a);
        self.blocks.merge(root_b);
        self.blocks.link(root_a, side, root_b);

        // restores the first level of detail where no neighbor has to split for it
        for (root, was_split) in refined {
            if was_split {
                self.blocks.try_split(root);
            }
        }
        debug!("Connected {} and {}.", cell_a.id(), cell_b.id());

        true
    }

    fn update_lod(&mut self, cells: &[Cell], camera_position: Vec3) {
        for cell in cells.iter().filter(|cell| cell.is_loaded()) {
            let Some(root) = Self::root_of(cell) else {
                continue;
            };

            let policy = LodPolicy {
                split_coeff: cell.render_properties.lod_split_coeff,
                min_steps: cell.render_properties.min_steps,
            };

            self.blocks.compute_lod(root, camera_position, policy);
        }
    }

    fn render(
        &mut self,
        cells: &mut [Cell],
        view: &TerrainRenderView,
        palette: &MaterialPalette,
        meshes: &mut Vec<RenderMesh>,
    ) {
        for cell in cells.iter_mut() {
            if !cell.is_loaded() || !cell.render_properties.visible {
                continue;
            }
            let Some(data) = cell.attachments().get::<CellRenderData>() else {
                continue;
            };

            let root = data.root;
            let splats: Vec<_> = data
                .masks
                .active()
                .map(|(material, mask)| {
                    let variables = ShaderVariables {
                        alpha_mask: Some(Arc::clone(mask)),
                    };
                    (material, Arc::new(variables))
                })
                .collect();

            let mut leaves = Vec::new();
            self.collect_visible(root, view, &mut leaves);

            for handle in leaves {
                self.emit(cell, handle, view, palette, &splats, meshes);
            }
        }
    }
}
