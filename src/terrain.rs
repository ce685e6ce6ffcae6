//! The terrain system, owning every cell and driving the subsystems.
//!
//! All cell transitions, buffer updates and listener notifications happen on
//! the thread calling into [`TerrainSystem`]. Changes committed through cell
//! locks are queued on the cell and dispatched to the renderer, the collider
//! and the height listeners by [`TerrainSystem::flush_updates`], which runs
//! before every render and collision pass.

use crate::{
    cell::{Cell, CellConfig, CellId, CellLoadState, CellUpdate},
    collider::{CollisionPair, GridCollider, SegmentHit, TerrainCollider, TriangleMesh},
    feeder::{DataFeeder, FileDataSource, ThreadedDataFeeder},
    material::{MaterialHandle, MaterialPalette},
    math::{bounds_of, GridRect, Side},
    plugin::TerrainDrawList,
    render::{BlockRenderer, RenderBackend, TerrainRenderView, TerrainRenderer},
};
use anyhow::{Context, Result};
use bevy::{
    math::{bounding::Aabb3d, Affine3A},
    prelude::*,
};
use derive_more::derive::From;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, sync::Arc};

/// Streaming parameters and cells of a terrain, usually read from a RON file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Directory the feeder sources are resolved against.
    pub data_root: String,
    pub max_loaded_cells: usize,
    /// Visible cells closer than this to the view are loaded when rendering.
    pub load_distance: f32,
    /// Cells closer than this to the view are pre-loaded.
    pub virtual_view_distance: f32,
    pub auto_preload: bool,
    pub materials: Vec<String>,
    pub cells: Vec<CellConfig>,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            data_root: "assets".to_string(),
            max_loaded_cells: usize::MAX,
            load_distance: 1024.0,
            virtual_view_distance: 2048.0,
            auto_preload: true,
            materials: Vec::new(),
            cells: Vec::new(),
        }
    }
}

impl TerrainConfig {
    pub fn from_ron(source: &str) -> Result<Self> {
        Ok(ron::from_str(source)?)
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .with_context(|| format!("Failed to read terrain config {}.", path.display()))?;

        Self::from_ron(&source).with_context(|| format!("Invalid terrain config {}.", path.display()))
    }
}

/// Ways to look up a cell.
#[derive(Copy, Clone, Debug, PartialEq, From)]
pub enum CellKey<'a> {
    Name(&'a str),
    /// The first cell whose footprint contains the object space xz position.
    Position(Vec2),
    Index(usize),
    Id(CellId),
}

/// Observes cell load state changes.
pub trait CellLoadListener: Send + Sync {
    fn on_cell_pre_load(&self, _cell: &Cell) {}

    fn on_cell_load(&self, _cell: &Cell) {}

    /// Called while the cell still holds its data.
    fn on_cell_unload(&self, _cell: &Cell) {}
}

/// Observes committed height changes.
pub trait CellHeightUpdateListener: Send + Sync {
    fn on_cell_height_update(&self, cell: &Cell, rect: GridRect);
}

/// A streamed terrain made of cells.
#[derive(Component)]
#[require(Transform, TerrainDrawList)]
pub struct TerrainSystem {
    cells: Vec<Cell>,
    palette: MaterialPalette,
    pub max_loaded_cells: usize,
    pub load_distance: f32,
    pub virtual_view_distance: f32,
    pub auto_preload: bool,
    next_cell_id: u32,
    feeder: Box<dyn DataFeeder>,
    renderer: Box<dyn TerrainRenderer>,
    collider: Box<dyn TerrainCollider>,
    load_listeners: Vec<Arc<dyn CellLoadListener>>,
    height_listeners: Vec<Arc<dyn CellHeightUpdateListener>>,
}

impl TerrainSystem {
    /// Creates a terrain with a threaded file feeder, a block renderer and a grid collider.
    pub fn new(config: TerrainConfig) -> Self {
        let mut terrain = Self {
            cells: Vec::with_capacity(config.cells.len()),
            palette: MaterialPalette::new(config.materials.iter().map(MaterialHandle::new)),
            max_loaded_cells: config.max_loaded_cells,
            load_distance: config.load_distance,
            virtual_view_distance: config.virtual_view_distance,
            auto_preload: config.auto_preload,
            next_cell_id: 0,
            feeder: Box::new(ThreadedDataFeeder::new(FileDataSource::new(config.data_root))),
            renderer: Box::new(BlockRenderer::default()),
            collider: Box::new(GridCollider::default()),
            load_listeners: Vec::new(),
            height_listeners: Vec::new(),
        };

        for cell in config.cells {
            terrain.add_cell(cell);
        }

        terrain
    }

    pub fn with_feeder(mut self, feeder: impl DataFeeder + 'static) -> Self {
        self.feeder = Box::new(feeder);
        self
    }

    pub fn with_renderer(mut self, renderer: impl TerrainRenderer + 'static) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    pub fn with_collider(mut self, collider: impl TerrainCollider + 'static) -> Self {
        self.collider = Box::new(collider);
        self
    }

    pub fn add_cell(&mut self, config: CellConfig) -> CellId {
        let id = CellId(self.next_cell_id);
        self.next_cell_id += 1;

        self.cells.push(Cell::new(id, config));
        debug!("Added {id}.");
        id
    }

    /// Unloads and removes a cell, returns whether it existed.
    pub fn remove_cell(&mut self, id: CellId) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };

        self.set_load_state(index, CellLoadState::NotLoaded);
        self.cells.remove(index);
        debug!("Removed {id}.");
        true
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.iter().find(|cell| cell.id() == id)
    }

    /// Mutable access without dispatch, queued updates are flushed before the next render or collision query.
    pub fn cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|cell| cell.id() == id)
    }

    fn index_of(&self, id: CellId) -> Option<usize> {
        self.cells.iter().position(|cell| cell.id() == id)
    }

    pub fn cell_index_at(&self, position: Vec2) -> Option<usize> {
        self.cells.iter().position(|cell| cell.contains(position))
    }

    fn find(&self, key: CellKey) -> Option<usize> {
        match key {
            CellKey::Name(name) => self.cells.iter().position(|cell| cell.name() == Some(name)),
            CellKey::Position(position) => self.cell_index_at(position),
            CellKey::Index(index) => (index < self.cells.len()).then_some(index),
            CellKey::Id(id) => self.index_of(id),
        }
    }

    /// Looks up a cell and marks it as used, loading it first if `load_data` is set.
    pub fn get_cell<'a>(&mut self, key: impl Into<CellKey<'a>>, load_data: bool) -> Option<&mut Cell> {
        let index = self.find(key.into())?;

        if load_data {
            self.set_load_state(index, CellLoadState::Loaded);
        }

        let cell = &mut self.cells[index];
        cell.touch();
        Some(cell)
    }

    /// Moves a cell to `state`, returning the state it ends up in.
    ///
    /// Requests for the current state are ignored. A failed feeder call
    /// leaves the cell `NotLoaded`.
    pub fn set_load_state(&mut self, index: usize, state: CellLoadState) -> Option<CellLoadState> {
        let current = self.cells.get(index)?.load_state();

        match (current, state) {
            _ if current == state => {}
            (CellLoadState::NotLoaded, CellLoadState::PreLoaded) => self.pre_load_cell(index),
            (_, CellLoadState::Loaded) => self.load_cell(index),
            (CellLoadState::Loaded, CellLoadState::NotLoaded) => self.unload_cell(index),
            (CellLoadState::PreLoaded, CellLoadState::NotLoaded) => {
                debug!("Dropping pre-loaded {}.", self.cells[index].id());
                self.cells[index].free_buffers();
            }
            (CellLoadState::Loaded, CellLoadState::PreLoaded) => {
                warn!("Ignoring transition of loaded {} to PreLoaded.", self.cells[index].id());
            }
            _ => {}
        }

        Some(self.cells[index].load_state())
    }

    fn pre_load_cell(&mut self, index: usize) {
        let cell = &mut self.cells[index];
        cell.allocate_buffers();

        if self.feeder.pre_load(cell, &self.palette) {
            cell.set_load_state(CellLoadState::PreLoaded);
            debug!("Pre-loaded {}.", cell.id());

            for listener in &self.load_listeners {
                listener.on_cell_pre_load(cell);
            }
        } else {
            warn!("Failed to pre-load {}.", cell.id());
            cell.free_buffers();
        }
    }

    fn load_cell(&mut self, index: usize) {
        let cell = &mut self.cells[index];
        if !cell.has_data() {
            cell.allocate_buffers();
        }

        if !self.feeder.load(cell, &self.palette) {
            warn!("Failed to load {}.", cell.id());
            cell.free_buffers();
            return;
        }

        cell.set_load_state(CellLoadState::Loaded);
        debug!("Loaded {}.", cell.id());

        self.renderer.on_cell_load(&mut self.cells, index, &self.palette);
        self.dispatch_updates(index);
        self.unload_old_cells();

        let cell = &self.cells[index];
        if cell.is_loaded() {
            for listener in &self.load_listeners {
                listener.on_cell_load(cell);
            }
        }
    }

    fn unload_cell(&mut self, index: usize) {
        for listener in &self.load_listeners {
            listener.on_cell_unload(&self.cells[index]);
        }

        self.renderer.on_cell_unload(&mut self.cells, index);
        self.cells[index].free_buffers();
        debug!("Unloaded {}.", self.cells[index].id());
    }

    pub fn loaded_cell_count(&self) -> usize {
        self.cells.iter().filter(|cell| cell.is_loaded()).count()
    }

    /// Evicts the least recently used loaded cells until at most `max_loaded_cells` remain.
    pub fn unload_old_cells(&mut self) {
        let mut loaded: Vec<(u64, usize)> = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_loaded())
            .map(|(index, cell)| (cell.last_used(), index))
            .collect();

        if loaded.len() <= self.max_loaded_cells {
            return;
        }

        loaded.sort_unstable();
        let excess = loaded.len() - self.max_loaded_cells;

        for (_, index) in loaded.into_iter().take(excess) {
            debug!("Evicting {}.", self.cells[index].id());
            self.unload_cell(index);
        }
    }

    /// Pre-loads every unloaded cell within the virtual view distance of `view`.
    pub fn pre_load_cells(&mut self, view: Vec3) {
        for index in 0..self.cells.len() {
            let cell = &self.cells[index];

            if cell.load_state() == CellLoadState::NotLoaded
                && cell.distance_to(view.xz()) <= self.virtual_view_distance
            {
                self.set_load_state(index, CellLoadState::PreLoaded);
            }
        }
    }

    pub fn material_palette(&self) -> &MaterialPalette {
        &self.palette
    }

    /// Replaces the palette, which may only grow. Fails without changes if an existing index would change.
    pub fn set_material_palette(&mut self, materials: impl IntoIterator<Item = MaterialHandle>) -> Result<()> {
        if self.palette.update(materials.into_iter().collect())? {
            self.renderer.on_material_palette_update(&mut self.cells, &self.palette);
        }

        Ok(())
    }

    /// Runs `f` on a cell and dispatches whatever it committed.
    pub fn modify_cell<R>(&mut self, id: CellId, f: impl FnOnce(&mut Cell) -> R) -> Option<R> {
        let index = self.index_of(id)?;
        let result = f(&mut self.cells[index]);

        self.dispatch_updates(index);
        Some(result)
    }

    /// Dispatches the pending updates of every cell.
    pub fn flush_updates(&mut self) {
        for index in 0..self.cells.len() {
            if self.cells[index].has_updates() {
                self.dispatch_updates(index);
            }
        }
    }

    fn dispatch_updates(&mut self, index: usize) {
        let cell = &mut self.cells[index];

        for update in cell.take_updates() {
            match update {
                CellUpdate::Height(rect) => {
                    self.renderer.on_height_update(cell, rect);
                    self.collider.on_height_update(cell, rect);

                    for listener in &self.height_listeners {
                        listener.on_cell_height_update(cell, rect);
                    }
                }
                CellUpdate::MaterialMap { rect, indices } => {
                    self.renderer.on_material_map_update(cell, rect, &indices);
                }
                CellUpdate::AlphaMask {
                    material,
                    rect,
                    alpha,
                } => {
                    self.renderer.on_alpha_mask_update(cell, material, rect, &alpha);
                }
            }
        }
    }

    /// The loaded cell below `position`, loading it if needed.
    fn query_cell(&mut self, position: Vec2) -> Option<&mut Cell> {
        let index = self.cell_index_at(position)?;
        self.set_load_state(index, CellLoadState::Loaded);

        let cell = &mut self.cells[index];
        cell.touch();
        cell.is_loaded().then_some(cell)
    }

    pub fn height_at(&mut self, position: Vec2) -> Option<f32> {
        self.query_cell(position)?.height_at(position)
    }

    pub fn normal_at(&mut self, position: Vec2) -> Option<Vec3> {
        self.query_cell(position)?.normal_at(position)
    }

    pub fn tangent_at(&mut self, position: Vec2) -> Option<Vec3> {
        self.query_cell(position)?.tangent_at(position)
    }

    pub fn binormal_at(&mut self, position: Vec2) -> Option<Vec3> {
        self.query_cell(position)?.bitangent_at(position)
    }

    /// Loads the collidable cells whose footprint overlaps `bounds` and returns their indices.
    fn collision_cells(&mut self, bounds: &Aabb3d) -> Vec<usize> {
        let overlaps = |cell: &Cell| {
            let footprint = cell.bounding_box();
            footprint.min.x <= bounds.max.x
                && bounds.min.x <= footprint.max.x
                && footprint.min.z <= bounds.max.z
                && bounds.min.z <= footprint.max.z
        };

        let candidates: Vec<usize> = (0..self.cells.len())
            .filter(|&index| {
                let cell = &self.cells[index];
                cell.collision_properties.collidable && overlaps(cell)
            })
            .collect();

        for &index in &candidates {
            self.set_load_state(index, CellLoadState::Loaded);
        }
        self.flush_updates();

        candidates
            .into_iter()
            .filter(|&index| {
                let cell = &mut self.cells[index];
                cell.touch();
                cell.is_loaded()
            })
            .collect()
    }

    /// Hits of the object space segment `start..end` with every cell, nearest first.
    pub fn collide_segment(&mut self, start: Vec3, end: Vec3, one_hit: bool) -> Vec<SegmentHit> {
        self.flush_updates();
        let Some(bounds) = bounds_of([start, end]) else {
            return Vec::new();
        };

        let mut hits = Vec::new();
        for index in self.collision_cells(&bounds) {
            hits.extend(self.collider.collide_segment(&self.cells[index], start, end, one_hit));
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        if one_hit {
            hits.truncate(1);
        }

        hits
    }

    /// Terrain triangles touching the given triangles, transformed into object space by `transform`.
    pub fn collide_triangles(
        &mut self,
        vertices: &[Vec3],
        triangles: &[[u32; 3]],
        transform: &Affine3A,
        one_hit: bool,
    ) -> Vec<CollisionPair> {
        self.flush_updates();
        let Some(bounds) = bounds_of(vertices.iter().map(|&vertex| transform.transform_point3(vertex))) else {
            return Vec::new();
        };

        let mut pairs = Vec::new();
        for index in self.collision_cells(&bounds) {
            pairs.extend(
                self.collider
                    .collide_triangles(&self.cells[index], vertices, triangles, transform, one_hit),
            );

            if one_hit && !pairs.is_empty() {
                break;
            }
        }

        pairs
    }

    /// Terrain triangles touching `mesh`, transformed into object space by `transform`.
    pub fn collide(&mut self, mesh: &TriangleMesh, transform: &Affine3A, one_hit: bool) -> Vec<CollisionPair> {
        self.flush_updates();
        let Some(bounds) = bounds_of(mesh.vertices.iter().map(|&vertex| transform.transform_point3(vertex))) else {
            return Vec::new();
        };

        let mut pairs = Vec::new();
        for index in self.collision_cells(&bounds) {
            pairs.extend(self.collider.collide(&mut self.cells[index], mesh, transform, one_hit));

            if one_hit && !pairs.is_empty() {
                break;
            }
        }

        pairs
    }

    /// Links the borders of two loaded cells, `b` lying on `side` of `a`.
    pub fn connect_cells(&mut self, a: CellId, b: CellId, side: Side) -> bool {
        let (Some(a), Some(b)) = (self.index_of(a), self.index_of(b)) else {
            return false;
        };

        self.renderer.connect_cells(&mut self.cells, a, b, side)
    }

    /// Flushes updates, pre-loads nearby cells and adapts the LOD to `camera_position`.
    pub fn update_view(&mut self, camera_position: Vec3) {
        self.flush_updates();

        if self.auto_preload {
            self.pre_load_cells(camera_position);
        }

        self.renderer.update_lod(&self.cells, camera_position);
    }

    /// Loads the visible cells within the load distance, updates the view
    /// and draws the resulting meshes. Returns the number of meshes drawn.
    pub fn render(&mut self, view: &TerrainRenderView, backend: &mut dyn RenderBackend) -> usize {
        let camera = view.camera_position.xz();

        for index in 0..self.cells.len() {
            let cell = &self.cells[index];

            if !cell.is_loaded()
                && cell.distance_to(camera) <= self.load_distance
                && view.is_visible(&cell.bounding_box())
            {
                self.set_load_state(index, CellLoadState::Loaded);
            }
        }

        self.update_view(view.camera_position);

        let mut meshes = Vec::new();
        self.renderer.render(&mut self.cells, view, &self.palette, &mut meshes);

        for mesh in &meshes {
            backend.draw_mesh(mesh);
        }

        meshes.len()
    }

    pub fn add_load_listener(&mut self, listener: Arc<dyn CellLoadListener>) {
        self.load_listeners.push(listener);
    }

    pub fn remove_load_listener(&mut self, listener: &Arc<dyn CellLoadListener>) -> bool {
        remove_listener(&mut self.load_listeners, listener)
    }

    pub fn add_height_listener(&mut self, listener: Arc<dyn CellHeightUpdateListener>) {
        self.height_listeners.push(listener);
    }

    pub fn remove_height_listener(&mut self, listener: &Arc<dyn CellHeightUpdateListener>) -> bool {
        remove_listener(&mut self.height_listeners, listener)
    }
}

fn remove_listener<T: ?Sized>(listeners: &mut Vec<Arc<T>>, listener: &Arc<T>) -> bool {
    let Some(position) = listeners.iter().position(|other| Arc::ptr_eq(other, listener)) else {
        return false;
    };

    listeners.remove(position);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        render::RenderMesh,
        test_util::{cell_config, FunctionFeeder},
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl CellLoadListener for Recorder {
        fn on_cell_pre_load(&self, cell: &Cell) {
            self.record(format!("pre_load {}", cell.id()));
        }

        fn on_cell_load(&self, cell: &Cell) {
            self.record(format!("load {}", cell.id()));
        }

        fn on_cell_unload(&self, cell: &Cell) {
            assert!(cell.has_data());
            self.record(format!("unload {}", cell.id()));
        }
    }

    impl CellHeightUpdateListener for Recorder {
        fn on_cell_height_update(&self, cell: &Cell, rect: GridRect) {
            self.record(format!("height {} {}x{}", cell.id(), rect.width, rect.height));
        }
    }

    fn ramp(position: Vec2) -> f32 {
        position.x
    }

    fn terrain(feeder: FunctionFeeder, cells: usize) -> TerrainSystem {
        let mut terrain = TerrainSystem::new(TerrainConfig {
            load_distance: 10.0,
            virtual_view_distance: 10.0,
            ..default()
        })
        .with_feeder(feeder);

        for index in 0..cells {
            terrain.add_cell(cell_config(Vec2::new(index as f32 * 8.0, 0.0), 8.0, 9));
        }

        terrain
    }

    #[test]
    fn failed_load_leaves_the_cell_unloaded() {
        let feeder = FunctionFeeder::failing();
        let calls = feeder.calls.clone();
        let mut terrain = terrain(feeder, 1);
        let recorder = Arc::new(Recorder::default());
        terrain.add_load_listener(recorder.clone());

        assert_eq!(terrain.set_load_state(0, CellLoadState::Loaded), Some(CellLoadState::NotLoaded));
        assert_eq!(calls.loads(), 1);
        assert!(!terrain.cells()[0].has_data());
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn same_state_requests_are_ignored() {
        let feeder = FunctionFeeder::new(ramp);
        let calls = feeder.calls.clone();
        let mut terrain = terrain(feeder, 1);
        let recorder = Arc::new(Recorder::default());
        terrain.add_load_listener(recorder.clone());

        terrain.set_load_state(0, CellLoadState::NotLoaded);
        assert_eq!(calls.pre_loads() + calls.loads(), 0);

        terrain.set_load_state(0, CellLoadState::Loaded);
        terrain.set_load_state(0, CellLoadState::Loaded);
        assert_eq!(calls.loads(), 1);
        assert_eq!(recorder.events(), ["load cell#0"]);

        assert_eq!(terrain.set_load_state(0, CellLoadState::PreLoaded), Some(CellLoadState::Loaded));
        assert_eq!(calls.pre_loads(), 0);
        assert_eq!(terrain.set_load_state(7, CellLoadState::Loaded), None);
    }

    #[test]
    fn state_transitions_notify_listeners() {
        let mut terrain = terrain(FunctionFeeder::new(ramp), 1);
        let recorder = Arc::new(Recorder::default());
        terrain.add_load_listener(recorder.clone());

        terrain.set_load_state(0, CellLoadState::PreLoaded);
        assert!(terrain.cells()[0].has_data());
        terrain.set_load_state(0, CellLoadState::Loaded);
        terrain.set_load_state(0, CellLoadState::NotLoaded);

        assert_eq!(recorder.events(), ["pre_load cell#0", "load cell#0", "unload cell#0"]);
        assert!(!terrain.cells()[0].has_data());
        assert_eq!(terrain.cells()[0].heights(), None);

        let listener: Arc<dyn CellLoadListener> = recorder.clone();
        assert!(terrain.remove_load_listener(&listener));
        assert!(!terrain.remove_load_listener(&listener));
        terrain.set_load_state(0, CellLoadState::Loaded);
        assert_eq!(recorder.events().len(), 3);
    }

    #[test]
    fn least_recently_used_cells_are_evicted() {
        let mut terrain = terrain(FunctionFeeder::new(ramp), 3);
        terrain.max_loaded_cells = 2;

        for index in 0..3usize {
            terrain.get_cell(index, true);
        }
        terrain.unload_old_cells();

        let loaded: Vec<bool> = terrain.cells().iter().map(Cell::is_loaded).collect();
        assert_eq!(loaded, [false, true, true]);
        assert_eq!(terrain.cells()[0].heights(), None);
        assert_eq!(terrain.loaded_cell_count(), 2);
    }

    #[test]
    fn using_a_cell_protects_it_from_eviction() {
        let mut terrain = terrain(FunctionFeeder::new(ramp), 3);
        terrain.max_loaded_cells = 2;

        terrain.get_cell(0usize, true);
        terrain.get_cell(1usize, true);
        terrain.get_cell(0usize, false);
        terrain.get_cell(2usize, true);

        let loaded: Vec<bool> = terrain.cells().iter().map(Cell::is_loaded).collect();
        assert_eq!(loaded, [true, false, true]);
    }

    #[test]
    fn nearby_cells_are_pre_loaded() {
        let feeder = FunctionFeeder::new(ramp);
        let calls = feeder.calls.clone();
        let mut terrain = terrain(feeder, 1);
        let far = terrain.add_cell(cell_config(Vec2::new(100.0, 0.0), 8.0, 9));

        terrain.update_view(Vec3::new(4.0, 0.0, 4.0));

        assert_eq!(terrain.cells()[0].load_state(), CellLoadState::PreLoaded);
        assert_eq!(terrain.cell(far).map(Cell::load_state), Some(CellLoadState::NotLoaded));
        assert_eq!(calls.pre_loads(), 1);

        terrain.auto_preload = false;
        terrain.update_view(Vec3::new(100.0, 0.0, 4.0));
        assert_eq!(terrain.cell(far).map(Cell::load_state), Some(CellLoadState::NotLoaded));
    }

    #[test]
    fn cells_are_found_by_every_key() {
        let mut terrain = terrain(FunctionFeeder::new(ramp), 2);
        let named = terrain.add_cell(CellConfig {
            name: Some("north".to_string()),
            ..cell_config(Vec2::new(0.0, -8.0), 8.0, 9)
        });

        assert_eq!(terrain.get_cell("north", false).map(|cell| cell.id()), Some(named));
        assert_eq!(terrain.get_cell(Vec2::new(12.0, 3.0), false).map(|cell| cell.id()), Some(CellId(1)));
        assert_eq!(terrain.get_cell(named, false).map(|cell| cell.name().is_some()), Some(true));
        assert!(terrain.get_cell(5usize, false).is_none());
        assert!(terrain.get_cell("south", true).is_none());

        let cell = terrain.get_cell(1usize, true).unwrap();
        assert!(cell.is_loaded());
        assert_eq!(cell.height(8, 0), Some(16.0));
    }

    #[test]
    fn point_queries_load_the_owning_cell() {
        let mut terrain = terrain(FunctionFeeder::new(ramp), 2);

        assert_eq!(terrain.height_at(Vec2::new(10.5, 3.0)), Some(10.5));
        assert!(terrain.cells()[1].is_loaded());
        assert!(!terrain.cells()[0].is_loaded());

        let normal = terrain.normal_at(Vec2::new(10.5, 3.0)).unwrap();
        assert!(normal.distance(Vec3::new(-1.0, 1.0, 0.0).normalize()) < 1e-4);
        assert!(terrain.tangent_at(Vec2::new(2.0, 2.0)).is_some());
        assert!(terrain.binormal_at(Vec2::new(2.0, 2.0)).is_some());
        assert_eq!(terrain.height_at(Vec2::new(-5.0, 0.0)), None);
    }

    #[test]
    fn modifications_reach_height_listeners() {
        let mut terrain = terrain(FunctionFeeder::new(ramp), 1);
        let recorder = Arc::new(Recorder::default());
        terrain.get_cell(0usize, true);
        terrain.add_height_listener(recorder.clone());

        terrain.modify_cell(CellId(0), |cell| {
            if let Some(mut heights) = cell.lock_height_data(GridRect::new(2, 2, 3, 4)) {
                heights.data_mut().fill(7.0);
            }
        });

        assert_eq!(recorder.events(), ["height cell#0 3x4"]);
        assert_eq!(terrain.cells()[0].height(3, 4), Some(7.0));
        assert_eq!(terrain.cells()[0].max_height(), 8.0);
        assert!(terrain.modify_cell(CellId(9), |_| ()).is_none());
    }

    #[test]
    fn palette_only_grows() {
        let mut terrain = terrain(FunctionFeeder::new(ramp), 0);
        let handles = |names: &[&str]| names.iter().copied().map(MaterialHandle::new).collect::<Vec<_>>();

        terrain.set_material_palette(handles(&["grass", "rock"])).unwrap();
        assert!(terrain.set_material_palette(handles(&["rock"])).is_err());
        assert!(terrain.set_material_palette(handles(&["grass", "sand"])).is_err());
        terrain.set_material_palette(handles(&["grass", "rock", "snow"])).unwrap();

        assert_eq!(terrain.material_palette().len(), 3);
        assert_eq!(terrain.material_palette().index_of("snow"), Some(2));
    }

    #[test]
    fn collision_queries_load_the_cells() {
        let mut terrain = terrain(FunctionFeeder::new(|_| 0.0), 2);

        let hits = terrain.collide_segment(Vec3::new(9.3, 5.0, 2.6), Vec3::new(9.3, -5.0, 2.6), false);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].point.distance(Vec3::new(9.3, 0.0, 2.6)) < 1e-5);
        assert!(terrain.cells()[1].is_loaded());
        assert!(!terrain.cells()[0].is_loaded());

        let crossing = terrain.collide_segment(Vec3::new(2.0, 1.0, 4.3), Vec3::new(14.0, -3.0, 4.3), false);
        assert_eq!(crossing.len(), 1);
        assert!(terrain.cells()[0].is_loaded());

        terrain.cell_mut(CellId(1)).unwrap().collision_properties.collidable = false;
        assert!(terrain
            .collide_segment(Vec3::new(9.3, 5.0, 2.6), Vec3::new(9.3, -5.0, 2.6), true)
            .is_empty());

        let blade = TriangleMesh::new(
            vec![Vec3::new(0.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.2, 1.0, 0.3)],
            vec![[0, 1, 2]],
        );
        let moved = Affine3A::from_translation(Vec3::new(3.2, 0.0, 3.1));
        assert!(!terrain.collide(&blade, &moved, true).is_empty());
        assert_eq!(
            terrain.collide_triangles(&blade.vertices, &blade.triangles, &moved, true).len(),
            1
        );
    }

    #[test]
    fn rendering_loads_visible_cells() {
        let mut terrain = terrain(FunctionFeeder::new(|_| 0.0), 2);
        let far = terrain.add_cell(cell_config(Vec2::new(500.0, 0.0), 8.0, 9));
        terrain.set_material_palette([MaterialHandle::new("ground")]).unwrap();
        for cell in 0..3 {
            terrain.cells[cell].base_material = Some("ground".into());
        }

        let mut meshes: Vec<RenderMesh> = Vec::new();
        let drawn = terrain.render(&TerrainRenderView::unculled(Vec3::new(8.0, 2.0, 4.0)), &mut meshes);

        assert_eq!(drawn, meshes.len());
        assert!(drawn >= 2);
        assert_eq!(terrain.loaded_cell_count(), 2);
        assert!(!terrain.cell(far).unwrap().is_loaded());
        assert!(meshes.iter().all(|mesh| mesh.cell != far));
    }

    #[test]
    fn removed_cells_are_unloaded() {
        let mut terrain = terrain(FunctionFeeder::new(ramp), 2);
        let recorder = Arc::new(Recorder::default());
        terrain.add_load_listener(recorder.clone());
        terrain.get_cell(1usize, true);

        assert!(terrain.remove_cell(CellId(1)));
        assert!(!terrain.remove_cell(CellId(1)));
        assert_eq!(terrain.cell_count(), 1);
        assert_eq!(recorder.events(), ["load cell#1", "unload cell#1"]);
    }

    #[test]
    fn config_from_ron() {
        let config = TerrainConfig::from_ron(
            r#"(
                max_loaded_cells: 4,
                virtual_view_distance: 300.0,
                materials: ["grass", "rock"],
                cells: [
                    (
                        name: Some("north"),
                        grid_width: 60,
                        render: (block_resolution: 16),
                        feeder: (heightmap_source: "north.png", heightmap_format: Raw16Le),
                        base_material: Some("grass"),
                    ),
                ],
            )"#,
        )
        .unwrap();

        assert_eq!(config.max_loaded_cells, 4);
        assert!(config.auto_preload);

        let terrain = TerrainSystem::new(config);
        let cell = &terrain.cells()[0];
        assert_eq!(cell.name(), Some("north"));
        assert_eq!(cell.grid_width(), 65);
        assert_eq!(cell.grid_height(), 513);
        assert_eq!(cell.render_properties.block_resolution, 16);
        assert_eq!(cell.feeder_properties.heightmap_source, "north.png");
        assert_eq!(terrain.material_palette().len(), 2);
        assert!(TerrainConfig::from_ron("(cells: 3)").is_err());
    }
}
