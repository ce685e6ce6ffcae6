//! A rectangular piece of heightfield terrain.

mod attachment;
mod lock;

pub use attachment::CellAttachments;
pub use lock::{LockedHeightData, LockedMaterialData};

use crate::{
    material::MaterialHandle,
    math::{GridRect, Side},
    properties::{CellCollisionProperties, CellRenderProperties, FeederProperties},
};
use bevy::{
    math::{bounding::Aabb3d, Vec3A},
    prelude::*,
};
use derive_more::derive::Display;
use itertools::iproduct;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::{
    ops::{Add, Mul},
    sync::atomic::{AtomicU64, Ordering},
};

const MIN_GRID_SIZE: u32 = 3;
const ADJACENCY_EPSILON: f32 = 1e-3;

static USAGE_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Identifies a cell for the lifetime of its terrain.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("cell#{_0}")]
pub struct CellId(pub(crate) u32);

/// How much of a cell's data is resident.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellLoadState {
    /// No grids are allocated.
    #[default]
    NotLoaded,
    /// Grids are allocated and the feeder has started fetching data.
    PreLoaded,
    /// Grids are filled and the cell is usable by every subsystem.
    Loaded,
}

/// Describes a cell before it is added to a terrain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    pub name: Option<String>,
    /// Object space `(x, z)` of the cell's first grid sample.
    pub position: [f32; 2],
    /// Width along x, height scale along y and depth along z.
    pub size: [f32; 3],
    pub grid_width: u32,
    pub grid_height: u32,
    pub material_width: u32,
    pub material_height: u32,
    /// Keep the material map in memory after it was handed to the renderer.
    pub material_persistent: bool,
    pub render: CellRenderProperties,
    pub collision: CellCollisionProperties,
    pub feeder: FeederProperties,
    pub base_material: Option<String>,
    pub splat_base_material: Option<String>,
    pub alpha_splat_material: Option<String>,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            name: None,
            position: [0.0, 0.0],
            size: [512.0, 100.0, 512.0],
            grid_width: 513,
            grid_height: 513,
            material_width: 256,
            material_height: 256,
            material_persistent: false,
            render: default(),
            collision: default(),
            feeder: default(),
            base_material: None,
            splat_base_material: None,
            alpha_splat_material: None,
        }
    }
}

/// Rounds a grid dimension up to the next `2^n + 1`, with a minimum of three samples.
pub fn corrected_grid_size(size: u32) -> u32 {
    let size = size.max(MIN_GRID_SIZE);

    if (size - 1).is_power_of_two() {
        size
    } else {
        size.next_power_of_two() + 1
    }
}

/// A change committed through a lock, waiting to be dispatched to the subsystems.
#[derive(Clone, Debug, PartialEq)]
pub enum CellUpdate {
    Height(GridRect),
    MaterialMap {
        rect: GridRect,
        indices: Array2<u8>,
    },
    AlphaMask {
        material: usize,
        rect: GridRect,
        alpha: Array2<u8>,
    },
}

/// Surface frames derived from the height grid.
struct TangentFrames {
    normals: Array2<Vec3>,
    tangents: Array2<Vec3>,
    bitangents: Array2<Vec3>,
}

/// A rectangular heightfield with its material data and per subsystem state.
///
/// Heights are stored in object space. Grid sample `(x, y)` lies at
/// `position + (x, y) * spacing` on the xz plane.
pub struct Cell {
    id: CellId,
    name: Option<String>,
    position: Vec2,
    size: Vec3,
    grid_width: u32,
    grid_height: u32,
    material_width: u32,
    material_height: u32,
    material_persistent: bool,
    pub render_properties: CellRenderProperties,
    pub collision_properties: CellCollisionProperties,
    pub feeder_properties: FeederProperties,
    pub base_material: Option<MaterialHandle>,
    pub splat_base_material: Option<MaterialHandle>,
    pub alpha_splat_material: Option<MaterialHandle>,
    load_state: CellLoadState,
    heights: Option<Array2<f32>>,
    frames: Option<TangentFrames>,
    material_map: Option<Array2<u8>>,
    min_height: f32,
    max_height: f32,
    bounding_box: Aabb3d,
    last_used: u64,
    attachments: CellAttachments,
    updates: Vec<CellUpdate>,
}

impl Cell {
    pub(crate) fn new(id: CellId, config: CellConfig) -> Self {
        let material = |name: Option<String>| name.map(MaterialHandle::new);

        let mut cell = Self {
            id,
            name: config.name,
            position: Vec2::from_array(config.position),
            size: Vec3::from_array(config.size),
            grid_width: corrected_grid_size(config.grid_width),
            grid_height: corrected_grid_size(config.grid_height),
            material_width: config.material_width.max(1),
            material_height: config.material_height.max(1),
            material_persistent: config.material_persistent,
            render_properties: config.render,
            collision_properties: config.collision,
            feeder_properties: config.feeder,
            base_material: material(config.base_material),
            splat_base_material: material(config.splat_base_material),
            alpha_splat_material: material(config.alpha_splat_material),
            load_state: CellLoadState::NotLoaded,
            heights: None,
            frames: None,
            material_map: None,
            min_height: 0.0,
            max_height: 0.0,
            bounding_box: Aabb3d {
                min: Vec3A::ZERO,
                max: Vec3A::ZERO,
            },
            last_used: 0,
            attachments: default(),
            updates: Vec::new(),
        };

        cell.reset_bounds();
        cell
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn size(&self) -> Vec3 {
        self.size
    }

    pub fn grid_width(&self) -> u32 {
        self.grid_width
    }

    pub fn grid_height(&self) -> u32 {
        self.grid_height
    }

    pub fn material_width(&self) -> u32 {
        self.material_width
    }

    pub fn material_height(&self) -> u32 {
        self.material_height
    }

    pub fn is_material_persistent(&self) -> bool {
        self.material_persistent
    }

    pub fn load_state(&self) -> CellLoadState {
        self.load_state
    }

    pub fn is_loaded(&self) -> bool {
        self.load_state == CellLoadState::Loaded
    }

    /// Whether the grids are allocated, which is the case in every state but `NotLoaded`
    /// and while a load is in progress.
    pub fn has_data(&self) -> bool {
        self.heights.is_some()
    }

    pub fn min_height(&self) -> f32 {
        self.min_height
    }

    pub fn max_height(&self) -> f32 {
        self.max_height
    }

    /// Object space bounds, using the full height scale until heights are known.
    pub fn bounding_box(&self) -> Aabb3d {
        self.bounding_box
    }

    /// Usage stamp, larger is more recent.
    pub fn last_used(&self) -> u64 {
        self.last_used
    }

    pub fn touch(&mut self) {
        self.last_used = USAGE_CLOCK.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heights(&self) -> Option<&Array2<f32>> {
        self.heights.as_ref()
    }

    /// The persistent material map, if enabled and loaded.
    pub fn material_map(&self) -> Option<&Array2<u8>> {
        self.material_map.as_ref()
    }

    pub fn attachments(&self) -> &CellAttachments {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut CellAttachments {
        &mut self.attachments
    }

    /// Distance between the grid samples along x and z.
    pub fn spacing(&self) -> Vec2 {
        Vec2::new(
            self.size.x / (self.grid_width - 1) as f32,
            self.size.z / (self.grid_height - 1) as f32,
        )
    }

    /// Whether the xz footprint contains `position`, borders included.
    pub fn contains(&self, position: Vec2) -> bool {
        let max = self.position + self.size.xz();
        position.cmpge(self.position).all() && position.cmple(max).all()
    }

    /// Distance from `position` to the xz footprint.
    pub fn distance_to(&self, position: Vec2) -> f32 {
        let closest = position.clamp(self.position, self.position + self.size.xz());
        closest.distance(position)
    }

    /// The side of this cell `other` is attached to, if they share a full edge.
    pub fn adjacent_side(&self, other: &Cell) -> Option<Side> {
        let near = |a: f32, b: f32| (a - b).abs() <= ADJACENCY_EPSILON * self.size.x.max(self.size.z);

        let same_x = near(self.position.x, other.position.x) && near(self.size.x, other.size.x);
        let same_z = near(self.position.y, other.position.y) && near(self.size.z, other.size.z);

        if same_x && near(other.position.y, self.position.y - other.size.z) {
            Some(Side::Top)
        } else if same_x && near(other.position.y, self.position.y + self.size.z) {
            Some(Side::Bottom)
        } else if same_z && near(other.position.x, self.position.x - other.size.x) {
            Some(Side::Left)
        } else if same_z && near(other.position.x, self.position.x + self.size.x) {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Object space xz position to unclamped grid coordinates.
    pub fn object_to_grid(&self, position: Vec2) -> Vec2 {
        (position - self.position) / self.spacing()
    }

    /// Object space position of grid sample `(x, y)`.
    pub fn grid_position(&self, x: u32, y: u32) -> Option<Vec3> {
        let height = self.height(x, y)?;
        let spacing = self.spacing();

        Some(Vec3::new(
            self.position.x + x as f32 * spacing.x,
            height,
            self.position.y + y as f32 * spacing.y,
        ))
    }

    pub fn height(&self, x: u32, y: u32) -> Option<f32> {
        self.heights.as_ref()?.get([y as usize, x as usize]).copied()
    }

    pub fn normal(&mut self, x: u32, y: u32) -> Option<Vec3> {
        self.frame_sample(x, y, |frames| &frames.normals)
    }

    pub fn tangent(&mut self, x: u32, y: u32) -> Option<Vec3> {
        self.frame_sample(x, y, |frames| &frames.tangents)
    }

    pub fn bitangent(&mut self, x: u32, y: u32) -> Option<Vec3> {
        self.frame_sample(x, y, |frames| &frames.bitangents)
    }

    /// Bilinearly interpolated height below the object space xz `position`.
    ///
    /// Positions outside the cell are clamped to its border.
    pub fn height_at(&self, position: Vec2) -> Option<f32> {
        let heights = self.heights.as_ref()?;
        Some(self.interpolate(position, |x, y| heights[[y, x]]))
    }

    pub fn normal_at(&mut self, position: Vec2) -> Option<Vec3> {
        self.interpolate_frame(position, |frames| &frames.normals)
            .map(Vec3::normalize_or_zero)
    }

    pub fn tangent_at(&mut self, position: Vec2) -> Option<Vec3> {
        self.interpolate_frame(position, |frames| &frames.tangents)
            .map(Vec3::normalize_or_zero)
    }

    pub fn bitangent_at(&mut self, position: Vec2) -> Option<Vec3> {
        self.interpolate_frame(position, |frames| &frames.bitangents)
            .map(Vec3::normalize_or_zero)
    }

    /// Grants exclusive write access to a rectangle of the height grid.
    ///
    /// The rectangle is clipped to the grid. Dropping the guard commits the
    /// change and queues a height update. Returns `None` while no heights are allocated.
    pub fn lock_height_data(&mut self, rect: GridRect) -> Option<LockedHeightData<'_>> {
        let rect = rect.clamp_to(self.grid_width, self.grid_height);
        let heights = self.heights.take()?;

        Some(LockedHeightData::new(self, heights, rect))
    }

    /// Grants exclusive write access to a rectangle of the material map.
    ///
    /// Non persistent cells hand out a zeroed scratch buffer. Dropping the
    /// guard queues a material update carrying the written indices.
    pub fn lock_material_data(&mut self, rect: GridRect) -> Option<LockedMaterialData<'_>> {
        if !self.has_data() {
            return None;
        }

        let rect = rect.clamp_to(self.material_width, self.material_height);
        let persistent = self.material_map.take();

        Some(LockedMaterialData::new(self, persistent, rect))
    }

    /// Replaces the coverage of one palette material inside `rect` of the material grid.
    pub fn set_alpha_mask(&mut self, material: usize, rect: GridRect, alpha: Array2<u8>) {
        if !self.has_data() {
            return;
        }

        let rect = rect.clamp_to(self.material_width, self.material_height);
        if alpha.dim() != (rect.height as usize, rect.width as usize) {
            warn!(
                "Ignoring alpha mask of shape {:?} for {rect:?} of {}.",
                alpha.dim(),
                self.id
            );
            return;
        }

        self.touch();
        self.updates.push(CellUpdate::AlphaMask {
            material,
            rect,
            alpha,
        });
    }

    pub(crate) fn set_load_state(&mut self, state: CellLoadState) {
        self.load_state = state;
        self.touch();
    }

    pub(crate) fn allocate_buffers(&mut self) {
        let shape = (self.grid_height as usize, self.grid_width as usize);

        self.heights = Some(Array2::zeros(shape));
        self.frames = None;
        self.material_map = self
            .material_persistent
            .then(|| Array2::zeros((self.material_height as usize, self.material_width as usize)));
        self.min_height = 0.0;
        self.max_height = 0.0;
        self.update_bounds();
    }

    /// Drops every grid and attachment and returns to `NotLoaded`.
    pub(crate) fn free_buffers(&mut self) {
        self.heights = None;
        self.frames = None;
        self.material_map = None;
        self.attachments.clear();
        self.updates.clear();
        self.load_state = CellLoadState::NotLoaded;
        self.reset_bounds();
        self.touch();
    }

    pub(crate) fn take_updates(&mut self) -> Vec<CellUpdate> {
        std::mem::take(&mut self.updates)
    }

    pub(crate) fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    fn commit_heights(&mut self, heights: Array2<f32>, rect: GridRect) {
        let (min, max) = heights
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &height| {
                (min.min(height), max.max(height))
            });

        self.heights = Some(heights);
        self.frames = None;
        self.min_height = min;
        self.max_height = max;
        self.update_bounds();
        self.touch();
        self.updates.push(CellUpdate::Height(rect));
    }

    fn commit_material(&mut self, persistent: Option<Array2<u8>>, rect: GridRect, indices: Array2<u8>) {
        self.material_map = persistent;
        self.touch();
        self.updates.push(CellUpdate::MaterialMap { rect, indices });
    }

    fn reset_bounds(&mut self) {
        self.min_height = 0.0;
        self.max_height = self.size.y;
        self.update_bounds();
    }

    fn update_bounds(&mut self) {
        self.bounding_box = Aabb3d {
            min: Vec3A::new(self.position.x, self.min_height, self.position.y),
            max: Vec3A::new(
                self.position.x + self.size.x,
                self.max_height,
                self.position.y + self.size.z,
            ),
        };
    }

    fn frames(&mut self) -> Option<&TangentFrames> {
        if self.frames.is_none() {
            let heights = self.heights.as_ref()?;
            self.frames = Some(compute_frames(heights, self.spacing()));
        }

        self.frames.as_ref()
    }

    fn frame_sample(
        &mut self,
        x: u32,
        y: u32,
        grid: impl Fn(&TangentFrames) -> &Array2<Vec3>,
    ) -> Option<Vec3> {
        grid(self.frames()?).get([y as usize, x as usize]).copied()
    }

    fn interpolate_frame(
        &mut self,
        position: Vec2,
        grid: impl Fn(&TangentFrames) -> &Array2<Vec3>,
    ) -> Option<Vec3> {
        self.frames()?;
        let grid = grid(self.frames.as_ref()?);

        Some(self.interpolate(position, |x, y| grid[[y, x]]))
    }

    fn interpolate<T>(&self, position: Vec2, sample: impl Fn(usize, usize) -> T) -> T
    where
        T: Mul<f32, Output = T> + Add<Output = T>,
    {
        let max = Vec2::new((self.grid_width - 1) as f32, (self.grid_height - 1) as f32);
        let grid = self.object_to_grid(position).clamp(Vec2::ZERO, max);

        let x = (grid.x.floor() as usize).min(self.grid_width as usize - 2);
        let y = (grid.y.floor() as usize).min(self.grid_height as usize - 2);
        let fx = grid.x - x as f32;
        let fy = grid.y - y as f32;

        let top = sample(x, y) * (1.0 - fx) + sample(x + 1, y) * fx;
        let bottom = sample(x, y + 1) * (1.0 - fx) + sample(x + 1, y + 1) * fx;

        top * (1.0 - fy) + bottom * fy
    }
}

/// Central differences inside the grid, one sided differences on its border.
fn compute_frames(heights: &Array2<f32>, spacing: Vec2) -> TangentFrames {
    let (rows, columns) = heights.dim();
    let shape = (rows, columns);

    let mut frames = TangentFrames {
        normals: Array2::from_elem(shape, Vec3::Y),
        tangents: Array2::from_elem(shape, Vec3::X),
        bitangents: Array2::from_elem(shape, Vec3::Z),
    };

    for (y, x) in iproduct!(0..rows, 0..columns) {
        let (left, right) = (x.saturating_sub(1), (x + 1).min(columns - 1));
        let (up, down) = (y.saturating_sub(1), (y + 1).min(rows - 1));

        let dhdx = (heights[[y, right]] - heights[[y, left]]) / ((right - left) as f32 * spacing.x);
        let dhdz = (heights[[down, x]] - heights[[up, x]]) / ((down - up) as f32 * spacing.y);

        frames.normals[[y, x]] = Vec3::new(-dhdx, 1.0, -dhdz).normalize();
        frames.tangents[[y, x]] = Vec3::new(1.0, dhdx, 0.0).normalize();
        frames.bitangents[[y, x]] = Vec3::new(0.0, dhdz, 1.0).normalize();
    }

    frames
}
