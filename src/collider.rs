//! Collision queries against cell heightfields.
//!
//! Every grid quad is split into the same two triangles the renderer draws at
//! full resolution, so hits lie exactly on the finest rendered surface.

use crate::{
    cell::Cell,
    math::{self, bounds_overlap, segment_triangle, triangles_intersect, GridRect, GridTraversal, Triangle},
};
use anyhow::{anyhow, Result};
use bevy::{
    math::{bounding::Aabb3d, Affine3A},
    prelude::*,
};
use parry3d::shape::TriMesh;
use std::{collections::BTreeSet, sync::Arc};

/// Hits closer than this along the segment are considered the same hit.
const HIT_EPSILON: f32 = 1e-4;

/// Where a segment crosses the terrain.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SegmentHit {
    pub point: Vec3,
    pub triangle: Triangle,
    /// Distance from the segment start.
    pub distance: f32,
}

/// A terrain triangle touching a triangle of the other body.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CollisionPair {
    pub terrain: Triangle,
    pub other: Triangle,
}

/// An indexed triangle soup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
}

impl TriangleMesh {
    pub fn new(vertices: Vec<Vec3>, triangles: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            triangles,
        }
    }

    /// The full resolution surface of a cell, `None` while it has no heights.
    pub fn from_cell(cell: &Cell) -> Option<Self> {
        let (width, height) = (cell.grid_width(), cell.grid_height());
        let mut vertices = Vec::with_capacity((width * height) as usize);

        for y in 0..height {
            for x in 0..width {
                vertices.push(cell.grid_position(x, y)?);
            }
        }

        let vertex = |x: u32, y: u32| y * width + x;
        let mut triangles = Vec::with_capacity(((width - 1) * (height - 1) * 2) as usize);

        for y in 0..height - 1 {
            for x in 0..width - 1 {
                triangles.push([vertex(x, y), vertex(x, y + 1), vertex(x + 1, y)]);
                triangles.push([vertex(x + 1, y), vertex(x, y + 1), vertex(x + 1, y + 1)]);
            }
        }

        Some(Self::new(vertices, triangles))
    }

    /// Builds the bounding volume hierarchy of the mesh.
    pub fn to_trimesh(&self) -> Result<TriMesh> {
        let vertices = self.vertices.iter().copied().map(math::to_point).collect();

        TriMesh::new(vertices, self.triangles.clone())
            .map_err(|error| anyhow!("Invalid triangle mesh: {error:?}"))
    }

    /// Triangles with valid indices, transformed by `transform`.
    pub fn transformed_triangles<'a>(&'a self, transform: &'a Affine3A) -> impl Iterator<Item = Triangle> + 'a {
        self.triangles.iter().filter_map(move |indices| {
            let mut triangle = [Vec3::ZERO; 3];

            for (corner, &index) in triangle.iter_mut().zip(indices) {
                *corner = transform.transform_point3(*self.vertices.get(index as usize)?);
            }

            Some(triangle)
        })
    }
}

fn triangle_bounds(triangle: &Triangle) -> Aabb3d {
    Aabb3d {
        min: triangle[0].min(triangle[1]).min(triangle[2]).into(),
        max: triangle[0].max(triangle[1]).max(triangle[2]).into(),
    }
}

/// Tests triangles against the spatial structure of a terrain surface.
pub trait CollisionEngine: Send + Sync {
    /// Returns touching `(terrain, other)` triangle pairs, both in terrain object space.
    fn collide(&self, terrain: &TriMesh, others: &[Triangle], one_hit: bool) -> Vec<(Triangle, Triangle)>;
}

/// Narrows the candidates through the bounding volume hierarchy of the
/// terrain mesh before testing the remaining pairs exactly.
#[derive(Clone, Copy, Debug, Default)]
pub struct QbvhCollisionEngine;

impl CollisionEngine for QbvhCollisionEngine {
    fn collide(&self, terrain: &TriMesh, others: &[Triangle], one_hit: bool) -> Vec<(Triangle, Triangle)> {
        let mut pairs = Vec::new();
        let mut candidates = Vec::new();

        for other in others {
            let shape = math::to_shape(other);

            candidates.clear();
            terrain.qbvh().intersect_aabb(&shape.local_aabb(), &mut candidates);

            for &index in &candidates {
                let candidate = terrain.triangle(index);

                if math::shapes_intersect(&candidate, &shape) {
                    pairs.push((math::from_shape(&candidate), *other));

                    if one_hit {
                        return pairs;
                    }
                }
            }
        }

        pairs
    }
}

/// The collider seam of a terrain.
pub trait TerrainCollider: Send + Sync {
    /// Hits of the object space segment `start..end`, nearest first.
    fn collide_segment(&self, cell: &Cell, start: Vec3, end: Vec3, one_hit: bool) -> Vec<SegmentHit>;

    /// Terrain triangles touching the given triangles, after applying `transform` to the vertices.
    fn collide_triangles(
        &self,
        cell: &Cell,
        vertices: &[Vec3],
        triangles: &[[u32; 3]],
        transform: &Affine3A,
        one_hit: bool,
    ) -> Vec<CollisionPair>;

    /// Tests a whole mesh through the collision engine.
    fn collide(&self, cell: &mut Cell, mesh: &TriangleMesh, transform: &Affine3A, one_hit: bool) -> Vec<CollisionPair>;

    fn on_height_update(&mut self, cell: &mut Cell, rect: GridRect);
}

/// The collision slot of a cell, caching the surface hierarchy.
struct CellCollisionData {
    surface: Arc<TriMesh>,
}

/// Collides directly against the height grid of each cell.
pub struct GridCollider {
    engine: Box<dyn CollisionEngine>,
}

impl Default for GridCollider {
    fn default() -> Self {
        Self::new(QbvhCollisionEngine)
    }
}

impl GridCollider {
    pub fn new(engine: impl CollisionEngine + 'static) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    fn quad_triangles(cell: &Cell, quad: UVec2) -> Option<[Triangle; 2]> {
        let (x, y) = (quad.x, quad.y);
        let corner = cell.grid_position(x, y)?;
        let right = cell.grid_position(x + 1, y)?;
        let down = cell.grid_position(x, y + 1)?;
        let opposite = cell.grid_position(x + 1, y + 1)?;

        Some([[corner, down, right], [right, down, opposite]])
    }

    fn collides(cell: &Cell) -> bool {
        cell.collision_properties.collidable && cell.has_data()
    }

    /// The cached surface hierarchy of a cell, built on first use.
    fn surface(cell: &mut Cell) -> Option<Arc<TriMesh>> {
        if let Some(data) = cell.attachments().get::<CellCollisionData>() {
            return Some(Arc::clone(&data.surface));
        }

        let surface = match TriangleMesh::from_cell(cell)?.to_trimesh() {
            Ok(surface) => Arc::new(surface),
            Err(error) => {
                warn!("Cannot build the collision surface of {}: {error:#}", cell.id());
                return None;
            }
        };

        cell.attachments_mut().insert(CellCollisionData {
            surface: Arc::clone(&surface),
        });
        Some(surface)
    }

    /// Quads a triangle may touch: those crossed by its edges and those whose center it covers.
    fn candidate_quads(cell: &Cell, triangle: &Triangle) -> BTreeSet<(u32, u32)> {
        let (columns, rows) = (cell.grid_width() - 1, cell.grid_height() - 1);
        let corners = triangle.map(|vertex| cell.object_to_grid(vertex.xz()));
        let mut quads = BTreeSet::new();

        for edge in 0..3 {
            let (start, end) = (corners[edge], corners[(edge + 1) % 3]);
            quads.extend(GridTraversal::new(start, end, columns, rows).map(|quad| (quad.x, quad.y)));
        }

        let min = corners[0].min(corners[1]).min(corners[2]).max(Vec2::ZERO);
        let max = corners[0].max(corners[1]).max(corners[2]);
        let limit = UVec2::new(columns, rows);
        let first = min.floor().as_uvec2().min(limit);
        let last = max.ceil().max(Vec2::ZERO).as_uvec2().min(limit);

        for y in first.y..last.y {
            for x in first.x..last.x {
                let center = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                if covers(&corners, center) {
                    quads.insert((x, y));
                }
            }
        }

        quads
    }
}

/// Whether the 2D triangle contains `point`, regardless of winding.
fn covers(triangle: &[Vec2; 3], point: Vec2) -> bool {
    let side = |a: Vec2, b: Vec2| (b - a).perp_dot(point - a);
    let signs = [
        side(triangle[0], triangle[1]),
        side(triangle[1], triangle[2]),
        side(triangle[2], triangle[0]),
    ];

    signs.iter().all(|&sign| sign >= 0.0) || signs.iter().all(|&sign| sign <= 0.0)
}

impl TerrainCollider for GridCollider {
    fn collide_segment(&self, cell: &Cell, start: Vec3, end: Vec3, one_hit: bool) -> Vec<SegmentHit> {
        if !Self::collides(cell) {
            return Vec::new();
        }

        let length = start.distance(end);
        let traversal = GridTraversal::new(
            cell.object_to_grid(start.xz()),
            cell.object_to_grid(end.xz()),
            cell.grid_width() - 1,
            cell.grid_height() - 1,
        );

        let mut hits: Vec<SegmentHit> = Vec::new();

        for quad in traversal {
            let Some(triangles) = Self::quad_triangles(cell, quad) else {
                continue;
            };

            hits.extend(triangles.iter().filter_map(|triangle| {
                segment_triangle(start, end, triangle).map(|(t, point)| SegmentHit {
                    point,
                    triangle: *triangle,
                    distance: t * length,
                })
            }));

            if one_hit && !hits.is_empty() {
                break;
            }
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.dedup_by(|a, b| (a.distance - b.distance).abs() <= HIT_EPSILON);

        if one_hit {
            hits.truncate(1);
        }

        hits
    }

    fn collide_triangles(
        &self,
        cell: &Cell,
        vertices: &[Vec3],
        triangles: &[[u32; 3]],
        transform: &Affine3A,
        one_hit: bool,
    ) -> Vec<CollisionPair> {
        if !Self::collides(cell) {
            return Vec::new();
        }

        let mesh = TriangleMesh::new(vertices.to_vec(), triangles.to_vec());
        let cell_bounds = cell.bounding_box();
        let mut pairs = Vec::new();

        for other in mesh.transformed_triangles(transform) {
            if !bounds_overlap(&triangle_bounds(&other), &cell_bounds) {
                continue;
            }

            for (x, y) in Self::candidate_quads(cell, &other) {
                let Some(quad) = Self::quad_triangles(cell, UVec2::new(x, y)) else {
                    continue;
                };

                for terrain in quad {
                    if triangles_intersect(&terrain, &other) {
                        pairs.push(CollisionPair { terrain, other });

                        if one_hit {
                            return pairs;
                        }
                    }
                }
            }
        }

        pairs
    }

    fn collide(&self, cell: &mut Cell, mesh: &TriangleMesh, transform: &Affine3A, one_hit: bool) -> Vec<CollisionPair> {
        if !Self::collides(cell) {
            return Vec::new();
        }

        let Some(surface) = Self::surface(cell) else {
            return Vec::new();
        };

        let cell_bounds = cell.bounding_box();
        let others: Vec<Triangle> = mesh
            .transformed_triangles(transform)
            .filter(|triangle| bounds_overlap(&triangle_bounds(triangle), &cell_bounds))
            .collect();

        self.engine
            .collide(&surface, &others, one_hit)
            .into_iter()
            .map(|(terrain, other)| CollisionPair { terrain, other })
            .collect()
    }

    fn on_height_update(&mut self, cell: &mut Cell, _rect: GridRect) {
        cell.attachments_mut().remove::<CellCollisionData>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{cell_config, loaded_cell};

    fn flat_cell(height: f32) -> Cell {
        loaded_cell(0, cell_config(Vec2::ZERO, 4.0, 5), move |_| height)
    }

    fn vertical(x: f32, z: f32) -> (Vec3, Vec3) {
        (Vec3::new(x, 10.0, z), Vec3::new(x, -10.0, z))
    }

    #[test]
    fn vertical_segment_hits_once() {
        let cell = flat_cell(0.0);
        let collider = GridCollider::default();
        let (start, end) = vertical(1.3, 2.6);

        let hits = collider.collide_segment(&cell, start, end, false);

        assert_eq!(hits.len(), 1);
        assert!(hits[0].point.distance(Vec3::new(1.3, 0.0, 2.6)) < 1e-5);
        assert!((hits[0].distance - 10.0).abs() < 1e-4);
    }

    #[test]
    fn hits_on_the_diagonal_are_merged() {
        let cell = flat_cell(1.0);
        let collider = GridCollider::default();
        let (start, end) = vertical(1.5, 1.5);

        assert_eq!(collider.collide_segment(&cell, start, end, false).len(), 1);
    }

    #[test]
    fn slanted_segment_returns_all_hits_nearest_first() {
        // a ridge along x = 2
        let cell = loaded_cell(0, cell_config(Vec2::ZERO, 4.0, 5), |position| {
            2.0 - (position.x - 2.0).abs()
        });
        let collider = GridCollider::default();
        let (start, end) = (Vec3::new(-1.0, 1.0, 1.2), Vec3::new(5.0, 1.0, 1.2));

        let hits = collider.collide_segment(&cell, start, end, false);
        assert_eq!(hits.len(), 2);
        assert!((hits[0].point.x - 1.0).abs() < 1e-4);
        assert!((hits[1].point.x - 3.0).abs() < 1e-4);
        assert!(hits[0].distance < hits[1].distance);

        let first = collider.collide_segment(&cell, start, end, true);
        assert_eq!(first.len(), 1);
        assert!(first[0].point.distance(hits[0].point) < 1e-4);
    }

    #[test]
    fn segments_that_miss() {
        let cell = flat_cell(0.0);
        let collider = GridCollider::default();

        let above = collider.collide_segment(&cell, Vec3::new(0.5, 1.0, 0.5), Vec3::new(3.5, 2.0, 3.5), false);
        let outside = collider.collide_segment(&cell, Vec3::new(9.0, 1.0, 9.0), Vec3::new(9.0, -1.0, 9.0), false);

        assert!(above.is_empty());
        assert!(outside.is_empty());
    }

    #[test]
    fn non_collidable_cells_never_hit() {
        let mut cell = flat_cell(0.0);
        cell.collision_properties.collidable = false;
        let collider = GridCollider::default();
        let (start, end) = vertical(1.0, 1.0);

        assert!(collider.collide_segment(&cell, start, end, false).is_empty());
        let mesh = TriangleMesh::new(vec![start, end, end + Vec3::X], vec![[0, 1, 2]]);
        assert!(collider.collide(&mut cell, &mesh, &Affine3A::IDENTITY, false).is_empty());
    }

    fn blade() -> (Vec<Vec3>, Vec<[u32; 3]>) {
        let vertices = vec![
            Vec3::new(0.0, -1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.3, 1.0, 0.2),
        ];
        (vertices, vec![[0, 1, 2]])
    }

    #[test]
    fn triangles_through_the_surface_collide() {
        let cell = flat_cell(0.0);
        let collider = GridCollider::default();
        let (vertices, triangles) = blade();

        let moved = Affine3A::from_translation(Vec3::new(1.2, 0.0, 2.3));
        let pairs = collider.collide_triangles(&cell, &vertices, &triangles, &moved, false);
        assert!(!pairs.is_empty());
        assert!(pairs.iter().all(|pair| pair.other[0].distance(Vec3::new(1.2, -1.0, 2.3)) < 1e-6));

        let one = collider.collide_triangles(&cell, &vertices, &triangles, &moved, true);
        assert_eq!(one.len(), 1);

        let lifted = Affine3A::from_translation(Vec3::new(1.2, 5.0, 2.3));
        assert!(collider.collide_triangles(&cell, &vertices, &triangles, &lifted, false).is_empty());
    }

    #[test]
    fn large_flat_triangle_finds_interior_quads() {
        let cell = flat_cell(0.0);
        let collider = GridCollider::default();

        // covers most of the cell, its edges only cross the border quads
        let vertices = vec![
            Vec3::new(-10.0, 0.0, -10.0),
            Vec3::new(-10.0, 0.0, 30.0),
            Vec3::new(30.0, 0.0, -10.0),
        ];
        let pairs = collider.collide_triangles(&cell, &vertices, &[[0, 1, 2]], &Affine3A::IDENTITY, false);

        assert_eq!(pairs.len(), 32);
    }

    #[test]
    fn mesh_collision_caches_the_terrain() {
        let mut cell = flat_cell(0.0);
        let mut collider = GridCollider::default();
        let (vertices, triangles) = blade();
        let mesh = TriangleMesh::new(vertices, triangles);
        let moved = Affine3A::from_translation(Vec3::new(2.5, 0.0, 1.5));

        let pairs = collider.collide(&mut cell, &mesh, &moved, false);
        assert!(!pairs.is_empty());
        let surface = Arc::clone(&cell.attachments().get::<CellCollisionData>().unwrap().surface);
        assert_eq!(surface.indices().len(), 32);

        assert_eq!(collider.collide(&mut cell, &mesh, &moved, true).len(), 1);
        let cached = &cell.attachments().get::<CellCollisionData>().unwrap().surface;
        assert!(Arc::ptr_eq(&surface, cached));

        collider.on_height_update(&mut cell, GridRect::full(5, 5));
        assert!(!cell.attachments().contains::<CellCollisionData>());
    }

    #[test]
    fn mesh_collision_only_reports_nearby_triangles() {
        let mut cell = loaded_cell(0, cell_config(Vec2::ZERO, 32.0, 33), |_| 0.0);
        let collider = GridCollider::default();
        let (vertices, triangles) = blade();
        let mesh = TriangleMesh::new(vertices, triangles);
        let position = Vec3::new(10.2, 0.0, 20.3);

        let pairs = collider.collide(&mut cell, &mesh, &Affine3A::from_translation(position), false);

        assert!(!pairs.is_empty());
        assert!(pairs.len() <= 4);
        for pair in pairs {
            assert!(pair.terrain.iter().all(|vertex| vertex.xz().distance(position.xz()) < 2.0));
        }

        let far = Affine3A::from_translation(Vec3::new(10.2, 3.0, 20.3));
        assert!(collider.collide(&mut cell, &mesh, &far, false).is_empty());
    }

    #[test]
    fn terrain_mesh_matches_the_grid() {
        let cell = flat_cell(2.0);
        let mesh = TriangleMesh::from_cell(&cell).unwrap();

        assert_eq!(mesh.vertices.len(), 25);
        assert_eq!(mesh.triangles.len(), 32);
        assert!(mesh.vertices.iter().all(|vertex| vertex.y == 2.0));
    }
}
