use bevy::math::Vec3;
use parry3d::{
    math::{Isometry, Point},
    query,
    shape::Triangle as TriangleShape,
};

pub type Triangle = [Vec3; 3];

const PARALLEL_EPSILON: f32 = 1e-9;
const BARYCENTRIC_TOLERANCE: f32 = 1e-6;

/// Intersects the segment `start..end` with a triangle.
///
/// Returns the segment parameter in `[0, 1]` and the intersection point.
/// Hits on triangle edges count, segments lying in the triangle plane never hit.
pub fn segment_triangle(start: Vec3, end: Vec3, triangle: &Triangle) -> Option<(f32, Vec3)> {
    let direction = end - start;
    let edge1 = triangle[1] - triangle[0];
    let edge2 = triangle[2] - triangle[0];

    let p = direction.cross(edge2);
    let determinant = edge1.dot(p);

    if determinant.abs() < PARALLEL_EPSILON {
        return None;
    }

    let inverse = 1.0 / determinant;
    let s = start - triangle[0];

    let u = s.dot(p) * inverse;
    if !(-BARYCENTRIC_TOLERANCE..=1.0 + BARYCENTRIC_TOLERANCE).contains(&u) {
        return None;
    }

    let q = s.cross(edge1);
    let v = direction.dot(q) * inverse;
    if v < -BARYCENTRIC_TOLERANCE || u + v > 1.0 + BARYCENTRIC_TOLERANCE {
        return None;
    }

    let t = edge2.dot(q) * inverse;
    (0.0..=1.0)
        .contains(&t)
        .then(|| (t, start + direction * t))
}

/// A bevy point as a parry point.
pub fn to_point(vertex: Vec3) -> Point<f32> {
    Point::new(vertex.x, vertex.y, vertex.z)
}

pub fn from_point(point: &Point<f32>) -> Vec3 {
    Vec3::new(point.x, point.y, point.z)
}

pub fn to_shape(triangle: &Triangle) -> TriangleShape {
    TriangleShape::new(to_point(triangle[0]), to_point(triangle[1]), to_point(triangle[2]))
}

pub fn from_shape(shape: &TriangleShape) -> Triangle {
    [from_point(&shape.a), from_point(&shape.b), from_point(&shape.c)]
}

/// Whether two triangles touch or cross, coplanar pairs included.
pub fn triangles_intersect(a: &Triangle, b: &Triangle) -> bool {
    shapes_intersect(&to_shape(a), &to_shape(b))
}

pub fn shapes_intersect(a: &TriangleShape, b: &TriangleShape) -> bool {
    let identity = Isometry::identity();
    query::intersection_test(&identity, a, &identity, b).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ground() -> Triangle {
        [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
        ]
    }

    #[test]
    fn vertical_segment_hits() {
        let (t, point) =
            segment_triangle(Vec3::new(0.25, 1.0, 0.25), Vec3::new(0.25, -1.0, 0.25), &ground())
                .unwrap();

        assert!((t - 0.5).abs() < 1e-6);
        assert!(point.distance(Vec3::new(0.25, 0.0, 0.25)) < 1e-6);
    }

    #[test]
    fn segment_misses() {
        let triangle = ground();

        // outside the footprint
        assert!(segment_triangle(Vec3::new(0.8, 1.0, 0.8), Vec3::new(0.8, -1.0, 0.8), &triangle).is_none());
        // too short
        assert!(segment_triangle(Vec3::new(0.2, 1.0, 0.2), Vec3::new(0.2, 0.5, 0.2), &triangle).is_none());
        // parallel
        assert!(segment_triangle(Vec3::new(-1.0, 0.0, 0.2), Vec3::new(2.0, 0.0, 0.2), &triangle).is_none());
    }

    #[test]
    fn crossing_triangles_intersect() {
        let vertical = [
            Vec3::new(0.2, -1.0, 0.2),
            Vec3::new(0.2, 1.0, 0.2),
            Vec3::new(0.3, 1.0, 0.1),
        ];

        assert!(triangles_intersect(&ground(), &vertical));
        assert!(triangles_intersect(&vertical, &ground()));
    }

    #[test]
    fn separated_triangles_do_not_intersect() {
        let lifted = ground().map(|vertex| vertex + Vec3::Y * 0.5);
        let beside = ground().map(|vertex| vertex + Vec3::X * 3.0);

        assert!(!triangles_intersect(&ground(), &lifted));
        assert!(!triangles_intersect(&ground(), &beside));
    }

    #[test]
    fn shapes_convert_both_ways() {
        let triangle = ground().map(|vertex| vertex + Vec3::new(0.5, 2.0, -1.0));
        let shape = to_shape(&triangle);

        assert_eq!(shape.b, Point::new(0.5, 2.0, 0.0));
        assert_eq!(from_shape(&shape), triangle);
    }

    #[test]
    fn coplanar_triangles() {
        let overlapping = ground().map(|vertex| vertex + Vec3::new(0.2, 0.0, 0.2));
        let apart = [
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 1.0),
        ];

        assert!(triangles_intersect(&ground(), &overlapping));
        assert!(!triangles_intersect(&ground(), &apart));
    }
}
