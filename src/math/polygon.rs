use super::{rot90, Point2d, Vector2d};
use crate::util::Interval;
use cgmath::prelude::*;

/// Projects a polygon onto an axis.
fn project(poly: &[Point2d], axis: Vector2d) -> Interval<f64> {
    Interval::hull(poly.iter().map(|p| p.to_vec().dot(axis)))
        .unwrap_or(Interval::new(f64::INFINITY, f64::NEG_INFINITY))
}

/// Returns true if some edge normal of `poly` separates it from `other`.
fn has_separating_axis(poly: &[Point2d], other: &[Point2d]) -> bool {
    (0..poly.len()).any(|i| {
        let edge = poly[(i + 1) % poly.len()] - poly[i];
        if edge.magnitude2() == 0.0 {
            return false;
        }
        let axis = rot90(edge);
        !project(poly, axis).overlaps(&project(other, axis))
    })
}

/// Tests two convex polygons for intersection using the separating axis theorem.
///
/// Polygons which merely touch along an edge do not intersect.
pub fn convex_polygons_intersect(a: &[Point2d], b: &[Point2d]) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    !has_separating_axis(a, b) && !has_separating_axis(b, a)
}

/// Tests whether a point lies inside (or on the boundary of) a convex polygon
/// with vertices in either winding order.
pub fn point_in_convex_polygon(point: Point2d, poly: &[Point2d]) -> bool {
    let mut sign = 0.0;
    for i in 0..poly.len() {
        let a = poly[i];
        let b = poly[(i + 1) % poly.len()];
        let cross = (b - a).perp_dot(point - a);
        if cross == 0.0 {
            continue;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    !poly.is_empty()
}
