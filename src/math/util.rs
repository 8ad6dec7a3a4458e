use super::{Point2d, Point3d, Orientation, Vector2d, Vector3d};
use cgmath::prelude::*;
use cgmath::{Quaternion, Rad};

/// Projects a point onto a local coordinate system.
///
/// # Parameters
/// * `point` - The point to project
/// * `origin` - The origin of the coordinate system
/// * `x_axis` - The basis vector pointing in the positive x-axis.
/// * `y_axis` - The basis vector pointing in the positive y-axis.
pub fn project_local(
    point: Point2d,
    origin: Point2d,
    x_axis: Vector2d,
    y_axis: Vector2d,
) -> Point2d {
    let point = point - origin;
    Point2d::new(point.dot(x_axis), point.dot(y_axis))
}

/// Rotates a vector 90 degrees anti-clockwise.
pub fn rot90(vec: Vector2d) -> Vector2d {
    Vector2d::new(-vec.y, vec.x)
}

/// Drops the height component of a point.
#[inline(always)]
pub fn flatten(point: Point3d) -> Point2d {
    Point2d::new(point.x, point.y)
}

/// Drops the height component of a vector.
#[inline(always)]
pub fn flatten_vec(vec: Vector3d) -> Vector2d {
    Vector2d::new(vec.x, vec.y)
}

/// Squared distance between two points, ignoring height.
pub fn distance2_2d(a: Point3d, b: Point3d) -> f64 {
    flatten(a).distance2(flatten(b))
}

/// Distance between two points, ignoring height.
pub fn distance_2d(a: Point3d, b: Point3d) -> f64 {
    distance2_2d(a, b).sqrt()
}

/// Normalises a vector, returning the zero vector if its length is zero.
pub fn safe_normalize(vec: Vector3d) -> Vector3d {
    let mag = vec.magnitude();
    if mag > 1e-12 {
        vec / mag
    } else {
        Vector3d::zero()
    }
}

/// Normalises a 2D vector, returning the zero vector if its length is zero.
pub fn safe_normalize_2d(vec: Vector2d) -> Vector2d {
    let mag = vec.magnitude();
    if mag > 1e-12 {
        vec / mag
    } else {
        Vector2d::zero()
    }
}

/// Computes the rotation which turns the local x-axis to face `dir`.
///
/// The rotation is composed of a yaw about the world up axis followed by a pitch,
/// so it never rolls. A zero vector gives the identity rotation.
pub fn rotation_from_direction(dir: Vector3d) -> Orientation {
    if dir.magnitude2() < 1e-24 {
        return Quaternion::from_sv(1.0, Vector3d::zero());
    }
    let yaw = dir.y.atan2(dir.x);
    let pitch = dir.z.atan2(dir.x.hypot(dir.y));
    Quaternion::from_angle_z(Rad(yaw)) * Quaternion::from_angle_y(Rad(-pitch))
}

/// The forward (local x-axis) direction of a rotation.
pub fn forward(rotation: Orientation) -> Vector3d {
    rotation.rotate_vector(Vector3d::unit_x())
}

/// The angle in radians between two rotations.
pub fn angular_distance(a: Orientation, b: Orientation) -> f64 {
    let dot = a.normalize().dot(b.normalize()).abs().min(1.0);
    2.0 * dot.acos()
}

/// Moves `current` towards `target`, covering `alpha` of the gap.
///
/// `alpha` is clamped to `[0, 1]`, so a large time step never overshoots.
pub fn lerp_towards(current: f64, target: f64, alpha: f64) -> f64 {
    current + (target - current) * alpha.clamp(0.0, 1.0)
}

/// The point on the segment from `a` to `b` closest to `point`.
pub fn closest_point_on_segment(point: Point3d, a: Point3d, b: Point3d) -> Point3d {
    let ab = b - a;
    let len2 = ab.magnitude2();
    if len2 < 1e-12 {
        return a;
    }
    let t = ((point - a).dot(ab) / len2).clamp(0.0, 1.0);
    a + ab * t
}
