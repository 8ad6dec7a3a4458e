//! Oriented bounding boxes used for entity and area overlap tests.

use crate::math::{
    convex_polygons_intersect, flatten, forward, point_in_convex_polygon, Orientation, Point2d,
    Point3d, Vector3d,
};
use crate::util::Interval;
use cgmath::prelude::*;
use cgmath::Quaternion;

/// A box which may rotate about the world up axis.
///
/// The footprint is kept as four 2D corners and the vertical extent as a separate
/// interval, so overlap tests reduce to a 2D polygon test plus an interval test.
#[derive(Clone, Copy, Debug)]
pub struct CollisionRectangle {
    /// The centre of the box.
    position: Point3d,
    /// The orientation of the box.
    rotation: Orientation,
    /// The full extents of the box along its local axes.
    dimensions: Vector3d,
    /// The footprint corners in the order (-,-), (+,-), (+,+), (-,+).
    corners: [Point2d; 4],
    /// The vertical extent of the box.
    height: Interval<f64>,
}

impl Default for CollisionRectangle {
    fn default() -> Self {
        Self::new(
            Vector3d::zero(),
            Point3d::origin(),
            Quaternion::from_sv(1.0, Vector3d::zero()),
        )
    }
}

impl CollisionRectangle {
    /// Creates a new collision rectangle. Negative dimensions are clamped to zero.
    pub fn new(dimensions: Vector3d, position: Point3d, rotation: Orientation) -> Self {
        let mut rect = Self {
            position,
            rotation,
            dimensions: clamp_dimensions(dimensions),
            corners: [Point2d::origin(); 4],
            height: Interval::default(),
        };
        rect.update();
        rect
    }

    /// The centre of the box.
    pub fn position(&self) -> Point3d {
        self.position
    }

    /// The orientation of the box.
    pub fn rotation(&self) -> Orientation {
        self.rotation
    }

    /// The full extents of the box.
    pub fn dimensions(&self) -> Vector3d {
        self.dimensions
    }

    /// The direction the box's local x-axis points in.
    pub fn forward(&self) -> Vector3d {
        forward(self.rotation)
    }

    /// The footprint corners.
    pub fn corners_2d(&self) -> &[Point2d; 4] {
        &self.corners
    }

    /// The vertical extent of the box.
    pub fn height(&self) -> Interval<f64> {
        self.height
    }

    pub fn set_position(&mut self, position: Point3d) {
        self.position = position;
        self.update();
    }

    pub fn set_rotation(&mut self, rotation: Orientation) {
        self.rotation = rotation;
        self.update();
    }

    pub fn set_dimensions(&mut self, dimensions: Vector3d) {
        self.dimensions = clamp_dimensions(dimensions);
        self.update();
    }

    /// Moves and rotates the box in one go.
    pub fn set_transform(&mut self, position: Point3d, rotation: Orientation) {
        self.position = position;
        self.rotation = rotation;
        self.update();
    }

    /// Half of the box's diagonal.
    pub fn bounding_radius(&self) -> f64 {
        0.5 * self.dimensions.magnitude()
    }

    /// Tests whether two boxes overlap. Boxes which only touch do not overlap.
    pub fn intersects(&self, other: &CollisionRectangle) -> bool {
        self.height.overlaps(&other.height)
            && convex_polygons_intersect(&self.corners, &other.corners)
    }

    /// Tests whether a point lies within the footprint of the box, ignoring height.
    pub fn contains_point(&self, point: Point2d) -> bool {
        point_in_convex_polygon(point, &self.corners)
    }

    /// Tests whether a triangle overlaps the footprint of the box, ignoring height.
    pub fn intersects_triangle(&self, triangle: &[Point2d; 3]) -> bool {
        convex_polygons_intersect(&self.corners, triangle)
    }

    /// The eight corners of the box in world space.
    pub fn corners(&self) -> [Point3d; 8] {
        let half = self.dimensions * 0.5;
        let mut out = [Point3d::origin(); 8];
        for (i, corner) in out.iter_mut().enumerate() {
            let sx = if i & 1 == 0 { -1.0 } else { 1.0 };
            let sy = if i & 2 == 0 { -1.0 } else { 1.0 };
            let sz = if i & 4 == 0 { -1.0 } else { 1.0 };
            let local = Vector3d::new(sx * half.x, sy * half.y, sz * half.z);
            *corner = self.position + self.rotation.rotate_vector(local);
        }
        out
    }

    fn update(&mut self) {
        let half = self.dimensions * 0.5;
        let offsets = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
        let mut min_z = self.position.z;
        let mut max_z = self.position.z;
        for (corner, (sx, sy)) in self.corners.iter_mut().zip(offsets) {
            let local = Vector3d::new(sx * half.x, sy * half.y, 0.0);
            let world = self.position + self.rotation.rotate_vector(local);
            min_z = min_z.min(world.z);
            max_z = max_z.max(world.z);
            *corner = flatten(world);
        }
        self.height = Interval::new(min_z - half.z, max_z + half.z);
    }
}

fn clamp_dimensions(dims: Vector3d) -> Vector3d {
    Vector3d::new(dims.x.max(0.0), dims.y.max(0.0), dims.z.max(0.0))
}
