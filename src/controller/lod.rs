//! Choosing which entities are simulated in high detail.

use crate::collision::CollisionRectangle;
use crate::math::{Orientation, Point3d};
use crate::world::World;
use cgmath::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// The viewpoint the simulation is being watched from.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Camera {
    pub position: Point3d,
    /// The camera looks along its local x-axis, with z up.
    pub rotation: Orientation,
    /// The horizontal field of view in degrees.
    pub fov_degrees: f64,
    /// Width divided by height.
    pub aspect_ratio: f64,
}

/// A camera prepared for projecting points.
pub(super) struct View {
    position: Point3d,
    inverse: Orientation,
    tan_inverse: f64,
    aspect_inverse: f64,
    far_distance: f64,
    outside_camera_is_far: bool,
}

impl View {
    pub fn new(camera: &Camera, far_distance: f64, outside_camera_is_far: bool) -> Self {
        let half_fov = (camera.fov_degrees * 0.5).to_radians();
        Self {
            position: camera.position,
            inverse: camera.rotation.invert(),
            tan_inverse: 1.0 / half_fov.tan(),
            aspect_inverse: 1.0 / camera.aspect_ratio,
            far_distance,
            outside_camera_is_far,
        }
    }

    pub fn distance(&self, rect: &CollisionRectangle) -> f64 {
        self.position.distance(rect.position())
    }

    /// Whether the box qualifies for high detail.
    pub fn is_candidate(&self, rect: &CollisionRectangle, world: &dyn World) -> bool {
        if !self.outside_camera_is_far {
            return self.distance(rect) < self.far_distance;
        }
        self.in_frustum(rect) && world.line_of_sight(self.position, rect.position())
    }

    /// Whether any part of the box projects inside the view, nearer than the far distance.
    fn in_frustum(&self, rect: &CollisionRectangle) -> bool {
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        let mut any = false;
        for corner in rect.corners() {
            let local = self.inverse.rotate_vector(corner - self.position);
            if local.x <= 0.0 {
                continue;
            }
            let projected = [
                local.y * self.tan_inverse / local.x,
                local.z * self.tan_inverse / (local.x * self.aspect_inverse),
                local.x / self.far_distance,
            ];
            for axis in 0..3 {
                min[axis] = min[axis].min(projected[axis]);
                max[axis] = max[axis].max(projected[axis]);
            }
            any = true;
        }
        any && min[0] < 1.0
            && min[1] < 1.0
            && min[2] < 1.0
            && max[0] > -1.0
            && max[1] > -1.0
            && max[2] > 0.0
    }
}

/// An entry in the nearest-entity heap, ordered by distance.
#[derive(Clone, Copy, Debug)]
struct Nearest {
    distance: f64,
    index: usize,
}

impl PartialEq for Nearest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Nearest {}

impl PartialOrd for Nearest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Nearest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

/// Selects the indices of the `limit` candidates with the smallest distances,
/// or every candidate if `limit` is zero.
pub(super) fn nearest(candidates: impl Iterator<Item = (usize, f64)>, limit: usize) -> Vec<usize> {
    if limit == 0 {
        return candidates.map(|(index, _)| index).collect();
    }
    let mut heap = BinaryHeap::with_capacity(limit + 1);
    for (index, distance) in candidates {
        heap.push(Nearest { distance, index });
        if heap.len() > limit {
            heap.pop();
        }
    }
    heap.into_iter().map(|n| n.index).collect()
}
