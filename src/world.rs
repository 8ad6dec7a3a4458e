//! The world the traffic moves through.

use crate::math::Point3d;

/// Queries answered by the environment hosting the simulation.
///
/// Implementations are shared between worker threads during a tick.
pub trait World: Send + Sync {
    /// The height of the ground directly below or above `point`, if there is any.
    fn ground_height(&self, point: Point3d) -> Option<f64>;

    /// Whether nothing obstructs the straight line from `from` to `to`.
    fn line_of_sight(&self, from: Point3d, to: Point3d) -> bool;
}

/// An empty world: no ground to snap to and nothing blocking the view.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWorld;

impl World for NoWorld {
    fn ground_height(&self, _point: Point3d) -> Option<f64> {
        None
    }

    fn line_of_sight(&self, _from: Point3d, _to: Point3d) -> bool {
        true
    }
}

/// A world whose ground is a flat plane at a fixed height.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlatWorld {
    pub height: f64,
}

impl World for FlatWorld {
    fn ground_height(&self, _point: Point3d) -> Option<f64> {
        Some(self.height)
    }

    fn line_of_sight(&self, _from: Point3d, _to: Point3d) -> bool {
        true
    }
}
