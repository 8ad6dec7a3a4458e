//! Right-of-way resolution between pairs of entities.
//!
//! Every entity runs [blocked_by] against every other entity using snapshots taken
//! before the pass begins, so no decision depends on the order of evaluation.
//! For any two overlapping vehicles exactly one of `blocked_by(a, b)` and
//! `blocked_by(b, a)` is true.

use crate::collision::CollisionRectangle;
use crate::entity::EntityClass;
use crate::math::{flatten, safe_normalize, Point3d, Vector3d};
use cgmath::prelude::*;

/// A read-consistent view of an entity, taken once per tick.
#[derive(Clone, Copy, Debug)]
pub struct EntitySnapshot {
    /// The entity's creation sequence number, used as a stable identity order.
    pub seq: u64,
    pub class: EntityClass,
    /// The rectangle the entity currently occupies.
    pub current: CollisionRectangle,
    /// The rectangle the entity expects to occupy shortly.
    pub future: CollisionRectangle,
    /// The unit direction of travel.
    pub direction: Vector3d,
    /// Whether the entity is inside a yield area.
    pub yielding: bool,
    /// Whether the entity is waiting for a clear road before leaving a parking space.
    pub waiting_to_depart: bool,
    /// Whether the entity is moving and not held up by anything.
    pub moving: bool,
    /// The radius of a sphere containing both rectangles, if the entity has one.
    pub bounding_radius: Option<f64>,
}

/// Determines whether entity `a` must give way to entity `b`.
pub fn blocked_by(a: &EntitySnapshot, b: &EntitySnapshot) -> bool {
    if b.class == EntityClass::Pedestrian {
        return false;
    }
    if b.waiting_to_depart && !a.waiting_to_depart {
        return false;
    }
    if a.waiting_to_depart {
        if too_far(&a.future, &b.current) {
            return false;
        }
        return a.future.intersects(&b.current) && !b.waiting_to_depart;
    }

    if cull_pair(a, b) {
        return false;
    }
    if !overlapping(a, b) {
        return false;
    }
    if a.class == EntityClass::Pedestrian {
        return true;
    }

    match (a.yielding, b.yielding) {
        (true, false) => return true,
        (false, true) => return false,
        _ => {}
    }

    let a_pos = a.current.position();
    let b_pos = b.current.position();
    if a_pos == b_pos {
        return a.seq > b.seq;
    }

    let a_to_b = b_pos - a_pos;
    let ab_dir = safe_normalize(a_to_b);

    if a.direction.dot(b.direction) >= 0.0 {
        let ab_dot = a.direction.dot(ab_dir);
        let ba_dot = b.direction.dot(-ab_dir);
        if ab_dot != 0.0 && ba_dot != 0.0 {
            let b_in_front_of_a = ab_dot > 0.0;
            let a_in_front_of_b = ba_dot > 0.0;
            // Facing each other, both would claim to be behind.
            if b_in_front_of_a != a_in_front_of_b {
                return b_in_front_of_a;
            }
        }
    }

    let ab_sideways = reject(a_to_b, a.direction).magnitude2();
    let ba_sideways = reject(a_to_b, b.direction).magnitude2();
    if ab_sideways == ba_sideways {
        return a.seq > b.seq;
    }
    // The entity with more room to the side goes first.
    ab_sideways < ba_sideways
}

/// Determines whether a rectangle is blocked by a point obstacle.
pub fn point_blocks(rect: &CollisionRectangle, point: Point3d) -> bool {
    let dims = rect.dimensions();
    if rect.position().distance2(point) > 0.25 * dims.magnitude2() {
        return false;
    }
    rect.contains_point(flatten(point))
}

/// Determines whether a pawn is in the way of an entity's predicted path.
pub fn pawn_blocks(future: &CollisionRectangle, pawn: &CollisionRectangle) -> bool {
    future.intersects(pawn)
}

/// Whether two snapshots' rectangles overlap in any combination.
fn overlapping(a: &EntitySnapshot, b: &EntitySnapshot) -> bool {
    a.current.intersects(&b.current)
        || a.future.intersects(&b.current)
        || a.current.intersects(&b.future)
        || a.future.intersects(&b.future)
}

/// Whether two snapshots are too far apart for any of their rectangles to touch.
///
/// Each snapshot is bounded by a sphere around its current position which contains
/// both of its rectangles. The test is symmetric: swapping `a` and `b` gives the same result.
fn cull_pair(a: &EntitySnapshot, b: &EntitySnapshot) -> bool {
    let reach = reach(a) + reach(b);
    a.current.position().distance2(b.current.position()) > reach * reach
}

/// The radius of a sphere around the current position containing both rectangles.
fn reach(s: &EntitySnapshot) -> f64 {
    let current = 0.5 * s.current.dimensions().magnitude();
    let future = s.current.position().distance(s.future.position())
        + 0.5 * s.future.dimensions().magnitude();
    current.max(future).max(s.bounding_radius.unwrap_or(0.0))
}

/// Whether two rectangles are too far apart to touch.
fn too_far(a: &CollisionRectangle, b: &CollisionRectangle) -> bool {
    let reach = 0.5 * (a.dimensions().magnitude() + b.dimensions().magnitude());
    a.position().distance2(b.position()) > reach * reach
}

/// Removes the component of `v` along the unit vector `n`.
fn reject(v: Vector3d, n: Vector3d) -> Vector3d {
    v - n * v.dot(n)
}
