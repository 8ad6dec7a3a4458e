use super::{EntityState, PathEvent, StepContext};
use crate::collision::CollisionRectangle;
use crate::config::PedestrianTemplate;
use crate::follower::{FreeFollower, PathState};
use crate::graph::{KeypointGraph, KeypointPath};
use crate::math::{distance_2d, rotation_from_direction, safe_normalize, Vector3d};
use log::trace;
use rand::Rng;

/// A pedestrian is considered to have reached a target this close to it.
const ACCEPTANCE_RADIUS: f64 = 50.0;

/// A pedestrian walking on the shared-use graph.
///
/// Pedestrians walk straight towards each point of their path in turn. The
/// position of a pedestrian is the centre of its body, not its feet.
#[derive(Clone, Debug)]
pub struct Pedestrian {
    follower: FreeFollower,
    /// Walking speed in cm/s.
    walk_speed: f64,
}

impl Pedestrian {
    pub fn new(template: &PedestrianTemplate) -> Self {
        Self {
            follower: FreeFollower::new(Vector3d::unit_z() * template.dimensions.z * 0.5),
            walk_speed: template.speed,
        }
    }

    pub fn follower(&self) -> &FreeFollower {
        &self.follower
    }

    pub fn walk_speed(&self) -> f64 {
        self.walk_speed
    }

    pub fn apply_custom_path(&mut self, path: KeypointPath, point: usize) {
        self.follower.set_path(path, point);
    }

    /// Starts a random path from the nearest keypoint.
    pub(crate) fn start<R: Rng + ?Sized>(
        &mut self,
        state: &mut EntityState,
        graph: &KeypointGraph,
        rng: &mut R,
    ) {
        let exceptions = state.rule_exceptions;
        if self
            .follower
            .new_path_from_nearest(state.position, exceptions, graph, rng)
            .is_none()
        {
            self.follower.first_time_spawn(exceptions, graph, rng);
        }
    }

    /// Places the pedestrian on the first point of its path.
    pub(crate) fn place(&mut self, state: &mut EntityState, graph: &KeypointGraph) {
        state.position = self.follower.target(graph);
        if self.follower.path().len() > 1 {
            self.follower.advance_target(graph);
            let ahead = self.follower.target(graph) - state.position;
            if distance_2d(state.position, self.follower.target(graph)) > 0.0 {
                state.direction = safe_normalize(Vector3d::new(ahead.x, ahead.y, 0.0));
                state.rotation = rotation_from_direction(state.direction);
            }
        }
        self.update_colliders(state);
    }

    pub(crate) fn step(
        &mut self,
        state: &mut EntityState,
        dt: f64,
        ctx: &mut StepContext,
    ) -> Option<PathEvent> {
        if state.in_active_stop_area || state.blocked || state.blocked_by_future_pawn {
            state.speed = 0.0;
            return None;
        }

        let target = self.follower.target(ctx.graph);
        let distance = distance_2d(state.position, target);
        if distance <= ACCEPTANCE_RADIUS {
            if let PathState::Ended { has_outbound } = self.follower.advance_target(ctx.graph) {
                self.new_path(state, has_outbound, ctx);
            }
            return None;
        }

        let to_target = target - state.position;
        let step = (self.walk_speed * dt).min(distance);
        let heading = safe_normalize(Vector3d::new(to_target.x, to_target.y, 0.0));
        state.position += to_target * (step / distance);
        state.speed = self.walk_speed;
        state.direction = heading;
        state.rotation = rotation_from_direction(heading);
        self.update_colliders(state);
        None
    }

    fn new_path(&mut self, state: &mut EntityState, has_outbound: bool, ctx: &mut StepContext) {
        let exceptions = state.rule_exceptions;
        if has_outbound {
            self.follower
                .new_path_from_nearest(state.position, exceptions, ctx.graph, &mut *ctx.rng);
            return;
        }
        // Dead end: reappear somewhere else.
        if let Some(start) = self
            .follower
            .new_path_from_spawn(exceptions, ctx.graph, &mut *ctx.rng)
        {
            trace!("Pedestrian reached a dead end, restarting at {:?}", start);
            state.position = start;
            self.update_colliders(state);
        }
    }

    fn update_colliders(&self, state: &mut EntityState) {
        state.collision.set_transform(state.position, state.rotation);
        let dims = state.dimensions;
        state.future_collision = CollisionRectangle::new(
            dims,
            state.position + state.direction * (dims.x + dims.y) * 0.5,
            state.rotation,
        );
    }
}
