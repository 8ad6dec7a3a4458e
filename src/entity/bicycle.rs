use super::{place_vehicle, update_vehicle_colliders, EntityState, PathEvent, StepContext};
use crate::config::BicycleTemplate;
use crate::follower::{CurveFollower, PathState};
use crate::graph::{KeypointGraph, KeypointPath};
use crate::math::rotation_from_direction;
use rand::Rng;

/// A bicycle on the shared-use graph.
///
/// Cyclists ride at a steady speed of their own choosing, which they reconsider
/// whenever a red light stops them.
#[derive(Clone, Debug)]
pub struct Bicycle {
    follower: CurveFollower,
    wheelbase: f64,
    base_speed: f64,
    random_speed: f64,
}

impl Bicycle {
    pub fn new(template: &BicycleTemplate) -> Self {
        Self {
            // Cyclists take corners in single arcs.
            follower: CurveFollower::new(false),
            wheelbase: template.wheelbase,
            base_speed: template.base_speed,
            random_speed: template.random_speed.abs(),
        }
    }

    pub fn follower(&self) -> &CurveFollower {
        &self.follower
    }

    pub fn apply_custom_path(
        &mut self,
        path: KeypointPath,
        point: usize,
        progress: f64,
        graph: &KeypointGraph,
    ) {
        self.follower.set_path(path, point, progress, graph);
    }

    /// Picks a new cruising speed.
    pub(crate) fn reroll_speed<R: Rng + ?Sized>(&self, state: &mut EntityState, rng: &mut R) {
        state.speed = if self.random_speed > 0.0 {
            self.base_speed + rng.gen_range(-self.random_speed..=self.random_speed)
        } else {
            self.base_speed
        };
    }

    /// Slows down a little behind something which is moving.
    pub(crate) fn slow_for_mover(&self, state: &mut EntityState) {
        state.speed = self.clamp_speed(state.speed * 0.99);
    }

    fn clamp_speed(&self, speed: f64) -> f64 {
        speed.clamp(self.base_speed - self.random_speed, self.base_speed + self.random_speed)
    }

    pub(crate) fn start<R: Rng + ?Sized>(
        &mut self,
        state: &mut EntityState,
        graph: &KeypointGraph,
        rng: &mut R,
    ) {
        self.reroll_speed(state, rng);
        if !self
            .follower
            .new_path_from_nearest(state.position, state.rule_exceptions, graph, rng)
        {
            self.follower.new_path_from_spawn(state.rule_exceptions, graph, rng);
        }
    }

    pub(crate) fn place(&mut self, state: &mut EntityState, graph: &KeypointGraph) {
        place_vehicle(&self.follower, self.wheelbase, false, state, graph);
    }

    pub(crate) fn step(
        &mut self,
        state: &mut EntityState,
        dt: f64,
        ctx: &mut StepContext,
    ) -> Option<PathEvent> {
        if state.in_active_stop_area {
            self.reroll_speed(state, &mut *ctx.rng);
            return None;
        }
        if state.blocked || state.blocked_by_future_pawn {
            return None;
        }

        state.speed = self.clamp_speed(state.speed * 1.00001);
        if let PathState::Ended { has_outbound } = self.follower.advance(state.speed * dt, ctx.graph) {
            let exceptions = state.rule_exceptions;
            if !has_outbound
                || !self
                    .follower
                    .new_path_from_nearest(state.position, exceptions, ctx.graph, &mut *ctx.rng)
            {
                self.follower.new_path_from_spawn(exceptions, ctx.graph, &mut *ctx.rng);
            }
        }

        let (rear, tangent) = self.follower.location(ctx.graph);
        state.direction = tangent;
        state.position = rear + tangent * self.wheelbase * 0.5;
        state.rotation = rotation_from_direction(tangent);
        update_vehicle_colliders(&self.follower, self.wheelbase, state, ctx.graph);
        None
    }
}
