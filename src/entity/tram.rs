use super::{EntityState, PathEvent, StepContext};
use crate::collision::CollisionRectangle;
use crate::config::TramTemplate;
use crate::follower::{CurveFollower, PathState};
use crate::graph::{KeypointGraph, KeypointPath};
use crate::math::{lerp_towards, rotation_from_direction, safe_normalize, Orientation, Point3d, Vector3d};
use cgmath::prelude::*;
use log::debug;
use rand::Rng;

const MIN_MOVE_SPEED: f64 = 50.0;

/// Trams accelerate harder below this speed.
const SLOW_SPEED: f64 = 300.0;

/// The speed trams pull into a station at.
pub const STATION_SPEED: f64 = 500.0;

/// A tram of one or more carts on the tramway graph.
///
/// The follower tracks the rear axle of the first cart. The other carts trail
/// behind it along the same path.
#[derive(Clone, Debug)]
pub struct Tram {
    follower: CurveFollower,
    wheelbase: f64,
    cart_gap: f64,
    target_speed: f64,
    /// The centre and orientation of each cart, front first.
    carts: Vec<(Point3d, Orientation)>,
    /// Seconds left to wait at a station, and the speed to leave at.
    station_stop: Option<(f64, f64)>,
}

impl Tram {
    pub fn new(template: &TramTemplate, allow_s_curves: bool) -> Self {
        let identity = Orientation::from_sv(1.0, Vector3d::zero());
        Self {
            follower: CurveFollower::new(allow_s_curves),
            wheelbase: template.wheelbase,
            cart_gap: template.cart_gap,
            target_speed: template.target_speed,
            carts: vec![(Point3d::origin(), identity); template.carts.max(1)],
            station_stop: None,
        }
    }

    pub fn follower(&self) -> &CurveFollower {
        &self.follower
    }

    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    pub fn set_target_speed(&mut self, speed: f64) {
        self.target_speed = speed;
    }

    /// Whether the tram is stopping or waiting at a station.
    pub fn at_station(&self) -> bool {
        self.station_stop.is_some()
    }

    /// Slows the tram down as it pulls into a station.
    pub(crate) fn enter_station(&mut self) {
        self.station_stop = None;
        self.target_speed = STATION_SPEED;
    }

    /// Stops the tram, and sets off again at `leave_speed` after `stop_time` seconds.
    pub(crate) fn leave_station(&mut self, stop_time: f64, leave_speed: f64) {
        debug!("Tram stops at a station for {} s", stop_time);
        self.station_stop = Some((stop_time, leave_speed));
        self.target_speed = 0.0;
    }

    /// The centre and orientation of each cart, front first.
    pub fn carts(&self) -> &[(Point3d, Orientation)] {
        &self.carts
    }

    /// The radius within which another entity may touch this tram.
    pub(crate) fn bounding_radius(&self, state: &EntityState) -> f64 {
        1.5 * state.dimensions.magnitude()
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

    pub(crate) fn start<R: Rng + ?Sized>(
        &mut self,
        state: &mut EntityState,
        graph: &KeypointGraph,
        rng: &mut R,
    ) {
        if !self
            .follower
            .new_path_from_nearest(state.position, state.rule_exceptions, graph, rng)
        {
            self.follower.new_path_from_spawn(state.rule_exceptions, graph, rng);
        }
    }

    pub(crate) fn place(&mut self, state: &mut EntityState, graph: &KeypointGraph) {
        self.position_carts(state, graph);
        self.update_colliders(state, graph);
    }

    pub(crate) fn step(
        &mut self,
        state: &mut EntityState,
        dt: f64,
        ctx: &mut StepContext,
    ) -> Option<PathEvent> {
        if let Some((remaining, leave_speed)) = &mut self.station_stop {
            *remaining -= dt;
            if *remaining <= 0.0 {
                self.target_speed = *leave_speed;
                self.station_stop = None;
            }
        }

        state.speed = if state.in_active_stop_area || state.blocked || state.blocked_by_future_pawn {
            lerp_towards(state.speed, 0.0, 0.99 * dt)
        } else if state.speed.abs() < SLOW_SPEED {
            lerp_towards(state.speed, self.target_speed, 0.97 * dt)
        } else {
            lerp_towards(state.speed, self.target_speed, 0.66 * dt)
        };

        if state.speed >= MIN_MOVE_SPEED {
            if let PathState::Ended { has_outbound } = self.follower.advance(state.speed * dt, ctx.graph) {
                self.new_path(state, has_outbound, ctx);
            }
            self.position_carts(state, ctx.graph);
        }
        self.update_colliders(state, ctx.graph);
        None
    }

    fn new_path(&mut self, state: &mut EntityState, has_outbound: bool, ctx: &mut StepContext) {
        let exceptions = state.rule_exceptions;
        if has_outbound
            && self
                .follower
                .new_path_from_nearest(state.position, exceptions, ctx.graph, &mut *ctx.rng)
        {
            return;
        }
        debug!("Tram reached the end of the line, restarting from a spawn point");
        self.follower.new_path_from_spawn(exceptions, ctx.graph, &mut *ctx.rng);
    }

    /// The centre and orientation of a cart whose rear axle is `offset` along the path.
    fn cart_pose(&self, offset: f64, graph: &KeypointGraph) -> (Point3d, Orientation, Vector3d) {
        let (rear, tangent) = self.follower.location_ahead(offset, graph);
        let (front, _) = self.follower.location_ahead(offset + self.wheelbase, graph);
        let mut dir = safe_normalize(front - rear);
        if dir.magnitude2() == 0.0 {
            dir = tangent;
        }
        (rear.midpoint(front), rotation_from_direction(dir), dir)
    }

    fn position_carts(&mut self, state: &mut EntityState, graph: &KeypointGraph) {
        let (position, rotation, dir) = self.cart_pose(0.0, graph);
        state.position = position;
        state.rotation = rotation;
        state.direction = dir;
        for i in 0..self.carts.len() {
            let offset = -(i as f64) * (self.wheelbase + self.cart_gap);
            let (position, rotation, _) = self.cart_pose(offset, graph);
            self.carts[i] = (position, rotation);
        }
    }

    fn update_colliders(&self, state: &mut EntityState, graph: &KeypointGraph) {
        let dims = state.dimensions;
        let up = Vector3d::unit_z() * dims.z * 0.5;
        let front = state.position;
        let (last, last_rotation) = self.carts.last().copied().unwrap_or((front, state.rotation));
        let rear = last - last_rotation.rotate_vector(Vector3d::unit_x()) * self.wheelbase;
        let mut axis = safe_normalize(front - rear);
        if axis.magnitude2() == 0.0 {
            axis = state.direction;
        }
        state
            .collision
            .set_transform(rear.midpoint(front) + up, rotation_from_direction(axis));

        let lookahead = self.wheelbase + state.speed * 0.01;
        let (future_rear, _) = self.follower.location_ahead(lookahead, graph);
        let (future_front, tangent) = self.follower.location_ahead(lookahead + self.wheelbase, graph);
        let mut future_dir = safe_normalize(future_front - future_rear);
        if future_dir.magnitude2() == 0.0 {
            future_dir = tangent;
        }
        state.future_collision = CollisionRectangle::new(
            Vector3d::new(dims.x / self.carts.len() as f64, dims.y, dims.z),
            future_rear.midpoint(future_front) + up,
            rotation_from_direction(future_dir),
        );
    }
}
