use super::{
    place_vehicle, update_vehicle_colliders, AreaOccupant, EntityState, PathEvent, StepContext,
};
use crate::collision::CollisionRectangle;
use crate::config::CarTemplate;
use crate::follower::{CurveFollower, PathState};
use crate::graph::{KeypointGraph, KeypointPath, PathPoint};
use crate::math::{
    angular_distance, distance_2d, forward, lerp_towards, rotation_from_direction,
    safe_normalize, Point3d, Vector3d,
};
use crate::parking::ParkingRoute;
use crate::ParkingSpaceId;
use cgmath::prelude::*;
use log::{debug, error};
use rand::Rng;

/// Cars slower than this do not move at all.
const MIN_MOVE_SPEED: f64 = 50.0;

/// The speed cars creep at towards a red light, and reverse at.
const CREEP_SPEED: f64 = 150.0;

/// Overtaking is considered once per this many ticks.
const OVERTAKE_INTERVAL: u32 = 30;

/// The width of the areas checked for traffic when overtaking.
pub(crate) const AREA_CHECK_WIDTH: f64 = 220.0;

/// How far ahead a driver looks for slow traffic.
const FRONTAL_SIGHT: f64 = 2500.0;

/// Cars ahead only count as the same lane if their heading is within this angle (radians).
const SAME_LANE_HEADING: f64 = 8.0 / 90.0;

/// How a particular driver drives.
#[derive(Clone, Copy, Debug)]
pub struct DriverCharacteristics {
    /// The fastest the driver will ever go.
    pub max_speed: f64,
    /// How much faster than the speed limit the driver tends to go.
    pub speed_multiplier: f64,
}

impl DriverCharacteristics {
    pub fn random<R: Rng + ?Sized>(max_speed: f64, rng: &mut R) -> Self {
        Self {
            max_speed,
            speed_multiplier: 1.0 + rng.gen_range(0.0..=0.2),
        }
    }
}

/// When and how a car overtakes slower traffic.
#[derive(Clone, Copy, Debug)]
pub struct OvertakeSettings {
    pub allow: bool,
    /// Whether cars may also overtake from the overtaking lane back into the normal lane.
    pub allow_both_ways: bool,
    /// Overtake if traffic ahead is slower than this fraction of the target speed.
    pub max_speed_diff_multiplier: f64,
    /// Abort if traffic approaching on the other lane is faster than this fraction of the car's speed.
    pub max_speed_diff_multiplier_behind: f64,
    /// Abort unless the other lane ahead is at least this much faster than the current lane.
    pub min_speed_diff_multiplier_front: f64,
    /// The distance over which the car merges into the other lane.
    pub merge_distance: f64,
    /// The distance the car stays in its lane before it starts merging.
    pub keep_lane_distance: f64,
    pub check_length_behind: f64,
    pub check_offset_behind: f64,
    pub check_length_side: f64,
    pub check_offset_side: f64,
    pub check_length_front: f64,
    pub check_offset_front: f64,
}

impl Default for OvertakeSettings {
    fn default() -> Self {
        let merge_distance = 1650.0;
        let keep_lane_distance = 300.0;
        Self {
            allow: true,
            allow_both_ways: true,
            max_speed_diff_multiplier: 0.83,
            max_speed_diff_multiplier_behind: 1.2,
            min_speed_diff_multiplier_front: 1.1,
            merge_distance,
            keep_lane_distance,
            check_length_behind: 2000.0,
            check_offset_behind: -1500.0 - merge_distance - keep_lane_distance,
            check_length_side: 1000.0,
            check_offset_side: -merge_distance - keep_lane_distance,
            check_length_front: 2500.0,
            check_offset_front: 1750.0 - merge_distance - keep_lane_distance,
        }
    }
}

/// A car driving on the road graph.
#[derive(Clone, Debug)]
pub struct Car {
    follower: CurveFollower,
    /// The distance between the axles.
    wheelbase: f64,
    driver: DriverCharacteristics,
    target_speed: f64,
    overtake: OvertakeSettings,
    /// The car drives backwards until it passes this follower point.
    reverse_until: Option<usize>,
    /// The car starts driving backwards once it passes this follower point.
    reverse_from: Option<usize>,
    waiting_to_depart: bool,
    /// Ticks since the last overtaking check, or since the car started waiting to depart.
    frame_counter: u32,
    /// The parking space the car's current path leads into.
    parking_into: Option<ParkingSpaceId>,
}

impl Car {
    pub fn new<R: Rng + ?Sized>(template: &CarTemplate, allow_s_curves: bool, rng: &mut R) -> Self {
        Self {
            follower: CurveFollower::new(allow_s_curves),
            wheelbase: template.wheelbase,
            driver: DriverCharacteristics::random(template.max_speed, rng),
            target_speed: 500.0,
            overtake: OvertakeSettings::default(),
            reverse_until: None,
            reverse_from: None,
            waiting_to_depart: false,
            frame_counter: 0,
            parking_into: None,
        }
    }

    pub fn follower(&self) -> &CurveFollower {
        &self.follower
    }

    pub fn wheelbase(&self) -> f64 {
        self.wheelbase
    }

    pub fn driver(&self) -> DriverCharacteristics {
        self.driver
    }

    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    pub fn overtake_settings(&self) -> &OvertakeSettings {
        &self.overtake
    }

    pub fn set_overtake_settings(&mut self, settings: OvertakeSettings) {
        self.overtake = settings;
    }

    pub fn waiting_to_depart(&self) -> bool {
        self.waiting_to_depart
    }

    /// The parking space the car is heading into, if any.
    pub fn parking_into(&self) -> Option<ParkingSpaceId> {
        self.parking_into
    }

    pub fn reversing(&self) -> bool {
        self.reverse_until.is_some()
    }

    /// Sets the speed the car tries to reach, limited by the driver's top speed.
    pub fn set_target_speed(&mut self, speed: f64) {
        self.target_speed = speed.clamp(-self.driver.max_speed, self.driver.max_speed);
    }

    /// Drive backwards until the follower passes `point`.
    pub fn reverse_until_point(&mut self, point: usize) {
        if point > self.follower.point() {
            self.reverse_until = Some(point);
        }
    }

    /// Start driving backwards once the follower passes `point`.
    pub fn start_reverse_from_point(&mut self, point: usize) {
        if point > self.follower.point() && point < self.follower.path().len() {
            self.reverse_from = Some(point);
        }
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

    /// Starts driving a scripted route into a parking space.
    pub(crate) fn begin_parking(&mut self, space: ParkingSpaceId, route: ParkingRoute, graph: &KeypointGraph) {
        self.follower.set_path(route.path, 0, 0.0, graph);
        self.reverse_until = None;
        self.reverse_from = None;
        if let Some(point) = route.reverse_from {
            self.start_reverse_from_point(point);
        }
        self.parking_into = Some(space);
        self.set_target_speed(350.0);
    }

    /// Holds the car still until a box of `dimensions` is free of traffic.
    /// The box is centred at the car's position minus `offset` in the car's frame.
    pub(crate) fn wait_for_unobstructed_depart(
        &mut self,
        state: &mut EntityState,
        dimensions: Vector3d,
        offset: Vector3d,
    ) {
        state.future_collision = CollisionRectangle::new(
            dimensions,
            state.position - state.rotation.rotate_vector(offset),
            state.rotation,
        );
        self.waiting_to_depart = true;
        self.frame_counter = 0;
    }

    /// Starts a random path from the car's position, or from a spawn point if
    /// there is nothing nearby to follow.
    pub(crate) fn start(&mut self, state: &mut EntityState, graph: &KeypointGraph, rng: &mut impl Rng) {
        if !self
            .follower
            .new_path_from_nearest(state.position, state.rule_exceptions, graph, rng)
        {
            self.follower.new_path_from_spawn(state.rule_exceptions, graph, rng);
        }
        self.target_speed = self.driver.max_speed;
    }

    pub(crate) fn place(&mut self, state: &mut EntityState, graph: &KeypointGraph) {
        place_vehicle(&self.follower, self.wheelbase, self.reversing(), state, graph);
    }

    /// Whether it is time to consider overtaking. Resets the interval if so.
    pub(crate) fn overtake_due(&mut self) -> bool {
        if self.frame_counter >= OVERTAKE_INTERVAL && !self.waiting_to_depart {
            self.frame_counter = 0;
            return true;
        }
        false
    }

    pub(crate) fn step(
        &mut self,
        state: &mut EntityState,
        dt: f64,
        ctx: &mut StepContext,
    ) -> Option<PathEvent> {
        self.frame_counter = self.frame_counter.saturating_add(1);
        if self.waiting_to_depart {
            if !state.blocked && !state.blocked_by_future_pawn && self.frame_counter >= 2 {
                self.waiting_to_depart = false;
            }
            return None;
        }

        state.speed = if state.in_active_stop_area && state.in_active_future_stop_area {
            lerp_towards(state.speed, 0.0, 3.0 * dt)
        } else if state.blocked || state.blocked_by_future_pawn {
            lerp_towards(state.speed, 0.0, 2.0 * dt)
        } else if state.in_active_future_stop_area {
            lerp_towards(state.speed, CREEP_SPEED, 0.66 * dt)
        } else {
            lerp_towards(state.speed, self.target_speed, 0.46 * dt)
        };

        let mut event = None;
        if state.speed >= MIN_MOVE_SPEED {
            event = self.drive(state, dt, ctx);
        }
        update_vehicle_colliders(&self.follower, self.wheelbase, state, ctx.graph);
        event
    }

    fn drive(&mut self, state: &mut EntityState, dt: f64, ctx: &mut StepContext) -> Option<PathEvent> {
        let event = match self.follower.advance(state.speed * dt, ctx.graph) {
            PathState::Following => None,
            PathState::Ended { has_outbound } => self.path_ended(state, has_outbound, ctx),
        };

        let (rear, tangent) = self.follower.location(ctx.graph);
        if !tangent.x.is_finite() || !tangent.y.is_finite() || !tangent.z.is_finite() {
            error!("Car path produced an invalid tangent, starting a new path");
            self.start(state, ctx.graph, &mut *ctx.rng);
            return event;
        }
        let point = self.follower.point();
        match (self.reverse_until, self.reverse_from) {
            (Some(until), _) if until > point => {}
            (_, Some(from)) if from <= point => {
                debug!("Car starts reversing at point {}", point);
                self.reverse_from = None;
                self.reverse_until = Some(usize::MAX);
                state.speed = 0.0;
                self.target_speed = CREEP_SPEED;
            }
            (Some(_), _) => {
                debug!("Car stops reversing at point {}", point);
                self.reverse_until = None;
                state.speed = 0.0;
            }
            _ => {}
        }

        // Reversing cars still follow the path, only the body is turned around.
        let (sign, facing) = if self.reversing() { (-1.0, -tangent) } else { (1.0, tangent) };
        let mut middle = rear + tangent * self.wheelbase * 0.5 * sign;
        if state.near {
            if let Some(z) = ctx.world.ground_height(middle) {
                middle.z = z;
            }
        }
        state.direction = tangent;
        state.position = middle;
        state.rotation = rotation_from_direction(facing);
        event
    }

    fn path_ended(
        &mut self,
        state: &mut EntityState,
        has_outbound: bool,
        ctx: &mut StepContext,
    ) -> Option<PathEvent> {
        self.reverse_until = None;
        self.reverse_from = None;
        if let Some(space) = self.parking_into.take() {
            return Some(PathEvent::Parked(space));
        }
        if has_outbound
            && self
                .follower
                .new_path_from_nearest(state.position, state.rule_exceptions, ctx.graph, &mut *ctx.rng)
        {
            return None;
        }
        Some(PathEvent::Respawn)
    }

    /// The lowest speed of the cars ahead in the same lane, if there are any.
    fn min_speed_in_front(
        &self,
        state: &EntityState,
        graph: &KeypointGraph,
        query: &impl Fn(Point3d, Vector3d, f64) -> Vec<AreaOccupant>,
    ) -> Option<f64> {
        let (centre, _) = self.follower.location_ahead(FRONTAL_SIGHT * 0.5, graph);
        let forward = safe_normalize(centre - state.position);
        query(centre, forward, FRONTAL_SIGHT)
            .into_iter()
            .filter(|o| o.entity.is_some())
            .filter(|o| angular_distance(state.rotation, o.rotation) <= SAME_LANE_HEADING)
            .map(|o| o.speed)
            .reduce(f64::min)
    }

    /// Plans a lane change past slower traffic ahead.
    ///
    /// `query(centre, forward, length)` must return everything in a box of that
    /// length (and [AREA_CHECK_WIDTH] wide) other than this car. Returns the new
    /// path, which starts at the car's current follower point.
    pub(crate) fn plan_overtake<R: Rng + ?Sized>(
        &self,
        state: &EntityState,
        graph: &KeypointGraph,
        query: impl Fn(Point3d, Vector3d, f64) -> Vec<AreaOccupant>,
        rng: &mut R,
    ) -> Option<KeypointPath> {
        let s = &self.overtake;
        if !s.allow {
            return None;
        }
        let lane_min_speed = self.min_speed_in_front(state, graph, &query)?;
        if lane_min_speed >= self.target_speed * s.max_speed_diff_multiplier {
            return None;
        }

        let path = self.follower.path();
        let current = self.follower.point();
        let lane = match (path.get(current), path.get(current + 1)) {
            (Some(PathPoint::Keypoint(a)), Some(PathPoint::Keypoint(b))) => (a, b),
            _ => return None,
        };
        let (adj_start_index, adj_end_index) = graph.overtake_pair(lane, s.allow_both_ways)?;
        let lane_start = graph.position(lane.0)?;
        let lane_end = graph.position(lane.1)?;
        let adj_start = graph.position(adj_start_index)?;
        let adj_end = graph.position(adj_end_index)?;

        let lane_length = distance_2d(lane_start, lane_end);
        if lane_length <= 0.0 {
            return None;
        }
        let progress = distance_2d(lane_start, state.position) / lane_length;
        if lane_length * (1.0 - progress) < s.merge_distance {
            return None;
        }
        let merge_point = adj_start + (adj_end - adj_start) * (progress + s.merge_distance / lane_length);
        let lane_forward = safe_normalize(adj_end - adj_start);

        let incoming = query(
            merge_point + lane_forward * s.check_offset_behind,
            lane_forward,
            s.check_length_behind,
        )
        .iter()
        .map(|o| o.speed)
        .fold(0.0, f64::max);
        if incoming * s.max_speed_diff_multiplier_behind > state.speed {
            return None;
        }
        if !query(
            merge_point + lane_forward * s.check_offset_side,
            lane_forward,
            s.check_length_side,
        )
        .is_empty()
        {
            return None;
        }
        let adjacent_min_speed = query(
            merge_point + lane_forward * s.check_offset_front,
            lane_forward,
            s.check_length_front,
        )
        .iter()
        .map(|o| o.speed)
        .reduce(f64::min);
        if let Some(speed) = adjacent_min_speed {
            if speed <= lane_min_speed * s.min_speed_diff_multiplier_front {
                return None;
            }
        }

        let stay_point = lane_start + (lane_end - lane_start) * (progress + s.keep_lane_distance / lane_length);
        let mut new_path = path.slice(0..current);
        new_path.push_custom(state.position - forward(state.rotation) * self.wheelbase);
        new_path.push_custom(state.position);
        new_path.push_custom(stay_point);
        new_path.push_custom(merge_point);
        new_path.append(&graph.random_path_from(adj_end_index, state.rule_exceptions, rng));
        debug!("Car overtakes from lane {:?}", lane);
        Some(new_path)
    }

    /// Switches to a path returned by [Car::plan_overtake].
    pub(crate) fn apply_overtake(&mut self, path: KeypointPath, graph: &KeypointGraph) {
        let point = self.follower.point();
        self.follower.set_path(path, point, 1.0, graph);
    }
}
