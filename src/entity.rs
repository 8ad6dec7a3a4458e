//! Traffic entities and the state they share.

use crate::area::{AreaChange, AreaKind, TrafficArea};
use crate::collision::CollisionRectangle;
use crate::follower::CurveFollower;
use crate::graph::{GraphKind, KeypointGraph, KeypointPath};
use crate::math::{rotation_from_direction, Orientation, Point3d, Vector3d};
use crate::priority::EntitySnapshot;
use crate::world::World;
use crate::{AreaId, AreaSet, EntityId, ParkingSpaceId};
use cgmath::prelude::*;
use cgmath::Quaternion;
use rand::rngs::StdRng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use bicycle::Bicycle;
pub use car::{Car, DriverCharacteristics, OvertakeSettings};
pub(crate) use car::AREA_CHECK_WIDTH;
pub use pedestrian::Pedestrian;
pub use tram::Tram;

mod bicycle;
mod car;
mod pedestrian;
mod tram;

/// The kind of a [TrafficEntity], without its data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntityClass {
    Car,
    Pedestrian,
    Tram,
    Bicycle,
}

impl EntityClass {
    /// The graph entities of this class travel on.
    pub fn graph(self) -> GraphKind {
        match self {
            EntityClass::Car => GraphKind::Road,
            EntityClass::Pedestrian | EntityClass::Bicycle => GraphKind::SharedUse,
            EntityClass::Tram => GraphKind::Tramway,
        }
    }
}

/// The kind-specific data of a [TrafficEntity].
#[derive(Clone, Debug)]
pub enum EntityKind {
    Car(Car),
    Pedestrian(Pedestrian),
    Tram(Tram),
    Bicycle(Bicycle),
}

impl EntityKind {
    pub fn class(&self) -> EntityClass {
        match self {
            EntityKind::Car(_) => EntityClass::Car,
            EntityKind::Pedestrian(_) => EntityClass::Pedestrian,
            EntityKind::Tram(_) => EntityClass::Tram,
            EntityKind::Bicycle(_) => EntityClass::Bicycle,
        }
    }
}

/// Something found by an area query.
#[derive(Clone, Copy, Debug)]
pub struct AreaOccupant {
    /// The entity, or `None` for a pawn.
    pub entity: Option<EntityId>,
    /// The occupant's speed in cm/s. Pawns are assumed to move slowly.
    pub speed: f64,
    pub rotation: Orientation,
}

/// Something which happened at the end of an entity's path that the controller must act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PathEvent {
    /// The entity has nowhere to go and should be respawned.
    Respawn,
    /// The car finished parking into the given space.
    Parked(ParkingSpaceId),
}

/// Everything an entity needs from its surroundings to move.
pub(crate) struct StepContext<'a> {
    pub graph: &'a KeypointGraph,
    pub world: &'a dyn World,
    pub rng: &'a mut StdRng,
}

/// The state common to every kind of entity.
#[derive(Clone, Debug)]
pub(crate) struct EntityState {
    pub position: Point3d,
    pub rotation: Orientation,
    /// The unit direction of travel.
    pub direction: Vector3d,
    /// The current speed in cm/s.
    pub speed: f64,
    pub dimensions: Vector3d,
    pub collision: CollisionRectangle,
    pub future_collision: CollisionRectangle,
    pub blocked: bool,
    pub blocked_by_future_pawn: bool,
    pub stop_areas: SmallVec<[AreaId; 2]>,
    pub future_stop_areas: SmallVec<[AreaId; 2]>,
    /// The number of yield areas the entity is inside.
    pub yield_areas: usize,
    pub in_active_stop_area: bool,
    pub in_active_future_stop_area: bool,
    /// Whether the entity is simulated in high detail.
    pub near: bool,
    /// Static entities never move, but still occupy space.
    pub simulate: bool,
    pub rule_exceptions: u32,
    pub variant: u32,
    /// The index of the template the entity was built from.
    pub template: usize,
}

impl EntityState {
    pub fn new(dimensions: Vector3d, rule_exceptions: u32, variant: u32) -> Self {
        Self {
            position: Point3d::origin(),
            rotation: Quaternion::from_sv(1.0, Vector3d::zero()),
            direction: Vector3d::unit_x(),
            speed: 0.0,
            dimensions,
            collision: CollisionRectangle::new(dimensions, Point3d::origin(), Quaternion::from_sv(1.0, Vector3d::zero())),
            future_collision: CollisionRectangle::default(),
            blocked: false,
            blocked_by_future_pawn: false,
            stop_areas: SmallVec::new(),
            future_stop_areas: SmallVec::new(),
            yield_areas: 0,
            in_active_stop_area: false,
            in_active_future_stop_area: false,
            near: false,
            simulate: true,
            rule_exceptions,
            variant,
            template: 0,
        }
    }
}

/// Places a vehicle on its follower with the rear axle on the path, and predicts
/// where it will be once it has travelled its own length further.
///
/// A reversing vehicle faces against the path, so its body trails the rear axle.
pub(crate) fn place_vehicle(
    follower: &CurveFollower,
    wheelbase: f64,
    reversing: bool,
    state: &mut EntityState,
    graph: &KeypointGraph,
) {
    let (rear, tangent) = follower.location(graph);
    let (sign, facing) = if reversing { (-1.0, -tangent) } else { (1.0, tangent) };
    state.direction = tangent;
    state.position = rear + tangent * wheelbase * 0.5 * sign;
    state.rotation = rotation_from_direction(facing);
    update_vehicle_colliders(follower, wheelbase, state, graph);
}

pub(crate) fn update_vehicle_colliders(
    follower: &CurveFollower,
    wheelbase: f64,
    state: &mut EntityState,
    graph: &KeypointGraph,
) {
    let dims = state.dimensions;
    let up = Vector3d::unit_z() * dims.z * 0.5;
    state.collision.set_transform(state.position + up, state.rotation);

    // Look further ahead at speed.
    let scale = (state.speed * 0.004 - 1.0).max(1.0);
    let (rear, tangent) = follower.location_ahead((wheelbase + dims.x * scale) * 0.5, graph);
    state.future_collision = CollisionRectangle::new(
        Vector3d::new(dims.x * scale, dims.y, dims.z),
        rear + tangent * wheelbase * 0.5 + up,
        rotation_from_direction(tangent),
    );
}

/// A car, pedestrian, tram or bicycle moving through the world.
#[derive(Clone, Debug)]
pub struct TrafficEntity {
    id: EntityId,
    /// Creation sequence number.
    seq: u64,
    pub(crate) state: EntityState,
    pub(crate) kind: EntityKind,
}

impl TrafficEntity {
    pub(crate) fn new(id: EntityId, seq: u64, state: EntityState, kind: EntityKind) -> Self {
        Self { id, seq, state, kind }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The creation sequence number. Entities created later have larger numbers.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn class(&self) -> EntityClass {
        self.kind.class()
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn position(&self) -> Point3d {
        self.state.position
    }

    pub fn rotation(&self) -> Orientation {
        self.state.rotation
    }

    /// The unit direction of travel.
    pub fn move_direction(&self) -> Vector3d {
        self.state.direction
    }

    pub fn speed(&self) -> f64 {
        self.state.speed
    }

    pub fn dimensions(&self) -> Vector3d {
        self.state.dimensions
    }

    pub fn collision(&self) -> &CollisionRectangle {
        &self.state.collision
    }

    /// The rectangle the entity expects to occupy shortly.
    pub fn future_collision(&self) -> &CollisionRectangle {
        &self.state.future_collision
    }

    /// Whether another entity or an obstacle has the right of way.
    pub fn blocked(&self) -> bool {
        self.state.blocked
    }

    /// Whether a pawn stands in the entity's predicted path.
    pub fn blocked_by_future_pawn(&self) -> bool {
        self.state.blocked_by_future_pawn
    }

    pub fn in_active_stop_area(&self) -> bool {
        self.state.in_active_stop_area
    }

    /// Whether the entity has been brought to a halt by traffic or a stop area.
    pub fn stopped(&self) -> bool {
        match self.kind {
            EntityKind::Car(_) | EntityKind::Tram(_) => {
                self.state.blocked || self.state.in_active_stop_area
            }
            EntityKind::Pedestrian(_) | EntityKind::Bicycle(_) => self.state.in_active_stop_area,
        }
    }

    /// Whether the entity gives way to everyone else. Trams never do.
    pub fn yielding(&self) -> bool {
        match self.kind {
            EntityKind::Tram(_) => false,
            _ => self.state.yield_areas > 0,
        }
    }

    /// Whether the entity is a car waiting to pull out of a parking space.
    pub fn waiting_to_depart(&self) -> bool {
        match &self.kind {
            EntityKind::Car(car) => car.waiting_to_depart(),
            _ => false,
        }
    }

    /// Whether the entity is simulated in high detail.
    pub fn near(&self) -> bool {
        self.state.near
    }

    /// Whether the entity moves at all.
    pub fn simulated(&self) -> bool {
        self.state.simulate
    }

    pub fn rule_exceptions(&self) -> u32 {
        self.state.rule_exceptions
    }

    /// The cosmetic variant chosen when the entity was spawned.
    pub fn variant(&self) -> u32 {
        self.state.variant
    }

    /// The index of the template the entity was spawned from.
    pub fn template(&self) -> usize {
        self.state.template
    }

    /// The path the entity is following.
    pub fn path(&self) -> &KeypointPath {
        match &self.kind {
            EntityKind::Car(car) => car.follower().path(),
            EntityKind::Pedestrian(ped) => ped.follower().path(),
            EntityKind::Tram(tram) => tram.follower().path(),
            EntityKind::Bicycle(bike) => bike.follower().path(),
        }
    }

    /// The follower point along [TrafficEntity::path] and the progress past it.
    pub fn path_progress(&self) -> (usize, f64) {
        match &self.kind {
            EntityKind::Car(car) => (car.follower().point(), car.follower().progress()),
            EntityKind::Pedestrian(ped) => (ped.follower().point(), 0.0),
            EntityKind::Tram(tram) => (tram.follower().point(), tram.follower().progress()),
            EntityKind::Bicycle(bike) => (bike.follower().point(), bike.follower().progress()),
        }
    }

    /// Sets the speed the entity tries to reach.
    pub fn set_target_speed(&mut self, speed: f64) {
        match &mut self.kind {
            EntityKind::Car(car) => car.set_target_speed(speed),
            EntityKind::Tram(tram) => tram.set_target_speed(speed),
            EntityKind::Pedestrian(_) | EntityKind::Bicycle(_) => self.state.speed = speed.max(0.0),
        }
    }

    /// Sets the current speed without any acceleration.
    pub fn set_instant_speed(&mut self, speed: f64) {
        self.state.speed = speed;
    }

    /// Moves the entity without following its path.
    pub fn teleport(&mut self, position: Point3d, rotation: Orientation) {
        self.state.position = position;
        self.state.rotation = rotation;
        self.state.direction = rotation.rotate_vector(Vector3d::unit_x());
        let offset = match self.kind {
            EntityKind::Pedestrian(_) => Vector3d::zero(),
            _ => Vector3d::unit_z() * self.state.dimensions.z * 0.5,
        };
        self.state.collision.set_transform(position + offset, rotation);
        self.state.future_collision.set_transform(position + offset, rotation);
    }

    /// Replaces the entity's path, starting at the given follower point and progress.
    ///
    /// Pedestrians walk to point `point` of the path and ignore `progress`.
    pub fn apply_custom_path(
        &mut self,
        path: KeypointPath,
        point: usize,
        progress: f64,
        graph: &KeypointGraph,
    ) {
        match &mut self.kind {
            EntityKind::Car(car) => car.apply_custom_path(path, point, progress, graph),
            EntityKind::Pedestrian(ped) => ped.apply_custom_path(path, point),
            EntityKind::Tram(tram) => tram.apply_custom_path(path, point, progress, graph),
            EntityKind::Bicycle(bike) => bike.apply_custom_path(path, point, progress, graph),
        }
    }

    /// A read-only view of the entity for right-of-way resolution.
    pub fn snapshot(&self) -> EntitySnapshot {
        let bounding_radius = match &self.kind {
            EntityKind::Tram(tram) => Some(tram.bounding_radius(&self.state)),
            _ => None,
        };
        EntitySnapshot {
            seq: self.seq,
            class: self.class(),
            current: self.state.collision,
            future: self.state.future_collision,
            direction: self.state.direction,
            yielding: self.yielding(),
            waiting_to_depart: self.waiting_to_depart(),
            moving: self.state.speed >= 50.0 && !self.stopped() && !self.state.blocked,
            bounding_radius,
        }
    }

    /// Records a change in membership of a stop or yield area.
    pub(crate) fn on_area_change(&mut self, area_id: AreaId, area: &TrafficArea, change: AreaChange) {
        let state = &mut self.state;
        match (area.kind(), change) {
            (AreaKind::Stop { .. }, AreaChange::Entered) => state.stop_areas.push(area_id),
            (AreaKind::Stop { .. }, AreaChange::Exited) => state.stop_areas.retain(|a| *a != area_id),
            (AreaKind::Stop { .. }, AreaChange::FutureEntered) => state.future_stop_areas.push(area_id),
            (AreaKind::Stop { .. }, AreaChange::FutureExited) => {
                state.future_stop_areas.retain(|a| *a != area_id)
            }
            (AreaKind::Yield, AreaChange::Entered) => state.yield_areas += 1,
            (AreaKind::Yield, AreaChange::Exited) => {
                state.yield_areas = state.yield_areas.saturating_sub(1)
            }
            (AreaKind::TramStation { .. }, AreaChange::Entered) => {
                if let EntityKind::Tram(tram) = &mut self.kind {
                    tram.enter_station();
                }
            }
            (AreaKind::TramStation { stop_time, leave_speed }, AreaChange::Exited) => {
                if let EntityKind::Tram(tram) = &mut self.kind {
                    tram.leave_station(*stop_time, *leave_speed);
                }
            }
            _ => {}
        }
    }

    /// Recomputes whether the entity is inside an active stop area.
    ///
    /// Pedestrians and bicycles only stop for areas facing the way they are heading.
    pub(crate) fn refresh_stop_state(&mut self, areas: &AreaSet) {
        let directional = matches!(self.kind, EntityKind::Pedestrian(_) | EntityKind::Bicycle(_));
        let direction = self.state.direction;
        let applies = |id: &AreaId| {
            areas
                .get(*id)
                .map_or(false, |a| a.active() && (!directional || a.faces(direction)))
        };
        self.state.in_active_stop_area = self.state.stop_areas.iter().any(applies);
        self.state.in_active_future_stop_area = match self.kind {
            EntityKind::Car(_) => self.state.future_stop_areas.iter().any(applies),
            _ => false,
        };
    }

    /// Advances the entity by `dt` seconds.
    pub(crate) fn step(&mut self, dt: f64, ctx: &mut StepContext) -> Option<PathEvent> {
        if !self.state.simulate {
            return None;
        }
        match &mut self.kind {
            EntityKind::Car(car) => car.step(&mut self.state, dt, ctx),
            EntityKind::Pedestrian(ped) => ped.step(&mut self.state, dt, ctx),
            EntityKind::Tram(tram) => tram.step(&mut self.state, dt, ctx),
            EntityKind::Bicycle(bike) => bike.step(&mut self.state, dt, ctx),
        }
    }

    /// Starts a new path from wherever the entity stands.
    pub(crate) fn start(&mut self, graph: &KeypointGraph, rng: &mut StdRng) {
        match &mut self.kind {
            EntityKind::Car(car) => car.start(&mut self.state, graph, rng),
            EntityKind::Pedestrian(ped) => ped.start(&mut self.state, graph, rng),
            EntityKind::Tram(tram) => tram.start(&mut self.state, graph, rng),
            EntityKind::Bicycle(bike) => bike.start(&mut self.state, graph, rng),
        }
    }

    /// Places the entity at the start of its current path.
    pub(crate) fn place_on_path(&mut self, graph: &KeypointGraph) {
        match &mut self.kind {
            EntityKind::Car(car) => car.place(&mut self.state, graph),
            EntityKind::Pedestrian(ped) => ped.place(&mut self.state, graph),
            EntityKind::Tram(tram) => tram.place(&mut self.state, graph),
            EntityKind::Bicycle(bike) => bike.place(&mut self.state, graph),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{CarTemplate, PedestrianTemplate};
    use crate::graph::test::{line_graph, rng};
    use crate::math::rotation_from_direction;
    use slotmap::SlotMap;

    fn entity(kind: EntityKind, dims: Vector3d) -> TrafficEntity {
        let mut ids = SlotMap::<EntityId, ()>::with_key();
        TrafficEntity::new(ids.insert(()), 1, EntityState::new(dims, u32::MAX, 0), kind)
    }

    #[test]
    fn stop_state_respects_direction() {
        let mut areas = AreaSet::with_key();
        let stop = areas.insert(TrafficArea::new(
            AreaKind::Stop { active: true },
            Point3d::new(0.0, 0.0, 0.0),
            rotation_from_direction(Vector3d::unit_y()),
            Vector3d::new(1.0, 1.0, 1.0),
        ));
        let template = PedestrianTemplate::default();
        let mut ped = entity(
            EntityKind::Pedestrian(Pedestrian::new(&template)),
            template.dimensions,
        );
        ped.on_area_change(stop, &areas[stop], AreaChange::Entered);

        ped.state.direction = Vector3d::unit_x();
        ped.refresh_stop_state(&areas);
        assert!(!ped.stopped());

        ped.state.direction = Vector3d::unit_y();
        ped.refresh_stop_state(&areas);
        assert!(ped.stopped());

        areas[stop].deactivate();
        ped.refresh_stop_state(&areas);
        assert!(!ped.stopped());
    }

    #[test]
    fn cars_stop_for_any_active_area() {
        let mut areas = AreaSet::with_key();
        let stop = areas.insert(TrafficArea::new(
            AreaKind::Stop { active: true },
            Point3d::new(0.0, 0.0, 0.0),
            rotation_from_direction(Vector3d::unit_y()),
            Vector3d::new(1.0, 1.0, 1.0),
        ));
        let mut rng = rng();
        let template = CarTemplate::default();
        let mut car = entity(
            EntityKind::Car(Car::new(&template, true, &mut rng)),
            template.dimensions,
        );
        car.on_area_change(stop, &areas[stop], AreaChange::Entered);
        car.refresh_stop_state(&areas);
        assert!(car.stopped());
        car.on_area_change(stop, &areas[stop], AreaChange::Exited);
        car.refresh_stop_state(&areas);
        assert!(!car.stopped());
    }

    #[test]
    fn yield_membership_counts() {
        let mut areas = AreaSet::with_key();
        let area = areas.insert(TrafficArea::new(
            AreaKind::Yield,
            Point3d::new(0.0, 0.0, 0.0),
            rotation_from_direction(Vector3d::unit_x()),
            Vector3d::new(1.0, 1.0, 1.0),
        ));
        let mut rng = rng();
        let template = CarTemplate::default();
        let mut car = entity(
            EntityKind::Car(Car::new(&template, true, &mut rng)),
            template.dimensions,
        );
        car.on_area_change(area, &areas[area], AreaChange::Entered);
        car.on_area_change(area, &areas[area], AreaChange::Entered);
        car.on_area_change(area, &areas[area], AreaChange::Exited);
        assert!(car.yielding());
        car.on_area_change(area, &areas[area], AreaChange::Exited);
        assert!(!car.yielding());
    }

    #[test]
    fn placed_vehicle_faces_along_path() {
        let graph = line_graph(4);
        let mut rng = rng();
        let template = CarTemplate::default();
        let mut car = entity(
            EntityKind::Car(Car::new(&template, true, &mut rng)),
            template.dimensions,
        );
        car.apply_custom_path(KeypointPath::from_keypoints([0, 1, 2, 3]), 0, 0.0, &graph);
        car.place_on_path(&graph);
        assert!((car.position().x - 125.0).abs() < 1e-6);
        assert!((car.move_direction().x - 1.0).abs() < 1e-6);
        assert!(car.future_collision().position().x > car.collision().position().x);
    }
}
