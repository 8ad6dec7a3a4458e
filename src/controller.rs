//! The traffic controller, which owns and steps every part of the simulation.

use crate::area::{AreaChange, AreaKind, TrafficArea, ZoneRules};
use crate::collision::CollisionRectangle;
use crate::config::{BicycleTemplate, CarTemplate, PedestrianTemplate, TrafficConfig, TramTemplate};
#[cfg(feature = "debug")]
use crate::debug::take_debug_frame;
use crate::debug::{debug_line, debug_point, debug_rect};
use crate::entity::{AreaOccupant, EntityClass, EntityKind, PathEvent, StepContext, TrafficEntity};
use crate::graph::{GraphKind, KeypointGraph};
use crate::light::{IntersectionController, TrafficLightGroup, TramIntersectionController, TramLight};
use crate::math::{
    angular_distance, flatten, flatten_vec, forward, rotation_from_direction, safe_normalize,
    Point3d, Vector3d,
};
use crate::parking::{ParkingController, ParkingSpace, MIN_TRAVERSED};
use crate::priority::{blocked_by, pawn_blocks, point_blocks, EntitySnapshot};
use crate::world::{NoWorld, World};
use crate::{
    AreaId, AreaSet, EntityId, EntitySet, IntersectionId, IntersectionSet, LightGroupId,
    LightGroupSet, ParkingSpaceId, TramIntersectionId, TramIntersectionSet,
};
use cgmath::prelude::*;
use itertools::izip;
use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::f64::consts::PI;

pub use lod::Camera;
use lod::View;

mod lod;
mod spawn;

/// Pawns are assumed to move at this speed in cm/s.
const PAWN_SPEED: f64 = 50.0;

/// Entities count as in front of a pawn within this cosine of its heading.
const IN_FRONT_COS: f64 = 0.8;

/// Entities count as in front of a pawn if they face within this angle of it.
const IN_FRONT_MAX_ANGLE: f64 = PI / 3.0;

/// The things outside the simulation that traffic must react to in a frame.
#[derive(Clone, Debug, Default)]
pub struct FrameInput {
    /// The viewpoint used to choose high detail entities. Without a camera,
    /// every entity is high detail.
    pub camera: Option<Camera>,
    /// Boxes of externally controlled actors, such as the player's vehicle.
    /// The first pawn is the one [TrafficController::entity_in_front_of_pawn] refers to.
    pub pawns: Vec<CollisionRectangle>,
    /// Point obstacles which block any entity about to run into them.
    pub obstacles: Vec<Point3d>,
}

/// Something that happened during a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrafficEvent {
    Spawned(EntityId),
    Retired(EntityId),
    EnteredStopArea { entity: EntityId, area: AreaId },
    ExitedStopArea { entity: EntityId, area: AreaId },
    EnteredYieldArea { entity: EntityId, area: AreaId },
    ExitedYieldArea { entity: EntityId, area: AreaId },
    /// The entity became high detail.
    Near(EntityId),
    /// The entity became low detail.
    Far(EntityId),
    /// The car finished parking and was removed.
    Parked { entity: EntityId, space: ParkingSpaceId },
    /// A parked car became the given entity.
    Departed { entity: EntityId, space: ParkingSpaceId },
}

/// The three graphs entities travel on.
#[derive(Clone, Debug, Default)]
struct Graphs {
    road: KeypointGraph,
    shared_use: KeypointGraph,
    tramway: KeypointGraph,
}

impl Graphs {
    fn get(&self, kind: GraphKind) -> &KeypointGraph {
        match kind {
            GraphKind::Road => &self.road,
            GraphKind::SharedUse => &self.shared_use,
            GraphKind::Tramway => &self.tramway,
        }
    }

    fn get_mut(&mut self, kind: GraphKind) -> &mut KeypointGraph {
        match kind {
            GraphKind::Road => &mut self.road,
            GraphKind::SharedUse => &mut self.shared_use,
            GraphKind::Tramway => &mut self.tramway,
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut KeypointGraph> {
        [&mut self.road, &mut self.shared_use, &mut self.tramway].into_iter()
    }
}

/// Entity templates by kind.
#[derive(Clone, Debug, Default)]
struct Templates {
    cars: Vec<CarTemplate>,
    pedestrians: Vec<PedestrianTemplate>,
    trams: Vec<TramTemplate>,
    bicycles: Vec<BicycleTemplate>,
}

/// A change to make once area memberships have been updated.
enum AreaAction {
    /// Obey a zone's speed limit, or the limit at the car's position if `None`.
    Regulate(EntityId, Option<f64>),
    Park(EntityId, ParkingSpaceId, u32),
}

/// The outcome of the right-of-way pass for one entity.
#[derive(Clone, Copy, Debug, Default)]
struct PassResult {
    blocked: bool,
    blocked_by_mover: bool,
    blocked_by_future_pawn: bool,
    /// The squared distance to the first pawn, if the entity is in front of it.
    in_front_of_pawn: Option<f64>,
    /// The distance to the camera, if the entity may be high detail.
    near_candidate: Option<f64>,
}

/// Owns the graphs, entities, areas, lights and parking spaces of a traffic simulation.
pub struct TrafficController {
    config: TrafficConfig,
    graphs: Graphs,
    templates: Templates,
    entities: EntitySet,
    areas: AreaSet,
    light_groups: LightGroupSet,
    intersections: IntersectionSet,
    tram_intersections: TramIntersectionSet,
    parking: ParkingController,
    world: Box<dyn World>,
    rng: StdRng,
    /// The next entity sequence number.
    seq: u64,
    /// The current frame of simulation.
    frame: usize,
    events: Vec<TrafficEvent>,
    /// Entities to retire at the end of the next tick.
    invalidated: Vec<EntityId>,
    /// The pawns of the previous tick.
    pawns: Vec<CollisionRectangle>,
    entity_in_front_of_pawn: Option<EntityId>,
    near_entities: Vec<EntityId>,
    /// Debugging information from the previously simulated frame.
    #[cfg(feature = "debug")]
    debug: serde_json::Value,
}

impl TrafficController {
    /// Creates an empty simulation seeded from system entropy.
    pub fn new(config: TrafficConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Creates an empty simulation which always makes the same random choices.
    pub fn with_seed(config: TrafficConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: TrafficConfig, rng: StdRng) -> Self {
        Self {
            config,
            graphs: Graphs::default(),
            templates: Templates::default(),
            entities: EntitySet::with_key(),
            areas: AreaSet::with_key(),
            light_groups: LightGroupSet::with_key(),
            intersections: IntersectionSet::with_key(),
            tram_intersections: TramIntersectionSet::with_key(),
            parking: ParkingController::new(),
            world: Box::new(NoWorld),
            rng,
            seq: 0,
            frame: 0,
            events: vec![],
            invalidated: vec![],
            pawns: vec![],
            entity_in_front_of_pawn: None,
            near_entities: vec![],
            #[cfg(feature = "debug")]
            debug: serde_json::Value::Null,
        }
    }

    pub fn config(&self) -> &TrafficConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut TrafficConfig {
        &mut self.config
    }

    /// Sets the world used for ground heights and visibility.
    pub fn set_world(&mut self, world: Box<dyn World>) {
        self.world = world;
    }

    pub fn graph(&self, kind: GraphKind) -> &KeypointGraph {
        self.graphs.get(kind)
    }

    /// Replaces one of the graphs.
    ///
    /// Entities already following the old graph should be respawned with
    /// [TrafficController::begin_simulate_traffic].
    pub fn set_graph(&mut self, kind: GraphKind, mut graph: KeypointGraph) {
        graph.update_entry_points();
        if graph.is_empty() {
            warn!("{:?} graph has no keypoints", kind);
        }
        *self.graphs.get_mut(kind) = graph;
    }

    /// Snaps every graph's keypoints to the world's ground.
    pub fn align_graphs_with_ground(&mut self) {
        let world = &self.world;
        for graph in self.graphs.iter_mut() {
            graph.align_with_ground(|p| world.ground_height(p));
        }
    }

    /// Adds the rules of the regulation zones containing each road keypoint to
    /// the keypoint's own rules.
    pub fn apply_zone_rules(&mut self) {
        let areas = &self.areas;
        self.graphs
            .road
            .apply_zone_rules(|p| zone_rules_at(areas, p).map_or(0, |z| z.rules));
    }

    pub fn set_car_templates(&mut self, templates: Vec<CarTemplate>) {
        self.templates.cars = templates;
    }

    pub fn set_pedestrian_templates(&mut self, templates: Vec<PedestrianTemplate>) {
        self.templates.pedestrians = templates;
    }

    pub fn set_tram_templates(&mut self, templates: Vec<TramTemplate>) {
        self.templates.trams = templates;
    }

    pub fn set_bicycle_templates(&mut self, templates: Vec<BicycleTemplate>) {
        self.templates.bicycles = templates;
    }

    pub fn car_templates(&self) -> &[CarTemplate] {
        &self.templates.cars
    }

    /// Adds an area. Stop areas start inactive unless a light group activates them.
    pub fn add_area(&mut self, area: TrafficArea) -> AreaId {
        self.areas.insert(area)
    }

    /// Removes an area, leaving any entities inside it as if they had exited.
    pub fn remove_area(&mut self, id: AreaId) -> Option<TrafficArea> {
        let area = self.areas.remove(id)?;
        for entity in self.entities.values_mut() {
            entity.state.stop_areas.retain(|a| *a != id);
            entity.state.future_stop_areas.retain(|a| *a != id);
            if area.kind() == &AreaKind::Yield && area.contains(entity.id()) {
                entity.state.yield_areas = entity.state.yield_areas.saturating_sub(1);
            }
        }
        Some(area)
    }

    pub fn area(&self, id: AreaId) -> Option<&TrafficArea> {
        self.areas.get(id)
    }

    pub fn area_mut(&mut self, id: AreaId) -> Option<&mut TrafficArea> {
        self.areas.get_mut(id)
    }

    pub fn iter_areas(&self) -> impl Iterator<Item = (AreaId, &TrafficArea)> {
        self.areas.iter()
    }

    /// Adds a light group and sets its stop areas to match its state.
    pub fn add_light_group(&mut self, group: TrafficLightGroup) -> LightGroupId {
        group.apply(&mut self.areas);
        self.light_groups.insert(group)
    }

    pub fn light_group(&self, id: LightGroupId) -> Option<&TrafficLightGroup> {
        self.light_groups.get(id)
    }

    pub fn iter_light_groups(&self) -> impl Iterator<Item = (LightGroupId, &TrafficLightGroup)> {
        self.light_groups.iter()
    }

    /// Creates an intersection which cycles the given light groups in order,
    /// and starts the first group's cycle.
    pub fn add_intersection(&mut self, groups: Vec<LightGroupId>) -> IntersectionId {
        let id = self.intersections.insert(IntersectionController::new(groups));
        self.intersections[id].connect(id, &mut self.light_groups, &mut self.areas);
        id
    }

    pub fn intersection(&self, id: IntersectionId) -> Option<&IntersectionController> {
        self.intersections.get(id)
    }

    pub fn iter_intersections(&self) -> impl Iterator<Item = (IntersectionId, &IntersectionController)> {
        self.intersections.iter()
    }

    /// Creates a tram crossing whose lights turn their groups red while a tram
    /// occupies the matching area.
    pub fn add_tram_intersection(&mut self, lights: Vec<TramLight>) -> TramIntersectionId {
        let controller = TramIntersectionController::new(lights);
        controller.connect(&mut self.light_groups, &mut self.areas);
        self.tram_intersections.insert(controller)
    }

    pub fn tram_intersection(&self, id: TramIntersectionId) -> Option<&TramIntersectionController> {
        self.tram_intersections.get(id)
    }

    pub fn iter_tram_intersections(
        &self,
    ) -> impl Iterator<Item = (TramIntersectionId, &TramIntersectionController)> {
        self.tram_intersections.iter()
    }

    /// Sets how long a light group stays green.
    pub fn set_green_duration(&mut self, id: LightGroupId, seconds: f64) {
        match self.light_groups.get_mut(id) {
            Some(group) => group.set_green_duration(seconds),
            None => warn!("No light group {:?}", id),
        }
    }

    /// Turns every light of an intersection red and restarts the cycle at the given group.
    pub fn reset_intersection(&mut self, id: IntersectionId, cycling_group: usize) {
        if let Some(intersection) = self.intersections.get_mut(id) {
            intersection.set_cycling_group(cycling_group);
            intersection.reset_lights(&mut self.light_groups, &mut self.areas);
        }
    }

    pub fn parking(&self) -> &ParkingController {
        &self.parking
    }

    pub fn parking_mut(&mut self) -> &mut ParkingController {
        &mut self.parking
    }

    pub fn add_parking_space(&mut self, space: ParkingSpace) -> ParkingSpaceId {
        self.parking.add_space(space)
    }

    /// Gets the current simulation frame index.
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Gets a reference to the entity with the given ID, if it still exists.
    pub fn entity(&self, id: EntityId) -> Option<&TrafficEntity> {
        self.entities.get(id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut TrafficEntity> {
        self.entities.get_mut(id)
    }

    /// Returns an iterator over all the entities in the simulation.
    pub fn iter_entities(&self) -> impl Iterator<Item = &TrafficEntity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// The nearest entity ahead of the first pawn and facing roughly the same way.
    pub fn entity_in_front_of_pawn(&self) -> Option<EntityId> {
        self.entity_in_front_of_pawn
    }

    /// The entities currently simulated in high detail.
    pub fn near_entities(&self) -> &[EntityId] {
        &self.near_entities
    }

    /// Takes the events raised since the last call.
    pub fn drain_events(&mut self) -> impl Iterator<Item = TrafficEvent> + '_ {
        self.events.drain(..)
    }

    /// Gets the debugging information for the previously simulated frame as JSON array.
    #[cfg(feature = "debug")]
    pub fn debug(&mut self) -> serde_json::Value {
        self.debug.clone()
    }

    /// The rules applying at a point: the default rules merged with every
    /// regulation zone containing the point.
    pub fn regulation_rules_at(&self, point: Point3d) -> ZoneRules {
        match zone_rules_at(&self.areas, point) {
            Some(rules) => self.config.default_zone_rules + rules,
            None => self.config.default_zone_rules,
        }
    }

    /// The speed limit at a point in cm/s.
    pub fn regulated_speed_at(&self, point: Point3d) -> f64 {
        self.regulation_rules_at(point).speed_limit
    }

    /// Finds the cars and pawns whose positions lie in a box centred at `centre`,
    /// `length` long in the direction `forward` and `width` wide.
    pub fn entities_in_area(
        &self,
        centre: Point3d,
        forward: Vector3d,
        length: f64,
        width: f64,
    ) -> Vec<AreaOccupant> {
        occupants_in_area(&self.entities, &self.pawns, centre, forward, length, width, None)
    }

    /// Advances the simulation by `dt` seconds.
    pub fn tick(&mut self, dt: f64, input: &FrameInput) {
        self.pawns.clone_from(&input.pawns);
        self.update_lights(dt);
        self.plan_overtakes();
        let path_events = self.step_entities(dt);
        self.update_areas();
        self.resolve_right_of_way(input);
        self.handle_path_events(path_events);
        self.frame += 1;

        #[cfg(feature = "debug")]
        {
            self.debug = take_debug_frame();
        }
    }

    fn update_lights(&mut self, dt: f64) {
        let areas = &mut self.areas;
        let finished = self
            .light_groups
            .values_mut()
            .filter_map(|group| if group.step(dt, areas) { group.intersection() } else { None })
            .collect::<Vec<_>>();
        for id in finished {
            if let Some(intersection) = self.intersections.get_mut(id) {
                intersection.cycle_finished(&mut self.light_groups, &mut self.areas);
            }
        }
        for tram_intersection in self.tram_intersections.values_mut() {
            tram_intersection.step(dt, &mut self.light_groups, &mut self.areas);
        }
    }

    /// Lets near cars which are due consider overtaking.
    fn plan_overtakes(&mut self) {
        let due = self
            .entities
            .iter_mut()
            .filter(|(_, e)| e.state.simulate && e.state.near)
            .filter_map(|(id, e)| match &mut e.kind {
                EntityKind::Car(car) => car.overtake_due().then_some(id),
                _ => None,
            })
            .collect::<Vec<_>>();

        let graph = &self.graphs.road;
        for id in due {
            let plan = {
                let entity = &self.entities[id];
                let car = match &entity.kind {
                    EntityKind::Car(car) => car,
                    _ => continue,
                };
                let (entities, pawns) = (&self.entities, &self.pawns);
                car.plan_overtake(
                    &entity.state,
                    graph,
                    |centre, forward, length| {
                        occupants_in_area(
                            entities,
                            pawns,
                            centre,
                            forward,
                            length,
                            crate::entity::AREA_CHECK_WIDTH,
                            Some(id),
                        )
                    },
                    &mut self.rng,
                )
            };
            if let (Some(path), Some(entity)) = (plan, self.entities.get_mut(id)) {
                if let EntityKind::Car(car) = &mut entity.kind {
                    car.apply_overtake(path, graph);
                }
            }
        }
    }

    fn step_entities(&mut self, dt: f64) -> Vec<(EntityId, PathEvent)> {
        let mut events = vec![];
        for (id, entity) in self.entities.iter_mut() {
            let mut ctx = StepContext {
                graph: self.graphs.get(entity.class().graph()),
                world: self.world.as_ref(),
                rng: &mut self.rng,
            };
            if let Some(event) = entity.step(dt, &mut ctx) {
                events.push((id, event));
            }
        }
        events
    }

    /// Updates area memberships and applies their effects.
    fn update_areas(&mut self) {
        let mut actions = vec![];
        for (entity_id, entity) in self.entities.iter_mut() {
            if !entity.state.simulate {
                continue;
            }
            let class = entity.class();
            for (area_id, area) in self.areas.iter_mut() {
                if !area.applies_to(class) {
                    continue;
                }
                let changes =
                    area.update(entity_id, &entity.state.collision, &entity.state.future_collision);
                for change in changes {
                    entity.on_area_change(area_id, area, change);
                    let event = match (*area.kind(), change) {
                        (AreaKind::Stop { .. }, AreaChange::Entered) => {
                            Some(TrafficEvent::EnteredStopArea { entity: entity_id, area: area_id })
                        }
                        (AreaKind::Stop { .. }, AreaChange::Exited) => {
                            Some(TrafficEvent::ExitedStopArea { entity: entity_id, area: area_id })
                        }
                        (AreaKind::Yield, AreaChange::Entered) => {
                            Some(TrafficEvent::EnteredYieldArea { entity: entity_id, area: area_id })
                        }
                        (AreaKind::Yield, AreaChange::Exited) => {
                            Some(TrafficEvent::ExitedYieldArea { entity: entity_id, area: area_id })
                        }
                        (AreaKind::Regulation(rules), AreaChange::Entered) => {
                            actions.push(AreaAction::Regulate(entity_id, Some(rules.speed_limit)));
                            None
                        }
                        (AreaKind::Regulation(_), AreaChange::Exited) => {
                            actions.push(AreaAction::Regulate(entity_id, None));
                            None
                        }
                        (AreaKind::Park { space, parking_rules }, AreaChange::Entered) => {
                            actions.push(AreaAction::Park(entity_id, space, parking_rules));
                            None
                        }
                        _ => None,
                    };
                    self.events.extend(event);
                }
            }
            entity.refresh_stop_state(&self.areas);
        }

        for action in actions {
            match action {
                AreaAction::Regulate(id, limit) => self.regulate(id, limit),
                AreaAction::Park(id, space, rules) => self.try_park(id, space, rules),
            }
        }
    }

    fn regulate(&mut self, id: EntityId, limit: Option<f64>) {
        let limit = match (limit, self.entities.get(id)) {
            (Some(limit), _) => limit,
            (None, Some(entity)) => self.regulated_speed_at(entity.position()),
            (None, None) => return,
        };
        if let Some(entity) = self.entities.get_mut(id) {
            if let EntityKind::Car(car) = &mut entity.kind {
                if car.parking_into().is_none() {
                    let speed = limit * car.driver().speed_multiplier;
                    car.set_target_speed(speed);
                }
            }
        }
    }

    /// Sends a car into a parking space if it is allowed and able to park there.
    fn try_park(&mut self, id: EntityId, space_id: ParkingSpaceId, parking_rules: u32) {
        let entity = match self.entities.get_mut(id) {
            Some(entity) => entity,
            None => return,
        };
        let exceptions = entity.state.rule_exceptions;
        let (position, rotation) = (entity.state.position, entity.state.rotation);
        let car = match &mut entity.kind {
            EntityKind::Car(car) => car,
            _ => return,
        };
        if parking_rules & exceptions != parking_rules
            || car.parking_into().is_some()
            || car.follower().point() <= MIN_TRAVERSED
        {
            return;
        }
        let space = match self.parking.space(space_id) {
            Some(space) if space.available() => space,
            _ => return,
        };
        let route = match space.parking_path(position, rotation, car.wheelbase(), &self.graphs.road) {
            Some(route) => route,
            None => return,
        };
        if self.parking.reserve(space_id, id) {
            debug!("Car {:?} starts parking", id);
            car.begin_parking(space_id, route, &self.graphs.road);
        }
    }

    /// Resolves right-of-way between every pair of simulated entities, and
    /// chooses the high detail entities.
    fn resolve_right_of_way(&mut self, input: &FrameInput) {
        let (ids, snapshots): (Vec<EntityId>, Vec<EntitySnapshot>) = self
            .entities
            .iter()
            .filter(|(_, e)| e.state.simulate)
            .map(|(id, e)| (id, e.snapshot()))
            .unzip();

        let view = input
            .camera
            .as_ref()
            .map(|c| View::new(c, self.config.far_distance, self.config.low_detail_outside_camera));
        for obstacle in &input.obstacles {
            debug_point("obstacle", *obstacle);
        }
        let world = self.world.as_ref();
        let evaluate = |i: usize| evaluate_entity(i, &snapshots, input, view.as_ref(), world);
        let results: Vec<PassResult> = if self.config.parallel {
            (0..snapshots.len()).into_par_iter().map(evaluate).collect()
        } else {
            (0..snapshots.len()).map(evaluate).collect()
        };

        // Static entities only take part in the in-front-of-pawn search.
        let statics = self
            .entities
            .iter()
            .filter(|(_, e)| !e.state.simulate)
            .filter_map(|(id, e)| Some((id, in_front_of_pawn(e.collision(), &input.pawns)?)));
        self.entity_in_front_of_pawn = ids
            .iter()
            .zip(&results)
            .filter_map(|(id, r)| Some((*id, r.in_front_of_pawn?)))
            .chain(statics)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id);

        let near = match view {
            Some(_) => {
                let candidates = results
                    .iter()
                    .enumerate()
                    .filter_map(|(i, r)| Some((i, r.near_candidate?)));
                lod::nearest(candidates, self.config.max_high_detail)
            }
            None => (0..ids.len()).collect(),
        };
        let mut is_near = vec![false; ids.len()];
        for i in near {
            is_near[i] = true;
        }

        self.near_entities.clear();
        for (id, result, near) in izip!(&ids, &results, is_near) {
            let entity = &mut self.entities[*id];
            entity.state.blocked = result.blocked;
            entity.state.blocked_by_future_pawn = result.blocked_by_future_pawn;
            if result.blocked_by_mover {
                if let EntityKind::Bicycle(bike) = &entity.kind {
                    bike.slow_for_mover(&mut entity.state);
                }
            }
            if result.blocked {
                debug_rect("blocked", &entity.state.future_collision);
            }
            if near {
                self.near_entities.push(*id);
            }
            if near != entity.state.near {
                entity.state.near = near;
                trace!("Entity {:?} near: {}", id, near);
                self.events.push(if near {
                    TrafficEvent::Near(*id)
                } else {
                    TrafficEvent::Far(*id)
                });
            }
        }
    }

    fn handle_path_events(&mut self, events: Vec<(EntityId, PathEvent)>) {
        for (id, event) in events {
            match event {
                PathEvent::Respawn => self.respawn(id),
                PathEvent::Parked(space) => self.finish_parking(id, space),
            }
        }
        for id in std::mem::take(&mut self.invalidated) {
            self.retire(id);
        }
    }

    /// Converts a car which reached the end of its parking path into a parked car.
    fn finish_parking(&mut self, id: EntityId, space: ParkingSpaceId) {
        let parked = match self.entities.get(id) {
            Some(entity) => crate::parking::ParkedCar {
                template: entity.template(),
                variant: entity.variant(),
            },
            None => return,
        };
        if self.parking.finish_parking(space, id, parked) {
            debug!("Car {:?} parked", id);
            self.events.push(TrafficEvent::Parked { entity: id, space });
        } else {
            self.parking.cancel(space, id);
        }
        self.respawn_car(id);
    }

    /// Sends a car along the shortest road from the keypoint nearest `start` to
    /// the keypoint nearest `end`, then on a random walk. The car first drives
    /// from where it stands to the start of the route.
    pub fn set_route(&mut self, id: EntityId, start: Point3d, end: Point3d) -> bool {
        let graph = &self.graphs.road;
        let (Some(from), Some(to)) = (graph.closest_keypoint(start), graph.closest_keypoint(end)) else {
            warn!("Cannot route without road keypoints");
            return false;
        };
        let Some(entity) = self.entities.get_mut(id) else {
            return false;
        };
        let exceptions = entity.rule_exceptions();
        let mut path = graph.find_path(from, to, exceptions, &mut self.rng);
        let continuation = graph.random_path_from(to, exceptions, &mut self.rng);
        path.append(&continuation.slice(1..continuation.len()));
        path.insert_custom(0, entity.position());
        entity.apply_custom_path(path, 0, 0.0, graph);
        true
    }

    pub(crate) fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Retires an entity immediately, returning false if it no longer exists.
    pub fn retire(&mut self, id: EntityId) -> bool {
        let entity = match self.entities.remove(id) {
            Some(entity) => entity,
            None => return false,
        };
        for area in self.areas.values_mut() {
            area.forget(id);
        }
        if let EntityKind::Car(car) = entity.kind() {
            if let Some(space) = car.parking_into() {
                self.parking.cancel(space, id);
            }
        }
        if self.entity_in_front_of_pawn == Some(id) {
            self.entity_in_front_of_pawn = None;
        }
        self.near_entities.retain(|e| *e != id);
        self.events.push(TrafficEvent::Retired(id));
        true
    }

    /// Retires an entity at the end of the next tick.
    pub fn invalidate(&mut self, id: EntityId) {
        if self.entities.contains_key(id) && !self.invalidated.contains(&id) {
            self.invalidated.push(id);
        }
    }

    /// Retires every entity.
    pub fn delete_all_entities(&mut self) {
        let ids = self.entities.keys().collect::<Vec<_>>();
        for id in ids {
            self.retire(id);
        }
        self.invalidated.clear();
    }
}

/// The merged rules of every regulation zone containing a point.
fn zone_rules_at(areas: &AreaSet, point: Point3d) -> Option<ZoneRules> {
    areas
        .values()
        .filter(|a| a.rect().contains_point(flatten(point)))
        .filter_map(|a| match a.kind() {
            AreaKind::Regulation(rules) => Some(*rules),
            _ => None,
        })
        .reduce(|a, b| a + b)
}

/// Finds the cars and pawns inside a box, excluding the entity `exclude`.
fn occupants_in_area(
    entities: &EntitySet,
    pawns: &[CollisionRectangle],
    centre: Point3d,
    forward: Vector3d,
    length: f64,
    width: f64,
    exclude: Option<EntityId>,
) -> Vec<AreaOccupant> {
    let dir = flatten_vec(forward);
    let area = CollisionRectangle::new(
        Vector3d::new(length, width, 1.0),
        centre,
        rotation_from_direction(Vector3d::new(dir.x, dir.y, 0.0)),
    );
    debug_line("area", centre - forward * length * 0.5, centre + forward * length * 0.5);

    let cars = entities
        .iter()
        .filter(|(id, e)| Some(*id) != exclude && e.class() == EntityClass::Car)
        .filter(|(_, e)| area.contains_point(flatten(e.position())))
        .map(|(id, e)| AreaOccupant {
            entity: Some(id),
            speed: e.speed(),
            rotation: e.rotation(),
        });
    let pawns = pawns
        .iter()
        .filter(|p| area.contains_point(flatten(p.position())))
        .map(|p| AreaOccupant {
            entity: None,
            speed: PAWN_SPEED,
            rotation: p.rotation(),
        });
    cars.chain(pawns).collect()
}

/// The squared distance from the first pawn to a box ahead of it and facing the same way.
fn in_front_of_pawn(rect: &CollisionRectangle, pawns: &[CollisionRectangle]) -> Option<f64> {
    let pawn = pawns.first()?;
    let relative = rect.position() - pawn.position();
    let ahead = forward(pawn.rotation()).dot(safe_normalize(relative)) > IN_FRONT_COS;
    if ahead && angular_distance(pawn.rotation(), rect.rotation()) < IN_FRONT_MAX_ANGLE {
        Some(relative.magnitude2())
    } else {
        None
    }
}

/// Runs the right-of-way tests of one entity against everything else.
fn evaluate_entity(
    i: usize,
    snapshots: &[EntitySnapshot],
    input: &FrameInput,
    view: Option<&View>,
    world: &dyn World,
) -> PassResult {
    let a = &snapshots[i];
    let mut result = PassResult::default();
    for (j, b) in snapshots.iter().enumerate() {
        if i != j && blocked_by(a, b) {
            result.blocked = true;
            result.blocked_by_mover |= b.moving;
        }
    }
    result.blocked |= input.obstacles.iter().any(|p| point_blocks(&a.future, *p));
    result.blocked_by_future_pawn = input.pawns.iter().any(|p| pawn_blocks(&a.future, p));
    result.in_front_of_pawn = in_front_of_pawn(&a.current, &input.pawns);
    result.near_candidate = view
        .filter(|v| v.is_candidate(&a.current, world))
        .map(|v| v.distance(&a.current));
    result
}
