//! Creating entities, and replacing them once they finish their paths.

use super::{TrafficController, TrafficEvent};
use crate::entity::{
    Bicycle, Car, EntityClass, EntityKind, EntityState, Pedestrian, TrafficEntity, Tram,
};
use crate::math::{forward, Orientation, Point3d, Vector3d};
use crate::EntityId;
use cgmath::prelude::*;
use cgmath::Quaternion;
use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;

/// Spreads initial spawns over the candidate keypoints without repeating any.
const PRIME: usize = 524_287;

/// How many keypoints a car tries before giving up on spawning.
const SPAWN_ATTEMPTS: usize = 50;

fn pick_variant<R: Rng + ?Sized>(variants: &[u32], rng: &mut R) -> u32 {
    variants.choose(rng).copied().unwrap_or(0)
}

impl TrafficController {
    /// Adds an entity. Simulated entities start a path from their position,
    /// static ones stay where they are put.
    fn insert_entity(
        &mut self,
        mut state: EntityState,
        kind: EntityKind,
        position: Point3d,
        rotation: Orientation,
        simulate: bool,
    ) -> EntityId {
        state.position = position;
        state.rotation = rotation;
        state.direction = forward(rotation);
        state.simulate = simulate;
        let seq = self.seq;
        self.seq += 1;

        let Self { entities, graphs, rng, events, .. } = self;
        let graph = graphs.get(kind.class().graph());
        let id = entities.insert_with_key(|id| TrafficEntity::new(id, seq, state, kind));
        let entity = &mut entities[id];
        entity.teleport(position, rotation);
        if simulate {
            entity.start(graph, rng);
            entity.place_on_path(graph);
        }
        debug!("Spawned {:?} {:?}", entity.class(), id);
        events.push(TrafficEvent::Spawned(id));
        id
    }

    /// Spawns a car from a particular template, with a random variant if none is given.
    pub(crate) fn spawn_car_with(
        &mut self,
        template: usize,
        variant: Option<u32>,
        position: Point3d,
        rotation: Orientation,
        simulate: bool,
    ) -> Option<EntityId> {
        let Some(t) = self.templates.cars.get(template) else {
            warn!("No car template {}", template);
            return None;
        };
        let car = Car::new(t, self.config.allow_s_curves, &mut self.rng);
        let variant = variant.unwrap_or_else(|| pick_variant(&t.variants, &mut self.rng));
        let mut state = EntityState::new(t.dimensions, t.rule_exceptions, variant);
        state.template = template;
        Some(self.insert_entity(state, EntityKind::Car(car), position, rotation, simulate))
    }

    /// Spawns a car from a random template.
    pub fn spawn_car(&mut self, position: Point3d, rotation: Orientation, simulate: bool) -> Option<EntityId> {
        if self.templates.cars.is_empty() {
            warn!("Cannot spawn a car without car templates");
            return None;
        }
        let template = self.rng.gen_range(0..self.templates.cars.len());
        self.spawn_car_with(template, None, position, rotation, simulate)
    }

    /// Spawns a pedestrian standing on `position`.
    pub fn spawn_pedestrian(
        &mut self,
        position: Point3d,
        rotation: Orientation,
        simulate: bool,
    ) -> Option<EntityId> {
        if self.templates.pedestrians.is_empty() {
            warn!("Cannot spawn a pedestrian without pedestrian templates");
            return None;
        }
        let index = self.rng.gen_range(0..self.templates.pedestrians.len());
        let template = &self.templates.pedestrians[index];
        let ped = Pedestrian::new(template);
        let variant = pick_variant(&template.variants, &mut self.rng);
        let mut state = EntityState::new(template.dimensions, template.rule_exceptions, variant);
        state.template = index;
        let centre = position + Vector3d::unit_z() * template.dimensions.z * 0.5;
        Some(self.insert_entity(state, EntityKind::Pedestrian(ped), centre, rotation, simulate))
    }

    /// Spawns a tram, which faces along the tramway once simulated.
    pub fn spawn_tram(&mut self, position: Point3d, simulate: bool) -> Option<EntityId> {
        if self.templates.trams.is_empty() {
            warn!("Cannot spawn a tram without tram templates");
            return None;
        }
        let index = self.rng.gen_range(0..self.templates.trams.len());
        let template = &self.templates.trams[index];
        let tram = Tram::new(template, self.config.allow_s_curves);
        let variant = pick_variant(&template.variants, &mut self.rng);
        let mut state = EntityState::new(template.dimensions, template.rule_exceptions, variant);
        state.template = index;
        let rotation = Quaternion::from_sv(1.0, Vector3d::zero());
        Some(self.insert_entity(state, EntityKind::Tram(tram), position, rotation, simulate))
    }

    pub fn spawn_bicycle(
        &mut self,
        position: Point3d,
        rotation: Orientation,
        simulate: bool,
    ) -> Option<EntityId> {
        if self.templates.bicycles.is_empty() {
            warn!("Cannot spawn a bicycle without bicycle templates");
            return None;
        }
        let index = self.rng.gen_range(0..self.templates.bicycles.len());
        let template = &self.templates.bicycles[index];
        let bike = Bicycle::new(template);
        let variant = pick_variant(&template.variants, &mut self.rng);
        let mut state = EntityState::new(template.dimensions, template.rule_exceptions, variant);
        state.template = index;
        Some(self.insert_entity(state, EntityKind::Bicycle(bike), position, rotation, simulate))
    }

    /// Spawns an entity of the given class at a random spawn point of its graph.
    pub fn spawn_at_spawn_point(&mut self, class: EntityClass) -> Option<EntityId> {
        let graph = self.graphs.get(class.graph());
        let Some(spawn) = graph.random_spawn_point(&mut self.rng) else {
            warn!("No {:?} graph to spawn a {:?} on", class.graph(), class);
            return None;
        };
        let position = graph.position(spawn)?;
        let rotation = graph.keypoint_rotation(spawn);
        match class {
            EntityClass::Car => self.spawn_car(position, rotation, true),
            EntityClass::Pedestrian => self.spawn_pedestrian(position, rotation, true),
            EntityClass::Tram => self.spawn_tram(position, true),
            EntityClass::Bicycle => self.spawn_bicycle(position, rotation, true),
        }
    }

    /// Replaces an entity which has nowhere left to go.
    pub(super) fn respawn(&mut self, id: EntityId) {
        match self.entities.get(id).map(|e| e.class()) {
            Some(EntityClass::Car) => {
                self.respawn_car(id);
            }
            Some(class) => {
                self.retire(id);
                self.spawn_at_spawn_point(class);
            }
            None => {}
        }
    }

    /// Retires a car and replaces it, either by pulling a parked car out of
    /// its space or by spawning a new car at a spawn point.
    pub fn respawn_car(&mut self, id: EntityId) -> Option<EntityId> {
        self.retire(id);
        let chance = self.config.parked_departure_chance.clamp(0.0, 1.0);
        if self.rng.gen_bool(chance) {
            if let Some(departed) = self.depart_parked_car() {
                return Some(departed);
            }
        }
        self.spawn_at_spawn_point(EntityClass::Car)
    }

    /// Turns a random parked car back into traffic. The car waits in its space
    /// until the road behind it is clear.
    pub fn depart_parked_car(&mut self) -> Option<EntityId> {
        let (space_id, parked) = self.parking.depart_random(&mut self.rng)?;
        let route = match (self.parking.space(space_id), self.templates.cars.get(parked.template)) {
            (Some(space), Some(template)) => space.departure_path(
                template.wheelbase,
                template.rule_exceptions,
                &self.graphs.road,
                &mut self.rng,
            ),
            _ => None,
        };
        let Some(route) = route else {
            debug!("Parked car has no way out of its space");
            self.parking.park(space_id, parked);
            return None;
        };
        let space = self.parking.space(space_id)?;
        let (position, rotation) = (space.position(), space.rotation());

        let id = self.spawn_car_with(parked.template, Some(parked.variant), position, rotation, false)?;
        let graph = &self.graphs.road;
        let entity = self.entities.get_mut(id)?;
        entity.state.simulate = true;
        entity.apply_custom_path(route.path, route.start_point, 0.0, graph);
        if let (EntityKind::Car(car), Some(until)) = (&mut entity.kind, route.reverse_until) {
            car.reverse_until_point(until);
        }
        entity.place_on_path(graph);
        entity.set_instant_speed(0.0);
        if let EntityKind::Car(car) = &mut entity.kind {
            car.set_target_speed(car.driver().max_speed);
            car.wait_for_unobstructed_depart(&mut entity.state, route.check_dimensions, route.check_offset);
        }
        debug!("Parked car departs as {:?}", id);
        self.events.push(TrafficEvent::Departed { entity: id, space: space_id });
        Some(id)
    }

    /// Replaces every entity with freshly spawned traffic, and refills the
    /// parking spaces.
    pub fn begin_simulate_traffic(&mut self) {
        self.delete_all_entities();
        self.parking.clear_all();
        let density = self.config.parking_density;
        self.parking.spawn_parked(density, &self.templates.cars, &mut self.rng);

        let seed = self.rng.gen_range(0..PRIME);
        self.spawn_initial_cars(seed);
        self.spawn_initial_trams();
        self.spawn_initial_shared_use(seed);
    }

    fn spawn_initial_cars(&mut self, seed: usize) {
        let count = self.config.cars;
        if count == 0 {
            return;
        }
        if self.templates.cars.is_empty() {
            warn!("No car templates, can't spawn cars");
            return;
        }

        // Fewer cars get more room each.
        let margin = (1e7 * (count as f64).powf(-1.4) + 300.0).clamp(0.0, 4000.0);
        let graph = &self.graphs.road;
        let mut candidates = graph.keypoints_with_margin(margin, &mut self.rng);
        for (centre, range) in &self.config.spawn_exclusions {
            graph.remove_keypoints_by_range(&mut candidates, *centre, *range);
        }
        if candidates.is_empty() {
            warn!("No road keypoints, can't spawn cars");
            return;
        }

        let mut spawn_number = 0;
        for _ in 0..count {
            let template = self.rng.gen_range(0..self.templates.cars.len());
            let exceptions = self.templates.cars[template].rule_exceptions;
            for _ in 0..SPAWN_ATTEMPTS {
                let kp = candidates[(spawn_number * PRIME + seed) % candidates.len()];
                spawn_number += 1;
                if !self.graphs.road.compare_rules(kp, exceptions) {
                    continue;
                }
                if let Some(position) = self.graphs.road.position(kp) {
                    let rotation = self.graphs.road.keypoint_rotation(kp);
                    self.spawn_car_with(template, None, position, rotation, true);
                }
                break;
            }
        }
    }

    /// Spaces trams evenly along the tramway keypoints.
    fn spawn_initial_trams(&mut self) {
        let count = self.config.trams;
        let len = self.graphs.tramway.len();
        if count == 0 {
            return;
        }
        if len == 0 {
            warn!("No tramway keypoints, can't spawn trams");
            return;
        }
        let offset = self.rng.gen_range(0..len) / count;
        for i in 0..count {
            let index = (len * i / count + offset) % len;
            if let Some(position) = self.graphs.tramway.position(index) {
                self.spawn_tram(position, true);
            }
        }
    }

    fn spawn_initial_shared_use(&mut self, seed: usize) {
        let (pedestrians, bicycles) = (self.config.pedestrians, self.config.bicycles);
        let len = self.graphs.shared_use.len();
        if pedestrians + bicycles == 0 {
            return;
        }
        if len == 0 {
            warn!("No shared use keypoints, can't spawn pedestrians or bicycles");
            return;
        }
        let identity = Quaternion::from_sv(1.0, Vector3d::zero());
        for i in 0..pedestrians + bicycles {
            let kp = (i * PRIME + seed) % len;
            let Some(position) = self.graphs.shared_use.position(kp) else {
                continue;
            };
            if i < pedestrians {
                self.spawn_pedestrian(position, identity, true);
            } else {
                self.spawn_bicycle(position, identity, true);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{CarTemplate, PedestrianTemplate, TrafficConfig, TramTemplate};
    use crate::graph::test::{line_graph, ring_graph};
    use crate::graph::GraphKind;
    use crate::math::{distance_2d, rotation_from_direction};
    use crate::parking::{ParkedCar, ParkingSpace};
    use assert_approx_eq::assert_approx_eq;

    fn controller(config: TrafficConfig) -> TrafficController {
        let mut controller = TrafficController::with_seed(
            TrafficConfig {
                parallel: false,
                ..config
            },
            11,
        );
        controller.set_car_templates(vec![CarTemplate::default()]);
        controller.set_pedestrian_templates(vec![PedestrianTemplate::default()]);
        controller.set_tram_templates(vec![TramTemplate::default()]);
        controller
    }

    fn empty_config() -> TrafficConfig {
        TrafficConfig {
            cars: 0,
            pedestrians: 0,
            bicycles: 0,
            trams: 0,
            ..TrafficConfig::default()
        }
    }

    #[test]
    fn missing_template_spawns_nothing() {
        let mut controller = controller(empty_config());
        controller.set_graph(GraphKind::SharedUse, line_graph(3));
        let identity = Quaternion::from_sv(1.0, Vector3d::zero());
        assert!(controller.spawn_bicycle(Point3d::origin(), identity, true).is_none());
        assert_eq!(controller.entity_count(), 0);
        assert_eq!(controller.drain_events().count(), 0);
    }

    #[test]
    fn static_entities_stay_put() {
        let mut controller = controller(empty_config());
        controller.set_graph(GraphKind::Road, line_graph(3));
        let rotation = rotation_from_direction(Vector3d::unit_y());
        let id = controller
            .spawn_car(Point3d::new(300.0, 400.0, 0.0), rotation, false)
            .unwrap();
        let entity = controller.entity(id).unwrap();
        assert!(!entity.simulated());
        assert_approx_eq!(entity.position().x, 300.0);
        assert_approx_eq!(entity.collision().position().z, 75.0);
        assert_approx_eq!(entity.move_direction().y, 1.0);
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut controller = controller(empty_config());
        controller.set_graph(GraphKind::Road, line_graph(5));
        let a = controller.spawn_car(Point3d::new(0.0, 0.0, 0.0), Orientation::from_sv(1.0, Vector3d::zero()), true).unwrap();
        let b = controller.spawn_car(Point3d::new(2000.0, 0.0, 0.0), Orientation::from_sv(1.0, Vector3d::zero()), true).unwrap();
        assert!(controller.entity(a).unwrap().seq() < controller.entity(b).unwrap().seq());
    }

    #[test]
    fn respawned_car_replaces_the_old_one() {
        let mut controller = controller(TrafficConfig {
            parked_departure_chance: 0.0,
            ..empty_config()
        });
        controller.set_graph(GraphKind::Road, line_graph(5));
        let old = controller.spawn_at_spawn_point(EntityClass::Car).unwrap();
        let new = controller.respawn_car(old).unwrap();
        assert_ne!(old, new);
        assert!(controller.entity(old).is_none());
        assert_eq!(controller.entity_count(), 1);
        let events = controller.drain_events().collect::<Vec<_>>();
        assert_eq!(
            events,
            vec![
                TrafficEvent::Spawned(old),
                TrafficEvent::Retired(old),
                TrafficEvent::Spawned(new)
            ]
        );
    }

    #[test]
    fn parked_car_departs_into_traffic() {
        let mut controller = controller(TrafficConfig {
            parked_departure_chance: 1.0,
            ..empty_config()
        });
        controller.set_graph(GraphKind::Road, line_graph(10));
        let space = controller.add_parking_space(ParkingSpace::new(
            Point3d::new(4000.0, -400.0, 0.0),
            rotation_from_direction(Vector3d::unit_x()),
            Point3d::new(3000.0, 0.0, 0.0),
            Point3d::new(6000.0, 0.0, 0.0),
        ));
        assert!(controller.parking_mut().park(space, ParkedCar { template: 0, variant: 3 }));

        let old = controller.spawn_at_spawn_point(EntityClass::Car).unwrap();
        let id = controller.respawn_car(old).unwrap();
        let car = controller.entity(id).unwrap();
        assert!(car.simulated());
        assert!(car.waiting_to_depart());
        assert_eq!(car.variant(), 3);
        assert_approx_eq!(car.speed(), 0.0);
        assert!(controller.parking().space(space).unwrap().occupant().is_none());
        let events = controller.drain_events().collect::<Vec<_>>();
        assert_eq!(events.last(), Some(&TrafficEvent::Departed { entity: id, space }));
    }

    #[test]
    fn car_backs_out_of_a_lot_bay() {
        let mut controller = controller(TrafficConfig {
            parked_departure_chance: 1.0,
            ..empty_config()
        });
        controller.set_graph(GraphKind::Road, line_graph(10));
        // Nose away from the road, so the car has to reverse out.
        let space = controller.add_parking_space(ParkingSpace::lot(
            Point3d::new(4000.0, -1500.0, 0.0),
            rotation_from_direction(-Vector3d::unit_y()),
            Point3d::new(3000.0, 0.0, 0.0),
            Point3d::new(6000.0, 0.0, 0.0),
        ));
        assert!(controller.parking_mut().park(space, ParkedCar { template: 0, variant: 3 }));

        let old = controller.spawn_at_spawn_point(EntityClass::Car).unwrap();
        let id = controller.respawn_car(old).unwrap();
        let entity = controller.entity(id).unwrap();
        let EntityKind::Car(car) = entity.kind() else {
            panic!("departed entity is not a car");
        };
        assert!(car.reversing());
        assert!(car.waiting_to_depart());
        assert!(forward(entity.rotation()).y < -0.9);
        assert!(distance_2d(entity.position(), Point3d::new(4000.0, -1500.0, 0.0)) < 100.0);
    }

    #[test]
    fn initial_traffic_fills_every_graph() {
        let mut controller = controller(TrafficConfig {
            cars: 4,
            pedestrians: 3,
            trams: 2,
            ..empty_config()
        });
        controller.set_graph(GraphKind::Road, ring_graph(60, 20000.0));
        controller.set_graph(GraphKind::SharedUse, ring_graph(20, 5000.0));
        controller.set_graph(GraphKind::Tramway, ring_graph(30, 8000.0));
        controller.begin_simulate_traffic();

        let count = |class| controller.iter_entities().filter(|e| e.class() == class).count();
        assert_eq!(count(EntityClass::Car), 4);
        assert_eq!(count(EntityClass::Pedestrian), 3);
        assert_eq!(count(EntityClass::Tram), 2);
        assert_eq!(count(EntityClass::Bicycle), 0);

        // Starting again replaces everything.
        controller.begin_simulate_traffic();
        assert_eq!(controller.entity_count(), 9);
    }

    #[test]
    fn empty_graphs_are_skipped() {
        let mut controller = controller(TrafficConfig {
            cars: 5,
            pedestrians: 5,
            trams: 5,
            ..empty_config()
        });
        controller.begin_simulate_traffic();
        assert_eq!(controller.entity_count(), 0);
    }
}
