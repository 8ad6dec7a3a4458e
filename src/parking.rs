//! Parking spaces and the cars parked in them.

use crate::config::CarTemplate;
use crate::graph::KeypointGraph;
use crate::graph::KeypointPath;
use crate::math::{
    closest_point_on_segment, distance_2d, forward, safe_normalize, Orientation, Point3d, Vector3d,
};
use crate::{EntityId, ParkingSpaceId};
use cgmath::prelude::*;
use log::{debug, warn};
use rand::seq::IteratorRandom;
use rand::Rng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

/// Cars only park once they are this many points into their path.
pub const MIN_TRAVERSED: usize = 15;

/// A departing car adds a point on its lane if the lane is further away than this.
const LANE_CORRECTION_DISTANCE: f64 = 1100.0;

/// The area which must be clear before a parked car pulls out.
const ROADSIDE_CHECK_DIMENSIONS: Vector3d = Vector3d::new(2600.0, 1300.0, 500.0);
const LOT_CHECK_DIMENSIONS: Vector3d = Vector3d::new(1300.0, 2600.0, 500.0);

/// A car sitting in a parking space, which is not simulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParkedCar {
    /// The index of the car's template.
    pub template: usize,
    pub variant: u32,
}

/// How cars get in and out of a parking space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParkingLayout {
    /// Parallel to the lane, entered forwards from behind.
    #[default]
    Roadside,
    /// A bay in a lot, entered forwards or in reverse depending on where the
    /// car approaches from.
    Lot,
}

/// A path into a parking space.
#[derive(Clone, Debug)]
pub struct ParkingRoute {
    pub path: KeypointPath,
    /// The car starts reversing once it passes this point.
    pub reverse_from: Option<usize>,
}

/// A path out of a parking space and the box which must be clear first.
#[derive(Clone, Debug)]
pub struct DepartureRoute {
    pub path: KeypointPath,
    /// The point the car's rear axle starts on.
    pub start_point: usize,
    /// The car reverses until it passes this point.
    pub reverse_until: Option<usize>,
    pub check_dimensions: Vector3d,
    /// Offset of the checked box behind the car, in the car's frame.
    pub check_offset: Vector3d,
}

/// A parking space.
#[derive(Clone, Debug)]
pub struct ParkingSpace {
    layout: ParkingLayout,
    /// The centre of a car parked in the space.
    position: Point3d,
    /// The heading of a car parked in the space.
    rotation: Orientation,
    /// A point near the start of the lane cars park from.
    arriving_point: Point3d,
    /// A point near the keypoint cars rejoin traffic at.
    departing_point: Point3d,
    occupant: Option<ParkedCar>,
    /// The car currently driving into the space.
    incoming: Option<EntityId>,
}

impl ParkingSpace {
    /// A roadside space.
    pub fn new(
        position: Point3d,
        rotation: Orientation,
        arriving_point: Point3d,
        departing_point: Point3d,
    ) -> Self {
        Self {
            layout: ParkingLayout::Roadside,
            position,
            rotation,
            arriving_point,
            departing_point,
            occupant: None,
            incoming: None,
        }
    }

    /// A bay in a parking lot.
    pub fn lot(
        position: Point3d,
        rotation: Orientation,
        arriving_point: Point3d,
        departing_point: Point3d,
    ) -> Self {
        Self {
            layout: ParkingLayout::Lot,
            ..Self::new(position, rotation, arriving_point, departing_point)
        }
    }

    pub fn layout(&self) -> ParkingLayout {
        self.layout
    }

    pub fn position(&self) -> Point3d {
        self.position
    }

    pub fn rotation(&self) -> Orientation {
        self.rotation
    }

    pub fn occupant(&self) -> Option<ParkedCar> {
        self.occupant
    }

    pub fn incoming(&self) -> Option<EntityId> {
        self.incoming
    }

    /// Whether a car could start parking here.
    pub fn available(&self) -> bool {
        self.occupant.is_none() && self.incoming.is_none()
    }

    /// A point `x` ahead of and `y` to the side of the space's centre.
    fn at(&self, x: f64, y: f64) -> Point3d {
        self.position + self.rotation.rotate_vector(Vector3d::new(x, y, 0.0))
    }

    /// `point` in the space's frame, with x pointing the way a parked car faces.
    fn local(&self, point: Point3d) -> Vector3d {
        self.rotation.invert().rotate_vector(point - self.position)
    }

    /// Where the rear axle of a car parked in the space rests.
    fn rest_point(&self, wheelbase: f64) -> Point3d {
        self.position - forward(self.rotation) * wheelbase * 0.5
    }

    /// Plans the path of a car driving into this space.
    ///
    /// The car's rear axle follows the path and stops half a wheelbase behind
    /// the space's centre, so the car comes to rest centred in the space.
    pub fn parking_path(
        &self,
        car_position: Point3d,
        car_rotation: Orientation,
        wheelbase: f64,
        graph: &KeypointGraph,
    ) -> Option<ParkingRoute> {
        match self.layout {
            ParkingLayout::Roadside => self
                .roadside_parking_path(car_position, car_rotation, wheelbase, graph)
                .map(|path| ParkingRoute { path, reverse_from: None }),
            ParkingLayout::Lot => Some(self.lot_parking_path(car_position, car_rotation, wheelbase, graph)),
        }
    }

    /// Cars park from a lane with a single outbound link.
    fn roadside_parking_path(
        &self,
        car_position: Point3d,
        car_rotation: Orientation,
        wheelbase: f64,
        graph: &KeypointGraph,
    ) -> Option<KeypointPath> {
        let (arriving, lane_end) = self.arriving_lane(graph)?;
        let car_forward = forward(car_rotation);
        let back = -forward(self.rotation);

        let mut path = KeypointPath::default();
        path.push_custom(car_position - car_forward * wheelbase * 0.5);
        if car_forward.dot(arriving - car_position) > 0.0 {
            if distance_2d(car_position, arriving) > wheelbase * 0.55 {
                path.push_custom(car_position);
            }
            path.push_custom(arriving);
        } else {
            path.push_custom(car_position);
        }
        path.push_custom(closest_point_on_segment(self.position + back * wheelbase * 2.5, arriving, lane_end));
        path.push_custom(self.position + back * wheelbase * 1.25);
        path.push_custom(self.rest_point(wheelbase));
        Some(path)
    }

    /// Cars behind the bay drive straight in. Cars past it overshoot to the
    /// far side of the aisle and back in.
    fn lot_parking_path(
        &self,
        car_position: Point3d,
        car_rotation: Orientation,
        wheelbase: f64,
        graph: &KeypointGraph,
    ) -> ParkingRoute {
        let local = self.local(car_position);
        let side = if local.y < 0.0 { -1.0 } else { 1.0 };
        let reverse = local.x >= 0.0;
        let mut approach = if reverse {
            vec![
                self.at(local.x, -500.0 * side),
                self.at(0.8 * local.x, -100.0 * side),
                self.at(0.4 * local.x, 0.0),
            ]
        } else {
            vec![self.at(local.x, 100.0 * side), self.at(0.75 * local.x, 0.0)]
        };

        let car_forward = forward(car_rotation);
        let mut path = KeypointPath::default();
        path.push_custom(car_position - car_forward * wheelbase * 0.5);
        path.push_custom(car_position);
        // Line the approach up with the aisle lane, if there is one.
        if let Some((arriving, lane_end)) = self.arriving_lane(graph) {
            let snapped = closest_point_on_segment(approach[0], arriving, lane_end);
            let shift = snapped - approach[0];
            approach[0] = snapped;
            approach[1] += shift;
            if car_forward.dot(arriving - car_position) > 0.0 {
                path.push_custom(arriving);
            }
        }

        let turn = approach[0];
        let incoming = safe_normalize(turn - path.position(path.len() - 1, graph));
        let mut reverse_from = None;
        for (i, point) in approach.into_iter().enumerate() {
            path.push_custom(point);
            if reverse && i == 0 {
                reverse_from = Some(path.len() - 1);
                // Back out along the way in before swinging into the bay.
                path.push_custom(turn - incoming * wheelbase * 0.75);
            }
        }
        path.push_custom(self.rest_point(wheelbase));
        ParkingRoute { path, reverse_from }
    }

    /// The start and end of the lane cars arrive on. It must have a single
    /// outbound link.
    fn arriving_lane(&self, graph: &KeypointGraph) -> Option<(Point3d, Point3d)> {
        let lane_start = graph.closest_keypoint(self.arriving_point)?;
        let lane_end = match graph.outbound(lane_start) {
            [end] => *end,
            _ => return None,
        };
        Some((graph.position(lane_start)?, graph.position(lane_end)?))
    }

    /// Plans the path of a car leaving this space, continuing on a random walk
    /// from the keypoint nearest the departing point.
    pub fn departure_path<R: Rng + ?Sized>(
        &self,
        wheelbase: f64,
        rule_exceptions: u32,
        graph: &KeypointGraph,
        rng: &mut R,
    ) -> Option<DepartureRoute> {
        let departing = graph.closest_keypoint(self.departing_point)?;
        let walk = graph.random_path_from(departing, rule_exceptions, rng);
        let first = walk.keypoints().next()?;
        let inbound = *graph.inbound(first).first()?;
        let lane = (graph.position(inbound)?, graph.position(first)?);

        let local = self.local(self.departing_point);
        let car_forward = forward(self.rotation);
        let mut path = KeypointPath::default();
        let mut route = match self.layout {
            ParkingLayout::Roadside => {
                path.push_custom(self.position - car_forward * wheelbase);
                path.push_custom(self.position);
                path.push_custom(self.at(local.x.clamp(0.0, 400.0), local.y * 0.7));
                path.push_custom(self.at(local.x.clamp(0.0, 600.0), local.y));
                DepartureRoute {
                    path,
                    start_point: 1,
                    reverse_until: None,
                    check_dimensions: ROADSIDE_CHECK_DIMENSIONS,
                    check_offset: Vector3d::new(-600.0, 0.0, 0.0),
                }
            }
            ParkingLayout::Lot if local.x < 0.0 => {
                // Back out away from the departing side.
                let side = if local.y < 0.0 { 1.0 } else { -1.0 };
                path.push_custom(self.position);
                path.push_custom(self.rest_point(wheelbase));
                path.push_custom(self.at((0.75 * local.x).clamp(-400.0, -300.0), 50.0 * side));
                path.push_custom(self.at(local.x.clamp(-500.0, -400.0), 550.0 * side));
                DepartureRoute {
                    path,
                    start_point: 1,
                    reverse_until: Some(3),
                    check_dimensions: LOT_CHECK_DIMENSIONS,
                    check_offset: Vector3d::new(600.0, 0.0, 0.0),
                }
            }
            ParkingLayout::Lot => {
                let (swing, lateral) = if local.y < 0.0 {
                    (50.0, local.y.clamp(-400.0, 0.0))
                } else {
                    (-50.0, local.y.clamp(0.0, 400.0))
                };
                path.push_custom(self.position - car_forward * wheelbase);
                path.push_custom(self.position);
                path.push_custom(self.at((0.75 * local.x).clamp(150.0, 250.0), swing));
                path.push_custom(self.at(local.x.max(250.0), lateral));
                DepartureRoute {
                    path,
                    start_point: 1,
                    reverse_until: None,
                    check_dimensions: LOT_CHECK_DIMENSIONS,
                    check_offset: Vector3d::new(-600.0, 0.0, 0.0),
                }
            }
        };

        let last = route.path.position(route.path.len() - 1, graph);
        let to_lane = lane.1 - last;
        if to_lane.magnitude() > LANE_CORRECTION_DISTANCE {
            let near = last + to_lane.normalize() * (LANE_CORRECTION_DISTANCE - 100.0);
            route.path.push_custom(closest_point_on_segment(near, lane.0, lane.1));
        }
        route.path.append(&walk);
        Some(route)
    }
}

/// Owns every parking space and the cars parked in them.
#[derive(Clone, Debug, Default)]
pub struct ParkingController {
    spaces: SlotMap<ParkingSpaceId, ParkingSpace>,
}

impl ParkingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_space(&mut self, space: ParkingSpace) -> ParkingSpaceId {
        self.spaces.insert(space)
    }

    pub fn remove_space(&mut self, id: ParkingSpaceId) -> Option<ParkingSpace> {
        self.spaces.remove(id)
    }

    pub fn space(&self, id: ParkingSpaceId) -> Option<&ParkingSpace> {
        self.spaces.get(id)
    }

    pub fn spaces(&self) -> impl Iterator<Item = (ParkingSpaceId, &ParkingSpace)> {
        self.spaces.iter()
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    /// The number of spaces with a car parked in them.
    pub fn occupied(&self) -> usize {
        self.spaces.values().filter(|s| s.occupant.is_some()).count()
    }

    /// Fills each free space with a parked car with probability `density`.
    ///
    /// Returns the number of cars parked.
    pub fn spawn_parked<R: Rng + ?Sized>(
        &mut self,
        density: f64,
        templates: &[CarTemplate],
        rng: &mut R,
    ) -> usize {
        if templates.is_empty() {
            warn!("Cannot fill parking spaces without any car templates");
            return 0;
        }
        let mut count = 0;
        for space in self.spaces.values_mut().filter(|s| s.available()) {
            if !rng.gen_bool(density.clamp(0.0, 1.0)) {
                continue;
            }
            let template = rng.gen_range(0..templates.len());
            let variant = templates[template].variants.iter().copied().choose(rng).unwrap_or(0);
            space.occupant = Some(ParkedCar { template, variant });
            count += 1;
        }
        debug!("Parked {} cars in {} spaces", count, self.spaces.len());
        count
    }

    /// Reserves a free space for a car about to drive into it.
    pub fn reserve(&mut self, id: ParkingSpaceId, car: EntityId) -> bool {
        match self.spaces.get_mut(id) {
            Some(space) if space.available() => {
                space.incoming = Some(car);
                true
            }
            _ => false,
        }
    }

    /// Releases a reservation made by a car which never finished parking.
    pub fn cancel(&mut self, id: ParkingSpaceId, car: EntityId) {
        if let Some(space) = self.spaces.get_mut(id) {
            if space.incoming == Some(car) {
                space.incoming = None;
            }
        }
    }

    /// Turns the car which reserved the space into a parked car.
    pub fn finish_parking(&mut self, id: ParkingSpaceId, car: EntityId, parked: ParkedCar) -> bool {
        match self.spaces.get_mut(id) {
            Some(space) if space.incoming == Some(car) && space.occupant.is_none() => {
                space.incoming = None;
                space.occupant = Some(parked);
                true
            }
            _ => false,
        }
    }

    /// Puts a parked car directly into a free space.
    pub fn park(&mut self, id: ParkingSpaceId, parked: ParkedCar) -> bool {
        match self.spaces.get_mut(id) {
            Some(space) if space.available() => {
                space.occupant = Some(parked);
                true
            }
            _ => false,
        }
    }

    /// Removes the parked car from a space.
    pub fn clear(&mut self, id: ParkingSpaceId) -> Option<ParkedCar> {
        self.spaces.get_mut(id)?.occupant.take()
    }

    /// Empties every space.
    pub fn clear_all(&mut self) {
        for space in self.spaces.values_mut() {
            space.occupant = None;
            space.incoming = None;
        }
    }

    /// Takes the car out of a random occupied space.
    pub fn depart_random<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<(ParkingSpaceId, ParkedCar)> {
        let id = self
            .spaces
            .iter()
            .filter(|(_, s)| s.occupant.is_some())
            .map(|(id, _)| id)
            .choose(rng)?;
        let parked = self.clear(id)?;
        Some((id, parked))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::test::{line_graph, rng};
    use crate::graph::PathPoint;
    use crate::math::rotation_from_direction;
    use assert_approx_eq::assert_approx_eq;

    fn roadside_space() -> ParkingSpace {
        ParkingSpace::new(
            Point3d::new(5000.0, 300.0, 0.0),
            rotation_from_direction(Vector3d::unit_x()),
            Point3d::new(4000.0, 0.0, 0.0),
            Point3d::new(6000.0, 0.0, 0.0),
        )
    }

    fn car_id() -> EntityId {
        let mut ids = SlotMap::<EntityId, ()>::with_key();
        ids.insert(())
    }

    #[test]
    fn parking_path_ends_in_space() {
        let graph = line_graph(8);
        let space = roadside_space();
        let route = space
            .parking_path(
                Point3d::new(3000.0, 0.0, 0.0),
                rotation_from_direction(Vector3d::unit_x()),
                250.0,
                &graph,
            )
            .unwrap();
        assert_eq!(route.reverse_from, None);
        let path = route.path;
        let customs = path.custom_points();
        assert_eq!(customs.len(), 6);
        assert_approx_eq!(customs[0].x, 2875.0);
        assert_approx_eq!(customs[2].x, 4000.0);
        assert_approx_eq!(customs[3].x, 4375.0);
        assert_approx_eq!(customs[3].y, 0.0);
        assert_approx_eq!(customs[5].x, 4875.0);
        assert_approx_eq!(customs[5].y, 300.0);
        assert_eq!(path.keypoints().count(), 0);
    }

    #[test]
    fn parking_needs_a_simple_lane() {
        let mut graph = line_graph(8);
        graph.link_keypoints(4, 7).unwrap();
        let space = roadside_space();
        let car = rotation_from_direction(Vector3d::unit_x());
        assert!(space.parking_path(Point3d::new(3000.0, 0.0, 0.0), car, 250.0, &graph).is_none());
    }

    #[test]
    fn departure_joins_the_graph() {
        let graph = line_graph(8);
        let space = roadside_space();
        let route = space.departure_path(250.0, u32::MAX, &graph, &mut rng()).unwrap();
        assert_eq!((route.start_point, route.reverse_until), (1, None));
        assert_approx_eq!(route.check_offset.x, -600.0);
        let path = route.path;
        let customs = path.custom_points();
        assert_eq!(customs.len(), 4);
        assert_approx_eq!(customs[0].x, 4750.0);
        assert_approx_eq!(customs[1].x, 5000.0);
        assert_approx_eq!(customs[2].x, 5400.0);
        assert_approx_eq!(customs[2].y, 90.0);
        assert_approx_eq!(customs[3].x, 5600.0);
        assert_approx_eq!(customs[3].y, 0.0);
        assert_eq!(path.get(4), Some(PathPoint::Keypoint(6)));
    }

    /// A lot bay beside a road along the x axis, 1500 from it.
    fn lot_space(facing: Vector3d, arriving_x: f64) -> ParkingSpace {
        ParkingSpace::lot(
            Point3d::new(5000.0, -1500.0, 0.0),
            rotation_from_direction(facing),
            Point3d::new(arriving_x, 0.0, 0.0),
            Point3d::new(7000.0, 0.0, 0.0),
        )
    }

    fn assert_point(actual: Point3d, x: f64, y: f64) {
        assert_approx_eq!(actual.x, x, 1e-6);
        assert_approx_eq!(actual.y, y, 1e-6);
    }

    #[test]
    fn lot_bay_entered_forwards_from_behind() {
        let graph = line_graph(10);
        let space = lot_space(-Vector3d::unit_y(), 4000.0);
        assert_eq!(space.layout(), ParkingLayout::Lot);
        let car = rotation_from_direction(Vector3d::unit_x());
        let route = space.parking_path(Point3d::new(3000.0, 0.0, 0.0), car, 250.0, &graph).unwrap();
        assert_eq!(route.reverse_from, None);
        let customs = route.path.custom_points();
        assert_eq!(customs.len(), 6);
        assert_point(customs[2], 4000.0, 0.0);
        assert_point(customs[3], 4900.0, 0.0);
        assert_point(customs[4], 5000.0, -375.0);
        assert_point(customs[5], 5000.0, -1375.0);
    }

    #[test]
    fn lot_bay_entered_in_reverse_from_the_aisle() {
        let graph = line_graph(10);
        let space = lot_space(Vector3d::unit_y(), 5000.0);
        let car = rotation_from_direction(Vector3d::unit_x());
        let route = space.parking_path(Point3d::new(3000.0, 0.0, 0.0), car, 250.0, &graph).unwrap();
        assert_eq!(route.reverse_from, Some(3));
        let customs = route.path.custom_points();
        assert_eq!(customs.len(), 8);
        assert_point(customs[3], 5500.0, 0.0);
        assert_point(customs[4], 5312.5, 0.0);
        assert_point(customs[5], 5100.0, -300.0);
        assert_point(customs[6], 5000.0, -900.0);
        // Backed in, the rear axle rests on the far side of the centre.
        assert_point(customs[7], 5000.0, -1625.0);
    }

    #[test]
    fn lot_departure_forwards() {
        let graph = line_graph(10);
        let space = lot_space(Vector3d::unit_y(), 5000.0);
        let route = space.departure_path(250.0, u32::MAX, &graph, &mut rng()).unwrap();
        assert_eq!((route.start_point, route.reverse_until), (1, None));
        assert_approx_eq!(route.check_dimensions.y, 2600.0);
        assert_approx_eq!(route.check_offset.x, -600.0);
        let customs = route.path.custom_points();
        assert_eq!(customs.len(), 5);
        assert_point(customs[1], 5000.0, -1500.0);
        assert_point(customs[2], 4950.0, -1250.0);
        assert_point(customs[3], 5400.0, 0.0);
        assert_point(customs[4], 6400.0, 0.0);
        assert_eq!(route.path.get(5), Some(PathPoint::Keypoint(7)));
    }

    #[test]
    fn lot_departure_backs_out() {
        let graph = line_graph(10);
        let space = lot_space(-Vector3d::unit_y(), 5000.0);
        let route = space.departure_path(250.0, u32::MAX, &graph, &mut rng()).unwrap();
        assert_eq!((route.start_point, route.reverse_until), (1, Some(3)));
        assert_approx_eq!(route.check_offset.x, 600.0);
        let customs = route.path.custom_points();
        assert_eq!(customs.len(), 5);
        assert_point(customs[1], 5000.0, -1375.0);
        assert_point(customs[2], 4950.0, -1100.0);
        assert_point(customs[3], 4450.0, -1000.0);
        assert_eq!(route.path.get(5), Some(PathPoint::Keypoint(7)));
    }

    #[test]
    fn reservations_and_departures() {
        let mut parking = ParkingController::new();
        let id = parking.add_space(roadside_space());
        let car = car_id();
        let parked = ParkedCar { template: 0, variant: 3 };

        assert!(parking.reserve(id, car));
        assert!(!parking.park(id, parked));
        assert!(parking.finish_parking(id, car, parked));
        assert_eq!(parking.occupied(), 1);
        assert!(!parking.reserve(id, car));

        let mut rng = rng();
        assert_eq!(parking.depart_random(&mut rng), Some((id, parked)));
        assert_eq!(parking.depart_random(&mut rng), None);

        assert!(parking.reserve(id, car));
        parking.cancel(id, car);
        assert!(parking.space(id).unwrap().available());
    }

    #[test]
    fn spawn_fills_every_space_at_full_density() {
        let mut parking = ParkingController::new();
        for _ in 0..5 {
            parking.add_space(roadside_space());
        }
        let templates = vec![CarTemplate { variants: vec![7], ..CarTemplate::default() }];
        assert_eq!(parking.spawn_parked(1.0, &templates, &mut rng()), 5);
        assert!(parking.spaces().all(|(_, s)| s.occupant() == Some(ParkedCar { template: 0, variant: 7 })));
        assert_eq!(parking.spawn_parked(1.0, &templates, &mut rng()), 0);
        parking.clear_all();
        assert_eq!(parking.spawn_parked(0.0, &templates, &mut rng()), 0);
    }
}
