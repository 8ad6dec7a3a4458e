//! Saving and replaying hand-built traffic situations.
//!
//! A scenario file starts with the magic bytes `TSCN` and a `u32` format
//! version. The sections follow in a fixed order, and each list is a `u32`
//! count followed by its elements. Every number is little-endian, and
//! orientations are stored as the four components `s, x, y, z` of a quaternion.

use crate::controller::TrafficController;
use crate::entity::EntityClass;
use crate::math::{distance_2d, Orientation, Point3d, Vector3d};
use cgmath::prelude::*;
use cgmath::Quaternion;
use log::{debug, warn};
use rand::Rng;
use std::fmt;
use std::io::{self, Read, Write};

const MAGIC: &[u8; 4] = b"TSCN";
const VERSION: u32 = 1;

/// How many keypoints are tried for each random car before giving up.
const RANDOM_CAR_ATTEMPTS: usize = 5;

/// An error reading or writing a scenario.
#[derive(Debug)]
pub enum ScenarioError {
    Io(io::Error),
    /// The data is not a scenario.
    BadMagic,
    /// The scenario was written by an incompatible version.
    UnsupportedVersion(u32),
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "scenario I/O error: {}", err),
            Self::BadMagic => write!(f, "not a scenario file"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported scenario version {}", v),
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ScenarioError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Where the player starts. Players are pawns, so the controller never moves them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlayerState {
    pub position: Point3d,
    pub rotation: Orientation,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            position: Point3d::origin(),
            rotation: Quaternion::from_sv(1.0, Vector3d::zero()),
        }
    }
}

/// A car placed by hand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CarState {
    pub position: Point3d,
    pub rotation: Orientation,
    /// The initial speed in cm/s.
    pub speed: f64,
    pub simulate: bool,
    /// The car drives the shortest route between these points, if set.
    pub route: Option<(Point3d, Point3d)>,
    /// The chance the car appears at all.
    pub spawn_rate: f64,
}

impl Default for CarState {
    fn default() -> Self {
        Self {
            position: Point3d::origin(),
            rotation: Quaternion::from_sv(1.0, Vector3d::zero()),
            speed: 500.0,
            simulate: true,
            route: None,
            spawn_rate: 1.0,
        }
    }
}

/// A pedestrian, standing on `position`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PedestrianState {
    pub position: Point3d,
}

impl Default for PedestrianState {
    fn default() -> Self {
        Self {
            position: Point3d::origin(),
        }
    }
}

/// The light timings of an intersection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntersectionState {
    /// The green duration of each light group in seconds.
    pub green_durations: Vec<f64>,
    /// The group which cycles first.
    pub first_group: u32,
}

/// A traffic situation which can be saved and replayed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scenario {
    pub player: PlayerState,
    pub cars: Vec<CarState>,
    pub pedestrians: Vec<PedestrianState>,
    /// Applied to the controller's intersections in the order they were added.
    pub intersections: Vec<IntersectionState>,
    /// Random cars added around the hand-placed ones.
    pub random_cars: u32,
    /// Random cars spawn at least this far from the scenario's centre.
    pub random_car_min_distance: f64,
}

impl Scenario {
    /// Records the cars, pedestrians and light timings of a running simulation.
    pub fn capture(controller: &TrafficController) -> Self {
        let mut scenario = Scenario::default();
        for entity in controller.iter_entities() {
            match entity.class() {
                EntityClass::Car => scenario.cars.push(CarState {
                    position: entity.position(),
                    rotation: entity.rotation(),
                    speed: entity.speed(),
                    simulate: entity.simulated(),
                    ..CarState::default()
                }),
                EntityClass::Pedestrian => scenario.pedestrians.push(PedestrianState {
                    position: entity.position() - Vector3d::unit_z() * entity.dimensions().z * 0.5,
                }),
                EntityClass::Tram | EntityClass::Bicycle => {}
            }
        }
        for (_, intersection) in controller.iter_intersections() {
            let green_durations = intersection
                .groups()
                .iter()
                .filter_map(|id| controller.light_group(*id))
                .map(|group| group.green_duration())
                .collect();
            scenario.intersections.push(IntersectionState {
                green_durations,
                first_group: intersection.cycling_group() as u32,
            });
        }
        scenario
    }

    /// Replaces the controller's entities with the scenario's, and resets the
    /// lights of its intersections.
    ///
    /// The player is not spawned: it belongs to whoever supplies the pawns.
    pub fn apply(&self, controller: &mut TrafficController) {
        controller.delete_all_entities();

        for car in &self.cars {
            if controller.rng().gen::<f64>() > car.spawn_rate {
                continue;
            }
            let Some(id) = controller.spawn_car(car.position, car.rotation, car.simulate) else {
                continue;
            };
            if let (true, Some((start, end))) = (car.simulate, car.route) {
                controller.set_route(id, start, end);
            }
            if let Some(entity) = controller.entity_mut(id) {
                entity.set_target_speed(car.speed);
                entity.set_instant_speed(car.speed);
            }
        }

        let identity = Quaternion::from_sv(1.0, Vector3d::zero());
        for ped in &self.pedestrians {
            controller.spawn_pedestrian(ped.position, identity, true);
        }

        self.spawn_random_cars(controller);

        let intersections = controller.iter_intersections().map(|(id, _)| id).collect::<Vec<_>>();
        if self.intersections.len() > intersections.len() {
            warn!(
                "Scenario has {} intersections but the simulation has {}",
                self.intersections.len(),
                intersections.len()
            );
        }
        for (state, id) in self.intersections.iter().zip(intersections) {
            let groups = controller
                .intersection(id)
                .map(|i| i.groups().to_vec())
                .unwrap_or_default();
            if groups.len() != state.green_durations.len() {
                warn!("Cannot load light timings: intersection has {} groups", groups.len());
                continue;
            }
            for (group, seconds) in groups.into_iter().zip(&state.green_durations) {
                controller.set_green_duration(group, *seconds);
            }
            controller.reset_intersection(id, state.first_group as usize);
        }
        debug!(
            "Applied scenario with {} cars and {} pedestrians",
            self.cars.len(),
            self.pedestrians.len()
        );
    }

    /// The point random cars keep away from: the player, or else the first car.
    fn centre(&self) -> Point3d {
        if self.player.position != Point3d::origin() {
            return self.player.position;
        }
        self.cars.first().map_or(Point3d::origin(), |car| car.position)
    }

    fn spawn_random_cars(&self, controller: &mut TrafficController) {
        let centre = self.centre();
        let road = controller.graph(crate::graph::GraphKind::Road);
        let len = road.len();
        if len == 0 {
            if self.random_cars > 0 {
                warn!("No road keypoints, can't spawn random cars");
            }
            return;
        }
        for _ in 0..self.random_cars {
            for _ in 0..RANDOM_CAR_ATTEMPTS {
                let kp = controller.rng().gen_range(0..len);
                let road = controller.graph(crate::graph::GraphKind::Road);
                let Some(position) = road.position(kp) else {
                    continue;
                };
                if distance_2d(position, centre) > self.random_car_min_distance {
                    let rotation = road.keypoint_rotation(kp);
                    controller.spawn_car(position, rotation, true);
                    break;
                }
            }
        }
    }

    /// Writes the scenario in its binary format.
    pub fn write_to(&self, mut out: impl Write) -> Result<(), ScenarioError> {
        out.write_all(MAGIC)?;
        write_u32(&mut out, VERSION)?;

        write_point(&mut out, self.player.position)?;
        write_rotation(&mut out, self.player.rotation)?;

        write_len(&mut out, self.cars.len())?;
        for car in &self.cars {
            write_point(&mut out, car.position)?;
            write_rotation(&mut out, car.rotation)?;
            write_f64(&mut out, car.speed)?;
            out.write_all(&[car.simulate as u8])?;
            match car.route {
                Some((start, end)) => {
                    out.write_all(&[1])?;
                    write_point(&mut out, start)?;
                    write_point(&mut out, end)?;
                }
                None => out.write_all(&[0])?,
            }
            write_f64(&mut out, car.spawn_rate)?;
        }

        write_len(&mut out, self.pedestrians.len())?;
        for ped in &self.pedestrians {
            write_point(&mut out, ped.position)?;
        }

        write_len(&mut out, self.intersections.len())?;
        for intersection in &self.intersections {
            write_len(&mut out, intersection.green_durations.len())?;
            for seconds in &intersection.green_durations {
                write_f64(&mut out, *seconds)?;
            }
            write_u32(&mut out, intersection.first_group)?;
        }

        write_u32(&mut out, self.random_cars)?;
        write_f64(&mut out, self.random_car_min_distance)?;
        Ok(())
    }

    /// Reads a scenario written by [Scenario::write_to].
    pub fn read_from(mut input: impl Read) -> Result<Self, ScenarioError> {
        let mut magic = [0; 4];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ScenarioError::BadMagic);
        }
        let version = read_u32(&mut input)?;
        if version != VERSION {
            return Err(ScenarioError::UnsupportedVersion(version));
        }

        let player = PlayerState {
            position: read_point(&mut input)?,
            rotation: read_rotation(&mut input)?,
        };

        let count = read_u32(&mut input)?;
        let mut cars = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let position = read_point(&mut input)?;
            let rotation = read_rotation(&mut input)?;
            let speed = read_f64(&mut input)?;
            let simulate = read_u8(&mut input)? != 0;
            let route = match read_u8(&mut input)? {
                0 => None,
                _ => Some((read_point(&mut input)?, read_point(&mut input)?)),
            };
            let spawn_rate = read_f64(&mut input)?;
            cars.push(CarState { position, rotation, speed, simulate, route, spawn_rate });
        }

        let count = read_u32(&mut input)?;
        let mut pedestrians = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            pedestrians.push(PedestrianState { position: read_point(&mut input)? });
        }

        let count = read_u32(&mut input)?;
        let mut intersections = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let groups = read_u32(&mut input)?;
            let green_durations = (0..groups)
                .map(|_| read_f64(&mut input))
                .collect::<io::Result<Vec<_>>>()?;
            let first_group = read_u32(&mut input)?;
            intersections.push(IntersectionState { green_durations, first_group });
        }

        Ok(Scenario {
            player,
            cars,
            pedestrians,
            intersections,
            random_cars: read_u32(&mut input)?,
            random_car_min_distance: read_f64(&mut input)?,
        })
    }
}

fn write_u32(out: &mut impl Write, value: u32) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn write_len(out: &mut impl Write, len: usize) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many scenario entries"))?;
    write_u32(out, len)
}

fn write_f64(out: &mut impl Write, value: f64) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn write_point(out: &mut impl Write, p: Point3d) -> io::Result<()> {
    write_f64(out, p.x)?;
    write_f64(out, p.y)?;
    write_f64(out, p.z)
}

fn write_rotation(out: &mut impl Write, q: Orientation) -> io::Result<()> {
    write_f64(out, q.s)?;
    write_f64(out, q.v.x)?;
    write_f64(out, q.v.y)?;
    write_f64(out, q.v.z)
}

fn read_u8(input: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(input: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f64(input: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0; 8];
    input.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_point(input: &mut impl Read) -> io::Result<Point3d> {
    Ok(Point3d::new(read_f64(input)?, read_f64(input)?, read_f64(input)?))
}

fn read_rotation(input: &mut impl Read) -> io::Result<Orientation> {
    let s = read_f64(input)?;
    let v = Vector3d::new(read_f64(input)?, read_f64(input)?, read_f64(input)?);
    Ok(Quaternion::from_sv(s, v))
}
