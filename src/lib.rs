pub use area::{AreaChange, AreaKind, TrafficArea, ZoneRules};
pub use cgmath;
pub use collision::CollisionRectangle;
pub use config::{BicycleTemplate, CarTemplate, PedestrianTemplate, TrafficConfig, TramTemplate};
pub use controller::{Camera, FrameInput, TrafficController, TrafficEvent};
pub use curve::{Curve, SegmentCurve, SCurve, SingleArc, Singularity, StraightLine};
pub use entity::{
    AreaOccupant, Bicycle, Car, DriverCharacteristics, EntityClass, EntityKind, OvertakeSettings,
    Pedestrian, TrafficEntity, Tram,
};
pub use follower::{CurveFollower, FreeFollower, PathState};
pub use graph::{rules, GraphError, GraphKind, Keypoint, KeypointGraph, KeypointPath, PathPoint};
pub use light::{
    IntersectionController, LightState, TrafficLightGroup, TramIntersectionController, TramLight,
    TramSignal,
};
pub use parking::{
    DepartureRoute, ParkedCar, ParkingController, ParkingLayout, ParkingRoute, ParkingSpace,
};
pub use priority::{blocked_by, EntitySnapshot};
pub use scenario::{
    CarState, IntersectionState, PedestrianState, PlayerState, Scenario, ScenarioError,
};
use slotmap::{new_key_type, SlotMap};
pub use slotmap::{Key, KeyData};
pub use util::Interval;
pub use world::{FlatWorld, NoWorld, World};

mod area;
mod collision;
mod config;
mod controller;
mod curve;
mod debug;
mod entity;
mod follower;
mod graph;
mod light;
pub mod math;
mod parking;
mod priority;
mod scenario;
mod util;
mod world;

new_key_type! {
    /// Unique ID of a [TrafficEntity].
    pub struct EntityId;
    /// Unique ID of a [TrafficArea].
    pub struct AreaId;
    /// Unique ID of a [TrafficLightGroup].
    pub struct LightGroupId;
    /// Unique ID of an [IntersectionController].
    pub struct IntersectionId;
    /// Unique ID of a [TramIntersectionController].
    pub struct TramIntersectionId;
    /// Unique ID of a [ParkingSpace].
    pub struct ParkingSpaceId;
}

type EntitySet = SlotMap<EntityId, TrafficEntity>;
type AreaSet = SlotMap<AreaId, TrafficArea>;
type LightGroupSet = SlotMap<LightGroupId, TrafficLightGroup>;
type IntersectionSet = SlotMap<IntersectionId, IntersectionController>;
type TramIntersectionSet = SlotMap<TramIntersectionId, TramIntersectionController>;
