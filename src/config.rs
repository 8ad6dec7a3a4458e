//! Tunable parameters of a traffic simulation.

use crate::area::ZoneRules;
use crate::graph::rules;
use crate::math::{Point2d, Vector3d};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Global settings of a [crate::TrafficController].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrafficConfig {
    /// The number of cars spawned by `begin_simulate_traffic`.
    pub cars: usize,
    /// The number of pedestrians spawned by `begin_simulate_traffic`.
    pub pedestrians: usize,
    /// The number of bicycles spawned by `begin_simulate_traffic`.
    pub bicycles: usize,
    /// The number of trams spawned by `begin_simulate_traffic`.
    pub trams: usize,
    /// Entities further than this from the camera are low detail.
    pub far_distance: f64,
    /// The maximum number of high detail entities, or 0 for no limit.
    pub max_high_detail: usize,
    /// Whether entities outside the camera's view are low detail.
    pub low_detail_outside_camera: bool,
    /// Whether cars may follow S-shaped curves between keypoints.
    pub allow_s_curves: bool,
    /// The chance that a respawned car departs from a parking space instead.
    pub parked_departure_chance: f64,
    /// The fraction of parking spaces filled by `begin_simulate_traffic`.
    pub parking_density: f64,
    /// The rules applying where no regulation zone does.
    pub default_zone_rules: ZoneRules,
    /// Circles `(centre, range)` in which cars are never spawned.
    pub spawn_exclusions: Vec<(Point2d, f64)>,
    /// Whether to resolve right-of-way on multiple threads.
    pub parallel: bool,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            cars: 200,
            pedestrians: 100,
            bicycles: 100,
            trams: 8,
            far_distance: 5000.0,
            max_high_detail: 10,
            low_detail_outside_camera: true,
            allow_s_curves: true,
            parked_departure_chance: 0.5,
            parking_density: 1.0,
            default_zone_rules: ZoneRules::default(),
            spawn_exclusions: vec![],
            parallel: true,
        }
    }
}

#[cfg(feature = "serde")]
impl TrafficConfig {
    /// Reads a configuration from JSON. Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// The attributes of a kind of car.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CarTemplate {
    /// The size of the car's body in cm.
    pub dimensions: Vector3d,
    /// The distance between the axles in cm.
    pub wheelbase: f64,
    /// The top speed of the driver in cm/s.
    pub max_speed: f64,
    /// The keypoint rules the car is exempt from.
    pub rule_exceptions: u32,
    /// Cosmetic variants, one of which is picked at random.
    pub variants: Vec<u32>,
}

impl Default for CarTemplate {
    fn default() -> Self {
        Self {
            dimensions: Vector3d::new(500.0, 200.0, 150.0),
            wheelbase: 250.0,
            max_speed: 600.0,
            rule_exceptions: rules::ALL,
            variants: vec![0],
        }
    }
}

/// The attributes of a kind of pedestrian.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PedestrianTemplate {
    pub dimensions: Vector3d,
    /// Walking speed in cm/s.
    pub speed: f64,
    pub rule_exceptions: u32,
    pub variants: Vec<u32>,
}

impl Default for PedestrianTemplate {
    fn default() -> Self {
        Self {
            dimensions: Vector3d::new(100.0, 100.0, 180.0),
            speed: 200.0,
            rule_exceptions: rules::ALL,
            variants: vec![0],
        }
    }
}

/// The attributes of a kind of tram.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TramTemplate {
    /// The size of a single cart.
    pub dimensions: Vector3d,
    pub wheelbase: f64,
    /// The number of carts.
    pub carts: usize,
    /// The gap between consecutive carts.
    pub cart_gap: f64,
    /// The cruising speed in cm/s.
    pub target_speed: f64,
    pub rule_exceptions: u32,
    pub variants: Vec<u32>,
}

impl Default for TramTemplate {
    fn default() -> Self {
        Self {
            dimensions: Vector3d::new(500.0, 200.0, 150.0),
            wheelbase: 250.0,
            carts: 1,
            cart_gap: 100.0,
            target_speed: 500.0,
            rule_exceptions: rules::ALL,
            variants: vec![0],
        }
    }
}

/// The attributes of a kind of bicycle.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BicycleTemplate {
    pub dimensions: Vector3d,
    pub wheelbase: f64,
    /// The mean riding speed in cm/s.
    pub base_speed: f64,
    /// The riding speed varies by up to this much either side of `base_speed`.
    pub random_speed: f64,
    pub rule_exceptions: u32,
    pub variants: Vec<u32>,
}

impl Default for BicycleTemplate {
    fn default() -> Self {
        Self {
            dimensions: Vector3d::new(120.0, 50.0, 200.0),
            wheelbase: 100.0,
            base_speed: 200.0,
            random_speed: 20.0,
            rule_exceptions: rules::ALL,
            variants: vec![0],
        }
    }
}

#[cfg(all(test, feature = "serde"))]
mod test {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = TrafficConfig::from_json(r#"{ "cars": 12, "parallel": false }"#).unwrap();
        assert_eq!(config.cars, 12);
        assert!(!config.parallel);
        assert_eq!(config.pedestrians, 100);
        assert_eq!(config.default_zone_rules, ZoneRules::default());
    }
}
