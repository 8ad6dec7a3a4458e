//! Directed graphs of keypoints which traffic entities travel between.

use crate::math::{distance2_2d, rotation_from_direction, Orientation, Point2d, Point3d, Vector3d};
use cgmath::prelude::*;
use cgmath::Quaternion;
use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use io::GraphError;
pub use path::{KeypointPath, PathPoint};

mod io;
mod path;
mod search;

/// Random walks stop after this many keypoints, so cyclic graphs terminate.
pub const RANDOM_PATH_MAX_LENGTH: usize = 300;

/// Bit flags restricting which entities may traverse a keypoint.
///
/// An entity may traverse a keypoint if every rule bit of the keypoint is
/// contained in the entity's exception mask.
pub mod rules {
    /// No restrictions.
    pub const NONE: u32 = 0;
    /// Only vehicles entering or leaving a parking space.
    pub const PARKING_ACCESS_ONLY: u32 = 1 << 0;
    /// Limited access for heavy vehicles.
    pub const HEAVY_WEIGHT_LIMITED: u32 = 1 << 1;
    /// No access at all.
    pub const NO_ACCESS: u32 = 1 << 2;
    /// Exempt from every rule.
    pub const ALL: u32 = u32::MAX;
}

/// Selects one of the graphs owned by the traffic controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GraphKind {
    /// Roads driven by cars.
    Road,
    /// Pavements and cycle paths shared by pedestrians and bicycles.
    SharedUse,
    /// Tram tracks.
    Tramway,
}

/// A node in a [KeypointGraph].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Keypoint {
    /// The position of the keypoint.
    pub position: Point3d,
    /// Keypoints reachable directly from this one.
    outbound: SmallVec<[usize; 4]>,
    /// Keypoints which lead directly to this one.
    inbound: SmallVec<[usize; 4]>,
    /// The rule bits of the keypoint.
    pub rules: u32,
}

impl Default for Keypoint {
    fn default() -> Self {
        Self {
            position: Point3d::origin(),
            outbound: SmallVec::new(),
            inbound: SmallVec::new(),
            rules: 0,
        }
    }
}

impl Keypoint {
    /// Keypoints reachable directly from this one.
    pub fn outbound(&self) -> &[usize] {
        &self.outbound
    }

    /// Keypoints which lead directly to this one.
    pub fn inbound(&self) -> &[usize] {
        &self.inbound
    }
}

/// Two parallel lanes on which vehicles may overtake each other.
///
/// Each lane is a directed pair of keypoint indices `(start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OvertakeLanes {
    /// The lane normally driven on.
    pub right: (usize, usize),
    /// The lane used for overtaking.
    pub left: (usize, usize),
}

/// A directed graph of keypoints.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeypointGraph {
    /// The keypoints.
    keypoints: Vec<Keypoint>,
    /// The directed links, in insertion order.
    links: Vec<(usize, usize)>,
    /// Keypoints at which entities may be spawned.
    spawn_points: Vec<usize>,
    /// Lane pairs eligible for overtaking.
    overtake_lanes: Vec<OvertakeLanes>,
    /// Keypoints with no inbound links.
    entry_points: Vec<usize>,
}

impl KeypointGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Default::default()
    }

    /// The number of keypoints in the graph.
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    /// Returns true if the graph has no keypoints.
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Gets a keypoint by index.
    pub fn keypoint(&self, index: usize) -> Option<&Keypoint> {
        self.keypoints.get(index)
    }

    /// Gets the position of a keypoint.
    pub fn position(&self, index: usize) -> Option<Point3d> {
        self.keypoints.get(index).map(|kp| kp.position)
    }

    /// Keypoints reachable directly from the given keypoint.
    pub fn outbound(&self, index: usize) -> &[usize] {
        self.keypoints.get(index).map(|kp| kp.outbound()).unwrap_or(&[])
    }

    /// Keypoints leading directly to the given keypoint.
    pub fn inbound(&self, index: usize) -> &[usize] {
        self.keypoints.get(index).map(|kp| kp.inbound()).unwrap_or(&[])
    }

    pub fn iter_keypoints(&self) -> impl Iterator<Item = &Keypoint> {
        self.keypoints.iter()
    }

    pub fn links(&self) -> &[(usize, usize)] {
        &self.links
    }

    pub fn spawn_points(&self) -> &[usize] {
        &self.spawn_points
    }

    pub fn overtake_lanes(&self) -> &[OvertakeLanes] {
        &self.overtake_lanes
    }

    /// Keypoints with no inbound links, as of the last load or [Self::update_entry_points].
    pub fn entry_points(&self) -> &[usize] {
        &self.entry_points
    }

    /// Adds a keypoint and returns its index.
    pub fn add_keypoint(&mut self, position: Point3d) -> usize {
        self.keypoints.push(Keypoint {
            position,
            ..Default::default()
        });
        self.keypoints.len() - 1
    }

    /// Removes a keypoint along with every link touching it.
    ///
    /// Higher keypoint indices shift down by one everywhere they are referenced.
    /// Spawn points and overtake lanes which referenced the removed keypoint are dropped.
    pub fn remove_keypoint(&mut self, index: usize) {
        if index >= self.keypoints.len() {
            warn!("Cannot remove keypoint {}: graph has {} keypoints", index, self.len());
            return;
        }
        let shift = |i: usize| if i > index { i - 1 } else { i };

        self.keypoints.remove(index);
        for kp in &mut self.keypoints {
            kp.outbound.retain(|i| *i != index);
            kp.inbound.retain(|i| *i != index);
            kp.outbound.iter_mut().for_each(|i| *i = shift(*i));
            kp.inbound.iter_mut().for_each(|i| *i = shift(*i));
        }
        self.links.retain(|(a, b)| *a != index && *b != index);
        self.links.iter_mut().for_each(|(a, b)| {
            *a = shift(*a);
            *b = shift(*b);
        });
        self.spawn_points.retain(|i| *i != index);
        self.spawn_points.iter_mut().for_each(|i| *i = shift(*i));
        self.overtake_lanes.retain(|o| {
            ![o.right.0, o.right.1, o.left.0, o.left.1].contains(&index)
        });
        for o in &mut self.overtake_lanes {
            o.right = (shift(o.right.0), shift(o.right.1));
            o.left = (shift(o.left.0), shift(o.left.1));
        }
        self.update_entry_points();
    }

    /// Adds a directed link from keypoint `from` to keypoint `to`.
    pub fn link_keypoints(&mut self, from: usize, to: usize) -> Result<(), GraphError> {
        if from >= self.len() || to >= self.len() {
            return Err(GraphError::InvalidLink { from, to });
        }
        self.links.push((from, to));
        self.keypoints[from].outbound.push(to);
        self.keypoints[to].inbound.push(from);
        Ok(())
    }

    /// Marks a keypoint as a spawn point.
    pub fn mark_spawn_point(&mut self, index: usize) {
        self.spawn_points.push(index);
    }

    /// Registers two parallel lanes as eligible for overtaking.
    pub fn add_overtake_lanes(&mut self, right: (usize, usize), left: (usize, usize)) {
        self.overtake_lanes.push(OvertakeLanes { right, left });
    }

    /// Sets the rule bits of a keypoint. Out of range indices are ignored.
    pub fn set_keypoint_rules(&mut self, index: usize, rules: u32) {
        if let Some(kp) = self.keypoints.get_mut(index) {
            kp.rules = rules;
        }
    }

    /// Removes everything from the graph.
    pub fn clear(&mut self) {
        *self = Default::default();
    }

    /// Recomputes the keypoints which have no inbound links.
    pub fn update_entry_points(&mut self) {
        self.entry_points = (0..self.len())
            .filter(|i| self.keypoints[*i].inbound.is_empty())
            .collect();
    }

    /// Returns true if a traveller with the given exceptions may traverse the keypoint.
    pub fn compare_rules(&self, index: usize, exceptions: u32) -> bool {
        self.keypoints
            .get(index)
            .map_or(false, |kp| kp.rules & exceptions == kp.rules)
    }

    /// Filters a list of keypoints down to those traversable with the given exceptions.
    pub fn verified(&self, indices: &[usize], exceptions: u32) -> SmallVec<[usize; 4]> {
        indices
            .iter()
            .copied()
            .filter(|i| self.compare_rules(*i, exceptions))
            .collect()
    }

    /// Generates a random walk starting from a random traversable keypoint.
    ///
    /// The path is only empty if no keypoint in the graph is traversable.
    pub fn random_path<R: Rng + ?Sized>(&self, exceptions: u32, rng: &mut R) -> KeypointPath {
        let valid = (0..self.len())
            .filter(|i| self.compare_rules(*i, exceptions))
            .collect::<Vec<_>>();
        match valid.choose(rng) {
            Some(start) => self.walk(*start, exceptions, rng),
            None => {
                warn!("No traversable keypoints for rule exceptions {:#x}", exceptions);
                KeypointPath::default()
            }
        }
    }

    /// Generates a random walk from `start` over traversable outbound links.
    ///
    /// The walk stops at a dead end or after [RANDOM_PATH_MAX_LENGTH] keypoints.
    /// If `start` itself is not traversable, a random path is generated instead.
    pub fn random_path_from<R: Rng + ?Sized>(
        &self,
        start: usize,
        exceptions: u32,
        rng: &mut R,
    ) -> KeypointPath {
        if !self.compare_rules(start, exceptions) {
            return self.random_path(exceptions, rng);
        }
        self.walk(start, exceptions, rng)
    }

    fn walk<R: Rng + ?Sized>(&self, start: usize, exceptions: u32, rng: &mut R) -> KeypointPath {
        let mut points = vec![start];
        let mut last = start;
        while points.len() < RANDOM_PATH_MAX_LENGTH {
            let nexts = self.verified(self.outbound(last), exceptions);
            match nexts.choose(rng) {
                Some(next) => {
                    points.push(*next);
                    last = *next;
                }
                None => break,
            }
        }
        KeypointPath::from_keypoints(points)
    }

    /// Picks a random spawn point, or a random keypoint if the graph has no spawn points.
    pub fn random_spawn_point<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        if let Some(sp) = self.spawn_points.choose(rng) {
            return Some(*sp);
        }
        if self.is_empty() {
            return None;
        }
        warn!("Graph has no spawn points, using a random keypoint");
        Some(rng.gen_range(0..self.len()))
    }

    /// Finds the keypoint closest to a position.
    ///
    /// Ties keep the keypoint with the lowest index.
    pub fn closest_keypoint(&self, position: Point3d) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, kp) in self.keypoints.iter().enumerate() {
            let dist = kp.position.distance2(position);
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((i, dist));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Selects a random maximal set of keypoints which are all at least `margin` apart.
    pub fn keypoints_with_margin<R: Rng + ?Sized>(&self, margin: f64, rng: &mut R) -> Vec<usize> {
        let margin2 = margin * margin;
        let mut order = (0..self.len()).collect::<Vec<_>>();
        order.shuffle(rng);

        let mut result: Vec<usize> = Vec::with_capacity(order.len());
        for i in order {
            let pos = self.keypoints[i].position;
            if result
                .iter()
                .all(|j| self.keypoints[*j].position.distance2(pos) >= margin2)
            {
                result.push(i);
            }
        }
        result
    }

    /// Removes keypoints within `range` of `centre`, ignoring height.
    pub fn remove_keypoints_by_range(&self, list: &mut Vec<usize>, centre: Point2d, range: f64) {
        let centre = Point3d::new(centre.x, centre.y, 0.0);
        list.retain(|i| {
            self.position(*i)
                .map_or(false, |p| distance2_2d(p, centre) > range * range)
        });
    }

    /// The orientation of an entity standing on a keypoint, facing the average
    /// position of the keypoint's outbound neighbours.
    pub fn keypoint_rotation(&self, index: usize) -> Orientation {
        let identity = Quaternion::from_sv(1.0, Vector3d::zero());
        let kp = match self.keypoints.get(index) {
            Some(kp) => kp,
            None => return identity,
        };
        if kp.outbound.is_empty() {
            return identity;
        }
        let sum = kp
            .outbound
            .iter()
            .fold(Vector3d::zero(), |acc, i| acc + self.keypoints[*i].position.to_vec());
        let target = Point3d::from_vec(sum / kp.outbound.len() as f64);
        rotation_from_direction(target - kp.position)
    }

    /// Finds the lane paired with `lane` for overtaking.
    ///
    /// With `allow_both_ways`, the overtaking lane also pairs back to the normal lane.
    pub fn overtake_pair(&self, lane: (usize, usize), allow_both_ways: bool) -> Option<(usize, usize)> {
        self.overtake_lanes.iter().find_map(|o| {
            if o.right == lane {
                Some(o.left)
            } else if allow_both_ways && o.left == lane {
                Some(o.right)
            } else {
                None
            }
        })
    }

    /// Merges zone rules into each keypoint's rules.
    pub fn apply_zone_rules(&mut self, zone_rules: impl Fn(Point3d) -> u32) {
        for kp in &mut self.keypoints {
            kp.rules |= zone_rules(kp.position);
        }
    }

    /// Snaps each keypoint to the ground height reported by `ground`.
    /// Keypoints with no ground below them are left untouched.
    pub fn align_with_ground(&mut self, ground: impl Fn(Point3d) -> Option<f64>) {
        for kp in &mut self.keypoints {
            if let Some(z) = ground(kp.position) {
                kp.position.z = z;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub fn rng() -> StdRng {
        StdRng::from_seed(*b"Keypoints all the way down......")
    }

    /// A straight road of `n` keypoints spaced 1000 units apart along the x-axis.
    pub fn line_graph(n: usize) -> KeypointGraph {
        let mut graph = KeypointGraph::new();
        for i in 0..n {
            graph.add_keypoint(Point3d::new(1000.0 * i as f64, 0.0, 0.0));
        }
        for i in 1..n {
            graph.link_keypoints(i - 1, i).unwrap();
        }
        graph.mark_spawn_point(0);
        graph.update_entry_points();
        graph
    }

    /// A closed loop of `n` keypoints on a circle.
    pub fn ring_graph(n: usize, radius: f64) -> KeypointGraph {
        let mut graph = KeypointGraph::new();
        for i in 0..n {
            let a = std::f64::consts::TAU * i as f64 / n as f64;
            graph.add_keypoint(Point3d::new(radius * a.cos(), radius * a.sin(), 0.0));
        }
        for i in 0..n {
            graph.link_keypoints(i, (i + 1) % n).unwrap();
        }
        graph.update_entry_points();
        graph
    }

    #[test]
    fn cleared_graph_starts_over() {
        let mut graph = line_graph(3);
        graph.add_overtake_lanes((0, 1), (1, 2));
        graph.clear();
        assert!(graph.is_empty());
        assert_eq!(graph.random_spawn_point(&mut rng()), None);
        let index = graph.add_keypoint(Point3d::new(1.0, 2.0, 3.0));
        assert_eq!(index, 0);
        let kp = graph.keypoint(0).unwrap();
        assert!(kp.outbound().is_empty() && kp.inbound().is_empty());
        assert_eq!(kp.rules, 0);
        assert_eq!(Keypoint::default().position, Point3d::origin());
    }

    #[test]
    fn single_keypoint_random_walk() {
        let mut graph = KeypointGraph::new();
        graph.add_keypoint(Point3d::new(5.0, 5.0, 0.0));
        let path = graph.random_path_from(0, rules::ALL, &mut rng());
        assert_eq!(path.points(), &[PathPoint::Keypoint(0)]);
    }

    #[test]
    fn random_walk_on_ring_is_capped() {
        let graph = ring_graph(10, 5000.0);
        let path = graph.random_path_from(3, rules::ALL, &mut rng());
        assert_eq!(path.len(), RANDOM_PATH_MAX_LENGTH);
        assert_eq!(path.get(0), Some(PathPoint::Keypoint(3)));
        assert_eq!(path.get(1), Some(PathPoint::Keypoint(4)));
    }

    #[test]
    fn random_walk_respects_rules() {
        let mut graph = KeypointGraph::new();
        for i in 0..4 {
            graph.add_keypoint(Point3d::new(i as f64, 0.0, 0.0));
        }
        // 0 branches to 1 (restricted) and 2 (open), both continue to 3.
        for (a, b) in [(0, 1), (0, 2), (1, 3), (2, 3)] {
            graph.link_keypoints(a, b).unwrap();
        }
        graph.set_keypoint_rules(1, rules::NO_ACCESS);
        let mut rng = rng();
        for _ in 0..20 {
            let path = graph.random_path_from(0, rules::PARKING_ACCESS_ONLY, &mut rng);
            assert_eq!(path.keypoints().collect::<Vec<_>>(), vec![0, 2, 3]);
        }
        // Starting on a restricted keypoint falls back to a valid random path.
        for _ in 0..20 {
            let path = graph.random_path_from(1, rules::NONE, &mut rng);
            assert!(path.keypoints().all(|k| graph.compare_rules(k, rules::NONE)));
            assert!(!path.is_empty());
        }
    }

    #[test]
    fn compare_rules_contract() {
        let mut graph = line_graph(2);
        graph.set_keypoint_rules(0, rules::PARKING_ACCESS_ONLY | rules::HEAVY_WEIGHT_LIMITED);
        assert!(graph.compare_rules(0, rules::ALL));
        assert!(!graph.compare_rules(0, rules::PARKING_ACCESS_ONLY));
        assert!(graph.compare_rules(1, rules::NONE));
        assert!(!graph.compare_rules(7, rules::ALL));
    }

    #[test]
    fn closest_keypoint_tie_keeps_first() {
        let mut graph = KeypointGraph::new();
        graph.add_keypoint(Point3d::new(-10.0, 0.0, 0.0));
        graph.add_keypoint(Point3d::new(10.0, 0.0, 0.0));
        graph.add_keypoint(Point3d::new(100.0, 0.0, 0.0));
        assert_eq!(graph.closest_keypoint(Point3d::new(0.0, 0.0, 0.0)), Some(0));
        assert_eq!(graph.closest_keypoint(Point3d::new(90.0, 0.0, 0.0)), Some(2));
        assert_eq!(KeypointGraph::new().closest_keypoint(Point3d::new(0.0, 0.0, 0.0)), None);
    }

    #[test]
    fn margin_selection_is_spread_out() {
        let mut graph = KeypointGraph::new();
        let mut rng = rng();
        for _ in 0..200 {
            graph.add_keypoint(Point3d::new(
                rng.gen_range(0.0..10000.0),
                rng.gen_range(0.0..10000.0),
                rng.gen_range(0.0..100.0),
            ));
        }
        let margin = 1500.0;
        let picked = graph.keypoints_with_margin(margin, &mut rng);
        assert!(!picked.is_empty());
        for (i, a) in picked.iter().enumerate() {
            for b in &picked[i + 1..] {
                let d = graph.position(*a).unwrap().distance(graph.position(*b).unwrap());
                assert!(d >= margin);
            }
        }
    }

    #[test]
    fn remove_keypoint_reindexes() {
        let mut graph = line_graph(4);
        graph.mark_spawn_point(3);
        graph.add_overtake_lanes((2, 3), (0, 1));
        graph.remove_keypoint(1);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.links(), &[(1, 2)]);
        assert_eq!(graph.outbound(1), &[2]);
        assert!(graph.outbound(0).is_empty());
        assert_eq!(graph.spawn_points(), &[0, 2]);
        assert!(graph.overtake_lanes().is_empty());
        assert_eq!(graph.entry_points(), &[0, 1]);
    }

    #[test]
    fn invalid_link_is_rejected() {
        let mut graph = line_graph(2);
        assert!(graph.link_keypoints(0, 5).is_err());
        assert_eq!(graph.links().len(), 1);
    }

    #[test]
    fn overtake_pairs() {
        let mut graph = line_graph(4);
        graph.add_overtake_lanes((0, 1), (2, 3));
        assert_eq!(graph.overtake_pair((0, 1), false), Some((2, 3)));
        assert_eq!(graph.overtake_pair((2, 3), false), None);
        assert_eq!(graph.overtake_pair((2, 3), true), Some((0, 1)));
    }

    #[test]
    fn rotation_faces_outbound() {
        let graph = line_graph(2);
        let fwd = crate::math::forward(graph.keypoint_rotation(0));
        assert_approx_eq!(fwd.x, 1.0);
        assert_approx_eq!(fwd.y, 0.0);
    }

    #[test]
    fn zone_rules_and_ground() {
        let mut graph = line_graph(3);
        graph.apply_zone_rules(|p| if p.x > 500.0 { rules::HEAVY_WEIGHT_LIMITED } else { 0 });
        assert_eq!(graph.keypoint(0).unwrap().rules, 0);
        assert_eq!(graph.keypoint(2).unwrap().rules, rules::HEAVY_WEIGHT_LIMITED);
        graph.align_with_ground(|p| (p.x < 1500.0).then(|| 42.0));
        assert_approx_eq!(graph.position(1).unwrap().z, 42.0);
        assert_approx_eq!(graph.position(2).unwrap().z, 0.0);
    }
}
