//! Following paths along generated curves.

use crate::curve::{Curve, SegmentCurve};
use crate::graph::{KeypointGraph, KeypointPath};
use crate::math::{safe_normalize, Point3d, Vector3d};
use cgmath::prelude::*;
use rand::Rng;

pub use free::FreeFollower;

mod free;

/// A new path starting on the entity's current position is only prefixed with
/// that position if it is further than this from the path's first point.
const CUSTOM_START_TOLERANCE: f64 = 10.0;

/// The outcome of moving along a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathState {
    /// The entity is still on its path.
    Following,
    /// The path has been consumed. `has_outbound` is true if the last keypoint
    /// of the path has outbound links to continue along.
    Ended { has_outbound: bool },
}

/// Tracks an entity's progress along a [KeypointPath], moving it along smooth curves.
///
/// The curves do not pass through the keypoints themselves: point `i` of the
/// follower is the midpoint of path points `i - 1` and `i`, and the first and last
/// points are the ends of the path. A path of `n` points therefore has `n + 1`
/// follower points and `n` curve segments.
#[derive(Clone, Debug)]
pub struct CurveFollower {
    /// The path being followed.
    path: KeypointPath,
    /// The follower point at the start of the current segment.
    point: usize,
    /// The fraction of the current segment travelled, from 0 to 1.
    progress: f64,
    /// The curve of the current segment.
    curve: Option<Curve>,
    /// Whether segments may be S-curves.
    allow_s_curve: bool,
}

impl CurveFollower {
    /// Creates a follower with an empty path.
    pub fn new(allow_s_curve: bool) -> Self {
        Self {
            path: KeypointPath::default(),
            point: 0,
            progress: 0.0,
            curve: None,
            allow_s_curve,
        }
    }

    pub fn path(&self) -> &KeypointPath {
        &self.path
    }

    pub fn point(&self) -> usize {
        self.point
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn curve(&self) -> Option<&Curve> {
        self.curve.as_ref()
    }

    /// The number of follower points.
    pub fn point_count(&self) -> usize {
        self.path.len() + 1
    }

    /// Returns true once the whole path has been travelled.
    pub fn is_finished(&self) -> bool {
        self.point + 1 >= self.point_count()
    }

    /// The position of a follower point.
    pub fn position(&self, index: usize, graph: &KeypointGraph) -> Point3d {
        let len = self.path.len();
        if len == 0 {
            return Point3d::origin();
        }
        if index == 0 {
            return self.path.position(0, graph);
        }
        if index >= len {
            return self.path.position(len - 1, graph);
        }
        let a = self.path.position(index - 1, graph);
        let b = self.path.position(index, graph);
        a.midpoint(b)
    }

    /// The tangent at a follower point: the direction between the path points either side.
    pub fn tangent(&self, index: usize, graph: &KeypointGraph) -> Vector3d {
        let len = self.path.len();
        if len < 2 {
            return Vector3d::unit_x();
        }
        let index = index.clamp(1, len - 1);
        safe_normalize(self.path.position(index, graph) - self.path.position(index - 1, graph))
    }

    /// Builds the curve of the segment starting at follower point `point`.
    pub fn curve_from_point(&self, point: usize, graph: &KeypointGraph) -> Option<Curve> {
        let count = self.point_count();
        if count < 2 {
            return None;
        }
        let start = point.min(count - 2);
        let end = start + 1;
        Some(Curve::between(
            self.position(start, graph),
            self.position(end, graph),
            self.tangent(start, graph),
            self.tangent(end, graph),
            self.allow_s_curve,
        ))
    }

    /// Moves a (point, progress, curve) triple `distance` units along the path.
    /// Negative distances move backwards, stopping at the start of the path.
    ///
    /// Does nothing if the triple is already at the end of the path.
    pub fn advance_point_and_progress(
        &self,
        point: &mut usize,
        progress: &mut f64,
        curve: &mut Option<Curve>,
        mut distance: f64,
        graph: &KeypointGraph,
    ) {
        let count = self.point_count();
        if count < 2 || *point + 1 >= count {
            return;
        }

        if distance > 0.0 {
            while distance > 0.0 && *point + 1 < count {
                let length = curve.as_ref().map_or(0.0, |c| c.length());
                let remaining = (1.0 - *progress) * length;
                if distance >= remaining {
                    distance -= remaining;
                    *point += 1;
                    *progress = 0.0;
                    *curve = self.curve_from_point(*point, graph);
                } else {
                    *progress += distance / length;
                    return;
                }
            }
        } else if distance < 0.0 {
            while distance < 0.0 {
                let length = curve.as_ref().map_or(0.0, |c| c.length());
                let remaining = *progress * length;
                if -distance < remaining {
                    *progress += distance / length;
                    return;
                }
                distance += remaining;
                if *point == 0 {
                    *progress = 0.0;
                    return;
                }
                *point -= 1;
                *progress = 1.0;
                *curve = self.curve_from_point(*point, graph);
            }
        }
    }

    /// Moves `distance` units along the path.
    pub fn advance(&mut self, distance: f64, graph: &KeypointGraph) -> PathState {
        let (mut point, mut progress, mut curve) = (self.point, self.progress, self.curve);
        self.advance_point_and_progress(&mut point, &mut progress, &mut curve, distance, graph);
        self.point = point;
        self.progress = progress;
        self.curve = curve;
        self.state(graph)
    }

    /// Whether the path is still being followed.
    pub fn state(&self, graph: &KeypointGraph) -> PathState {
        if !self.is_finished() {
            return PathState::Following;
        }
        let has_outbound = self
            .path
            .last_keypoint()
            .map_or(false, |k| !graph.outbound(k).is_empty());
        PathState::Ended { has_outbound }
    }

    fn location_of(
        &self,
        point: usize,
        progress: f64,
        curve: Option<&Curve>,
        graph: &KeypointGraph,
    ) -> (Point3d, Vector3d) {
        let count = self.point_count();
        match curve {
            Some(curve) if count >= 2 && point + 1 < count => {
                curve.sample(progress * curve.length())
            }
            Some(_) if count >= 2 => (self.position(count - 1, graph), self.tangent(count - 1, graph)),
            _ => (Point3d::origin(), Vector3d::unit_x()),
        }
    }

    /// The current position and tangent.
    pub fn location(&self, graph: &KeypointGraph) -> (Point3d, Vector3d) {
        self.location_of(self.point, self.progress, self.curve.as_ref(), graph)
    }

    /// The position and tangent `step` units further along the path, without moving.
    pub fn location_ahead(&self, step: f64, graph: &KeypointGraph) -> (Point3d, Vector3d) {
        let (mut point, mut progress, mut curve) = (self.point, self.progress, self.curve);
        self.advance_point_and_progress(&mut point, &mut progress, &mut curve, step, graph);
        self.location_of(point, progress, curve.as_ref(), graph)
    }

    /// The curvature of the path at the current position.
    pub fn turn_amount(&self) -> f64 {
        self.curve
            .as_ref()
            .map_or(0.0, |c| c.curvature_at(c.length() * self.progress))
    }

    /// Jumps to a follower point and progress on the current path.
    pub fn set_point_and_progress(&mut self, point: usize, progress: f64, graph: &KeypointGraph) {
        self.point = point;
        self.progress = progress.clamp(0.0, 1.0);
        self.curve = self.curve_from_point(point, graph);
    }

    /// Replaces the path, starting at the given follower point and progress.
    pub fn set_path(&mut self, path: KeypointPath, point: usize, progress: f64, graph: &KeypointGraph) {
        self.path = path;
        self.set_point_and_progress(point, progress, graph);
    }

    /// Starts a random path from the keypoint closest to `position`.
    ///
    /// If the path leads anywhere, `position` is prepended so the entity does not
    /// jump, and true is returned. Otherwise the path is left unchanged.
    pub fn new_path_from_nearest<R: Rng + ?Sized>(
        &mut self,
        position: Point3d,
        exceptions: u32,
        graph: &KeypointGraph,
        rng: &mut R,
    ) -> bool {
        let closest = match graph.closest_keypoint(position) {
            Some(closest) => closest,
            None => return false,
        };
        if graph.outbound(closest).is_empty() {
            return false;
        }
        let mut path = graph.random_path_from(closest, exceptions, rng);
        if path.len() < 2 {
            return false;
        }
        if position.distance(path.position(0, graph)) > CUSTOM_START_TOLERANCE {
            path.insert_custom(0, position);
        }
        self.set_path(path, 0, 0.0, graph);
        true
    }

    /// Starts a random path from a random spawn point, returning false if the
    /// graph is empty.
    pub fn new_path_from_spawn<R: Rng + ?Sized>(
        &mut self,
        exceptions: u32,
        graph: &KeypointGraph,
        rng: &mut R,
    ) -> bool {
        match graph.random_spawn_point(rng) {
            Some(spawn) => {
                let path = graph.random_path_from(spawn, exceptions, rng);
                self.set_path(path, 0, 0.0, graph);
                true
            }
            None => false,
        }
    }

    /// Starts a random path somewhere in the graph, at a random point along its first segment.
    pub fn first_time_spawn<R: Rng + ?Sized>(
        &mut self,
        exceptions: u32,
        graph: &KeypointGraph,
        rng: &mut R,
    ) {
        let path = graph.random_path(exceptions, rng);
        let progress = rng.gen_range(0.0..1.0);
        self.set_path(path, 0, progress, graph);
    }

    /// Starts the shortest path between two keypoints.
    pub fn new_path_between<R: Rng + ?Sized>(
        &mut self,
        start: usize,
        dest: usize,
        exceptions: u32,
        graph: &KeypointGraph,
        rng: &mut R,
    ) {
        let path = graph.find_path(start, dest, exceptions, rng);
        self.set_path(path, 0, 0.0, graph);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::test::{line_graph, ring_graph, rng};
    use crate::graph::{rules, PathPoint};
    use assert_approx_eq::assert_approx_eq;

    fn follower_on(graph: &KeypointGraph, keypoints: &[usize]) -> CurveFollower {
        let mut follower = CurveFollower::new(true);
        follower.set_path(KeypointPath::from_keypoints(keypoints.iter().copied()), 0, 0.0, graph);
        follower
    }

    #[test]
    fn points_are_midpoints() {
        let graph = line_graph(4);
        let follower = follower_on(&graph, &[0, 1, 2, 3]);
        assert_eq!(follower.point_count(), 5);
        assert_approx_eq!(follower.position(0, &graph).x, 0.0);
        assert_approx_eq!(follower.position(1, &graph).x, 500.0);
        assert_approx_eq!(follower.position(3, &graph).x, 2500.0);
        assert_approx_eq!(follower.position(4, &graph).x, 3000.0);
        assert_approx_eq!(follower.tangent(0, &graph).x, 1.0);
    }

    #[test]
    fn advance_along_straight_road() {
        let graph = line_graph(4);
        let mut follower = follower_on(&graph, &[0, 1, 2, 3]);
        assert_eq!(follower.advance(700.0, &graph), PathState::Following);
        assert_eq!(follower.point(), 1);
        assert_approx_eq!(follower.progress(), 0.2);
        assert_approx_eq!(follower.location(&graph).0.x, 700.0);
        assert_approx_eq!(follower.location_ahead(1000.0, &graph).0.x, 1700.0);
        // Lookahead does not move the follower.
        assert_approx_eq!(follower.location(&graph).0.x, 700.0);
        assert_eq!(follower.advance(5000.0, &graph), PathState::Ended { has_outbound: false });
        assert_approx_eq!(follower.location(&graph).0.x, 3000.0);
    }

    #[test]
    fn forward_then_back_returns_to_start() {
        let graph = ring_graph(12, 4000.0);
        let path = (0..40).map(|i| i % 12).collect::<Vec<_>>();
        let mut follower = follower_on(&graph, &path);
        follower.set_point_and_progress(3, 0.4, &graph);
        let before = (follower.point(), follower.progress(), follower.location(&graph).0);
        for d in [10.0, 900.0, 2345.6, 7000.0] {
            follower.advance(d, &graph);
            follower.advance(-d, &graph);
            assert_eq!(follower.point(), before.0);
            assert_approx_eq!(follower.progress(), before.1, 1e-6);
            assert!(follower.location(&graph).0.distance(before.2) < 1e-3);
        }
    }

    #[test]
    fn reversing_stops_at_path_start() {
        let graph = line_graph(3);
        let mut follower = follower_on(&graph, &[0, 1, 2]);
        follower.advance(300.0, &graph);
        follower.advance(-1000.0, &graph);
        assert_eq!(follower.point(), 0);
        assert_eq!(follower.progress(), 0.0);
    }

    #[test]
    fn empty_and_single_point_paths() {
        let graph = line_graph(2);
        let mut follower = CurveFollower::new(true);
        assert_eq!(follower.location(&graph), (Point3d::origin(), Vector3d::unit_x()));
        follower.set_path(KeypointPath::from_keypoints([1]), 0, 0.0, &graph);
        assert_eq!(follower.advance(10.0, &graph), PathState::Ended { has_outbound: false });
        assert!(follower.is_finished());
        assert_approx_eq!(follower.location(&graph).0.x, 1000.0);
    }

    #[test]
    fn path_from_nearest_starts_at_position() {
        let graph = ring_graph(8, 2000.0);
        let mut follower = CurveFollower::new(true);
        let here = Point3d::new(2100.0, 50.0, 0.0);
        assert!(follower.new_path_from_nearest(here, rules::ALL, &graph, &mut rng()));
        assert_eq!(follower.path().get(0), Some(PathPoint::Custom(0)));
        assert_eq!(follower.path().get(1), Some(PathPoint::Keypoint(0)));
        assert!(follower.location(&graph).0.distance(here) < 1e-6);

        // Dead ends cannot be continued from.
        let line = line_graph(3);
        let at_end = Point3d::new(2000.0, 0.0, 0.0);
        assert!(!follower.new_path_from_nearest(at_end, rules::ALL, &line, &mut rng()));
    }

    #[test]
    fn ended_path_reports_outbound() {
        let graph = ring_graph(6, 1000.0);
        let mut follower = follower_on(&graph, &[0, 1, 2]);
        assert_eq!(follower.advance(1.0e6, &graph), PathState::Ended { has_outbound: true });
    }
}
