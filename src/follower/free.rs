use super::PathState;
use crate::graph::{KeypointGraph, KeypointPath};
use crate::math::{Point3d, Vector3d};
use cgmath::Zero;
use rand::Rng;

/// Tracks an entity's progress along a [KeypointPath] as a sequence of target points.
///
/// Unlike [super::CurveFollower], this does not move the entity. The entity walks
/// towards [FreeFollower::target] and calls [FreeFollower::advance_target] when close enough.
#[derive(Clone, Debug)]
pub struct FreeFollower {
    path: KeypointPath,
    point: usize,
    /// Added to every target, e.g. to keep a pedestrian's centre above the ground.
    offset: Vector3d,
}

impl Default for FreeFollower {
    fn default() -> Self {
        Self::new(Vector3d::zero())
    }
}

impl FreeFollower {
    pub fn new(offset: Vector3d) -> Self {
        Self {
            path: KeypointPath::default(),
            point: 0,
            offset,
        }
    }

    pub fn path(&self) -> &KeypointPath {
        &self.path
    }

    pub fn point(&self) -> usize {
        self.point
    }

    pub fn offset(&self) -> Vector3d {
        self.offset
    }

    /// The point currently being walked towards.
    pub fn target(&self, graph: &KeypointGraph) -> Point3d {
        if self.path.is_empty() {
            return Point3d::new(0.0, 0.0, 0.0) + self.offset;
        }
        let index = self.point.min(self.path.len() - 1);
        self.path.position(index, graph) + self.offset
    }

    /// Moves on to the next point of the path.
    pub fn advance_target(&mut self, graph: &KeypointGraph) -> PathState {
        self.point += 1;
        self.state(graph)
    }

    pub fn state(&self, graph: &KeypointGraph) -> PathState {
        if self.point + 1 < self.path.len() {
            return PathState::Following;
        }
        let has_outbound = self
            .path
            .last_keypoint()
            .map_or(false, |k| !graph.outbound(k).is_empty());
        PathState::Ended { has_outbound }
    }

    /// Replaces the path, targeting its first point.
    pub fn set_path(&mut self, path: KeypointPath, point: usize) {
        self.path = path;
        self.point = point;
    }

    /// Starts a random path from the keypoint closest to `position`.
    ///
    /// Returns the path's first target, which the entity should be placed at.
    pub fn new_path_from_nearest<R: Rng + ?Sized>(
        &mut self,
        position: Point3d,
        exceptions: u32,
        graph: &KeypointGraph,
        rng: &mut R,
    ) -> Option<Point3d> {
        let closest = graph.closest_keypoint(position)?;
        self.set_path(graph.random_path_from(closest, exceptions, rng), 0);
        Some(self.target(graph))
    }

    /// Starts a random path from a random spawn point, returning its first target.
    pub fn new_path_from_spawn<R: Rng + ?Sized>(
        &mut self,
        exceptions: u32,
        graph: &KeypointGraph,
        rng: &mut R,
    ) -> Option<Point3d> {
        let spawn = graph.random_spawn_point(rng)?;
        self.set_path(graph.random_path_from(spawn, exceptions, rng), 0);
        Some(self.target(graph))
    }

    /// Starts a random path anywhere in the graph, returning its first target.
    pub fn first_time_spawn<R: Rng + ?Sized>(
        &mut self,
        exceptions: u32,
        graph: &KeypointGraph,
        rng: &mut R,
    ) -> Point3d {
        self.set_path(graph.random_path(exceptions, rng), 0);
        self.target(graph)
    }

    /// Starts the shortest path between two keypoints, returning its first target.
    pub fn new_path_between<R: Rng + ?Sized>(
        &mut self,
        start: usize,
        dest: usize,
        exceptions: u32,
        graph: &KeypointGraph,
        rng: &mut R,
    ) -> Point3d {
        self.set_path(graph.find_path(start, dest, exceptions, rng), 0);
        self.target(graph)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::rules;
    use crate::graph::test::{line_graph, ring_graph, rng};
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn default_follower_targets_the_origin() {
        let graph = line_graph(3);
        let follower = FreeFollower::default();
        assert_eq!(follower.offset(), Vector3d::zero());
        assert_eq!(follower.target(&graph), Point3d::new(0.0, 0.0, 0.0));
        assert_eq!(follower.state(&graph), PathState::Ended { has_outbound: false });
    }

    #[test]
    fn targets_are_offset_keypoints() {
        let graph = line_graph(3);
        let mut follower = FreeFollower::new(Vector3d::new(0.0, 0.0, 90.0));
        let start = follower.new_path_between(0, 2, rules::ALL, &graph, &mut rng());
        assert_approx_eq!(start.x, 0.0);
        assert_approx_eq!(start.z, 90.0);
        assert_eq!(follower.advance_target(&graph), PathState::Following);
        assert_approx_eq!(follower.target(&graph).x, 1000.0);
        assert_eq!(
            follower.advance_target(&graph),
            PathState::Ended { has_outbound: false }
        );
        assert_approx_eq!(follower.target(&graph).x, 2000.0);
        // Further advances stay on the last point.
        follower.advance_target(&graph);
        assert_approx_eq!(follower.target(&graph).x, 2000.0);
    }

    #[test]
    fn nearest_path_starts_on_closest_keypoint() {
        let graph = ring_graph(6, 1000.0);
        let mut follower = FreeFollower::default();
        let start = follower
            .new_path_from_nearest(Point3d::new(900.0, 30.0, 0.0), rules::ALL, &graph, &mut rng())
            .unwrap();
        assert_approx_eq!(start.x, 1000.0);
        assert_approx_eq!(start.y, 0.0);
        assert_eq!(follower.state(&graph), PathState::Following);

        let empty = KeypointGraph::new();
        assert!(follower.new_path_from_spawn(rules::ALL, &empty, &mut rng()).is_none());
    }
}
