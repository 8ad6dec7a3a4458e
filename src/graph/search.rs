use super::{KeypointGraph, KeypointPath};
use crate::math::distance_2d;
use log::warn;
use pathfinding::directed::astar::astar;
use rand::seq::SliceRandom;
use rand::Rng;

/// Path costs are planar distances in this fraction of a world unit. Link costs
/// round up and the heuristic rounds down, so the heuristic stays consistent.
const COST_RESOLUTION: f64 = 10.0;

impl KeypointGraph {
    /// Finds the shortest path from `start` to `dest` over traversable keypoints,
    /// measuring distance in the ground plane.
    ///
    /// Never fails: if `start` is not traversable a random path is returned, and if
    /// `dest` is unreachable the path leads to a random traversable neighbour of
    /// `start`, or walks randomly from a spawn point when `start` is a dead end.
    pub fn find_path<R: Rng + ?Sized>(
        &self,
        start: usize,
        dest: usize,
        exceptions: u32,
        rng: &mut R,
    ) -> KeypointPath {
        if !self.compare_rules(start, exceptions) {
            return self.random_path(exceptions, rng);
        }
        if start == dest {
            return KeypointPath::from_keypoints([start]);
        }

        let result = astar(
            &start,
            |k| successors(self, *k, exceptions),
            |k| self.cost_lower_bound(*k, dest),
            |k| *k == dest,
        );
        if let Some((points, _)) = result {
            return KeypointPath::from_keypoints(points);
        }

        warn!("No path from keypoint {} to {}", start, dest);
        let outbound = self.verified(self.outbound(start), exceptions);
        match outbound.choose(rng) {
            Some(next) => KeypointPath::from_keypoints([start, *next]),
            None => match self.random_spawn_point(rng) {
                Some(spawn) => self.random_path_from(spawn, exceptions, rng),
                None => self.random_path(exceptions, rng),
            },
        }
    }

    fn scaled_distance(&self, a: usize, b: usize) -> f64 {
        match (self.position(a), self.position(b)) {
            (Some(a), Some(b)) => distance_2d(a, b) * COST_RESOLUTION,
            _ => 0.0,
        }
    }

    fn link_cost(&self, from: usize, to: usize) -> u64 {
        self.scaled_distance(from, to).ceil() as u64
    }

    fn cost_lower_bound(&self, from: usize, dest: usize) -> u64 {
        self.scaled_distance(from, dest).floor() as u64
    }
}

fn successors(
    graph: &KeypointGraph,
    from: usize,
    exceptions: u32,
) -> impl Iterator<Item = (usize, u64)> + '_ {
    graph
        .verified(graph.outbound(from), exceptions)
        .into_iter()
        .map(move |to| (to, graph.link_cost(from, to)))
}
