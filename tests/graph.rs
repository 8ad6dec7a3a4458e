//! Tests of keypoint graphs and the paths generated on them.

use keypoint_traffic::{
    math::Point3d, rules, CurveFollower, KeypointGraph, KeypointPath, PathState,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

/// Two routes from 0 to 3: through 1 (closed to traffic) or the long way through 4.
fn forked_graph() -> KeypointGraph {
    let mut graph = KeypointGraph::new();
    graph.add_keypoint(Point3d::new(0.0, 0.0, 0.0));
    graph.add_keypoint(Point3d::new(1000.0, 0.0, 0.0));
    graph.add_keypoint(Point3d::new(2000.0, 0.0, 0.0));
    graph.add_keypoint(Point3d::new(3000.0, 0.0, 0.0));
    graph.add_keypoint(Point3d::new(1500.0, 3000.0, 0.0));
    for (from, to) in [(0, 1), (1, 2), (2, 3), (0, 4), (4, 3)] {
        graph.link_keypoints(from, to).unwrap();
    }
    graph.set_keypoint_rules(1, rules::NO_ACCESS);
    graph.mark_spawn_point(0);
    graph.update_entry_points();
    graph
}

#[test]
fn path_to_self_is_a_single_keypoint() {
    let mut graph = KeypointGraph::new();
    for i in 0..8 {
        graph.add_keypoint(Point3d::new(100.0 * i as f64, 0.0, 0.0));
    }
    for i in 1..8 {
        graph.link_keypoints(i - 1, i).unwrap();
    }
    let path = graph.find_path(5, 5, rules::ALL, &mut rng());
    assert_eq!(path, KeypointPath::from_keypoints([5]));
}

#[test]
fn lone_keypoint_walk_ends_immediately() {
    let mut graph = KeypointGraph::new();
    graph.add_keypoint(Point3d::new(10.0, 20.0, 0.0));
    let path = graph.random_path_from(0, rules::ALL, &mut rng());
    assert_eq!(path.keypoints().collect::<Vec<_>>(), vec![0]);
}

#[test]
fn paths_respect_keypoint_rules() {
    let graph = forked_graph();
    let mut rng = rng();

    let unrestricted = graph.find_path(0, 3, rules::ALL, &mut rng);
    assert_eq!(unrestricted.keypoints().collect::<Vec<_>>(), vec![0, 1, 2, 3]);

    let restricted = graph.find_path(0, 3, rules::NONE, &mut rng);
    assert_eq!(restricted.keypoints().collect::<Vec<_>>(), vec![0, 4, 3]);

    for _ in 0..20 {
        let walk = graph.random_path_from(0, rules::NONE, &mut rng);
        assert!(walk.keypoints().all(|k| graph.compare_rules(k, rules::NONE)));
    }
}

#[test]
fn margin_keypoints_are_spread_out() {
    let mut graph = KeypointGraph::new();
    for x in 0..10 {
        for y in 0..10 {
            graph.add_keypoint(Point3d::new(x as f64 * 300.0, y as f64 * 300.0, 0.0));
        }
    }
    let margin = 1000.0;
    let chosen = graph.keypoints_with_margin(margin, &mut rng());
    assert!(chosen.len() > 1);
    for (i, a) in chosen.iter().enumerate() {
        for b in &chosen[i + 1..] {
            let pa = graph.position(*a).unwrap();
            let pb = graph.position(*b).unwrap();
            assert!((pa - pb).x.hypot((pa - pb).y) >= margin);
        }
    }
}

#[test]
fn text_format_round_trip() {
    let mut graph = forked_graph();
    graph.add_overtake_lanes((0, 1), (0, 4));
    let mut text = vec![];
    graph.write_to(&mut text).unwrap();
    let parsed = KeypointGraph::parse(std::str::from_utf8(&text).unwrap()).unwrap();

    assert_eq!(parsed.len(), graph.len());
    assert_eq!(parsed.links(), graph.links());
    assert_eq!(parsed.spawn_points(), graph.spawn_points());
    assert_eq!(parsed.overtake_lanes(), graph.overtake_lanes());
    assert_eq!(parsed.keypoint(1).unwrap().rules, rules::NO_ACCESS);
    assert_eq!(parsed.outbound(0), graph.outbound(0));
    assert_eq!(parsed.position(4), graph.position(4));
}

#[test]
fn follower_advances_symmetrically() {
    let mut graph = KeypointGraph::new();
    graph.add_keypoint(Point3d::new(0.0, 0.0, 0.0));
    graph.add_keypoint(Point3d::new(1000.0, 0.0, 0.0));
    graph.add_keypoint(Point3d::new(2000.0, 800.0, 0.0));
    graph.add_keypoint(Point3d::new(2500.0, 2000.0, 0.0));
    for i in 1..4 {
        graph.link_keypoints(i - 1, i).unwrap();
    }

    let mut follower = CurveFollower::new(true);
    follower.set_path(KeypointPath::from_keypoints([0, 1, 2, 3]), 0, 0.25, &graph);
    let (start, _) = follower.location(&graph);
    let (point, progress) = (follower.point(), follower.progress());

    assert_eq!(follower.advance(1300.0, &graph), PathState::Following);
    assert!(follower.point() > point);
    follower.advance(-1300.0, &graph);

    let (end, _) = follower.location(&graph);
    assert_eq!(follower.point(), point);
    assert!((follower.progress() - progress).abs() < 1e-9);
    assert!((end - start).x.abs() < 1e-6 && (end - start).y.abs() < 1e-6);
}
