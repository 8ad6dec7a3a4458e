//! Tests that run the traffic controller over small hand-built scenes.

use keypoint_traffic::{
    math::{rotation_from_direction, Orientation, Point3d, Vector3d},
    AreaKind, CarTemplate, EntityKind, FrameInput, GraphKind, KeypointGraph, LightState,
    TrafficArea, TrafficConfig, TrafficController, TrafficEvent, TrafficLightGroup, TramLight,
    TramTemplate,
};

fn controller() -> TrafficController {
    let config = TrafficConfig {
        cars: 0,
        pedestrians: 0,
        bicycles: 0,
        trams: 0,
        parallel: false,
        ..TrafficConfig::default()
    };
    let mut controller = TrafficController::with_seed(config, 3);
    controller.set_car_templates(vec![CarTemplate::default()]);
    controller.set_tram_templates(vec![TramTemplate::default()]);
    controller
}

/// A straight one-way road along the x axis with keypoints 1000 apart.
fn straight_road(n: usize) -> KeypointGraph {
    let mut graph = KeypointGraph::new();
    for i in 0..n {
        graph.add_keypoint(Point3d::new(1000.0 * i as f64, 0.0, 0.0));
    }
    for i in 1..n {
        graph.link_keypoints(i - 1, i).unwrap();
    }
    graph.mark_spawn_point(0);
    graph
}

fn facing(x: f64, y: f64) -> Orientation {
    rotation_from_direction(Vector3d::new(x, y, 0.0))
}

/// Test that a car's position increases monotonically.
#[test]
fn car_drives_forward() {
    let mut controller = controller();
    controller.set_graph(GraphKind::Road, straight_road(20));
    let car = controller
        .spawn_car(Point3d::new(0.0, 0.0, 0.0), facing(1.0, 0.0), true)
        .unwrap();

    let start = controller.entity(car).unwrap().position();
    let mut x = start.x;
    for _ in 0..100 {
        controller.tick(0.1, &FrameInput::default());
        let next = controller.entity(car).unwrap().position();
        assert!(next.x >= x);
        assert!(next.y.abs() < 1.0);
        x = next.x;
    }
    assert!(x > start.x + 1000.0);
}

/// Two cars driving straight at each other never both give way.
#[test]
fn head_on_cars_do_not_deadlock() {
    let mut controller = controller();
    let mut graph = KeypointGraph::new();
    graph.add_keypoint(Point3d::new(0.0, 0.0, 0.0));
    graph.add_keypoint(Point3d::new(4000.0, 0.0, 0.0));
    graph.add_keypoint(Point3d::new(3500.0, 0.0, 0.0));
    graph.add_keypoint(Point3d::new(-500.0, 0.0, 0.0));
    graph.link_keypoints(0, 1).unwrap();
    graph.link_keypoints(2, 3).unwrap();
    controller.set_graph(GraphKind::Road, graph);

    let a = controller
        .spawn_car(Point3d::new(0.0, 0.0, 0.0), facing(1.0, 0.0), true)
        .unwrap();
    let b = controller
        .spawn_car(Point3d::new(3500.0, 0.0, 0.0), facing(-1.0, 0.0), true)
        .unwrap();

    let mut anyone_blocked = false;
    for _ in 0..200 {
        controller.tick(0.05, &FrameInput::default());
        let (car_a, car_b) = match (controller.entity(a), controller.entity(b)) {
            (Some(car_a), Some(car_b)) => (car_a, car_b),
            _ => break,
        };
        assert!(!(car_a.blocked() && car_b.blocked()));
        anyone_blocked |= car_a.blocked() || car_b.blocked();
    }
    assert!(anyone_blocked);
}

/// A car inside an active stop area halts until the area is switched off.
#[test]
fn stop_area_holds_car_until_released() {
    let mut controller = controller();
    controller.set_graph(GraphKind::Road, straight_road(6));
    let area = controller.add_area(TrafficArea::new(
        AreaKind::Stop { active: true },
        Point3d::new(1000.0, 0.0, 0.0),
        facing(1.0, 0.0),
        Vector3d::new(8.0, 4.0, 3.0),
    ));
    let car = controller
        .spawn_car(Point3d::new(1000.0, 0.0, 0.0), facing(1.0, 0.0), true)
        .unwrap();

    controller.tick(0.1, &FrameInput::default());
    assert!(controller.entity(car).unwrap().stopped());
    let events = controller.drain_events().collect::<Vec<_>>();
    assert!(events.contains(&TrafficEvent::EnteredStopArea { entity: car, area }));

    controller.area_mut(area).unwrap().deactivate();
    controller.tick(0.1, &FrameInput::default());
    assert!(!controller.entity(car).unwrap().stopped());
}

/// An intersection never lets two of its groups through at once.
#[test]
fn intersection_shows_one_group_at_a_time() {
    let mut controller = controller();
    let groups = (0..3)
        .map(|i| {
            let area = controller.add_area(TrafficArea::new(
                AreaKind::Stop { active: true },
                Point3d::new(0.0, 1000.0 * i as f64, 0.0),
                facing(1.0, 0.0),
                Vector3d::new(1.0, 1.0, 1.0),
            ));
            controller.add_light_group(TrafficLightGroup::new(vec![area]).with_durations(1.5, 4.0))
        })
        .collect::<Vec<_>>();
    controller.add_intersection(groups.clone());

    let mut greens = vec![false; groups.len()];
    for _ in 0..600 {
        controller.tick(0.1, &FrameInput::default());
        let states = groups
            .iter()
            .map(|g| controller.light_group(*g).unwrap().state())
            .collect::<Vec<_>>();
        assert!(states.iter().filter(|s| **s != LightState::Red).count() <= 1);
        for (green, state) in greens.iter_mut().zip(&states) {
            *green |= *state == LightState::Green;
        }
    }
    assert!(greens.iter().all(|g| *g));
}

/// A tram passing through a tram light area stops the road while it crosses.
#[test]
fn tram_light_stops_the_road() {
    let mut controller = controller();
    controller.set_graph(GraphKind::Tramway, straight_road(20));
    let stop = controller.add_area(TrafficArea::new(
        AreaKind::Stop { active: false },
        Point3d::new(3000.0, 3000.0, 0.0),
        facing(0.0, -1.0),
        Vector3d::new(4.0, 4.0, 3.0),
    ));
    let road = controller.add_light_group(TrafficLightGroup::new(vec![stop]));
    let detector = controller.add_area(TrafficArea::new(
        AreaKind::TramLight,
        Point3d::new(3000.0, 0.0, 0.0),
        facing(1.0, 0.0),
        Vector3d::new(10.0, 10.0, 3.0),
    ));
    let crossing = controller.add_tram_intersection(vec![TramLight::new(detector, vec![road], vec![])]);
    assert_eq!(controller.tram_intersection(crossing).unwrap().lights().len(), 1);
    controller.spawn_tram(Point3d::new(0.0, 0.0, 0.0), true).unwrap();

    let mut states = vec![controller.light_group(road).unwrap().state()];
    for _ in 0..300 {
        controller.tick(0.1, &FrameInput::default());
        let state = controller.light_group(road).unwrap().state();
        if states.last() != Some(&state) {
            states.push(state);
        }
        assert_eq!(controller.area(stop).unwrap().active(), state.stops_traffic());
    }
    use LightState::*;
    assert_eq!(states, vec![Green, Yellow, Red, Yellow, Green]);
}

/// A tram stops just past a station and waits before setting off again.
#[test]
fn tram_waits_at_station() {
    let mut controller = controller();
    controller.set_graph(GraphKind::Tramway, straight_road(60));
    controller.add_area(TrafficArea::new(
        AreaKind::TramStation { stop_time: 2.0, leave_speed: 800.0 },
        Point3d::new(3000.0, 0.0, 0.0),
        facing(1.0, 0.0),
        Vector3d::new(10.0, 10.0, 3.0),
    ));
    let id = controller.spawn_tram(Point3d::new(0.0, 0.0, 0.0), true).unwrap();

    let mut stopped = false;
    let mut left = false;
    for _ in 0..400 {
        controller.tick(0.1, &FrameInput::default());
        let entity = controller.entity(id).unwrap();
        let EntityKind::Tram(tram) = entity.kind() else {
            panic!("not a tram");
        };
        if tram.at_station() {
            stopped = true;
            assert!(entity.position().x > 3000.0);
        } else if stopped && tram.target_speed() == 800.0 && entity.position().x > 6000.0 {
            left = true;
            break;
        }
    }
    assert!(stopped && left);
}
