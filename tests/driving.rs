//! Tests that drive agents through a whole simulation.

mod common;

use common::{straight_road, wp, Kinematic};
use std::f64::consts::FRAC_PI_2;
use urban_traffic::{
    math::Point2d, AgentAttributes, AgentType, ApproachAttributes, Behavior, CrossingAttributes,
    Event, IntersectionAttributes, IntersectionControl, LevelData, LightState, SignalPhase,
    SignalTiming, Simulation, SimulationConfig, WaypointId,
};

const CAR: AgentType = AgentType(0);
const WALKER: AgentType = AgentType(1);

/// A signalised crossroads. The west-east road (0..4) stops at waypoint 2 and the
/// south-north road (5..7) at waypoint 6. A footpath (10, 8, 9, 11) crosses the west arm.
fn crossroads() -> LevelData {
    let waypoints = vec![
        wp(0, -40.0, 0.0, &[1]),
        wp(1, -20.0, 0.0, &[2]),
        wp(2, 0.0, 0.0, &[3]),
        wp(3, 10.0, 0.0, &[4]),
        wp(4, 30.0, 0.0, &[]),
        wp(5, 0.0, -30.0, &[6]),
        wp(6, 0.0, -8.0, &[7]),
        wp(7, 0.0, 20.0, &[]),
        wp(8, -5.0, 6.0, &[9]),
        wp(9, -5.0, -6.0, &[11]),
        wp(10, -5.0, 15.0, &[8]),
        wp(11, -5.0, -15.0, &[]),
    ];
    let intersection = IntersectionAttributes {
        name: "crossroads".into(),
        approaches: vec![
            ApproachAttributes {
                stop_waypoints: vec![WaypointId(2)],
                conflicts: None,
            },
            ApproachAttributes {
                stop_waypoints: vec![WaypointId(6)],
                conflicts: None,
            },
        ],
        exit_waypoints: vec![WaypointId(3), WaypointId(7)],
        crossings: vec![CrossingAttributes {
            waypoints: vec![WaypointId(8), WaypointId(9)],
            conflicts: None,
        }],
        // The cross road gets the first green
        control: IntersectionControl::Signal(SignalTiming {
            phases: vec![SignalPhase::new(&[1], 10.0), SignalPhase::new(&[0], 8.0)],
            amber_time: 0.0,
            all_red_time: 1.0,
        }),
    };
    LevelData::fitted(waypoints, vec![intersection], 10.0, 20.0)
}

fn reached_waypoints(events: &[Event]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::WaypointReached { waypoint, .. } => Some(waypoint.0),
            _ => None,
        })
        .collect()
}

/// A car on an empty road passes every waypoint in order, then arrives.
#[test]
fn vehicle_drives_to_end_of_road() {
    let level = LevelData::fitted(straight_road(10, 10.0), vec![], 10.0, 20.0);
    let mut sim = Simulation::load(&level, SimulationConfig::default()).unwrap();
    let car = sim.add_agent(
        AgentAttributes::car(CAR),
        Box::new(Kinematic::car(Point2d::new(-2.0, 0.0), 0.0)),
        Behavior::follow_path(),
        Some(WaypointId(0)),
    );

    let mut x = -2.0;
    for _ in 0..300 {
        sim.step(0.1);
        let next = sim.agent(car).unwrap().position().x;
        assert!(next >= x);
        x = next;
    }

    let events = sim.take_events();
    assert_eq!(events.first(), Some(&Event::AgentAdded(car)));
    assert_eq!(reached_waypoints(&events), (0..10).collect::<Vec<_>>());
    assert_eq!(events.last(), Some(&Event::DestinationReached(car)));
    assert!((0..10).all(|i| !sim.registry().is_reserved(WaypointId(i))));
}

/// A car waits at a red light and crosses once its approach turns green.
#[test]
fn vehicle_waits_for_green() {
    let mut sim = Simulation::load(&crossroads(), SimulationConfig::default()).unwrap();
    let car = sim.add_agent(
        AgentAttributes::car(CAR),
        Box::new(Kinematic::car(Point2d::new(-42.0, 0.0), 0.0)),
        Behavior::follow_path(),
        Some(WaypointId(0)),
    );

    let mut entered_at = None;
    let mut arrived = false;
    for _ in 0..300 {
        sim.step(0.1);
        if sim.time() < 10.8 {
            assert!(sim.agent(car).unwrap().position().x < 0.0);
        }
        for event in sim.take_events() {
            match event {
                Event::WaypointReached { waypoint: WaypointId(2), .. } => {
                    entered_at.get_or_insert(sim.time());
                }
                Event::DestinationReached(_) => arrived = true,
                _ => {}
            }
        }
    }

    assert!(entered_at.unwrap() > 10.8);
    assert!(arrived);
    let (_, controller) = sim.intersections().iter().next().unwrap();
    assert_eq!(controller.vehicles_inside().count(), 0);
    assert!(!controller.contains_vehicle(car));
}

/// A pedestrian only steps onto the street while every light is red.
#[test]
fn pedestrian_crosses_during_all_red() {
    let mut sim = Simulation::load(&crossroads(), SimulationConfig::default()).unwrap();
    let walker = sim.add_agent(
        AgentAttributes::pedestrian(WALKER),
        Box::new(Kinematic::walker(Point2d::new(-5.0, 16.0), -FRAC_PI_2)),
        Behavior::follow_path(),
        Some(WaypointId(10)),
    );

    let mut started = false;
    let mut arrived = false;
    for _ in 0..600 {
        sim.step(0.1);
        for event in sim.take_events() {
            match event {
                Event::StreetCrossingStarted { agent, intersection, waypoint } => {
                    assert_eq!(agent, walker);
                    assert_eq!(waypoint, WaypointId(8));
                    let controller = sim.intersections().get(intersection).unwrap();
                    assert_eq!(controller.light(0), Some(LightState::Red));
                    assert_eq!(controller.light(1), Some(LightState::Red));
                    started = true;
                }
                Event::DestinationReached(agent) => {
                    assert_eq!(agent, walker);
                    assert!(started);
                    arrived = true;
                }
                _ => {}
            }
        }
    }

    assert!(started);
    assert!(arrived);
    let (_, controller) = sim.intersections().iter().next().unwrap();
    assert_eq!(controller.pedestrians_crossing(0), 0);
}

/// Removing an agent mid-intersection frees its slot for everyone else.
#[test]
fn removed_vehicle_releases_intersection() {
    let mut sim = Simulation::load(&crossroads(), SimulationConfig::default()).unwrap();
    // Wait for the west-east green
    for _ in 0..115 {
        sim.step(0.1);
    }
    let car = sim.add_agent(
        AgentAttributes::car(CAR),
        Box::new(Kinematic::car(Point2d::new(-1.0, 0.0), 0.0)),
        Behavior::follow_path(),
        Some(WaypointId(2)),
    );
    sim.step(0.1);
    let (id, controller) = sim.intersections().iter().next().unwrap();
    assert!(controller.contains_vehicle(car));
    assert_eq!(sim.agent(car).unwrap().intersection(), Some(id));

    assert!(sim.remove_agent(car));
    let controller = sim.intersections().get(id).unwrap();
    assert_eq!(controller.vehicles_inside().count(), 0);
    assert!(sim.registry().is_empty());
    assert_eq!(sim.reconcile(), 0);
}

/// Swapping behavior drops the old path and raises an event.
#[test]
fn behavior_swap_is_reported() {
    let level = LevelData::fitted(straight_road(6, 10.0), vec![], 10.0, 20.0);
    let mut sim = Simulation::load(&level, SimulationConfig::default()).unwrap();
    let walker = sim.add_agent(
        AgentAttributes::pedestrian(CAR),
        Box::new(Kinematic::walker(Point2d::new(0.0, 0.0), 0.0)),
        Behavior::follow_path(),
        None,
    );
    sim.step(0.1);
    assert!(sim.registry().is_reserved(WaypointId(3)));

    sim.set_destination(walker, WaypointId(2)).unwrap();
    assert_eq!(sim.behavior(walker).map(|b| b.name()), Some("run_toward_point"));
    assert!(!sim.registry().is_reserved(WaypointId(3)));
    let events = sim.take_events();
    assert_eq!(
        events.last(),
        Some(&Event::BehaviorChanged {
            agent: walker,
            behavior: "run_toward_point"
        })
    );
    assert!(sim.set_destination(walker, WaypointId(99)).is_err());
}

/// A destination behind a one-way road is never reported as reached.
#[test]
fn unreachable_destination_is_not_reached() {
    let level = LevelData::fitted(straight_road(5, 10.0), vec![], 10.0, 20.0);
    let mut sim = Simulation::load(&level, SimulationConfig::default()).unwrap();
    let walker = sim.add_agent(
        AgentAttributes::pedestrian(WALKER),
        Box::new(Kinematic::walker(Point2d::new(30.0, 0.0), 0.0)),
        Behavior::follow_path(),
        Some(WaypointId(3)),
    );
    sim.step(0.1);
    assert_eq!(sim.registry().get(walker).unwrap().last_reached(), Some(WaypointId(3)));
    sim.set_destination(walker, WaypointId(0)).unwrap();
    for _ in 0..50 {
        sim.step(0.1);
    }
    let events = sim.take_events();
    assert!(!events.contains(&Event::DestinationReached(walker)));
    match sim.behavior(walker) {
        Some(Behavior::RunTowardPoint(b)) => assert!(b.is_stranded()),
        other => panic!("unexpected behavior {:?}", other.map(|b| b.name())),
    }
}
