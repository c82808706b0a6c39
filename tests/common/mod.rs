//! Helpers shared by the integration tests.

#![allow(dead_code)]

use urban_traffic::{
    math::{Point2d, Vector2d},
    AgentController, ControlIntent, WaypointAttributes,
};

/// The hard braking deceleration of every test agent, in m/s^2.
const MAX_DECEL: f64 = 6.0;

/// A point-mass controller which integrates its control inputs with a fixed time step.
#[derive(Clone, Debug)]
pub struct Kinematic {
    pub position: Point2d,
    /// Heading angle in radians, counter-clockwise from the x axis.
    pub angle: f64,
    pub speed: f64,
    /// Acceleration at full throttle, in m/s^2.
    pub max_acc: f64,
    /// Turn rate at full steering lock, in rad/s.
    pub turn_rate: f64,
    pub dt: f64,
    /// A fixed obstacle distance reported to the simulation.
    pub obstacle: Option<f64>,
}

impl Kinematic {
    pub fn car(position: Point2d, angle: f64) -> Self {
        Self {
            position,
            angle,
            speed: 0.0,
            max_acc: 2.0,
            turn_rate: 1.0,
            dt: 0.1,
            obstacle: None,
        }
    }

    pub fn walker(position: Point2d, angle: f64) -> Self {
        Self {
            max_acc: 1.0,
            turn_rate: 3.0,
            ..Self::car(position, angle)
        }
    }
}

impl AgentController for Kinematic {
    fn position(&self) -> Point2d {
        self.position
    }

    fn heading(&self) -> Vector2d {
        Vector2d::new(self.angle.cos(), self.angle.sin())
    }

    fn speed(&self) -> f64 {
        self.speed
    }

    fn obstacle_distance(&self) -> Option<f64> {
        self.obstacle
    }

    fn apply(&mut self, intent: &ControlIntent) {
        let acc = intent.throttle * self.max_acc - intent.brake * MAX_DECEL;
        self.speed = (self.speed + acc * self.dt).max(0.0);
        self.angle += intent.steer * self.turn_rate * self.dt;
        self.position += self.heading() * self.speed * self.dt;
    }
}

/// A waypoint linked to the given successors.
pub fn wp(id: u32, x: f64, y: f64, next: &[u32]) -> WaypointAttributes {
    WaypointAttributes::new(id, Point2d::new(x, y), next)
}

/// A straight one-way road of `count` waypoints along the x axis, `spacing` m apart.
pub fn straight_road(count: u32, spacing: f64) -> Vec<WaypointAttributes> {
    (0..count)
        .map(|i| {
            let next = if i + 1 < count { vec![i + 1] } else { vec![] };
            wp(i, spacing * i as f64, 0.0, &next)
        })
        .collect()
}
