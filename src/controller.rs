//! The interface between the simulation core and the physics controllers that move agents.

use crate::math::{Point2d, Vector2d};
use crate::AgentId;

/// The control inputs the simulation requests of an agent for the next frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlIntent {
    /// Steering input in [-1, 1]; positive steers left.
    pub steer: f64,
    /// Throttle input in [0, 1].
    pub throttle: f64,
    /// Brake input in [0, 1].
    pub brake: f64,
    /// Handbrake input in [0, 1].
    pub handbrake: f64,
    /// -1 for reverse, 0 for neutral, 1 for forward drive.
    pub gear: i8,
    /// The speed the agent is trying to reach, in m/s.
    pub target_speed: f64,
}

impl ControlIntent {
    /// Full brake with the wheels straight.
    pub fn hold() -> Self {
        Self {
            steer: 0.0,
            throttle: 0.0,
            brake: 1.0,
            handbrake: 0.0,
            gear: 1,
            target_speed: 0.0,
        }
    }

    /// Clamps every input into its valid range.
    pub fn clamped(self) -> Self {
        Self {
            steer: self.steer.clamp(-1.0, 1.0),
            throttle: self.throttle.clamp(0.0, 1.0),
            brake: self.brake.clamp(0.0, 1.0),
            handbrake: self.handbrake.clamp(0.0, 1.0),
            gear: self.gear.clamp(-1, 1),
            target_speed: self.target_speed.max(0.0),
        }
    }

    /// Whether the intent asks the agent to stop.
    pub fn is_stopping(&self) -> bool {
        self.throttle == 0.0 && self.brake > 0.0
    }
}

impl Default for ControlIntent {
    fn default() -> Self {
        Self::hold()
    }
}

/// Optional vehicle-dynamics capabilities of a controller.
pub trait VehicleDynamics {
    /// The current steering input in [-1, 1]; positive is left.
    fn steer_input(&self) -> f64;
}

/// A physics controller moving one agent, implemented outside the simulation core.
pub trait AgentController {
    /// The agent's position on the horizontal plane.
    fn position(&self) -> Point2d;

    /// A vector aligned with the agent's heading.
    fn heading(&self) -> Vector2d;

    /// The agent's current speed in m/s.
    fn speed(&self) -> f64;

    /// The distance in m to the closest obstacle ahead, if one is detected.
    fn obstacle_distance(&self) -> Option<f64> {
        None
    }

    /// The vehicle-dynamics capability, for controllers that provide one.
    fn dynamics(&self) -> Option<&dyn VehicleDynamics> {
        None
    }

    /// Applies the control inputs for the next frame.
    fn apply(&mut self, intent: &ControlIntent);
}

/// A snapshot of an agent's state, as sensed at the start of a frame.
#[derive(Clone, Copy, Debug)]
pub struct SensedState {
    pub agent: AgentId,
    pub position: Point2d,
    pub heading: Vector2d,
    pub speed: f64,
    /// The current steering input, if the controller reports one.
    pub steer: f64,
    /// The distance to the closest obstacle ahead, if any.
    pub obstacle_distance: Option<f64>,
}

impl SensedState {
    /// Reads the state of an agent from its controller.
    pub fn sense(agent: AgentId, controller: &dyn AgentController) -> Self {
        Self {
            agent,
            position: controller.position(),
            heading: controller.heading(),
            speed: controller.speed(),
            steer: controller.dynamics().map(|d| d.steer_input()).unwrap_or(0.0),
            obstacle_distance: controller.obstacle_distance().filter(|d| d.is_finite()),
        }
    }
}
