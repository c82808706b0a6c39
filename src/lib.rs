//! A waypoint-graph traffic and pedestrian agent simulation.
//!
//! Agents drive or walk along a directed [WaypointGraph], reserving the waypoints they
//! are about to use, and are arbitrated at signalised and priority intersections. Movement
//! itself is delegated to an external physics layer through the [AgentController] trait.

pub use behavior::{
    new_waypoint_index, Behavior, BehaviorContext, BehaviorResult, CurveConfig, CurveSlowdown,
    FollowObstacle, FollowPath, OvertakeConfig, OvertakeState, OvertakeStationaryObstacle,
    PointOfInterest, RunAwayFromPoint, RunTowardPoint,
};
pub use cgmath;
pub use controller::{AgentController, ControlIntent, SensedState, VehicleDynamics};
pub use error::{Error, Result};
pub use events::{Event, EventQueue};
pub use graph::WaypointGraph;
pub use grid::{Bounds, CellId, SpatialGrid};
pub use intersection::{
    ApproachAttributes, ApproachState, CrossingAttributes, CrossingState, IntersectionAttributes,
    IntersectionControl, IntersectionController, Intersections, LightState, SignalPhase,
    SignalTiming,
};
pub use level::LevelData;
pub use registry::{AgentAttributes, AgentKind, AgentRecord, AgentRegistry};
pub use simulation::{Simulation, SimulationConfig};
pub use slotmap::{Key, KeyData};
pub use util::Interval;
pub use waypoint::{AgentType, AgentTypes, Waypoint, WaypointAttributes, WaypointFlags, WaypointId};

mod behavior;
mod controller;
mod debug;
mod error;
mod events;
mod graph;
mod grid;
mod intersection;
mod level;
pub mod math;
mod registry;
mod simulation;
mod util;
mod waypoint;

use slotmap::new_key_type;

new_key_type! {
    /// Unique ID of an agent in an [AgentRegistry].
    pub struct AgentId;
    /// Unique ID of an [IntersectionController].
    pub struct IntersectionId;
}
