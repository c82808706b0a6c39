//! Per-agent behaviors, which turn sensed state into a [ControlIntent].
//!
//! Every agent has exactly one active [Behavior]. Behaviors may ask to be replaced by another,
//! in which case the simulation deactivates the old one before activating the new one.

pub use self::curve::{CurveConfig, CurveSlowdown};
pub use self::flee::{new_waypoint_index, RunAwayFromPoint, RunTowardPoint};
pub use self::follow_obstacle::FollowObstacle;
pub use self::follow_path::FollowPath;
pub use self::overtake::{OvertakeConfig, OvertakeState, OvertakeStationaryObstacle};
use crate::controller::{ControlIntent, SensedState};
use crate::events::{Event, EventQueue};
use crate::graph::WaypointGraph;
use crate::grid::SpatialGrid;
use crate::intersection::Intersections;
use crate::math::Point2d;
use crate::registry::AgentRegistry;
use crate::simulation::SimulationConfig;
use crate::AgentId;
use log::trace;
use rand::rngs::StdRng;

mod acceleration;
mod curve;
mod flee;
mod follow_obstacle;
mod follow_path;
mod overtake;

/// The shared simulation state a behavior may read and update.
pub struct BehaviorContext<'a> {
    pub graph: &'a WaypointGraph,
    pub grid: &'a SpatialGrid,
    pub registry: &'a mut AgentRegistry,
    pub intersections: &'a mut Intersections,
    pub events: &'a mut EventQueue,
    pub config: &'a SimulationConfig,
    pub rng: &'a mut StdRng,
    /// The simulation time in s.
    pub time: f64,
}

/// A location a behavior steers relative to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PointOfInterest {
    /// A fixed point in the world.
    Fixed(Point2d),
    /// The current position of another agent, which may despawn at any time.
    Agent(AgentId),
}

impl PointOfInterest {
    /// The point's current position, or `None` if the agent it tracks is gone.
    pub fn resolve(&self, registry: &AgentRegistry) -> Option<Point2d> {
        match *self {
            PointOfInterest::Fixed(point) => Some(point),
            PointOfInterest::Agent(id) => registry.get(id).map(|record| record.position()),
        }
    }
}

/// The outcome of executing a behavior for one frame.
#[derive(Clone, Debug)]
pub struct BehaviorResult {
    pub intent: ControlIntent,
    /// A behavior which should take over from the next frame.
    pub replace_with: Option<Behavior>,
}

impl BehaviorResult {
    pub fn intent(intent: ControlIntent) -> Self {
        Self {
            intent,
            replace_with: None,
        }
    }

    pub fn replace(intent: ControlIntent, behavior: Behavior) -> Self {
        Self {
            intent,
            replace_with: Some(behavior),
        }
    }
}

/// An agent's active behavior.
#[derive(Clone, Debug)]
pub enum Behavior {
    FollowPath(FollowPath),
    CurveSlowdown(CurveSlowdown),
    OvertakeStationaryObstacle(OvertakeStationaryObstacle),
    FollowObstacle(FollowObstacle),
    RunTowardPoint(RunTowardPoint),
    RunAwayFromPoint(RunAwayFromPoint),
}

impl Behavior {
    /// Follows the waypoint graph, choosing among successors at random.
    pub fn follow_path() -> Self {
        Behavior::FollowPath(FollowPath::new())
    }

    /// Follows the waypoint graph, slowing down ahead of curves.
    pub fn curve_slowdown(config: CurveConfig) -> Self {
        Behavior::CurveSlowdown(CurveSlowdown::new(config))
    }

    /// Manoeuvres around a stationary obstacle into an adjacent lane.
    pub fn overtake(config: OvertakeConfig) -> Self {
        Behavior::OvertakeStationaryObstacle(OvertakeStationaryObstacle::new(config))
    }

    /// Follows the path while keeping `gap` metres behind the obstacle ahead.
    pub fn follow_obstacle(gap: f64) -> Self {
        Behavior::FollowObstacle(FollowObstacle::new(gap))
    }

    /// Walks along the graph towards a point.
    pub fn run_toward(point: PointOfInterest) -> Self {
        Behavior::RunTowardPoint(RunTowardPoint::new(point))
    }

    /// Walks along the graph away from a point.
    pub fn run_away(point: PointOfInterest) -> Self {
        Behavior::RunAwayFromPoint(RunAwayFromPoint::new(point))
    }

    /// A short name for logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            Behavior::FollowPath(_) => "follow_path",
            Behavior::CurveSlowdown(_) => "curve_slowdown",
            Behavior::OvertakeStationaryObstacle(_) => "overtake",
            Behavior::FollowObstacle(_) => "follow_obstacle",
            Behavior::RunTowardPoint(_) => "run_toward_point",
            Behavior::RunAwayFromPoint(_) => "run_away_from_point",
        }
    }

    /// Called when the behavior becomes the agent's active behavior.
    pub fn activate(&mut self, agent: AgentId, ctx: &mut BehaviorContext) {
        trace!("{agent:?} activating {}", self.name());
        match self {
            Behavior::FollowPath(b) => b.activate(agent, ctx),
            Behavior::OvertakeStationaryObstacle(b) => b.activate(ctx),
            Behavior::FollowObstacle(b) => b.activate(ctx),
            Behavior::RunTowardPoint(b) => b.activate(),
            Behavior::CurveSlowdown(_) | Behavior::RunAwayFromPoint(_) => {}
        }
    }

    /// Called when the behavior stops being the agent's active behavior.
    /// Releases every waypoint reservation and intersection slot the agent holds.
    pub fn deactivate(&mut self, agent: AgentId, ctx: &mut BehaviorContext) {
        trace!("{agent:?} deactivating {}", self.name());
        ctx.registry.clear_path(agent);
        ctx.intersections.release_agent(agent);
        ctx.registry.set_intersection(agent, None);
    }

    /// Computes the agent's control intent for this frame.
    pub fn execute(&mut self, state: &SensedState, ctx: &mut BehaviorContext) -> BehaviorResult {
        match self {
            Behavior::FollowPath(b) => BehaviorResult::intent(b.execute(state, ctx)),
            Behavior::CurveSlowdown(b) => BehaviorResult::intent(b.execute(state, ctx)),
            Behavior::OvertakeStationaryObstacle(b) => b.execute(state, ctx),
            Behavior::FollowObstacle(b) => b.execute(state, ctx),
            Behavior::RunTowardPoint(b) => BehaviorResult::intent(b.execute(state, ctx)),
            Behavior::RunAwayFromPoint(b) => BehaviorResult::intent(b.execute(state, ctx)),
        }
    }
}

/// Swaps an agent's behavior, running the lifecycle hooks in order.
pub(crate) fn swap_behavior(
    agent: AgentId,
    current: &mut Behavior,
    mut next: Behavior,
    ctx: &mut BehaviorContext,
) {
    current.deactivate(agent, ctx);
    next.activate(agent, ctx);
    ctx.events.push(Event::BehaviorChanged {
        agent,
        behavior: next.name(),
    });
    *current = next;
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use crate::grid::Bounds;
    use crate::intersection::IntersectionAttributes;
    use crate::math::Vector2d;
    use crate::registry::AgentAttributes;
    use crate::waypoint::WaypointAttributes;
    use rand::SeedableRng;

    /// Owns everything a [BehaviorContext] borrows.
    pub struct Fixture {
        pub graph: WaypointGraph,
        pub grid: SpatialGrid,
        pub registry: AgentRegistry,
        pub intersections: Intersections,
        pub events: EventQueue,
        pub config: SimulationConfig,
        pub rng: StdRng,
        pub time: f64,
    }

    impl Fixture {
        pub fn new(records: &[WaypointAttributes]) -> Self {
            let graph = WaypointGraph::new(records).unwrap();
            let bounds = Bounds::from_corners(Point2d::new(-100.0, -100.0), Point2d::new(100.0, 100.0));
            let grid = SpatialGrid::build(bounds, 10.0, graph.positions()).unwrap();
            Self {
                graph,
                grid,
                registry: AgentRegistry::new(),
                intersections: Intersections::new(),
                events: EventQueue::default(),
                config: SimulationConfig::default(),
                rng: StdRng::seed_from_u64(7),
                time: 0.0,
            }
        }

        pub fn with_intersection(mut self, attribs: &IntersectionAttributes) -> Self {
            self.intersections.add(attribs, &self.graph).unwrap();
            self
        }

        pub fn ctx(&mut self) -> BehaviorContext<'_> {
            BehaviorContext {
                graph: &self.graph,
                grid: &self.grid,
                registry: &mut self.registry,
                intersections: &mut self.intersections,
                events: &mut self.events,
                config: &self.config,
                rng: &mut self.rng,
                time: self.time,
            }
        }

        pub fn spawn(&mut self, attributes: AgentAttributes, at: u32, position: Point2d) -> AgentId {
            self.registry
                .register_agent(attributes, Some(crate::WaypointId(at)), position)
        }
    }

    /// A sensed state for an agent at `position` heading along `heading`.
    pub fn sensed(agent: AgentId, position: Point2d, heading: Vector2d, speed: f64) -> SensedState {
        SensedState {
            agent,
            position,
            heading,
            speed,
            steer: 0.0,
            obstacle_distance: None,
        }
    }
}
