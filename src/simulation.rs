use crate::behavior::{swap_behavior, Behavior, BehaviorContext, PointOfInterest};
use crate::controller::{AgentController, ControlIntent, SensedState};
#[cfg(feature = "debug")]
use crate::debug::{debug_circle, debug_line, debug_path, take_debug_frame};
use crate::error::{Error, Result};
use crate::events::{Event, EventQueue};
use crate::graph::WaypointGraph;
use crate::grid::SpatialGrid;
use crate::intersection::Intersections;
use crate::level::LevelData;
use crate::math::Point2d;
use crate::registry::{AgentAttributes, AgentKind, AgentRecord, AgentRegistry};
use crate::waypoint::{AgentType, WaypointId};
use crate::AgentId;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;

/// Tunable parameters of a [Simulation].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SimulationConfig {
    /// The number of waypoints each agent keeps committed ahead of it.
    pub lookahead: usize,
    /// A vehicle has reached a waypoint once within this distance, in m.
    pub reach_radius: f64,
    /// A pedestrian has reached a waypoint once within this distance, in m.
    pub pedestrian_reach_radius: f64,
    /// How far to look for the closest waypoint, in m.
    pub search_radius: f64,
    /// The heading error giving full steering lock, in radians.
    pub max_steer_angle: f64,
    /// Below this speed a vehicle counts as stopped, in m/s.
    pub stop_speed: f64,
    /// How long an agent at a dead end waits before looking for a way on, in s.
    pub dead_end_retry: f64,
    /// How often intersections are purged of departed agents, in s.
    pub reconcile_interval: f64,
    /// Seeds the random choices made by agents.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            lookahead: 4,
            reach_radius: 2.0,
            pedestrian_reach_radius: 0.6,
            search_radius: 25.0,
            max_steer_angle: 35f64.to_radians(),
            stop_speed: 0.3,
            dead_end_retry: 2.0,
            reconcile_interval: 5.0,
            seed: 0,
        }
    }
}

impl SimulationConfig {
    /// The reach radius for an agent of the given kind.
    pub fn reach_for(&self, kind: AgentKind) -> f64 {
        match kind {
            AgentKind::Vehicle => self.reach_radius,
            AgentKind::Pedestrian => self.pedestrian_reach_radius,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.lookahead == 0 {
            return Err(Error::Configuration("lookahead must be at least one waypoint".into()));
        }
        let positive = [
            ("reach radius", self.reach_radius),
            ("pedestrian reach radius", self.pedestrian_reach_radius),
            ("search radius", self.search_radius),
            ("max steer angle", self.max_steer_angle),
            ("reconcile interval", self.reconcile_interval),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, v)| !(*v > 0.0 && v.is_finite())) {
            return Err(Error::Configuration(format!("{name} must be positive and finite, got {value}")));
        }
        let non_negative = [("stop speed", self.stop_speed), ("dead end retry", self.dead_end_retry)];
        if let Some((name, value)) = non_negative.iter().find(|(_, v)| !(*v >= 0.0 && v.is_finite())) {
            return Err(Error::Configuration(format!("{name} must be non-negative and finite, got {value}")));
        }
        Ok(())
    }
}

/// A traffic and pedestrian simulation over one loaded level.
///
/// Owns every shared service (graph, grid, registry, intersections) and steps each
/// agent once per frame against an external [AgentController].
pub struct Simulation {
    graph: WaypointGraph,
    grid: SpatialGrid,
    registry: AgentRegistry,
    intersections: Intersections,
    /// The active behavior of each agent.
    behaviors: SecondaryMap<AgentId, Behavior>,
    /// The physics controller of each agent.
    controllers: SecondaryMap<AgentId, Box<dyn AgentController>>,
    /// The set of "frozen" agents, which will not move.
    frozen: Vec<AgentId>,
    events: EventQueue,
    config: SimulationConfig,
    rng: StdRng,
    /// The simulation time in s.
    time: f64,
    /// The current frame of simulation.
    frame: usize,
    /// The time since intersections were last reconciled, in s.
    since_reconcile: f64,
    /// Debugging information from the previously simulated frame.
    #[cfg(feature = "debug")]
    debug: serde_json::Value,
}

impl Simulation {
    /// Builds a simulation from a level's authoring data.
    pub fn load(level: &LevelData, config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let graph = WaypointGraph::new(&level.waypoints)?;
        let grid = SpatialGrid::build(level.bounds, level.cell_size, graph.positions())?;
        let mut intersections = Intersections::new();
        for attribs in &level.intersections {
            intersections.add(attribs, &graph)?;
        }
        let (cols, rows) = grid.dimensions();
        info!(
            "level loaded: {} waypoints, {cols}x{rows} cells, {} intersections",
            graph.len(),
            intersections.len()
        );
        Ok(Self {
            graph,
            grid,
            registry: AgentRegistry::new(),
            intersections,
            behaviors: SecondaryMap::new(),
            controllers: SecondaryMap::new(),
            frozen: vec![],
            events: EventQueue::default(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            time: 0.0,
            frame: 0,
            since_reconcile: 0.0,
            #[cfg(feature = "debug")]
            debug: serde_json::Value::Null,
        })
    }

    /// Adds an agent driven by `controller`.
    ///
    /// The agent starts towards `start`, or the closest usable waypoint if `None`.
    pub fn add_agent(
        &mut self,
        attributes: AgentAttributes,
        controller: Box<dyn AgentController>,
        mut behavior: Behavior,
        start: Option<WaypointId>,
    ) -> AgentId {
        let position = controller.position();
        let start = start
            .filter(|id| self.graph.try_get(*id).is_some())
            .or_else(|| {
                self.graph.closest_waypoint(
                    &self.grid,
                    position,
                    attributes.agent_type,
                    self.config.search_radius,
                )
            });
        let id = self.registry.register_agent(attributes, start, position);
        self.registry
            .update_sensed(id, position, controller.heading(), controller.speed());
        let cell = self.grid.cell_at(position);
        self.grid.register_agent(id, cell);
        self.controllers.insert(id, controller);
        behavior.activate(id, &mut self.context());
        self.behaviors.insert(id, behavior);
        self.events.push(Event::AgentAdded(id));
        debug!("added {id:?} at {start:?}");
        id
    }

    /// Removes an agent, releasing everything it holds. Returns `false` if it was already gone.
    pub fn remove_agent(&mut self, id: AgentId) -> bool {
        if !self.registry.contains(id) {
            return false;
        }
        if let Some(mut behavior) = self.behaviors.remove(id) {
            behavior.deactivate(id, &mut self.context());
        }
        self.intersections.release_agent(id);
        self.registry.unregister_agent(id);
        self.grid.unregister_agent(id);
        self.controllers.remove(id);
        self.frozen.retain(|f| *f != id);
        self.events.push(Event::AgentRemoved(id));
        true
    }

    /// Replaces an agent's behavior, deactivating the current one first.
    pub fn set_behavior(&mut self, id: AgentId, behavior: Behavior) -> Result<()> {
        let mut current = self.behaviors.remove(id).ok_or(Error::UnknownAgent)?;
        swap_behavior(id, &mut current, behavior, &mut self.context());
        self.behaviors.insert(id, current);
        Ok(())
    }

    /// Sends an agent to a waypoint, raising [Event::DestinationReached] on arrival.
    pub fn set_destination(&mut self, id: AgentId, destination: WaypointId) -> Result<()> {
        let point = self.graph.get(destination)?.position();
        self.set_behavior(id, Behavior::run_toward(PointOfInterest::Fixed(point)))
    }

    /// Gets an agent's active behavior.
    pub fn behavior(&self, id: AgentId) -> Option<&Behavior> {
        self.behaviors.get(id)
    }

    /// Randomly assigns a speed factor to each agent, which is sampled from a normal
    /// distribution with a mean of 1 (no adjustment) and standard deviation of `stddev`.
    pub fn randomise_speed_factors(&mut self, stddev: f64) -> Result<()> {
        let distr = rand_distr::Normal::new(1.0, stddev)
            .map_err(|err| Error::Configuration(format!("invalid standard deviation {stddev}: {err}")))?;
        for id in self.registry.ids() {
            let factor = distr.sample(&mut self.rng).clamp(0.75, 1.25);
            self.registry.set_speed_factor(id, factor);
        }
        Ok(())
    }

    /// Sets the `frozen` attribute of an agent. A frozen agent brakes fully and
    /// remains stopped until it is no longer frozen.
    pub fn set_agent_frozen(&mut self, id: AgentId, frozen: bool) {
        let idx = self.frozen.iter().position(|f| *f == id);
        match (frozen, idx) {
            (true, None) if self.registry.contains(id) => {
                self.frozen.push(id);
            }
            (false, Some(idx)) => {
                self.frozen.remove(idx);
            }
            _ => {}
        }
    }

    /// Gets the `frozen` attribute of an agent. [Read more](Self::set_agent_frozen).
    pub fn is_agent_frozen(&self, id: AgentId) -> bool {
        self.frozen.contains(&id)
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// Intersections advance first so every agent sees the same signal phase. Then each agent
    /// is sensed, re-gridded, has its behavior executed, and receives its control intent.
    pub fn step(&mut self, dt: f64) {
        self.time += dt;
        self.intersections.update(dt);
        self.since_reconcile += dt;
        if self.since_reconcile >= self.config.reconcile_interval {
            self.since_reconcile = 0.0;
            self.reconcile();
        }

        for id in self.registry.ids() {
            self.step_agent(id);
        }
        self.frame += 1;

        #[cfg(feature = "debug")]
        {
            self.debug = take_debug_frame();
        }
    }

    /// Purges agents which are no longer registered from every intersection,
    /// returning how many were purged.
    pub fn reconcile(&mut self) -> usize {
        let purged = self.intersections.reconcile(&self.registry);
        if purged > 0 {
            info!("reconciled intersections, {purged} stale entries removed");
        }
        purged
    }

    /// Removes and returns all events raised since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain()
    }

    /// The speed limit at a position for an agent type, from the closest waypoint.
    pub fn speed_limit_at(&self, position: Point2d, ty: AgentType) -> Option<f64> {
        self.graph
            .speed_limit_at(&self.grid, position, ty, self.config.search_radius)
    }

    /// Gets the current simulation frame index.
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// The simulation time in s.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn graph(&self) -> &WaypointGraph {
        &self.graph
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn intersections(&self) -> &Intersections {
        &self.intersections
    }

    /// Gets the agent with the given ID.
    pub fn agent(&self, id: AgentId) -> Option<&AgentRecord> {
        self.registry.get(id)
    }

    /// Returns an iterator over all the agents in the simulation.
    pub fn iter_agents(&self) -> impl Iterator<Item = &AgentRecord> {
        self.registry.iter()
    }

    /// Gets the debugging information for the previously simulated frame as JSON array.
    #[cfg(feature = "debug")]
    pub fn debug(&mut self) -> serde_json::Value {
        self.debug.clone()
    }

    fn context(&mut self) -> BehaviorContext<'_> {
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

    /// Senses, decides and actuates a single agent.
    fn step_agent(&mut self, id: AgentId) {
        let Some(controller) = self.controllers.get_mut(id) else {
            return;
        };
        let state = SensedState::sense(id, &**controller);
        self.registry
            .update_sensed(id, state.position, state.heading, state.speed);
        self.grid.update_agent(id, state.position);

        if self.frozen.contains(&id) {
            controller.apply(&ControlIntent::hold());
            return;
        }
        let Some(behavior) = self.behaviors.get_mut(id) else {
            controller.apply(&ControlIntent::hold());
            return;
        };

        let mut ctx = BehaviorContext {
            graph: &self.graph,
            grid: &self.grid,
            registry: &mut self.registry,
            intersections: &mut self.intersections,
            events: &mut self.events,
            config: &self.config,
            rng: &mut self.rng,
            time: self.time,
        };
        let result = behavior.execute(&state, &mut ctx);
        if let Some(next) = result.replace_with {
            debug!("{id:?} behavior {} -> {}", behavior.name(), next.name());
            swap_behavior(id, behavior, next, &mut ctx);
        }
        controller.apply(&result.intent.clamped());

        #[cfg(feature = "debug")]
        if let Some(record) = self.registry.get(id) {
            let graph = &self.graph;
            if let Some(pos) = record.target().and_then(|t| graph.position(t)) {
                debug_line("target", state.position, pos);
                debug_circle("reach", pos, self.config.reach_for(record.kind()));
            }
            debug_path("path", record.path().iter().filter_map(|w| graph.position(*w)));
        }
    }
}
