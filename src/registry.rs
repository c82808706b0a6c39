use crate::error::{Error, Result};
use crate::graph::WaypointGraph;
use crate::math::{Point2d, Vector2d};
use crate::waypoint::{AgentType, WaypointId};
use crate::{AgentId, IntersectionId};
use itertools::Itertools;
use log::trace;
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};

/// How far back [AgentRegistry::all_previous_free] searches, in waypoints.
const MAX_TRACE_BACK: usize = 32;

/// Whether an agent drives or walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AgentKind {
    Vehicle,
    Pedestrian,
}

/// The attributes of a simulated agent.
#[derive(Clone, Copy, Debug)]
pub struct AgentAttributes {
    /// Vehicle or pedestrian.
    pub kind: AgentKind,
    /// The type tag matched against waypoint allow-lists.
    pub agent_type: AgentType,
    /// The fastest the agent will travel, in m/s.
    pub max_speed: f64,
    /// The agent's length in m, used for following gaps.
    pub length: f64,
    /// The maximum acceleration in m/s^2.
    pub max_acc: f64,
    /// The comfortable deceleration in m/s^2, a positive number.
    pub comf_dec: f64,
}

impl AgentAttributes {
    /// Attributes of a typical passenger car.
    pub fn car(agent_type: AgentType) -> Self {
        Self {
            kind: AgentKind::Vehicle,
            agent_type,
            max_speed: 25.0,
            length: 4.5,
            max_acc: 2.0,
            comf_dec: 2.5,
        }
    }

    /// Attributes of a typical pedestrian.
    pub fn pedestrian(agent_type: AgentType) -> Self {
        Self {
            kind: AgentKind::Pedestrian,
            agent_type,
            max_speed: 1.4,
            length: 0.5,
            max_acc: 1.0,
            comf_dec: 1.5,
        }
    }
}

/// The registry's view of a live agent.
#[derive(Clone, Debug)]
pub struct AgentRecord {
    id: AgentId,
    attributes: AgentAttributes,
    /// The committed path; the front is the current target.
    path: VecDeque<WaypointId>,
    /// The waypoints reserved as targets.
    reserved: SmallVec<[WaypointId; 8]>,
    /// The last waypoint the agent reached.
    last_reached: Option<WaypointId>,
    /// The intersection the agent has been granted or is waiting at.
    intersection: Option<IntersectionId>,
    /// A multiplier applied to path speeds.
    speed_factor: f64,
    /// Last sensed world state.
    position: Point2d,
    heading: Vector2d,
    speed: f64,
}

impl AgentRecord {
    /// Gets the agent's ID.
    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn attributes(&self) -> &AgentAttributes {
        &self.attributes
    }

    pub fn kind(&self) -> AgentKind {
        self.attributes.kind
    }

    pub fn agent_type(&self) -> AgentType {
        self.attributes.agent_type
    }

    /// The committed path; the first waypoint is the current target.
    pub fn path(&self) -> &VecDeque<WaypointId> {
        &self.path
    }

    /// The current target waypoint.
    pub fn target(&self) -> Option<WaypointId> {
        self.path.front().copied()
    }

    /// The last waypoint of the committed path, or the last reached waypoint if the path is empty.
    pub fn path_tail(&self) -> Option<WaypointId> {
        self.path.back().copied().or(self.last_reached)
    }

    pub fn last_reached(&self) -> Option<WaypointId> {
        self.last_reached
    }

    pub fn intersection(&self) -> Option<IntersectionId> {
        self.intersection
    }

    pub fn speed_factor(&self) -> f64 {
        self.speed_factor
    }

    /// The position in world space as of the last tick.
    pub fn position(&self) -> Point2d {
        self.position
    }

    /// The heading in world space as of the last tick.
    pub fn heading(&self) -> Vector2d {
        self.heading
    }

    /// The speed in m/s as of the last tick.
    pub fn speed(&self) -> f64 {
        self.speed
    }
}

/// Tracks live agents, their committed paths, and which waypoints are reserved as targets.
///
/// Reservations are advisory: several agents may hold the same waypoint where lanes merge.
/// The most recent holder is considered its owner.
#[derive(Clone, Debug, Default)]
pub struct AgentRegistry {
    agents: SlotMap<AgentId, AgentRecord>,
    /// The agents holding each reserved waypoint, oldest first.
    holders: HashMap<WaypointId, SmallVec<[AgentId; 2]>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers an agent, optionally starting at a waypoint which becomes its first target.
    pub fn register_agent(
        &mut self,
        attributes: AgentAttributes,
        initial: Option<WaypointId>,
        position: Point2d,
    ) -> AgentId {
        let id = self.agents.insert_with_key(|id| AgentRecord {
            id,
            attributes,
            path: VecDeque::new(),
            reserved: SmallVec::new(),
            last_reached: None,
            intersection: None,
            speed_factor: 1.0,
            position,
            heading: Vector2d::new(0.0, 0.0),
            speed: 0.0,
        });
        if let Some(initial) = initial {
            self.commit_path(id, &[initial]);
        }
        id
    }

    /// Removes an agent and frees all of its reservations.
    pub fn unregister_agent(&mut self, id: AgentId) -> Option<AgentRecord> {
        let record = self.agents.remove(id)?;
        for waypoint in &record.reserved {
            release(&mut self.holders, id, *waypoint);
        }
        Some(record)
    }

    /// Whether the agent is still registered.
    pub fn contains(&self, id: AgentId) -> bool {
        self.agents.contains_key(id)
    }

    pub fn get(&self, id: AgentId) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    fn get_mut(&mut self, id: AgentId) -> Result<&mut AgentRecord> {
        self.agents.get_mut(id).ok_or(Error::UnknownAgent)
    }

    /// Returns an iterator over all registered agents.
    pub fn iter(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    /// The IDs of all registered agents, in a stable order.
    pub fn ids(&self) -> Vec<AgentId> {
        self.agents.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Replaces the agent's reserved waypoints with `targets`, freeing the ones no longer
    /// wanted. Waypoints the agent already holds keep their place among the holders.
    pub fn reserve_targets(&mut self, id: AgentId, targets: &[WaypointId]) -> Result<()> {
        let record = self.agents.get_mut(id).ok_or(Error::UnknownAgent)?;
        reserve(record, &mut self.holders, targets);
        Ok(())
    }

    /// Whether any agent has reserved the waypoint.
    pub fn is_reserved(&self, waypoint: WaypointId) -> bool {
        self.holders.contains_key(&waypoint)
    }

    /// Whether an agent other than `id` has reserved the waypoint.
    pub fn is_reserved_by_other(&self, waypoint: WaypointId, id: AgentId) -> bool {
        self.holders
            .get(&waypoint)
            .map(|holders| holders.iter().any(|holder| *holder != id))
            .unwrap_or(false)
    }

    /// The agent which most recently reserved the waypoint.
    pub fn reservation_owner(&self, waypoint: WaypointId) -> Option<AgentId> {
        self.holders.get(&waypoint).and_then(|h| h.last().copied())
    }

    /// The agents holding a reservation on the waypoint, oldest first.
    pub fn holders(&self, waypoint: WaypointId) -> &[AgentId] {
        self.holders.get(&waypoint).map(|h| &h[..]).unwrap_or(&[])
    }

    /// Whether every waypoint from `waypoint` back to the previous merge point
    /// is free of other agents' reservations.
    pub fn all_previous_free(&self, waypoint: WaypointId, id: AgentId, graph: &WaypointGraph) -> bool {
        graph
            .trace_back_to_merge(waypoint, MAX_TRACE_BACK)
            .into_iter()
            .all(|w| !self.is_reserved_by_other(w, id))
    }

    /// Replaces the agent's path and reserves every waypoint on it.
    pub fn commit_path(&mut self, id: AgentId, path: &[WaypointId]) {
        if let Some(record) = self.agents.get_mut(id) {
            record.path = path.iter().copied().collect();
            reserve(record, &mut self.holders, path);
        }
    }

    /// Appends a waypoint to the agent's path and reserves it.
    pub fn extend_path(&mut self, id: AgentId, waypoint: WaypointId) -> Result<()> {
        let record = self.agents.get_mut(id).ok_or(Error::UnknownAgent)?;
        record.path.push_back(waypoint);
        if !record.reserved.contains(&waypoint) {
            record.reserved.push(waypoint);
            self.holders.entry(waypoint).or_default().push(id);
        }
        Ok(())
    }

    /// Drops the agent's current target after it has been reached,
    /// releasing its reservation. Returns the reached waypoint.
    pub fn advance(&mut self, id: AgentId) -> Option<WaypointId> {
        let record = self.agents.get_mut(id)?;
        let reached = record.path.pop_front()?;
        record.last_reached = Some(reached);
        // A looping path may still hold the waypoint further on
        if !record.path.contains(&reached) {
            record.reserved.retain(|w| *w != reached);
            release(&mut self.holders, id, reached);
        }
        Some(reached)
    }

    /// Clears the agent's path and releases its reservations.
    pub fn clear_path(&mut self, id: AgentId) {
        if let Some(record) = self.agents.get_mut(id) {
            record.path.clear();
            reserve(record, &mut self.holders, &[]);
        }
    }

    /// Records the agent's sensed world state.
    pub fn update_sensed(&mut self, id: AgentId, position: Point2d, heading: Vector2d, speed: f64) {
        if let Ok(record) = self.get_mut(id) {
            record.position = position;
            record.heading = heading;
            record.speed = speed;
        }
    }

    /// Records the intersection the agent is currently dealing with.
    pub fn set_intersection(&mut self, id: AgentId, intersection: Option<IntersectionId>) {
        if let Ok(record) = self.get_mut(id) {
            if record.intersection != intersection {
                trace!("{id:?} intersection {:?} -> {intersection:?}", record.intersection);
            }
            record.intersection = intersection;
        }
    }

    pub fn set_speed_factor(&mut self, id: AgentId, factor: f64) {
        if let Ok(record) = self.get_mut(id) {
            record.speed_factor = factor;
        }
    }

}

/// Brings the record's reservations in line with `targets`.
fn reserve(record: &mut AgentRecord, holders: &mut HashMap<WaypointId, SmallVec<[AgentId; 2]>>, targets: &[WaypointId]) {
    let id = record.id;
    let targets = targets.iter().copied().unique().collect::<SmallVec<[_; 8]>>();
    for waypoint in record.reserved.iter().filter(|w| !targets.contains(w)) {
        release(holders, id, *waypoint);
    }
    for waypoint in targets.iter().filter(|w| !record.reserved.contains(w)) {
        holders.entry(*waypoint).or_default().push(id);
    }
    record.reserved = targets;
}

fn release(holders: &mut HashMap<WaypointId, SmallVec<[AgentId; 2]>>, id: AgentId, waypoint: WaypointId) {
    if let Some(list) = holders.get_mut(&waypoint) {
        if let Some(pos) = list.iter().position(|holder| *holder == id) {
            list.remove(pos);
        }
        if list.is_empty() {
            holders.remove(&waypoint);
        }
    }
}
