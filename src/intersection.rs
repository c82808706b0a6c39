use self::priority::PriorityRules;
use self::signal::SignalController;
use crate::error::{Error, Result};
use crate::graph::WaypointGraph;
use crate::registry::AgentRegistry;
use crate::{AgentId, IntersectionId, WaypointId};
use log::{debug, info, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::collections::HashMap;

pub use signal::{LightState, SignalPhase, SignalTiming};

mod priority;
mod signal;

/// Whether vehicles on an approach may enter the intersection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApproachState {
    /// Vehicles must stop.
    Closed,
    /// Vehicles may proceed once no conflicting traffic is inside.
    Open,
    /// Vehicles may proceed only when no conflicting approach is occupied
    /// and no approach with precedence is waiting.
    Yielding,
}

/// Whether pedestrians may start crossing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrossingState {
    Closed,
    Open,
}

/// The authoring record of one road feeding into an intersection.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ApproachAttributes {
    /// The waypoints where vehicles on this approach wait.
    pub stop_waypoints: Vec<WaypointId>,
    /// The approaches this one conflicts with. `None` conflicts with every other approach.
    #[cfg_attr(feature = "serde", serde(default))]
    pub conflicts: Option<Vec<usize>>,
}

/// The authoring record of a pedestrian crossing.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrossingAttributes {
    /// The waypoints where pedestrians wait to cross.
    pub waypoints: Vec<WaypointId>,
    /// The approaches whose traffic crosses this crossing. `None` means every approach.
    #[cfg_attr(feature = "serde", serde(default))]
    pub conflicts: Option<Vec<usize>>,
}

/// How right-of-way is decided.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IntersectionControl {
    /// Traffic lights cycling through a fixed plan.
    Signal(SignalTiming),
    /// Waypoint priorities, give-way and zipper rules.
    Priority,
}

/// The authoring record of an intersection.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntersectionAttributes {
    pub name: String,
    pub approaches: Vec<ApproachAttributes>,
    /// Reaching one of these waypoints means a vehicle has left the intersection.
    pub exit_waypoints: Vec<WaypointId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub crossings: Vec<CrossingAttributes>,
    pub control: IntersectionControl,
}

#[derive(Clone, Debug)]
struct Approach {
    stop_waypoints: SmallVec<[WaypointId; 4]>,
    /// The highest priority of the stop waypoints.
    priority: i32,
    /// Whether any stop waypoint is a zipper give-way.
    zipper: bool,
    /// Conflicting approaches.
    conflicts: SmallVec<[usize; 4]>,
    /// Crossings which this approach's traffic passes over.
    crossings: SmallVec<[usize; 2]>,
    /// The number of vehicles inside which entered from here.
    occupancy: usize,
    state: ApproachState,
}

#[derive(Clone, Debug)]
struct Crossing {
    waypoints: SmallVec<[WaypointId; 4]>,
    conflicts: SmallVec<[usize; 4]>,
    /// The pedestrians currently crossing.
    pedestrians: SmallVec<[AgentId; 4]>,
    state: CrossingState,
}

#[derive(Clone, Debug)]
enum Control {
    Signal(SignalController),
    Priority,
}

/// Grants vehicles and pedestrians the right to cross one intersection.
///
/// Occupancy is tracked per vehicle rather than counted, so entering twice or
/// leaving without entering has no effect.
#[derive(Clone, Debug)]
pub struct IntersectionController {
    id: IntersectionId,
    name: String,
    approaches: Vec<Approach>,
    crossings: Vec<Crossing>,
    exit_waypoints: SmallVec<[WaypointId; 4]>,
    control: Control,
    rules: PriorityRules,
    /// The vehicles inside the intersection and the approach each entered from.
    occupants: HashMap<AgentId, usize>,
    /// Time elapsed since the intersection was created, in s.
    time: f64,
}

impl IntersectionController {
    /// Creates an intersection controller from its authoring record.
    pub fn new(attribs: &IntersectionAttributes, graph: &WaypointGraph) -> Result<Self> {
        let name = &attribs.name;
        let num_approaches = attribs.approaches.len();
        if num_approaches == 0 {
            return Err(Error::Configuration(format!("intersection {name} has no approaches")));
        }

        let exists = |id: WaypointId, what: &str| {
            graph.get(id).map(|_| ()).map_err(|_| Error::GraphIntegrity {
                waypoint: id,
                reason: format!("{what} of intersection {name} does not exist"),
            })
        };
        let check_indices = |list: &Option<Vec<usize>>, what: &str| match list {
            Some(list) if list.iter().any(|a| *a >= num_approaches) => Err(Error::Configuration(
                format!("{what} of intersection {name} references a missing approach"),
            )),
            _ => Ok(()),
        };

        let mut approaches = Vec::with_capacity(num_approaches);
        for (idx, approach) in attribs.approaches.iter().enumerate() {
            check_indices(&approach.conflicts, "approach")?;
            let mut priority = i32::MIN;
            let mut zipper = false;
            for id in &approach.stop_waypoints {
                exists(*id, "stop waypoint")?;
                let waypoint = graph.get(*id)?;
                priority = i32::max(priority, waypoint.priority());
                zipper |= waypoint.flags().zipper_give_way;
            }
            let conflicts = match &approach.conflicts {
                Some(list) => list.iter().copied().filter(|a| *a != idx).collect(),
                None => (0..num_approaches).filter(|a| *a != idx).collect(),
            };
            approaches.push(Approach {
                stop_waypoints: approach.stop_waypoints.iter().copied().collect(),
                priority: if priority == i32::MIN { 0 } else { priority },
                zipper,
                conflicts,
                crossings: SmallVec::new(),
                occupancy: 0,
                state: ApproachState::Closed,
            });
        }

        // Conflicts are symmetric
        for a in 0..num_approaches {
            for b in approaches[a].conflicts.clone() {
                if !approaches[b].conflicts.contains(&a) {
                    approaches[b].conflicts.push(a);
                }
            }
        }

        let mut crossings = Vec::with_capacity(attribs.crossings.len());
        for (idx, crossing) in attribs.crossings.iter().enumerate() {
            check_indices(&crossing.conflicts, "crossing")?;
            for id in &crossing.waypoints {
                exists(*id, "crossing waypoint")?;
            }
            let conflicts: SmallVec<[usize; 4]> = match &crossing.conflicts {
                Some(list) => list.iter().copied().collect(),
                None => (0..num_approaches).collect(),
            };
            for approach in &conflicts {
                approaches[*approach].crossings.push(idx);
            }
            crossings.push(Crossing {
                waypoints: crossing.waypoints.iter().copied().collect(),
                conflicts,
                pedestrians: SmallVec::new(),
                state: CrossingState::Closed,
            });
        }

        for id in &attribs.exit_waypoints {
            exists(*id, "exit waypoint")?;
        }

        let control = match &attribs.control {
            IntersectionControl::Signal(timing) => {
                timing.validate(num_approaches)?;
                Control::Signal(SignalController::new(timing.clone()))
            }
            IntersectionControl::Priority => Control::Priority,
        };

        let mut controller = Self {
            id: IntersectionId::default(),
            name: name.clone(),
            approaches,
            crossings,
            exit_waypoints: attribs.exit_waypoints.iter().copied().collect(),
            control,
            rules: PriorityRules::new(num_approaches),
            occupants: HashMap::new(),
            time: 0.0,
        };
        controller.refresh_states();
        Ok(controller)
    }

    /// Gets the intersection's ID.
    pub fn id(&self) -> IntersectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advances the intersection's timers by `dt` seconds.
    pub fn update(&mut self, dt: f64) {
        self.time += dt;
        self.rules.expire(self.time);
        let crossings_clear = self.crossings.iter().all(|c| c.pedestrians.is_empty());
        if let Control::Signal(signal) = &mut self.control {
            signal.step(dt, crossings_clear);
        }
        self.refresh_states();
    }

    /// Whether a vehicle waiting at `waypoint` may enter now.
    ///
    /// The request is remembered briefly so that approaches without precedence yield to it.
    /// Waypoints which do not belong to this intersection are always free.
    pub fn is_path_free(&mut self, waypoint: WaypointId) -> bool {
        let Some(approach) = self.approach_of(waypoint) else {
            debug!("{waypoint} is not a stop waypoint of intersection {}", self.name);
            return true;
        };
        self.rules.request(approach, self.time);
        self.can_enter(approach)
    }

    /// Checks [Self::is_path_free] and, if free, records the vehicle as inside.
    /// Returns `true` iff the vehicle is inside afterwards.
    pub fn try_enter(&mut self, vehicle: AgentId, waypoint: WaypointId) -> bool {
        if self.occupants.contains_key(&vehicle) {
            return true;
        }
        let Some(approach) = self.approach_of(waypoint) else {
            debug!("{waypoint} is not a stop waypoint of intersection {}", self.name);
            return true;
        };
        self.rules.request(approach, self.time);
        if !self.can_enter(approach) {
            return false;
        }
        self.admit(vehicle, approach);
        true
    }

    /// Records a vehicle as inside, having entered from the approach containing `waypoint`.
    /// Returns `false` if the vehicle was already inside or the waypoint isn't a stop waypoint.
    pub fn vehicle_enter(&mut self, vehicle: AgentId, waypoint: WaypointId) -> bool {
        if self.occupants.contains_key(&vehicle) {
            return false;
        }
        match self.approach_of(waypoint) {
            Some(approach) => {
                self.admit(vehicle, approach);
                true
            }
            None => false,
        }
    }

    /// Records a vehicle as having left. Returns `false` if it wasn't inside.
    pub fn vehicle_left(&mut self, vehicle: AgentId) -> bool {
        match self.occupants.remove(&vehicle) {
            Some(approach) => {
                let approach = &mut self.approaches[approach];
                approach.occupancy = approach.occupancy.saturating_sub(1);
                self.refresh_states();
                true
            }
            None => false,
        }
    }

    /// Records a pedestrian starting to cross at `waypoint`, if the crossing is open.
    /// Returns `true` iff the pedestrian is crossing afterwards.
    pub fn pedestrian_enter(&mut self, pedestrian: AgentId, waypoint: WaypointId) -> bool {
        let Some(idx) = self.crossing_of(waypoint) else {
            return false;
        };
        let crossing = &mut self.crossings[idx];
        if crossing.pedestrians.contains(&pedestrian) {
            return true;
        }
        if crossing.state == CrossingState::Closed {
            return false;
        }
        crossing.pedestrians.push(pedestrian);
        true
    }

    /// Records that a pedestrian has finished crossing.
    /// Returns `false` if it wasn't crossing.
    pub fn pedestrian_passed(&mut self, pedestrian: AgentId) -> bool {
        let mut found = false;
        for crossing in &mut self.crossings {
            if let Some(pos) = crossing.pedestrians.iter().position(|p| *p == pedestrian) {
                crossing.pedestrians.remove(pos);
                found = true;
            }
        }
        if found {
            self.refresh_states();
        }
        found
    }

    /// Removes vehicles and pedestrians which are no longer registered,
    /// returning how many were purged.
    pub fn reconcile(&mut self, registry: &AgentRegistry) -> usize {
        let stale = self
            .occupants
            .keys()
            .copied()
            .filter(|id| !registry.contains(*id))
            .collect::<Vec<_>>();
        let mut purged = 0;
        for id in stale {
            purged += self.vehicle_left(id) as usize;
        }
        for crossing in &mut self.crossings {
            let before = crossing.pedestrians.len();
            crossing.pedestrians.retain(|id| registry.contains(*id));
            purged += before - crossing.pedestrians.len();
        }
        if purged > 0 {
            warn!("intersection {}: purged {purged} departed agents", self.name);
            self.refresh_states();
        }
        purged
    }

    /// The number of approaches.
    pub fn approach_count(&self) -> usize {
        self.approaches.len()
    }

    /// The approach whose stop waypoints include `waypoint`.
    pub fn approach_of(&self, waypoint: WaypointId) -> Option<usize> {
        self.approaches
            .iter()
            .position(|a| a.stop_waypoints.contains(&waypoint))
    }

    pub fn approach_state(&self, approach: usize) -> Option<ApproachState> {
        self.approaches.get(approach).map(|a| a.state)
    }

    /// The light shown to an approach, for signal-controlled intersections.
    pub fn light(&self, approach: usize) -> Option<LightState> {
        match &self.control {
            Control::Signal(signal) if approach < self.approaches.len() => Some(signal.light(approach)),
            _ => None,
        }
    }

    /// The current signal phase, for signal-controlled intersections.
    pub fn signal_phase(&self) -> Option<usize> {
        match &self.control {
            Control::Signal(signal) => Some(signal.phase()),
            Control::Priority => None,
        }
    }

    /// The number of vehicles inside which entered from `approach`.
    pub fn occupancy(&self, approach: usize) -> usize {
        self.approaches.get(approach).map(|a| a.occupancy).unwrap_or(0)
    }

    /// The vehicles inside the intersection.
    pub fn vehicles_inside(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.occupants.keys().copied()
    }

    pub fn contains_vehicle(&self, vehicle: AgentId) -> bool {
        self.occupants.contains_key(&vehicle)
    }

    /// Whether two approaches conflict.
    pub fn conflicts(&self, a: usize, b: usize) -> bool {
        self.approaches
            .get(a)
            .map(|approach| approach.conflicts.contains(&b))
            .unwrap_or(false)
    }

    /// The crossing containing `waypoint`.
    pub fn crossing_of(&self, waypoint: WaypointId) -> Option<usize> {
        self.crossings
            .iter()
            .position(|c| c.waypoints.contains(&waypoint))
    }

    pub fn crossing_state(&self, crossing: usize) -> Option<CrossingState> {
        self.crossings.get(crossing).map(|c| c.state)
    }

    /// The number of pedestrians on a crossing.
    pub fn pedestrians_crossing(&self, crossing: usize) -> usize {
        self.crossings.get(crossing).map(|c| c.pedestrians.len()).unwrap_or(0)
    }

    /// All stop waypoints, for every approach.
    pub fn stop_waypoints(&self) -> impl Iterator<Item = WaypointId> + '_ {
        self.approaches.iter().flat_map(|a| a.stop_waypoints.iter().copied())
    }

    pub fn exit_waypoints(&self) -> &[WaypointId] {
        &self.exit_waypoints
    }

    /// All pedestrian crossing waypoints.
    pub fn crossing_waypoints(&self) -> impl Iterator<Item = WaypointId> + '_ {
        self.crossings.iter().flat_map(|c| c.waypoints.iter().copied())
    }

    fn admit(&mut self, vehicle: AgentId, approach: usize) {
        self.occupants.insert(vehicle, approach);
        self.approaches[approach].occupancy += 1;
        let zipper = self.approaches[approach].zipper;
        self.rules.granted(approach, zipper);
        self.refresh_states();
    }

    fn can_enter(&self, idx: usize) -> bool {
        let approach = &self.approaches[idx];
        if approach.state == ApproachState::Closed {
            return false;
        }
        if approach.conflicts.iter().any(|c| self.approaches[*c].occupancy > 0) {
            return false;
        }
        if approach.crossings.iter().any(|c| !self.crossings[*c].pedestrians.is_empty()) {
            return false;
        }
        if approach.state == ApproachState::Yielding {
            let must_yield = approach.conflicts.iter().any(|c| {
                let other = &self.approaches[*c];
                let precedes = match other.state {
                    ApproachState::Closed => false,
                    ApproachState::Open => true,
                    ApproachState::Yielding => {
                        other.priority > approach.priority && !(other.zipper && approach.zipper)
                    }
                };
                precedes && self.rules.is_waiting(*c, self.time)
            });
            if must_yield {
                return false;
            }
            if approach.zipper {
                let others = approach
                    .conflicts
                    .iter()
                    .copied()
                    .filter(|c| self.approaches[*c].zipper);
                if !self.rules.is_zipper_turn(idx, others, self.time) {
                    return false;
                }
            }
        }
        true
    }

    fn refresh_states(&mut self) {
        match &self.control {
            Control::Signal(signal) => {
                for (idx, approach) in self.approaches.iter_mut().enumerate() {
                    approach.state = match signal.light(idx) {
                        LightState::Green if signal.is_yielding(idx) => ApproachState::Yielding,
                        LightState::Green => ApproachState::Open,
                        LightState::Amber | LightState::Red => ApproachState::Closed,
                    };
                }
                for crossing in &mut self.crossings {
                    let clear = crossing.conflicts.iter().all(|a| {
                        signal.light(*a) == LightState::Red && self.approaches[*a].occupancy == 0
                    });
                    crossing.state = if clear { CrossingState::Open } else { CrossingState::Closed };
                }
            }
            Control::Priority => {
                for idx in 0..self.approaches.len() {
                    let approach = &self.approaches[idx];
                    let top = approach
                        .conflicts
                        .iter()
                        .all(|c| self.approaches[*c].priority <= approach.priority);
                    let state = if top && !approach.zipper {
                        ApproachState::Open
                    } else {
                        ApproachState::Yielding
                    };
                    self.approaches[idx].state = state;
                }
                for crossing in &mut self.crossings {
                    let clear = crossing.conflicts.iter().all(|a| self.approaches[*a].occupancy == 0);
                    crossing.state = if clear { CrossingState::Open } else { CrossingState::Closed };
                }
            }
        }
    }
}

/// All the intersections of a level, indexed by the waypoints that lead into,
/// out of, and across them.
#[derive(Clone, Debug, Default)]
pub struct Intersections {
    controllers: SlotMap<IntersectionId, IntersectionController>,
    by_stop: HashMap<WaypointId, IntersectionId>,
    by_exit: HashMap<WaypointId, SmallVec<[IntersectionId; 2]>>,
    by_crossing: HashMap<WaypointId, IntersectionId>,
}

impl Intersections {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds an intersection. A stop or crossing waypoint may belong to only one intersection.
    pub fn add(&mut self, attribs: &IntersectionAttributes, graph: &WaypointGraph) -> Result<IntersectionId> {
        let controller = IntersectionController::new(attribs, graph)?;
        let claimed = controller
            .stop_waypoints()
            .chain(controller.crossing_waypoints())
            .find(|w| self.by_stop.contains_key(w) || self.by_crossing.contains_key(w));
        if let Some(waypoint) = claimed {
            return Err(Error::Configuration(format!(
                "waypoint {waypoint} of intersection {} already belongs to another intersection",
                attribs.name
            )));
        }

        let id = self.controllers.insert(controller);
        let controller = &mut self.controllers[id];
        controller.id = id;
        for waypoint in controller.stop_waypoints() {
            self.by_stop.insert(waypoint, id);
        }
        for waypoint in controller.crossing_waypoints() {
            self.by_crossing.insert(waypoint, id);
        }
        for waypoint in controller.exit_waypoints() {
            self.by_exit.entry(*waypoint).or_default().push(id);
        }
        info!(
            "intersection {} loaded with {} approaches",
            controller.name,
            controller.approach_count()
        );
        Ok(id)
    }

    pub fn get(&self, id: IntersectionId) -> Option<&IntersectionController> {
        self.controllers.get(id)
    }

    pub fn get_mut(&mut self, id: IntersectionId) -> Option<&mut IntersectionController> {
        self.controllers.get_mut(id)
    }

    /// Returns an iterator over all the intersections.
    pub fn iter(&self) -> impl Iterator<Item = (IntersectionId, &IntersectionController)> {
        self.controllers.iter()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// The intersection a stop waypoint leads into.
    pub fn at_stop(&self, waypoint: WaypointId) -> Option<IntersectionId> {
        self.by_stop.get(&waypoint).copied()
    }

    /// Whether reaching `waypoint` means leaving intersection `id`.
    pub fn is_exit(&self, waypoint: WaypointId, id: IntersectionId) -> bool {
        self.by_exit
            .get(&waypoint)
            .map(|ids| ids.contains(&id))
            .unwrap_or(false)
    }

    /// The intersection a pedestrian crossing waypoint belongs to.
    pub fn at_crossing(&self, waypoint: WaypointId) -> Option<IntersectionId> {
        self.by_crossing.get(&waypoint).copied()
    }

    /// Advances every intersection's timers.
    pub fn update(&mut self, dt: f64) {
        for controller in self.controllers.values_mut() {
            controller.update(dt);
        }
    }

    /// Purges departed agents from every intersection.
    pub fn reconcile(&mut self, registry: &AgentRegistry) -> usize {
        self.controllers
            .values_mut()
            .map(|controller| controller.reconcile(registry))
            .sum()
    }

    /// Releases everything an agent holds in any intersection.
    pub fn release_agent(&mut self, agent: AgentId) {
        for controller in self.controllers.values_mut() {
            controller.vehicle_left(agent);
            controller.pedestrian_passed(agent);
        }
    }
}
