use crate::math::Point2d;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Index of a [Waypoint] within a [WaypointGraph](crate::WaypointGraph).
///
/// Indices are assigned by the authoring data, are dense, and never change while a level is loaded.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WaypointId(pub u32);

impl WaypointId {
    /// The sentinel used by authoring data for "no waypoint".
    pub const INVALID: WaypointId = WaypointId(u32::MAX);

    /// Whether this is the invalid sentinel.
    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }

    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for WaypointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WaypointId({})", self.0)
    }
}

impl fmt::Display for WaypointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A vehicle or pedestrian type tag, e.g. "car", "bus" or "pedestrian".
/// Up to 64 distinct tags are supported per level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AgentType(pub u8);

/// A set of [AgentType]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AgentTypes(u64);

impl AgentTypes {
    /// A set containing every agent type.
    pub const ALL: AgentTypes = AgentTypes(u64::MAX);

    /// The empty set.
    pub const fn none() -> Self {
        Self(0)
    }

    /// Creates a set from a list of types.
    pub fn of(types: &[AgentType]) -> Self {
        types.iter().fold(Self::none(), |set, ty| set.with(*ty))
    }

    /// Returns a copy of the set with `ty` added.
    pub fn with(self, ty: AgentType) -> Self {
        Self(self.0 | Self::bit(ty))
    }

    /// Whether the set contains the type.
    pub fn contains(self, ty: AgentType) -> bool {
        self.0 & Self::bit(ty) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn bit(ty: AgentType) -> u64 {
        1u64.checked_shl(ty.0 as u32).unwrap_or(0)
    }
}

impl fmt::Debug for AgentTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types = (0..64u8).filter(|i| self.contains(AgentType(*i)));
        f.debug_set().entries(types).finish()
    }
}

/// Traffic rule flags attached to a waypoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WaypointFlags {
    /// Agents must come to a standstill here before proceeding.
    pub stop: bool,
    /// Agents must yield to crossing traffic before proceeding.
    pub give_way: bool,
    /// Agents alternate with a merging lane before proceeding.
    pub zipper_give_way: bool,
    /// Reaching this waypoint raises a triggered [Event::WaypointReached](crate::Event).
    pub trigger_event: bool,
}

/// The authoring record of a waypoint, as exported by the level editor.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WaypointAttributes {
    /// The waypoint's index; must equal its position in the authoring list.
    pub id: WaypointId,
    /// The position projected onto the horizontal plane.
    pub position: Point2d,
    /// The successor waypoints.
    pub neighbors: Vec<WaypointId>,
    /// The predecessor waypoints. May be left empty, in which case they are derived from `neighbors`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub prevs: Vec<WaypointId>,
    /// Waypoints in adjacent lanes at the same longitudinal position.
    #[cfg_attr(feature = "serde", serde(default))]
    pub other_lanes: Vec<WaypointId>,
    /// The maximum speed in m/s.
    pub max_speed: f64,
    /// The lane width in m.
    pub lane_width: f64,
    /// The agent types allowed to use this waypoint.
    pub allowed: AgentTypes,
    /// Traffic rule flags.
    #[cfg_attr(feature = "serde", serde(default))]
    pub flags: WaypointFlags,
    /// Higher priorities win at uncontrolled intersections.
    #[cfg_attr(feature = "serde", serde(default))]
    pub priority: i32,
}

impl WaypointAttributes {
    /// Creates an unflagged waypoint open to every agent type.
    pub fn new(id: u32, position: Point2d, neighbors: &[u32]) -> Self {
        Self {
            id: WaypointId(id),
            position,
            neighbors: neighbors.iter().map(|n| WaypointId(*n)).collect(),
            prevs: vec![],
            other_lanes: vec![],
            max_speed: 13.9,
            lane_width: 3.5,
            allowed: AgentTypes::ALL,
            flags: WaypointFlags::default(),
            priority: 0,
        }
    }
}

/// A node in the road or sidewalk graph.
#[derive(Clone, Debug)]
pub struct Waypoint {
    pub(crate) id: WaypointId,
    pub(crate) position: Point2d,
    pub(crate) neighbors: SmallVec<[WaypointId; 4]>,
    pub(crate) prevs: SmallVec<[WaypointId; 4]>,
    pub(crate) other_lanes: SmallVec<[WaypointId; 2]>,
    pub(crate) max_speed: f64,
    pub(crate) lane_width: f64,
    pub(crate) allowed: AgentTypes,
    pub(crate) flags: WaypointFlags,
    pub(crate) priority: i32,
}

impl Waypoint {
    pub(crate) fn new(attribs: &WaypointAttributes) -> Self {
        Self {
            id: attribs.id,
            position: attribs.position,
            neighbors: attribs.neighbors.iter().copied().collect(),
            prevs: SmallVec::new(),
            other_lanes: attribs.other_lanes.iter().copied().collect(),
            max_speed: attribs.max_speed,
            lane_width: attribs.lane_width,
            allowed: attribs.allowed,
            flags: attribs.flags,
            priority: attribs.priority,
        }
    }

    /// Gets the waypoint's index.
    pub fn id(&self) -> WaypointId {
        self.id
    }

    /// The position on the horizontal plane.
    pub fn position(&self) -> Point2d {
        self.position
    }

    /// The successor waypoints, in authoring order.
    pub fn neighbors(&self) -> &[WaypointId] {
        &self.neighbors
    }

    /// The predecessor waypoints.
    pub fn prevs(&self) -> &[WaypointId] {
        &self.prevs
    }

    /// Waypoints in adjacent lanes at the same longitudinal position.
    pub fn other_lanes(&self) -> &[WaypointId] {
        &self.other_lanes
    }

    /// The maximum speed in m/s.
    pub fn max_speed(&self) -> f64 {
        self.max_speed
    }

    /// The lane width in m.
    pub fn lane_width(&self) -> f64 {
        self.lane_width
    }

    /// Whether agents of the given type may use this waypoint.
    pub fn allows(&self, ty: AgentType) -> bool {
        self.allowed.contains(ty)
    }

    pub fn flags(&self) -> WaypointFlags {
        self.flags
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// A waypoint without successors is a terminal, such as a despawn point.
    pub fn is_terminal(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Whether an agent must ask for permission before passing this waypoint.
    pub fn requires_permission(&self) -> bool {
        self.flags.stop || self.flags.give_way || self.flags.zipper_give_way
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn agent_type_sets() {
        let car = AgentType(0);
        let bus = AgentType(3);
        let pedestrian = AgentType(63);
        let set = AgentTypes::of(&[car, pedestrian]);
        assert!(set.contains(car));
        assert!(set.contains(pedestrian));
        assert!(!set.contains(bus));
        assert!(AgentTypes::ALL.contains(bus));
        assert!(AgentTypes::none().is_empty());
        assert!(!AgentTypes::none().with(AgentType(64)).contains(AgentType(64)));
    }

    #[test]
    fn invalid_sentinel() {
        assert!(WaypointId::INVALID.is_invalid());
        assert!(!WaypointId(0).is_invalid());
    }
}
