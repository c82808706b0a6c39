//! Notifications raised by the simulation.
//!
//! Events are queued while a frame is simulated and drained by the caller afterwards,
//! so consumers must not assume they arrive before the next frame begins.

use crate::{AgentId, IntersectionId, WaypointId};

/// A notification about an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// An agent was added to the simulation.
    AgentAdded(AgentId),
    /// An agent was removed from the simulation.
    AgentRemoved(AgentId),
    /// An agent reached the end of its path or its requested destination.
    DestinationReached(AgentId),
    /// An agent reached a waypoint.
    WaypointReached {
        agent: AgentId,
        waypoint: WaypointId,
        /// Whether the waypoint is flagged as raising a trigger event.
        trigger: bool,
    },
    /// A pedestrian started crossing a street at an intersection.
    StreetCrossingStarted {
        agent: AgentId,
        intersection: IntersectionId,
        waypoint: WaypointId,
    },
    /// An agent's active behavior was replaced.
    BehaviorChanged {
        agent: AgentId,
        behavior: &'static str,
    },
}

impl Event {
    /// The agent the event concerns.
    pub fn agent(&self) -> AgentId {
        match *self {
            Event::AgentAdded(agent)
            | Event::AgentRemoved(agent)
            | Event::DestinationReached(agent)
            | Event::WaypointReached { agent, .. }
            | Event::StreetCrossingStarted { agent, .. }
            | Event::BehaviorChanged { agent, .. } => agent,
        }
    }
}

/// A queue of events raised during simulation.
#[derive(Clone, Debug, Default)]
pub struct EventQueue {
    events: Vec<Event>,
}

impl EventQueue {
    /// Queues an event.
    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Removes and returns all queued events, oldest first.
    pub fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// The queued events, oldest first.
    pub fn pending(&self) -> &[Event] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
