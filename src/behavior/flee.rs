use super::follow_path::{DriveOptions, PathFollower, Selection};
use super::{BehaviorContext, PointOfInterest};
use crate::controller::{ControlIntent, SensedState};
use crate::graph::WaypointGraph;
use crate::math::Point2d;
use crate::waypoint::{AgentType, WaypointId};
use cgmath::prelude::*;
use log::{debug, trace};
use std::collections::VecDeque;

/// Picks the allowed successor of `current` farthest from `danger`.
/// Returns [WaypointId::INVALID] if `current` has no allowed successor.
pub fn new_waypoint_index(graph: &WaypointGraph, current: WaypointId, ty: AgentType, danger: Point2d) -> WaypointId {
    let mut best: Option<(WaypointId, f64)> = None;
    for next in graph.allowed_successors(current, ty) {
        let Some(pos) = graph.position(next) else {
            continue;
        };
        let distance = pos.distance2(danger);
        if best.map_or(true, |(_, max)| distance > max) {
            best = Some((next, distance));
        }
    }
    best.map_or(WaypointId::INVALID, |(id, _)| id)
}

/// Walks away from a point, choosing at every junction the successor farthest from it.
#[derive(Clone, Debug)]
pub struct RunAwayFromPoint {
    follower: PathFollower,
    point: PointOfInterest,
}

impl RunAwayFromPoint {
    pub fn new(point: PointOfInterest) -> Self {
        Self {
            follower: PathFollower::default(),
            point,
        }
    }

    pub(crate) fn execute(&mut self, state: &SensedState, ctx: &mut BehaviorContext) -> ControlIntent {
        let Some(danger) = self.point.resolve(ctx.registry) else {
            return ControlIntent::hold();
        };
        let mut selection = Selection::AwayFrom(danger);
        self.follower
            .drive(state, ctx, &mut selection, DriveOptions::default())
    }
}

/// Walks along the graph to the waypoint closest to a point.
#[derive(Clone, Debug)]
pub struct RunTowardPoint {
    follower: PathFollower,
    point: PointOfInterest,
    /// The waypoint the current route leads to.
    destination: Option<WaypointId>,
    selection: Selection,
    /// Set while no route exists; the route is searched for again at this time.
    retry_at: Option<f64>,
}

impl RunTowardPoint {
    pub fn new(point: PointOfInterest) -> Self {
        Self {
            follower: PathFollower::default(),
            point,
            destination: None,
            selection: Selection::Route(VecDeque::new()),
            retry_at: None,
        }
    }

    /// The waypoint the agent is heading for.
    pub fn destination(&self) -> Option<WaypointId> {
        self.destination
    }

    /// Whether the agent is holding because its destination can't be reached.
    pub fn is_stranded(&self) -> bool {
        self.retry_at.is_some()
    }

    pub(crate) fn activate(&mut self) {
        self.follower.reset();
        self.destination = None;
        self.selection = Selection::Route(VecDeque::new());
        self.retry_at = None;
    }

    pub(crate) fn execute(&mut self, state: &SensedState, ctx: &mut BehaviorContext) -> ControlIntent {
        let agent = state.agent;
        let Some(point) = self.point.resolve(ctx.registry) else {
            return ControlIntent::hold();
        };
        let Some(record) = ctx.registry.get(agent) else {
            return ControlIntent::hold();
        };
        let (ty, target) = (record.agent_type(), record.target());
        let start = target.or(record.last_reached());
        let Some(destination) = ctx
            .graph
            .closest_waypoint(ctx.grid, point, ty, ctx.config.search_radius)
        else {
            trace!("{agent:?} has no waypoint near {point:?}");
            return ControlIntent::hold();
        };
        let retry = self.retry_at.is_some_and(|at| ctx.time >= at);
        if Some(destination) != self.destination || retry {
            self.destination = Some(destination);
            self.follower.reset();
            let route = match start {
                Some(start) if start == destination => Some(vec![]),
                Some(start) => match ctx.graph.find_path(start, destination, ty) {
                    Ok(route) => Some(route),
                    Err(err) => {
                        debug!("{agent:?} can't run toward {point:?}: {err}");
                        None
                    }
                },
                None => {
                    debug!("{agent:?} can't run toward {point:?}: not on the graph");
                    None
                }
            };
            match start {
                Some(start) if target.is_some() => ctx.registry.commit_path(agent, &[start]),
                _ => ctx.registry.clear_path(agent),
            }
            match route {
                Some(route) => {
                    self.retry_at = None;
                    self.selection = Selection::Route(route.into());
                }
                None => {
                    self.retry_at = Some(ctx.time + ctx.config.dead_end_retry);
                    self.selection = Selection::Route(VecDeque::new());
                }
            }
        }
        if self.retry_at.is_some() {
            return ControlIntent::hold();
        }
        self.follower
            .drive(state, ctx, &mut self.selection, DriveOptions::default())
    }
}
