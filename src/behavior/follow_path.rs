use super::acceleration::Longitudinal;
use super::flee::new_waypoint_index;
use super::BehaviorContext;
use crate::controller::{ControlIntent, SensedState};
use crate::events::Event;
use crate::math::{heading_frame, signed_angle, Point2d, Vector2d};
use crate::registry::{AgentAttributes, AgentKind};
use crate::util::rotated_range;
use crate::waypoint::WaypointId;
use crate::{AgentId, IntersectionId};
use cgmath::prelude::*;
use log::{debug, warn};
use rand::Rng;
use std::collections::VecDeque;

/// Waypoints an agent may pass in a single frame.
const MAX_ADVANCE_PER_FRAME: usize = 2;

/// How the next waypoint is picked when an agent's path runs short.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Selection {
    /// A random allowed successor, preferring ones nobody else has reserved.
    Random,
    /// The allowed successor farthest from a point.
    AwayFrom(Point2d),
    /// The next waypoint of a planned route. The agent stops when it runs out.
    Route(VecDeque<WaypointId>),
}

/// The result of looking for the waypoint after `tail`.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Next {
    Waypoint(WaypointId),
    /// `tail` is terminal, or the route is complete.
    Arrived,
    /// `tail` has successors but none this agent may use.
    DeadEnd,
}

impl Selection {
    fn next(&mut self, ctx: &mut BehaviorContext, agent: AgentId, tail: WaypointId, attributes: &AgentAttributes) -> Next {
        let ty = attributes.agent_type;
        let end = match ctx.graph.try_get(tail) {
            Some(waypoint) if !waypoint.is_terminal() => Next::DeadEnd,
            _ => Next::Arrived,
        };
        match self {
            Selection::Route(route) => match route.pop_front() {
                Some(next) => Next::Waypoint(next),
                None => Next::Arrived,
            },
            Selection::AwayFrom(point) => {
                let next = new_waypoint_index(ctx.graph, tail, ty, *point);
                if next.is_invalid() {
                    end
                } else {
                    Next::Waypoint(next)
                }
            }
            Selection::Random => {
                let candidates = ctx.graph.allowed_successors(tail, ty);
                if candidates.is_empty() {
                    return end;
                }
                let start = ctx.rng.gen_range(0..candidates.len());
                let free = rotated_range(candidates.len(), start)
                    .map(|idx| candidates[idx])
                    .find(|id| !ctx.registry.is_reserved_by_other(*id, agent));
                // Reservations are advisory; take the contested waypoint if nothing is free
                Next::Waypoint(free.unwrap_or(candidates[start]))
            }
        }
    }
}

/// Options for a single [PathFollower::drive] call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DriveOptions {
    /// Multiplies the path speed limit.
    pub speed_multiplier: f64,
    /// Extra distance in m to keep to the obstacle ahead.
    pub follow_gap: f64,
}

impl Default for DriveOptions {
    fn default() -> Self {
        Self {
            speed_multiplier: 1.0,
            follow_gap: 0.0,
        }
    }
}

/// Drives an agent along its committed path, extending it as it runs short and
/// stopping wherever it needs permission to continue.
#[derive(Clone, Debug, Default)]
pub(crate) struct PathFollower {
    /// After a dead end, don't look for a new waypoint before this time.
    retry_at: Option<f64>,
    /// Consecutive dead ends hit without finding a way on.
    dead_ends: u32,
    /// The path can't be extended because the agent has arrived.
    at_end: bool,
    /// Whether the arrival has been notified.
    notified: bool,
    /// The intersection and waypoint at which a pedestrian started crossing.
    crossing: Option<(IntersectionId, WaypointId)>,
}

impl PathFollower {
    /// Computes this frame's control intent.
    pub fn drive(
        &mut self,
        state: &SensedState,
        ctx: &mut BehaviorContext,
        selection: &mut Selection,
        options: DriveOptions,
    ) -> ControlIntent {
        let agent = state.agent;
        let Some(record) = ctx.registry.get(agent) else {
            return ControlIntent::hold();
        };
        let attributes = *record.attributes();
        let reach = ctx.config.reach_for(attributes.kind);

        self.refill(state, ctx, selection, &attributes);

        let mut advanced = 0;
        let (target, target_pos, distance, may_pass) = loop {
            let Some(target) = ctx.registry.get(agent).and_then(|r| r.target()) else {
                return self.idle(agent, ctx);
            };
            let Some(target_pos) = ctx.graph.position(target) else {
                debug!("{agent:?} targets missing waypoint {target}");
                ctx.registry.clear_path(agent);
                return ControlIntent::hold();
            };
            let distance = (target_pos - state.position).magnitude();
            let may_pass = self.may_pass(state, ctx, &attributes, target, distance);
            if may_pass && distance <= reach && advanced < MAX_ADVANCE_PER_FRAME {
                self.reached(agent, target, ctx);
                self.refill(state, ctx, selection, &attributes);
                advanced += 1;
                continue;
            }
            break (target, target_pos, distance, may_pass);
        };

        let steer = steer_towards(state.heading, target_pos - state.position, ctx.config.max_steer_angle);
        let mut lon = Longitudinal::new(&attributes);
        let speed_factor = ctx.registry.get(agent).map(|r| r.speed_factor()).unwrap_or(1.0);
        let path_speed = ctx
            .graph
            .try_get(target)
            .map(|w| w.max_speed())
            .unwrap_or(attributes.max_speed);
        let speed_limit = f64::min(
            path_speed * speed_factor * options.speed_multiplier,
            attributes.max_speed,
        );
        lon.apply_current_speed_limit(state.speed, speed_limit);
        if let Some(next_limit) = self.next_speed_limit(agent, ctx) {
            lon.apply_speed_limit(state.speed, next_limit * speed_factor, distance);
        }
        if !may_pass {
            lon.stop_at_line(distance - 0.5 * attributes.length, state.speed);
        }
        if let Some(obstacle) = state.obstacle_distance {
            lon.follow(obstacle - options.follow_gap, state.speed, 0.0);
        }
        lon.intent(steer)
    }

    /// Forgets any state tied to the previous path.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether the agent's path has ended and cannot be extended.
    pub fn has_arrived(&self) -> bool {
        self.at_end && self.notified
    }

    /// Extends the agent's path up to the lookahead length.
    fn refill(
        &mut self,
        state: &SensedState,
        ctx: &mut BehaviorContext,
        selection: &mut Selection,
        attributes: &AgentAttributes,
    ) {
        if matches!(self.retry_at, Some(t) if ctx.time < t) {
            return;
        }
        self.retry_at = None;
        let agent = state.agent;
        loop {
            let Some(record) = ctx.registry.get(agent) else {
                return;
            };
            if record.path().len() >= ctx.config.lookahead {
                return;
            }
            let next = match record.path_tail() {
                Some(tail) => selection.next(ctx, agent, tail, attributes),
                None => match ctx.graph.closest_waypoint(
                    ctx.grid,
                    state.position,
                    attributes.agent_type,
                    ctx.config.search_radius,
                ) {
                    Some(closest) => Next::Waypoint(closest),
                    None => {
                        debug!("{agent:?} has no waypoint within {} m", ctx.config.search_radius);
                        Next::DeadEnd
                    }
                },
            };
            match next {
                Next::Waypoint(waypoint) => {
                    self.at_end = false;
                    self.notified = false;
                    self.dead_ends = 0;
                    if ctx.registry.extend_path(agent, waypoint).is_err() {
                        return;
                    }
                }
                Next::Arrived => {
                    self.at_end = true;
                    return;
                }
                Next::DeadEnd => {
                    self.dead_ends += 1;
                    if self.dead_ends > 1 {
                        warn!("{agent:?} still stuck at a dead end after {} retries", self.dead_ends - 1);
                    } else {
                        debug!("{agent:?} hit a dead end, retrying in {} s", ctx.config.dead_end_retry);
                    }
                    self.retry_at = Some(ctx.time + ctx.config.dead_end_retry);
                    return;
                }
            }
        }
    }

    /// Whether the agent may drive past `target` now.
    fn may_pass(
        &mut self,
        state: &SensedState,
        ctx: &mut BehaviorContext,
        attributes: &AgentAttributes,
        target: WaypointId,
        distance: f64,
    ) -> bool {
        let agent = state.agent;
        let reach = ctx.config.reach_for(attributes.kind);
        match attributes.kind {
            AgentKind::Vehicle => {
                if let Some(id) = ctx.intersections.at_stop(target) {
                    let Some(controller) = ctx.intersections.get_mut(id) else {
                        return true;
                    };
                    if controller.contains_vehicle(agent) {
                        return true;
                    }
                    let Some(record) = ctx.registry.get(agent) else {
                        return false;
                    };
                    // Ask once the agent could still comfortably stop at the line
                    let approach = Longitudinal::new(record.attributes()).stopping_distance(state.speed) + reach;
                    if distance > approach {
                        return false;
                    }
                    ctx.registry.set_intersection(agent, Some(id));
                    return controller.try_enter(agent, target);
                }

                let Some(waypoint) = ctx.graph.try_get(target) else {
                    return true;
                };
                let flags = waypoint.flags();
                if flags.stop && state.speed > ctx.config.stop_speed {
                    return false;
                }
                if flags.give_way || flags.zipper_give_way {
                    return !self.must_give_way(agent, ctx, target);
                }
                true
            }
            AgentKind::Pedestrian => {
                if self.crossing.is_some() {
                    return true;
                }
                let Some(id) = ctx.intersections.at_crossing(target) else {
                    return true;
                };
                // Only stepping onto the street needs permission, not stepping off it
                let next = ctx.registry.get(agent).and_then(|r| r.path().get(1).copied());
                let crosses = next.is_some_and(|next| ctx.intersections.at_crossing(next) == Some(id));
                if !crosses {
                    return true;
                }
                if distance > reach {
                    return false;
                }
                let Some(controller) = ctx.intersections.get_mut(id) else {
                    return true;
                };
                if !controller.pedestrian_enter(agent, target) {
                    return false;
                }
                self.crossing = Some((id, target));
                ctx.registry.set_intersection(agent, Some(id));
                ctx.events.push(Event::StreetCrossingStarted {
                    agent,
                    intersection: id,
                    waypoint: target,
                });
                true
            }
        }
    }

    /// Whether another agent is about to use a competing lane into the merge after `target`.
    fn must_give_way(&self, agent: AgentId, ctx: &BehaviorContext, target: WaypointId) -> bool {
        let Some(next) = ctx.registry.get(agent).and_then(|r| r.path().get(1).copied()) else {
            return false;
        };
        let Ok(prevs) = ctx.graph.predecessors(next) else {
            return false;
        };
        prevs
            .iter()
            .filter(|prev| **prev != target)
            .any(|prev| ctx.registry.is_reserved_by_other(*prev, agent))
    }

    /// The speed limit of the waypoint after the current target.
    fn next_speed_limit(&self, agent: AgentId, ctx: &BehaviorContext) -> Option<f64> {
        let next = ctx.registry.get(agent)?.path().get(1).copied()?;
        ctx.graph.try_get(next).map(|w| w.max_speed())
    }

    /// Records that the agent has passed its target.
    fn reached(&mut self, agent: AgentId, target: WaypointId, ctx: &mut BehaviorContext) {
        ctx.registry.advance(agent);
        let trigger = ctx
            .graph
            .try_get(target)
            .map(|w| w.flags().trigger_event)
            .unwrap_or(false);
        ctx.events.push(Event::WaypointReached {
            agent,
            waypoint: target,
            trigger,
        });

        if let Some((id, entered)) = self.crossing {
            if target != entered {
                if let Some(controller) = ctx.intersections.get_mut(id) {
                    controller.pedestrian_passed(agent);
                }
                self.crossing = None;
                ctx.registry.set_intersection(agent, None);
            }
            return;
        }
        let Some(id) = ctx.registry.get(agent).and_then(|r| r.intersection()) else {
            return;
        };
        if ctx.intersections.is_exit(target, id) {
            if let Some(controller) = ctx.intersections.get_mut(id) {
                controller.vehicle_left(agent);
            }
            ctx.registry.set_intersection(agent, None);
        }
    }

    /// The intent when the path is empty.
    fn idle(&mut self, agent: AgentId, ctx: &mut BehaviorContext) -> ControlIntent {
        if self.at_end && !self.notified {
            self.notified = true;
            ctx.events.push(Event::DestinationReached(agent));
        }
        ControlIntent::hold()
    }
}

/// The steering input which turns `heading` towards `to_target`.
pub(crate) fn steer_towards(heading: Vector2d, to_target: Vector2d, max_steer_angle: f64) -> f64 {
    let (_, forward) = heading_frame(heading);
    if forward == Vector2d::zero() || to_target.magnitude2() < 1e-12 {
        return 0.0;
    }
    (signed_angle(forward, to_target) / max_steer_angle).clamp(-1.0, 1.0)
}

/// Follows the waypoint graph, picking successors at random.
#[derive(Clone, Debug)]
pub struct FollowPath {
    follower: PathFollower,
    selection: Selection,
    /// A waypoint to start from when activated.
    start: Option<WaypointId>,
}

impl FollowPath {
    pub fn new() -> Self {
        Self {
            follower: PathFollower::default(),
            selection: Selection::Random,
            start: None,
        }
    }

    /// Follows the graph from `start`, which becomes the agent's first target.
    pub fn starting_at(start: WaypointId) -> Self {
        Self {
            start: Some(start),
            ..Self::new()
        }
    }

    pub(crate) fn activate(&mut self, agent: AgentId, ctx: &mut BehaviorContext) {
        self.follower.reset();
        if let Some(start) = self.start.take() {
            ctx.registry.commit_path(agent, &[start]);
        }
    }

    pub(crate) fn execute(&mut self, state: &SensedState, ctx: &mut BehaviorContext) -> ControlIntent {
        self.follower
            .drive(state, ctx, &mut self.selection, DriveOptions::default())
    }
}

impl Default for FollowPath {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::super::fixture::*;
    use super::*;
    use crate::intersection::{ApproachAttributes, IntersectionAttributes, IntersectionControl};
    use crate::registry::AgentAttributes;
    use crate::waypoint::{AgentType, AgentTypes, WaypointAttributes};
    use assert_approx_eq::assert_approx_eq;

    /// A straight road of `n` waypoints 10 m apart along the x axis.
    fn road(n: u32) -> Vec<WaypointAttributes> {
        (0..n)
            .map(|i| {
                let next = if i + 1 < n { vec![i + 1] } else { vec![] };
                WaypointAttributes::new(i, Point2d::new(10.0 * i as f64, 0.0), &next)
            })
            .collect()
    }

    fn east() -> Vector2d {
        Vector2d::new(1.0, 0.0)
    }

    #[test]
    fn extends_path_to_lookahead() {
        let mut fixture = Fixture::new(&road(8));
        let agent = fixture.spawn(AgentAttributes::car(AgentType(0)), 1, Point2d::new(0.0, 0.0));
        let mut behavior = FollowPath::new();
        let intent = behavior.execute(&sensed(agent, Point2d::new(0.0, 0.0), east(), 0.0), &mut fixture.ctx());

        let path = fixture.registry.get(agent).unwrap().path().iter().copied().collect::<Vec<_>>();
        assert_eq!(path, [1, 2, 3, 4].map(WaypointId));
        assert!(fixture.registry.is_reserved(WaypointId(4)));
        assert!(intent.throttle > 0.0);
        assert_approx_eq!(intent.steer, 0.0);
    }

    #[test]
    fn steers_towards_target() {
        let left = steer_towards(east(), Vector2d::new(1.0, 1.0), 0.6);
        let right = steer_towards(east(), Vector2d::new(1.0, -0.1), 0.6);
        assert_approx_eq!(left, 1.0);
        assert!(right < 0.0 && right > -1.0);
        assert_approx_eq!(steer_towards(Vector2d::zero(), east(), 0.6), 0.0);
    }

    #[test]
    fn advances_and_raises_waypoint_events() {
        let mut records = road(8);
        records[1].flags.trigger_event = true;
        let mut fixture = Fixture::new(&records);
        let agent = fixture.spawn(AgentAttributes::car(AgentType(0)), 1, Point2d::new(9.5, 0.0));
        let mut behavior = FollowPath::new();
        behavior.execute(&sensed(agent, Point2d::new(9.5, 0.0), east(), 5.0), &mut fixture.ctx());

        let record = fixture.registry.get(agent).unwrap();
        assert_eq!(record.last_reached(), Some(WaypointId(1)));
        assert_eq!(record.target(), Some(WaypointId(2)));
        assert!(!fixture.registry.is_reserved(WaypointId(1)));
        assert_eq!(
            fixture.events.drain(),
            vec![Event::WaypointReached {
                agent,
                waypoint: WaypointId(1),
                trigger: true
            }]
        );
    }

    #[test]
    fn terminal_waypoint_is_a_destination() {
        let mut fixture = Fixture::new(&road(3));
        let agent = fixture.spawn(AgentAttributes::car(AgentType(0)), 2, Point2d::new(20.0, 0.0));
        let mut behavior = FollowPath::new();
        let state = sensed(agent, Point2d::new(20.0, 0.0), east(), 0.0);

        let intent = behavior.execute(&state, &mut fixture.ctx());
        assert!(intent.is_stopping());
        let events = fixture.events.drain();
        assert_eq!(events.last(), Some(&Event::DestinationReached(agent)));

        // Only raised once
        behavior.execute(&state, &mut fixture.ctx());
        assert!(fixture.events.is_empty());
    }

    #[test]
    fn dead_end_retries_after_delay() {
        let mut records = road(4);
        records[2].allowed = AgentTypes::of(&[AgentType(1)]);
        let mut fixture = Fixture::new(&records);
        let agent = fixture.spawn(AgentAttributes::car(AgentType(0)), 1, Point2d::new(0.0, 0.0));
        let mut behavior = FollowPath::new();
        let state = sensed(agent, Point2d::new(0.0, 0.0), east(), 0.0);

        behavior.execute(&state, &mut fixture.ctx());
        assert_eq!(fixture.registry.get(agent).unwrap().path().len(), 1);
        assert!(behavior.follower.retry_at.is_some());
        assert!(fixture.events.is_empty());

        fixture.time = fixture.config.dead_end_retry + 0.1;
        behavior.execute(&state, &mut fixture.ctx());
        assert!(behavior.follower.retry_at.is_some());
    }

    #[test]
    fn prefers_unreserved_successor() {
        // 0 forks into 1 and 2
        let records = vec![
            WaypointAttributes::new(0, Point2d::new(0.0, 0.0), &[1, 2]),
            WaypointAttributes::new(1, Point2d::new(10.0, 2.0), &[]),
            WaypointAttributes::new(2, Point2d::new(10.0, -2.0), &[]),
        ];
        let mut fixture = Fixture::new(&records);
        let other = fixture.spawn(AgentAttributes::car(AgentType(0)), 1, Point2d::new(5.0, 2.0));
        let agent = fixture.spawn(AgentAttributes::car(AgentType(0)), 0, Point2d::new(-5.0, 0.0));
        let mut behavior = FollowPath::new();
        behavior.execute(&sensed(agent, Point2d::new(-5.0, 0.0), east(), 0.0), &mut fixture.ctx());

        let path = fixture.registry.get(agent).unwrap().path().iter().copied().collect::<Vec<_>>();
        assert_eq!(path, vec![WaypointId(0), WaypointId(2)]);
        assert_eq!(fixture.registry.reservation_owner(WaypointId(1)), Some(other));
    }

    #[test]
    fn stops_until_intersection_grants_entry() {
        // Two roads crossing: 0 -> 1 -> 2 (east) and 3 -> 4 -> 5 (north); 1 and 4 are stop waypoints
        let records = vec![
            WaypointAttributes::new(0, Point2d::new(-20.0, 0.0), &[1]),
            WaypointAttributes::new(1, Point2d::new(-5.0, 0.0), &[2]),
            WaypointAttributes::new(2, Point2d::new(10.0, 0.0), &[]),
            WaypointAttributes::new(3, Point2d::new(0.0, -20.0), &[4]),
            WaypointAttributes::new(4, Point2d::new(0.0, -5.0), &[5]),
            WaypointAttributes::new(5, Point2d::new(0.0, 10.0), &[]),
        ];
        let attribs = IntersectionAttributes {
            name: "cross".into(),
            approaches: vec![
                ApproachAttributes {
                    stop_waypoints: vec![WaypointId(1)],
                    conflicts: None,
                },
                ApproachAttributes {
                    stop_waypoints: vec![WaypointId(4)],
                    conflicts: None,
                },
            ],
            exit_waypoints: vec![WaypointId(2), WaypointId(5)],
            crossings: vec![],
            control: IntersectionControl::Priority,
        };
        let mut fixture = Fixture::new(&records).with_intersection(&attribs);
        let id = fixture.intersections.at_stop(WaypointId(1)).unwrap();

        let north = fixture.spawn(AgentAttributes::car(AgentType(0)), 4, Point2d::new(0.0, -6.0));
        fixture.intersections.get_mut(id).unwrap().vehicle_enter(north, WaypointId(4));

        let east_car = fixture.spawn(AgentAttributes::car(AgentType(0)), 1, Point2d::new(-6.0, 0.0));
        let mut behavior = FollowPath::new();
        let state = sensed(east_car, Point2d::new(-6.0, 0.0), east(), 0.0);
        let intent = behavior.execute(&state, &mut fixture.ctx());
        assert!(intent.is_stopping());
        assert_eq!(fixture.registry.get(east_car).unwrap().target(), Some(WaypointId(1)));
        assert_eq!(fixture.registry.get(east_car).unwrap().intersection(), Some(id));

        fixture.intersections.get_mut(id).unwrap().vehicle_left(north);
        let intent = behavior.execute(&state, &mut fixture.ctx());
        assert!(!intent.is_stopping());
        assert!(fixture.intersections.get(id).unwrap().contains_vehicle(east_car));

        // Reaching the exit leaves the intersection
        let state = sensed(east_car, Point2d::new(9.0, 0.0), east(), 5.0);
        behavior.execute(&state, &mut fixture.ctx());
        assert!(!fixture.intersections.get(id).unwrap().contains_vehicle(east_car));
        assert_eq!(fixture.registry.get(east_car).unwrap().intersection(), None);
    }

    #[test]
    fn stop_sign_requires_standstill() {
        let mut records = road(4);
        records[1].flags.stop = true;
        let mut fixture = Fixture::new(&records);
        let agent = fixture.spawn(AgentAttributes::car(AgentType(0)), 1, Point2d::new(9.0, 0.0));
        let mut behavior = FollowPath::new();

        let intent = behavior.execute(&sensed(agent, Point2d::new(9.0, 0.0), east(), 3.0), &mut fixture.ctx());
        assert!(intent.is_stopping());
        assert_eq!(fixture.registry.get(agent).unwrap().target(), Some(WaypointId(1)));

        behavior.execute(&sensed(agent, Point2d::new(9.5, 0.0), east(), 0.0), &mut fixture.ctx());
        assert_eq!(fixture.registry.get(agent).unwrap().last_reached(), Some(WaypointId(1)));
    }

    #[test]
    fn follows_obstacle_ahead() {
        let mut fixture = Fixture::new(&road(8));
        let agent = fixture.spawn(AgentAttributes::car(AgentType(0)), 2, Point2d::new(0.0, 0.0));
        let mut behavior = FollowPath::new();
        let mut state = sensed(agent, Point2d::new(0.0, 0.0), east(), 10.0);
        state.obstacle_distance = Some(1.0);
        let intent = behavior.execute(&state, &mut fixture.ctx());
        assert!(intent.is_stopping());
    }
}
