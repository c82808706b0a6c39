use super::follow_path::FollowPath;
use super::{Behavior, BehaviorContext, BehaviorResult};
use crate::controller::{ControlIntent, SensedState};
use crate::math::{heading_frame, signed_angle, Point2d};
use crate::waypoint::WaypointId;
use cgmath::prelude::*;
use log::trace;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How many waypoints to walk along a lane looking for the nearest one ahead of the agent.
const MAX_LANE_WALK: usize = 8;

/// Stop moving forward when the obstacle is this close.
const MIN_FRONT_CLEARANCE: f64 = 0.5; // m

/// Tuning for [OvertakeStationaryObstacle].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OvertakeConfig {
    /// Distance driven forward on each attempt, in m.
    pub forward_distance: f64,
    /// Distance reversed on the first attempt, in m.
    pub backward_distance: f64,
    /// Multiplies the reverse distance on each repeated attempt.
    pub repeat_factor: f64,
    /// Speed while manoeuvring, in m/s.
    pub movement_speed: f64,
    /// Full steering lock, as a steering input.
    pub max_steer: f64,
    /// Steering change per frame while turning the wheels.
    pub steer_step: f64,
    /// The agent is lined up with the lane once its heading is within this angle, in radians.
    pub align_angle: f64,
    /// How long to wait for the obstacle or the lane before giving up, in s.
    pub timeout: f64,
    /// Forward/reverse attempts before giving up.
    pub max_attempts: usize,
}

impl Default for OvertakeConfig {
    fn default() -> Self {
        Self {
            forward_distance: 1.5,
            backward_distance: 2.5,
            repeat_factor: 1.05,
            movement_speed: 4.0,
            max_steer: 1.0,
            steer_step: 0.1,
            align_angle: 20f64.to_radians(),
            timeout: 5.0,
            max_attempts: 5,
        }
    }
}

impl OvertakeConfig {
    /// The steering input at which the wheels count as fully turned.
    fn max_steer_reached(&self) -> f64 {
        self.max_steer - self.steer_step
    }
}

/// The stages of an overtaking manoeuvre.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OvertakeState {
    /// Stopped behind the obstacle, waiting to detect it.
    Stopped,
    /// Turning the wheels towards the overtaking lane.
    TurningTowardOvertake,
    /// Creeping forward on full lock.
    MovingForward,
    /// Turning the wheels the other way.
    TurningAway,
    /// Reversing on opposite lock.
    Reversing,
    /// Lined up with the lane, waiting for it to clear.
    WaitingForClear,
    /// Handing back to path following on the new lane.
    Exiting,
}

/// Gets round a stationary obstacle by shuffling forwards and backwards until lined up
/// with an adjacent lane, then joins that lane once nobody else is about to use it.
/// Falls back to [FollowObstacle](super::FollowObstacle) when no lane is usable.
#[derive(Clone, Debug)]
pub struct OvertakeStationaryObstacle {
    config: OvertakeConfig,
    state: OvertakeState,
    /// The waypoint on the lane being joined.
    lane: Option<WaypointId>,
    /// +1 when the lane is to the left, -1 to the right.
    side: f64,
    /// Where the current forward or reverse move started.
    origin: Point2d,
    /// The distance to reverse on the current attempt.
    backward_distance: f64,
    attempts: usize,
    /// When the current state was entered, in s.
    since: f64,
}

impl OvertakeStationaryObstacle {
    pub fn new(config: OvertakeConfig) -> Self {
        Self {
            config,
            state: OvertakeState::Stopped,
            lane: None,
            side: 1.0,
            origin: Point2d::new(0.0, 0.0),
            backward_distance: config.backward_distance,
            attempts: 0,
            since: 0.0,
        }
    }

    pub fn state(&self) -> OvertakeState {
        self.state
    }

    /// The waypoint of the lane being joined.
    pub fn lane(&self) -> Option<WaypointId> {
        self.lane
    }

    pub(crate) fn activate(&mut self, ctx: &BehaviorContext) {
        *self = Self::new(self.config);
        self.since = ctx.time;
    }

    pub(crate) fn execute(&mut self, state: &SensedState, ctx: &mut BehaviorContext) -> BehaviorResult {
        let config = self.config;
        let elapsed = ctx.time - self.since;
        let reached = config.max_steer_reached();
        match self.state {
            OvertakeState::Stopped => {
                if state.obstacle_distance.is_none() {
                    if elapsed > config.timeout {
                        return BehaviorResult::replace(ControlIntent::hold(), Behavior::follow_path());
                    }
                    return BehaviorResult::intent(ControlIntent::hold());
                }
                let Some(lane) = self.choose_lane(state, ctx) else {
                    return self.give_up(state, "no usable lane");
                };
                let angle = ctx
                    .graph
                    .position(lane)
                    .map(|pos| signed_angle(state.heading, pos - state.position))
                    .unwrap_or(0.0);
                self.lane = Some(lane);
                self.side = if angle < 0.0 { -1.0 } else { 1.0 };
                self.transition(state, ctx, OvertakeState::TurningTowardOvertake);
                BehaviorResult::intent(self.turn(state.steer, self.side))
            }
            OvertakeState::TurningTowardOvertake => {
                if self.side * state.steer >= reached || elapsed > config.timeout {
                    self.transition(state, ctx, OvertakeState::MovingForward);
                }
                BehaviorResult::intent(self.turn(state.steer, self.side))
            }
            OvertakeState::MovingForward => {
                let travelled = (state.position - self.origin).magnitude();
                let blocked = state
                    .obstacle_distance
                    .is_some_and(|d| d < MIN_FRONT_CLEARANCE);
                if travelled >= config.forward_distance || blocked || elapsed > config.timeout {
                    self.transition(state, ctx, OvertakeState::TurningAway);
                    return BehaviorResult::intent(self.turn(state.steer, -self.side));
                }
                BehaviorResult::intent(self.creep(state.speed, self.side, 1))
            }
            OvertakeState::TurningAway => {
                if -self.side * state.steer >= reached || elapsed > config.timeout {
                    self.transition(state, ctx, OvertakeState::Reversing);
                }
                BehaviorResult::intent(self.turn(state.steer, -self.side))
            }
            OvertakeState::Reversing => {
                let travelled = (state.position - self.origin).magnitude();
                if travelled < self.backward_distance && elapsed <= config.timeout {
                    return BehaviorResult::intent(self.creep(state.speed, -self.side, -1));
                }
                if self.is_aligned(state, ctx) {
                    self.transition(state, ctx, OvertakeState::WaitingForClear);
                    return BehaviorResult::intent(ControlIntent::hold());
                }
                self.attempts += 1;
                if self.attempts >= config.max_attempts {
                    return self.give_up(state, "could not line up with the lane");
                }
                self.backward_distance *= config.repeat_factor;
                self.transition(state, ctx, OvertakeState::TurningTowardOvertake);
                BehaviorResult::intent(self.turn(state.steer, self.side))
            }
            OvertakeState::WaitingForClear => {
                let Some(lane) = self.lane else {
                    return self.give_up(state, "lost the lane");
                };
                if ctx.registry.all_previous_free(lane, state.agent, ctx.graph) {
                    self.transition(state, ctx, OvertakeState::Exiting);
                } else if elapsed > config.timeout {
                    return self.give_up(state, "lane never cleared");
                }
                BehaviorResult::intent(ControlIntent::hold())
            }
            OvertakeState::Exiting => match self.lane {
                Some(lane) => BehaviorResult::replace(
                    ControlIntent::hold(),
                    Behavior::FollowPath(FollowPath::starting_at(lane)),
                ),
                None => self.give_up(state, "lost the lane"),
            },
        }
    }

    /// Picks the fastest allowed adjacent lane of the agent's upcoming waypoint, then settles on
    /// the nearest waypoint of that lane lying ahead of the agent's front.
    fn choose_lane(&self, state: &SensedState, ctx: &BehaviorContext) -> Option<WaypointId> {
        let record = ctx.registry.get(state.agent)?;
        let ty = record.agent_type();
        let (_, forward) = heading_frame(state.heading);
        let front = state.position + forward * (0.5 * record.attributes().length);
        let ahead = |id: WaypointId| {
            ctx.graph
                .position(id)
                .filter(|p| (*p - front).dot(forward) > 0.0)
                .map(|p| (p - front).magnitude())
        };

        // The path is cleared when the behavior takes over, so fall back to the successor
        // of the last reached waypoint that best matches the heading.
        let upcoming = match record.target() {
            Some(target) => target,
            None => {
                let last = record.last_reached()?;
                ctx.graph
                    .allowed_successors(last, ty)
                    .into_iter()
                    .filter_map(|id| Some((id, ctx.graph.position(id)? - state.position)))
                    .min_by(|(_, a), (_, b)| {
                        let a = signed_angle(forward, *a).abs();
                        a.total_cmp(&signed_angle(forward, *b).abs())
                    })?
                    .0
            }
        };
        let lane = ctx
            .graph
            .try_get(upcoming)?
            .other_lanes()
            .iter()
            .filter_map(|id| ctx.graph.try_get(*id))
            .filter(|w| w.allows(ty))
            .max_by(|a, b| a.max_speed().total_cmp(&b.max_speed()))?;

        // Move past lane waypoints the agent has already overtaken
        let mut id = lane.id();
        for _ in 0..MAX_LANE_WALK {
            if ahead(id).is_some() {
                break;
            }
            id = *ctx.graph.allowed_successors(id, ty).first()?;
        }
        let mut dist = ahead(id)?;

        // Then step back while the predecessor is still ahead and closer
        for _ in 0..MAX_LANE_WALK {
            let Some((prev, prev_dist)) = ctx
                .graph
                .try_get(id)?
                .prevs()
                .iter()
                .find_map(|prev| Some((*prev, ahead(*prev)?)))
            else {
                break;
            };
            if prev_dist >= dist {
                break;
            }
            id = prev;
            dist = prev_dist;
        }
        Some(id)
    }

    fn is_aligned(&self, state: &SensedState, ctx: &BehaviorContext) -> bool {
        let Some(target) = self.lane.and_then(|lane| ctx.graph.position(lane)) else {
            return false;
        };
        signed_angle(state.heading, target - state.position).abs() <= self.config.align_angle
    }

    fn transition(&mut self, state: &SensedState, ctx: &BehaviorContext, next: OvertakeState) {
        trace!("{:?} overtake {:?} -> {next:?}", state.agent, self.state);
        self.state = next;
        self.since = ctx.time;
        self.origin = state.position;
    }

    fn give_up(&self, state: &SensedState, reason: &str) -> BehaviorResult {
        trace!("{:?} abandoning overtake: {reason}", state.agent);
        BehaviorResult::replace(ControlIntent::hold(), Behavior::follow_obstacle(0.0))
    }

    /// Turns the wheels towards `direction` while standing still.
    fn turn(&self, steer: f64, direction: f64) -> ControlIntent {
        let goal = direction * self.config.max_steer;
        let step = (goal - steer).clamp(-self.config.steer_step, self.config.steer_step);
        ControlIntent {
            steer: steer + step,
            ..ControlIntent::hold()
        }
        .clamped()
    }

    /// Creeps at manoeuvring speed on full lock.
    fn creep(&self, speed: f64, direction: f64, gear: i8) -> ControlIntent {
        let (throttle, brake) = if speed.abs() < self.config.movement_speed {
            (0.5, 0.0)
        } else {
            (0.0, 0.2)
        };
        ControlIntent {
            steer: direction * self.config.max_steer,
            throttle,
            brake,
            handbrake: 0.0,
            gear,
            target_speed: self.config.movement_speed,
        }
        .clamped()
    }
}
