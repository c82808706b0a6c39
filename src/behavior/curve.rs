use super::follow_path::{DriveOptions, PathFollower, Selection};
use super::BehaviorContext;
use crate::controller::{ControlIntent, SensedState};
use crate::graph::WaypointGraph;
use crate::waypoint::WaypointId;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The smallest speed correction ever applied, so a committed path is never abandoned.
const MIN_CORRECTION: f64 = 0.2;

/// Tuning for [CurveSlowdown].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CurveConfig {
    /// Below this speed no correction is applied, in m/s.
    pub safe_speed: f64,
    /// Turns smaller than this, in radians, are ignored.
    pub min_turn_angle: f64,
    /// Corrections only start once the cumulative turn exceeds this, in radians.
    pub min_total_angle: f64,
    /// The number of upcoming path waypoints inspected.
    pub lookahead: usize,
}

impl Default for CurveConfig {
    fn default() -> Self {
        Self {
            safe_speed: 40.0 / 3.6,
            min_turn_angle: 1f64.to_radians(),
            min_total_angle: 5f64.to_radians(),
            lookahead: 4,
        }
    }
}

impl CurveConfig {
    /// The speed multiplier in [0.2, 1] for an agent at `speed` (of at most `max_speed`)
    /// about to follow `path`.
    pub fn speed_correction(&self, graph: &WaypointGraph, path: &[WaypointId], speed: f64, max_speed: f64) -> f64 {
        if speed < self.safe_speed || max_speed <= 0.0 {
            return 1.0;
        }
        let window = &path[..usize::min(path.len(), self.lookahead)];
        let total: f64 = graph
            .turn_angles(window)
            .filter(|angle| *angle > self.min_turn_angle)
            .sum();
        if total < self.min_total_angle {
            return 1.0;
        }
        let angle = total.to_degrees().clamp(0.0, 90.0);
        let speed_ratio = (1.2 * speed / max_speed).clamp(0.0, 1.0);
        (1.0 - angle / 90.0 * speed_ratio).clamp(MIN_CORRECTION, 1.0)
    }
}

/// Follows the path like [FollowPath](super::FollowPath), slowing down ahead of curves.
#[derive(Clone, Debug)]
pub struct CurveSlowdown {
    follower: PathFollower,
    selection: Selection,
    config: CurveConfig,
    /// The last correction applied.
    correction: f64,
}

impl CurveSlowdown {
    pub fn new(config: CurveConfig) -> Self {
        Self {
            follower: PathFollower::default(),
            selection: Selection::Random,
            config,
            correction: 1.0,
        }
    }

    /// The speed multiplier applied on the last frame.
    pub fn correction(&self) -> f64 {
        self.correction
    }

    pub(crate) fn execute(&mut self, state: &SensedState, ctx: &mut BehaviorContext) -> ControlIntent {
        self.correction = match ctx.registry.get(state.agent) {
            Some(record) => {
                let path = record.path().iter().copied().collect::<Vec<_>>();
                self.config
                    .speed_correction(ctx.graph, &path, state.speed, record.attributes().max_speed)
            }
            None => 1.0,
        };
        let options = DriveOptions {
            speed_multiplier: self.correction,
            ..Default::default()
        };
        self.follower.drive(state, ctx, &mut self.selection, options)
    }
}

#[cfg(test)]
mod test {
    use super::super::fixture::*;
    use super::*;
    use crate::math::{Point2d, Vector2d};
    use crate::registry::AgentAttributes;
    use crate::waypoint::{AgentType, WaypointAttributes};
    use assert_approx_eq::assert_approx_eq;

    /// East along the x axis, then a right angle north at waypoint 2.
    fn bend() -> Vec<WaypointAttributes> {
        vec![
            WaypointAttributes::new(0, Point2d::new(0.0, 0.0), &[1]),
            WaypointAttributes::new(1, Point2d::new(10.0, 0.0), &[2]),
            WaypointAttributes::new(2, Point2d::new(20.0, 0.0), &[3]),
            WaypointAttributes::new(3, Point2d::new(20.0, 10.0), &[4]),
            WaypointAttributes::new(4, Point2d::new(20.0, 20.0), &[]),
        ]
    }

    fn ids(ids: &[u32]) -> Vec<WaypointId> {
        ids.iter().map(|i| WaypointId(*i)).collect()
    }

    #[test]
    fn straight_path_is_uncorrected() {
        let graph = WaypointGraph::new(&bend()).unwrap();
        let config = CurveConfig::default();
        assert_approx_eq!(config.speed_correction(&graph, &ids(&[0, 1, 2]), 20.0, 25.0), 1.0);
    }

    #[test]
    fn slow_agents_are_uncorrected() {
        let graph = WaypointGraph::new(&bend()).unwrap();
        let config = CurveConfig::default();
        assert_approx_eq!(config.speed_correction(&graph, &ids(&[1, 2, 3]), 10.0, 25.0), 1.0);
    }

    #[test]
    fn right_angle_at_speed_is_clamped() {
        let graph = WaypointGraph::new(&bend()).unwrap();
        let config = CurveConfig::default();
        // 90 degrees at full speed ratio would stop the agent
        assert_approx_eq!(config.speed_correction(&graph, &ids(&[1, 2, 3]), 25.0, 25.0), 0.2);
        // Half the speed ratio: 1 - 0.6
        assert_approx_eq!(config.speed_correction(&graph, &ids(&[1, 2, 3]), 12.5, 25.0), 0.4);
    }

    #[test]
    fn behavior_records_correction() {
        let mut fixture = Fixture::new(&bend());
        let agent = fixture.spawn(AgentAttributes::car(AgentType(0)), 1, Point2d::new(0.0, 0.0));
        let mut behavior = CurveSlowdown::new(CurveConfig::default());
        let state = sensed(agent, Point2d::new(0.0, 0.0), Vector2d::new(1.0, 0.0), 20.0);
        // The first frame only commits the path ahead
        behavior.execute(&state, &mut fixture.ctx());
        assert_approx_eq!(behavior.correction(), 1.0);
        behavior.execute(&state, &mut fixture.ctx());
        assert!(behavior.correction() < 1.0);
        assert!(behavior.correction() >= 0.2);
    }
}
