use super::follow_path::{DriveOptions, PathFollower, Selection};
use super::{Behavior, BehaviorContext, BehaviorResult};
use crate::controller::SensedState;

/// How long the road ahead must stay clear before resuming normal driving.
const RESUME_AFTER: f64 = 2.0; // s

/// Follows the path while keeping a fixed gap behind an obstacle that can't be overtaken.
/// Once the obstacle has been out of sight for a while it hands back to [FollowPath](super::FollowPath).
#[derive(Clone, Debug)]
pub struct FollowObstacle {
    follower: PathFollower,
    selection: Selection,
    /// The gap to keep in m.
    gap: f64,
    /// When the obstacle was last seen, in s.
    last_seen: f64,
}

impl FollowObstacle {
    pub fn new(gap: f64) -> Self {
        Self {
            follower: PathFollower::default(),
            selection: Selection::Random,
            gap: gap.max(0.0),
            last_seen: 0.0,
        }
    }

    pub(crate) fn activate(&mut self, ctx: &BehaviorContext) {
        self.follower.reset();
        self.last_seen = ctx.time;
    }

    pub(crate) fn execute(&mut self, state: &SensedState, ctx: &mut BehaviorContext) -> BehaviorResult {
        if state.obstacle_distance.is_some() {
            self.last_seen = ctx.time;
        }
        let options = DriveOptions {
            follow_gap: self.gap,
            ..Default::default()
        };
        let intent = self.follower.drive(state, ctx, &mut self.selection, options);
        if ctx.time - self.last_seen >= RESUME_AFTER {
            BehaviorResult::replace(intent, Behavior::follow_path())
        } else {
            BehaviorResult::intent(intent)
        }
    }
}
