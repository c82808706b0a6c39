use crate::controller::ControlIntent;
use crate::registry::AgentAttributes;

/// The minimum gap to keep to an obstacle ahead in m.
const MIN_GAP: f64 = 2.0; // m

/// The hardest braking any agent applies, in m/s^2.
const MAX_DECEL: f64 = 6.0; // m/s^2

/// The desired time gap to the obstacle ahead.
const TIME_HEADWAY: f64 = 1.5; // s

/// Accumulates longitudinal constraints for one frame and turns the
/// most restrictive into throttle and brake inputs.
///
/// Each `apply_*` call can only lower the acceleration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Longitudinal {
    max_acc: f64,
    comf_dec: f64,
    acc: f64,
    /// The lowest speed limit applied this frame.
    target_speed: f64,
}

impl Longitudinal {
    pub fn new(attributes: &AgentAttributes) -> Self {
        Self {
            max_acc: attributes.max_acc,
            comf_dec: attributes.comf_dec,
            acc: attributes.max_acc,
            target_speed: attributes.max_speed,
        }
    }

    /// The acceleration requested so far, in m/s^2.
    pub fn acc(&self) -> f64 {
        f64::max(self.acc, -MAX_DECEL)
    }

    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    /// Applies the speed limit at the agent's current position.
    pub fn apply_current_speed_limit(&mut self, vel: f64, speed_limit: f64) {
        self.target_speed = f64::min(self.target_speed, speed_limit);
        if speed_limit <= 0.0 {
            self.acc = -MAX_DECEL;
            return;
        }
        let this_acc = self.max_acc * (1. - (vel / speed_limit).powi(4));
        self.acc = f64::min(self.acc, this_acc);
    }

    /// Applies a speed limit which takes effect `distance` m ahead,
    /// decelerating comfortably if required.
    pub fn apply_speed_limit(&mut self, vel: f64, speed_limit: f64, distance: f64) {
        if distance <= 0.0 {
            return self.apply_current_speed_limit(vel, speed_limit);
        }
        let this_acc = (speed_limit.powi(2) - vel.powi(2)) / (2. * distance);
        if this_acc <= -self.comf_dec {
            let this_acc = f64::max(-2.0 * self.comf_dec, this_acc);
            self.acc = f64::min(self.acc, this_acc);
        }
    }

    /// Stops before a line `net_dist` m ahead.
    pub fn stop_at_line(&mut self, net_dist: f64, vel: f64) {
        self.target_speed = 0.0;
        let acc = self.idm(net_dist + MIN_GAP, vel, 0.0);
        self.acc = f64::min(self.acc, acc);
    }

    /// Follows an obstacle `net_dist` m ahead which moves at `their_vel`.
    pub fn follow(&mut self, net_dist: f64, vel: f64, their_vel: f64) {
        let acc = self.idm(net_dist, vel, their_vel);
        self.acc = f64::min(self.acc, acc);
    }

    /// The comfortable braking distance from `vel`, in m.
    pub fn stopping_distance(&self, vel: f64) -> f64 {
        let min_dist = 2.5; // m
        let t = vel / self.comf_dec;
        0.5 * vel * t + min_dist
    }

    /// Converts the accumulated acceleration into a control intent.
    pub fn intent(&self, steer: f64) -> ControlIntent {
        let acc = self.acc();
        let (throttle, brake) = if acc >= 0.0 {
            (acc / self.max_acc, 0.0)
        } else {
            (0.0, -acc / MAX_DECEL)
        };
        ControlIntent {
            steer,
            throttle,
            brake,
            handbrake: 0.0,
            gear: 1,
            target_speed: self.target_speed,
        }
        .clamped()
    }

    /// The intelligent driver model.
    fn idm(&self, net_dist: f64, vel: f64, their_vel: f64) -> f64 {
        if net_dist <= MIN_GAP {
            -MAX_DECEL
        } else {
            let appr = vel - their_vel;
            let factor = 1. / (2. * (self.max_acc * self.comf_dec).sqrt());
            let ss = MIN_GAP + (vel * TIME_HEADWAY) + (vel * appr * factor);
            let term = ss / net_dist;
            self.max_acc * (1. - (term * term))
        }
    }
}
