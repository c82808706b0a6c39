use crate::error::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The timing plan of a signal-controlled intersection.
///
/// Phases run in order and repeat. Each phase shows green to its approaches for `green_time`,
/// then amber for `amber_time`, then red to every approach for `all_red_time`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SignalTiming {
    pub phases: Vec<SignalPhase>,
    /// Amber duration in s; zero skips amber.
    #[cfg_attr(feature = "serde", serde(default))]
    pub amber_time: f64,
    /// All-red duration in s, during which pedestrian crossings may open.
    pub all_red_time: f64,
}

/// One phase of a [SignalTiming].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SignalPhase {
    /// Approaches which receive a protected green.
    pub open: Vec<usize>,
    /// Approaches which may proceed when no conflicting approach is occupied.
    #[cfg_attr(feature = "serde", serde(default))]
    pub yielding: Vec<usize>,
    /// Green duration in s.
    pub green_time: f64,
}

impl SignalPhase {
    /// A phase giving a protected green to `open` approaches.
    pub fn new(open: &[usize], green_time: f64) -> Self {
        Self {
            open: open.to_vec(),
            yielding: vec![],
            green_time,
        }
    }
}

impl SignalTiming {
    /// The duration of one full cycle in s, excluding any all-red extensions.
    pub fn cycle_time(&self) -> f64 {
        self.phases
            .iter()
            .map(|p| p.green_time + self.amber_time + self.all_red_time)
            .sum()
    }

    pub(crate) fn validate(&self, num_approaches: usize) -> Result<()> {
        if self.phases.is_empty() {
            return Err(Error::Configuration("signal has no phases".into()));
        }
        if !(self.amber_time >= 0.0 && self.all_red_time >= 0.0) {
            return Err(Error::Configuration("negative signal clearance time".into()));
        }
        for phase in &self.phases {
            if !(phase.green_time > 0.0) {
                return Err(Error::Configuration(format!(
                    "green time must be positive, got {}",
                    phase.green_time
                )));
            }
            if let Some(idx) = phase.open.iter().chain(&phase.yielding).find(|a| **a >= num_approaches) {
                return Err(Error::Configuration(format!("signal phase references approach {idx}")));
            }
        }
        Ok(())
    }
}

/// The state of a traffic light.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum LightState {
    Red,
    Amber,
    Green,
}

/// The part of a phase the signal is currently showing.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum Stage {
    Green,
    Amber,
    AllRed,
}

/// Runs a [SignalTiming].
#[derive(Clone, Debug)]
pub(crate) struct SignalController {
    timing: SignalTiming,
    /// The current phase index.
    phase: usize,
    /// The current stage of the phase.
    stage: Stage,
    /// The time since the current stage was entered, in s.
    since: f64,
}

impl SignalController {
    pub fn new(timing: SignalTiming) -> Self {
        Self {
            timing,
            phase: 0,
            stage: Stage::Green,
            since: 0.0,
        }
    }

    pub fn timing(&self) -> &SignalTiming {
        &self.timing
    }

    pub fn phase(&self) -> usize {
        self.phase
    }

    /// Advances the signal timing by `dt` seconds.
    /// The all-red stage is held for as long as `crossings_clear` is false.
    pub fn step(&mut self, dt: f64, crossings_clear: bool) {
        self.since += dt;
        loop {
            let duration = self.stage_duration();
            if self.since < duration {
                break;
            }
            let next = match self.stage {
                Stage::Green if self.timing.amber_time > 0.0 => Stage::Amber,
                Stage::Green | Stage::Amber => Stage::AllRed,
                Stage::AllRed if crossings_clear => Stage::Green,
                Stage::AllRed => {
                    // Hold until the crossings empty; don't bank the extra time
                    self.since = duration;
                    break;
                }
            };
            if next == Stage::Green {
                self.phase = (self.phase + 1) % self.timing.phases.len();
            }
            self.stage = next;
            self.since -= duration;
        }
    }

    /// The light shown to an approach.
    pub fn light(&self, approach: usize) -> LightState {
        let phase = &self.timing.phases[self.phase];
        let in_phase = phase.open.contains(&approach) || phase.yielding.contains(&approach);
        match (in_phase, self.stage) {
            (true, Stage::Green) => LightState::Green,
            (true, Stage::Amber) => LightState::Amber,
            _ => LightState::Red,
        }
    }

    /// Whether the approach only has a permissive green in the current phase.
    pub fn is_yielding(&self, approach: usize) -> bool {
        self.timing.phases[self.phase].yielding.contains(&approach)
    }

    /// Whether every light is red.
    pub fn is_all_red(&self) -> bool {
        self.stage == Stage::AllRed
    }

    fn stage_duration(&self) -> f64 {
        match self.stage {
            Stage::Green => self.timing.phases[self.phase].green_time,
            Stage::Amber => self.timing.amber_time,
            Stage::AllRed => self.timing.all_red_time,
        }
    }
}
