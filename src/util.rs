//! Small helpers shared across modules.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed range `[min, max]` along one world axis.
#[derive(Copy, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Interval<T> {
    pub min: T,
    pub max: T,
}

impl<T> Interval<T> {
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: PartialOrd> Interval<T> {
    /// Whether `value` lies in the range, end points included.
    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }
}

impl<T: std::ops::Sub<Output = T> + Copy> Interval<T> {
    pub fn length(&self) -> T {
        self.max - self.min
    }
}

impl Interval<f64> {
    /// The index of the `step` wide bucket containing `value`, counting from `min`.
    /// Values outside the range land in the first or last of `count` buckets.
    pub fn bucket(&self, value: f64, step: f64, count: usize) -> usize {
        let idx = ((value - self.min) / step).floor();
        if idx.is_nan() || idx < 0.0 {
            0
        } else {
            usize::min(idx as usize, count.saturating_sub(1))
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Interval<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}]", self.min, self.max)
    }
}

/// Iterates over `0..count`, starting at `start` and wrapping around.
pub fn rotated_range(count: usize, start: usize) -> impl Iterator<Item = usize> {
    (start..count).chain(0..start.min(count))
}
