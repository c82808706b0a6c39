/// A request to proceed lapses if it isn't repeated within this interval.
const REQUEST_EXPIRY: f64 = 0.5; // s

/// Bookkeeping for right-of-way between approaches: who is waiting, and
/// whose turn it is at a zipper merge.
#[derive(Clone, Debug)]
pub(crate) struct PriorityRules {
    /// The time each approach last asked to proceed.
    waiting: Vec<Option<f64>>,
    /// The zipper approach which was granted most recently.
    last_zipper: Option<usize>,
}

impl PriorityRules {
    pub fn new(num_approaches: usize) -> Self {
        Self {
            waiting: vec![None; num_approaches],
            last_zipper: None,
        }
    }

    /// Records that a vehicle on `approach` wants to proceed.
    pub fn request(&mut self, approach: usize, now: f64) {
        self.waiting[approach] = Some(now);
    }

    /// Whether a vehicle on `approach` has asked to proceed recently.
    pub fn is_waiting(&self, approach: usize, now: f64) -> bool {
        matches!(self.waiting[approach], Some(t) if now - t <= REQUEST_EXPIRY)
    }

    /// Whether it's `approach`'s turn at a zipper merge with the `others`.
    /// An approach may not go twice in a row while a competing approach waits.
    pub fn is_zipper_turn(&self, approach: usize, mut others: impl Iterator<Item = usize>, now: f64) -> bool {
        if self.last_zipper != Some(approach) {
            return true;
        }
        !others.any(|other| other != approach && self.is_waiting(other, now))
    }

    /// Records that `approach` was granted entry.
    pub fn granted(&mut self, approach: usize, zipper: bool) {
        self.waiting[approach] = None;
        if zipper {
            self.last_zipper = Some(approach);
        }
    }

    /// Forgets requests which have lapsed.
    pub fn expire(&mut self, now: f64) {
        for slot in &mut self.waiting {
            if matches!(slot, Some(t) if now - *t > REQUEST_EXPIRY) {
                *slot = None;
            }
        }
    }
}
