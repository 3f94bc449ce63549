//! Admission control: the global concurrency ceiling.
//!
//! Capacity is not an independently maintained counter. The number of
//! occupied slots is recomputed from durable state (rows in
//! `{admitted, running}`) at the start of every admission pass, which makes
//! the invariant survive coordinator crashes without reconciliation.

use crate::store::PhaseRecord;

/// Decides how many ready phases may be admitted right now.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionController {
    ceiling: usize,
}

impl AdmissionController {
    pub fn new(ceiling: usize) -> Self {
        Self { ceiling }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Free slots given the current number of in-flight phases.
    pub fn capacity(&self, in_flight: usize) -> usize {
        self.ceiling.saturating_sub(in_flight)
    }

    /// The FIFO prefix of the ready set that fits in the free capacity.
    /// `ready` must already be in ascending creation order.
    pub fn admit<'a>(&self, in_flight: usize, ready: &'a [PhaseRecord]) -> &'a [PhaseRecord] {
        let grant = self.capacity(in_flight).min(ready.len());
        &ready[..grant]
    }
}
