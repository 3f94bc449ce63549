//! The phase coordination engine.
//!
//! A single task owns every state transition: submissions, completion
//! callbacks, sweeper findings, cancellations, and retries all funnel into
//! one event channel consumed between ticks, so store mutations are never
//! concurrent even while many agent processes run in parallel.
//!
//! - `resolver` — pure readiness and run-outcome computation
//! - `admission` — the concurrency ceiling
//! - `sweeper` — liveness and timeout detection for running phases
//! - `engine` — the coordinator loop composing the above

mod admission;
mod engine;
mod resolver;
mod sweeper;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};

pub use admission::AdmissionController;
pub use engine::Coordinator;
pub use resolver::{resolve_ready, run_outcome};
pub use sweeper::Sweeper;

/// Terminal outcome reported for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// Which producer observed the outcome. Sweeper findings may auto-requeue;
/// agent-reported failures wait for an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOrigin {
    Callback,
    Sweeper,
}

/// An asynchronous report that a phase reached a terminal outcome.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    pub phase_id: i64,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub origin: SignalOrigin,
}

/// Control and completion events consumed by the coordinator task.
#[derive(Debug)]
pub enum EngineEvent {
    Completion(CompletionSignal),
    CancelRun { run_id: i64 },
    RetryPhase { phase_id: i64 },
}

/// Cloneable handle for feeding events into the coordinator and waking it
/// ahead of its next timer tick.
#[derive(Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<EngineEvent>,
    wake: Arc<Notify>,
}

impl EngineHandle {
    pub(crate) fn new(events: mpsc::Sender<EngineEvent>, wake: Arc<Notify>) -> Self {
        Self { events, wake }
    }

    /// Enqueue an event and wake the coordinator. Returns false if the
    /// engine has shut down.
    pub async fn send(&self, event: EngineEvent) -> bool {
        let ok = self.events.send(event).await.is_ok();
        if ok {
            self.wake.notify_one();
        }
        ok
    }

    /// Wake the coordinator without an event (e.g. after a submission).
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}
