//! Recovery sweeper: detects running phases whose process died without
//! reporting, or that overran their wall-clock ceiling.
//!
//! The sweeper never mutates the store itself. It produces completion
//! signals that are fed through the same consumer as agent callbacks, so
//! there is exactly one code path that drives phases to terminal states.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::errors::StoreError;
use crate::exec::AgentLauncher;
use crate::store::{DbHandle, PhaseStatus};

use super::{CompletionSignal, Outcome, SignalOrigin};

pub struct Sweeper {
    db: DbHandle,
    launcher: Arc<dyn AgentLauncher>,
    timeout: Duration,
}

impl Sweeper {
    pub fn new(db: DbHandle, launcher: Arc<dyn AgentLauncher>, timeout: Duration) -> Self {
        Self {
            db,
            launcher,
            timeout,
        }
    }

    /// Scan running phases and report losses and timeouts. A phase is
    /// reported at most once per sweep even if it is both dead and stale.
    pub async fn sweep(&self) -> Result<Vec<CompletionSignal>, StoreError> {
        let mut signals = Vec::new();
        let mut reported = HashSet::new();

        let running = self
            .db
            .call(|store| store.list_phases_with_status(PhaseStatus::Running))
            .await?;

        for phase in &running {
            let lost = match phase.pid {
                Some(pid) => !self.launcher.is_alive(phase.id, pid).await,
                // A running phase without a pid is unrecoverable bookkeeping
                // damage; treat it as lost.
                None => true,
            };
            if lost {
                warn!(phase_id = phase.id, pid = ?phase.pid, "process lost");
                reported.insert(phase.id);
                signals.push(CompletionSignal {
                    phase_id: phase.id,
                    outcome: Outcome::Failure,
                    detail: Some("process lost".to_string()),
                    origin: SignalOrigin::Sweeper,
                });
            }
        }

        let timeout = self.timeout;
        let stale = self
            .db
            .call(move |store| store.find_stale_running(timeout))
            .await?;

        for phase in &stale {
            if reported.contains(&phase.id) {
                continue;
            }
            warn!(phase_id = phase.id, timeout_secs = self.timeout.as_secs(), "phase timed out");
            signals.push(CompletionSignal {
                phase_id: phase.id,
                outcome: Outcome::Failure,
                detail: Some(format!("timed out after {}s", self.timeout.as_secs())),
                origin: SignalOrigin::Sweeper,
            });
        }

        Ok(signals)
    }
}
