//! Dependency resolution and run-outcome reasoning.
//!
//! Both functions are stateless: they are recomputed from current store
//! contents on every tick instead of maintained incrementally, so there is
//! no index that can drift from the source of truth.

use std::collections::{HashMap, HashSet};

use crate::store::{PhaseRecord, PhaseStatus, RunStatus};

/// Phases to promote from `queued` to `ready`: those whose every dependency
/// is completed. Input order is preserved, so passing phases in ascending
/// creation order keeps the FIFO admission guarantee.
pub fn resolve_ready(queued: &[PhaseRecord], completed: &HashSet<i64>) -> Vec<i64> {
    queued
        .iter()
        .filter(|phase| phase.depends_on.iter().all(|dep| completed.contains(dep)))
        .map(|phase| phase.id)
        .collect()
}

/// Classification of a queued phase while deciding whether a run is done.
#[derive(Clone, Copy, PartialEq)]
enum QueuedFate {
    Unknown,
    /// A transitive dependency failed or was cancelled; this phase can
    /// never become ready.
    Blocked,
    /// Every dependency is completed or can still complete.
    Progressable,
}

/// Decide whether a run has finished, and with what overall status.
///
/// `dep_status` must cover every dependency id referenced by `phases`,
/// including external dependencies living in other runs.
///
/// Returns `None` while any phase is active (`ready`/`admitted`/`running`)
/// or any queued phase could still become ready. A queued phase is
/// permanently blocked when a transitive dependency is `failed` or
/// `cancelled`; a run where only blocked phases remain is finished. A
/// `failed` phase counts as terminal here — an explicit retry re-queues it
/// and reactivates the run.
pub fn run_outcome(
    phases: &[PhaseRecord],
    dep_status: &HashMap<i64, PhaseStatus>,
) -> Option<RunStatus> {
    if phases
        .iter()
        .any(|p| matches!(p.status, PhaseStatus::Ready | PhaseStatus::Admitted | PhaseStatus::Running))
    {
        return None;
    }

    let queued: Vec<&PhaseRecord> = phases
        .iter()
        .filter(|p| p.status == PhaseStatus::Queued)
        .collect();

    let mut fate: HashMap<i64, QueuedFate> =
        queued.iter().map(|p| (p.id, QueuedFate::Unknown)).collect();

    // Fixpoint over the (acyclic) queued subgraph.
    loop {
        let mut changed = false;
        for phase in &queued {
            if fate[&phase.id] != QueuedFate::Unknown {
                continue;
            }
            let mut blocked = false;
            let mut pending = false;
            for dep in &phase.depends_on {
                match fate.get(dep) {
                    Some(QueuedFate::Blocked) => blocked = true,
                    Some(QueuedFate::Progressable) => {}
                    Some(QueuedFate::Unknown) => pending = true,
                    None => match dep_status.get(dep) {
                        Some(PhaseStatus::Completed) => {}
                        Some(PhaseStatus::Failed) | Some(PhaseStatus::Cancelled) | None => {
                            blocked = true
                        }
                        // Still moving somewhere else (possibly another run).
                        Some(_) => {}
                    },
                }
                if blocked {
                    break;
                }
            }
            if blocked {
                fate.insert(phase.id, QueuedFate::Blocked);
                changed = true;
            } else if !pending {
                fate.insert(phase.id, QueuedFate::Progressable);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    if fate.values().any(|f| *f == QueuedFate::Progressable) {
        return None;
    }

    // Nothing can move anymore: every phase is terminal or blocked.
    let any_failed = phases.iter().any(|p| p.status == PhaseStatus::Failed);
    let any_blocked = !fate.is_empty();
    let any_cancelled = phases.iter().any(|p| p.status == PhaseStatus::Cancelled);

    Some(if any_failed || any_blocked {
        RunStatus::Failed
    } else if any_cancelled {
        RunStatus::Cancelled
    } else {
        RunStatus::Completed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(id: i64, status: PhaseStatus, deps: Vec<i64>) -> PhaseRecord {
        PhaseRecord {
            id,
            run_id: 1,
            name: format!("phase-{}", id),
            phase_index: id as i32,
            status,
            depends_on: deps,
            payload: serde_json::Value::Null,
            attempt_count: 0,
            max_attempts: 3,
            workdir: None,
            port_a: None,
            port_b: None,
            pid: None,
            queued_at: "2026-01-01 00:00:00".to_string(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    fn status_map(phases: &[PhaseRecord]) -> HashMap<i64, PhaseStatus> {
        phases.iter().map(|p| (p.id, p.status)).collect()
    }

    #[test]
    fn test_resolve_ready_requires_all_deps_completed() {
        let queued = vec![
            phase(1, PhaseStatus::Queued, vec![]),
            phase(2, PhaseStatus::Queued, vec![1]),
            phase(3, PhaseStatus::Queued, vec![1, 2]),
        ];

        let none: HashSet<i64> = HashSet::new();
        assert_eq!(resolve_ready(&queued, &none), vec![1]);

        let one: HashSet<i64> = [1].into();
        assert_eq!(resolve_ready(&queued, &one), vec![1, 2]);

        let both: HashSet<i64> = [1, 2].into();
        assert_eq!(resolve_ready(&queued, &both), vec![1, 2, 3]);
    }

    #[test]
    fn test_resolve_ready_preserves_fifo_order() {
        let queued = vec![
            phase(5, PhaseStatus::Queued, vec![]),
            phase(9, PhaseStatus::Queued, vec![]),
            phase(12, PhaseStatus::Queued, vec![]),
        ];
        assert_eq!(resolve_ready(&queued, &HashSet::new()), vec![5, 9, 12]);
    }

    #[test]
    fn test_run_outcome_active_while_anything_runs() {
        let phases = vec![
            phase(1, PhaseStatus::Running, vec![]),
            phase(2, PhaseStatus::Queued, vec![1]),
        ];
        assert_eq!(run_outcome(&phases, &status_map(&phases)), None);
    }

    #[test]
    fn test_run_outcome_active_while_queued_can_progress() {
        // Phase 2 waits on a completed dep; nothing is running yet, but it
        // will be promoted on the next tick.
        let phases = vec![
            phase(1, PhaseStatus::Completed, vec![]),
            phase(2, PhaseStatus::Queued, vec![1]),
        ];
        assert_eq!(run_outcome(&phases, &status_map(&phases)), None);
    }

    #[test]
    fn test_run_outcome_all_completed() {
        let phases = vec![
            phase(1, PhaseStatus::Completed, vec![]),
            phase(2, PhaseStatus::Completed, vec![1]),
        ];
        assert_eq!(
            run_outcome(&phases, &status_map(&phases)),
            Some(RunStatus::Completed)
        );
    }

    #[test]
    fn test_run_outcome_failed_blocks_transitive_dependents() {
        // 1 failed; 2 depends on 1; 3 depends on 2. Both dependents are
        // permanently blocked, so the run is finished and failed.
        let phases = vec![
            phase(1, PhaseStatus::Failed, vec![]),
            phase(2, PhaseStatus::Queued, vec![1]),
            phase(3, PhaseStatus::Queued, vec![2]),
        ];
        assert_eq!(
            run_outcome(&phases, &status_map(&phases)),
            Some(RunStatus::Failed)
        );
    }

    #[test]
    fn test_run_outcome_independent_branch_keeps_run_active() {
        // 1 failed, but 3 is an independent branch still queued with a
        // satisfiable dependency.
        let phases = vec![
            phase(1, PhaseStatus::Failed, vec![]),
            phase(2, PhaseStatus::Queued, vec![1]),
            phase(3, PhaseStatus::Queued, vec![4]),
        ];
        let mut statuses = status_map(&phases);
        statuses.insert(4, PhaseStatus::Completed);
        assert_eq!(run_outcome(&phases, &statuses), None);
    }

    #[test]
    fn test_run_outcome_external_dep_still_running_elsewhere() {
        let phases = vec![phase(1, PhaseStatus::Queued, vec![50])];
        let mut statuses = status_map(&phases);
        statuses.insert(50, PhaseStatus::Running);
        assert_eq!(run_outcome(&phases, &statuses), None);
    }

    #[test]
    fn test_run_outcome_external_dep_failed() {
        let phases = vec![phase(1, PhaseStatus::Queued, vec![50])];
        let mut statuses = status_map(&phases);
        statuses.insert(50, PhaseStatus::Failed);
        assert_eq!(run_outcome(&phases, &statuses), Some(RunStatus::Failed));
    }

    #[test]
    fn test_run_outcome_cancelled() {
        let phases = vec![
            phase(1, PhaseStatus::Completed, vec![]),
            phase(2, PhaseStatus::Cancelled, vec![1]),
        ];
        assert_eq!(
            run_outcome(&phases, &status_map(&phases)),
            Some(RunStatus::Cancelled)
        );
    }

    #[test]
    fn test_run_outcome_unknown_dep_counts_as_blocked() {
        let phases = vec![phase(1, PhaseStatus::Queued, vec![50])];
        // 50 absent from the map entirely.
        assert_eq!(
            run_outcome(&phases, &status_map(&phases)),
            Some(RunStatus::Failed)
        );
    }
}
