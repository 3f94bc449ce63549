//! Typed error hierarchy for the coordination engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — phase store I/O failures
//! - `ExecError` — execution context provisioning and agent launch failures
//! - `SubmitError` — submission-time dependency graph validation failures

use thiserror::Error;

/// Errors from the phase store.
///
/// `Unavailable` is transient by contract: the coordinator retries on the
/// next tick and never converts it into a phase failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Workflow run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Phase {id} not found")]
    PhaseNotFound { id: i64 },

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Errors from the execution-context provisioner and agent launcher.
/// Either one fails the affected phase immediately; any partially allocated
/// context is released before the error propagates.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Provisioning failed for phase {phase_id}: {message}")]
    ProvisioningFailed { phase_id: i64, message: String },

    #[error("Launch failed for phase {phase_id}: {message}")]
    LaunchFailed { phase_id: i64, message: String },

    #[error("Context for phase {phase_id} is already leased")]
    AlreadyLeased { phase_id: i64 },
}

/// Submission-time validation failures. The whole submission is rejected
/// wholesale; nothing is persisted.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Duplicate phase name: {0}")]
    DuplicateName(String),

    #[error("Phase '{phase}' depends on unknown phase '{dependency}'")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Cycle detected in phase dependencies. Involved phases: {phases:?}")]
    CycleDetected { phases: Vec<String> },

    #[error("External dependency {0} does not exist")]
    UnknownExternalDependency(i64),

    #[error("Submission contains no phases")]
    Empty,
}
