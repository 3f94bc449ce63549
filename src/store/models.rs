use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single schedulable phase.
///
/// Transitions only move forward (see `is_valid_transition`); a retry does not
/// resurrect history, it re-queues the record with `attempt_count + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Queued,
    Ready,
    Admitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Admitted => "admitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further transitions (failed may be re-queued
    /// by an explicit retry while attempts remain).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States that hold an admission slot (and, once running, an execution
    /// context). The concurrency ceiling bounds the number of these.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Admitted | Self::Running)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "ready" => Ok(Self::Ready),
            "admitted" => Ok(Self::Admitted),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// Validate that a phase status transition is allowed by the state machine.
pub fn is_valid_transition(from: &PhaseStatus, to: &PhaseStatus) -> bool {
    use PhaseStatus::*;
    matches!(
        (from, to),
        (Queued, Ready)
            | (Ready, Admitted)
            | (Admitted, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Admitted, Failed)
            | (Queued, Cancelled)
            | (Ready, Cancelled)
            | (Admitted, Cancelled)
            | (Running, Cancelled)
            | (Failed, Queued)
    )
}

/// Overall status of a workflow run, derived from its phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// One top-level unit of submitted work. Owns a set of phase records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub issue_ref: String,
    pub status: RunStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// One schedulable unit of execution within a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    /// Position within the run's submission order, for progress reporting.
    pub phase_index: i32,
    pub status: PhaseStatus,
    /// Row ids of phases that must reach `completed` before this one is ready.
    pub depends_on: Vec<i64>,
    /// Opaque versioned blob handed to the execution agent unmodified.
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub workdir: Option<String>,
    pub port_a: Option<u16>,
    pub port_b: Option<u16>,
    pub pid: Option<i64>,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

impl PhaseRecord {
    /// Whether another execution is still permitted. `attempt_count` counts
    /// completed retries, so a phase has run `attempt_count + 1` times;
    /// `max_attempts` bounds total executions.
    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count + 1 < self.max_attempts
    }
}

/// Insert-time description of a phase, before row ids exist. Dependencies are
/// expressed as names of sibling phases in the same submission plus optional
/// row ids of already-persisted phases from earlier runs.
#[derive(Debug, Clone)]
pub struct NewPhase {
    pub name: String,
    pub depends_on: Vec<String>,
    pub external_deps: Vec<i64>,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

/// A run together with all of its phases, used for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: WorkflowRun,
    pub phases: Vec<PhaseRecord>,
}
