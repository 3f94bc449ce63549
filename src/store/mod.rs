//! Durable phase store: the single shared mutable resource of the engine.
//!
//! `models` defines the persisted records and their state machines; `db` is
//! the SQLite access layer behind an async-safe handle.

mod db;
mod models;

pub use db::{DbHandle, PhaseStore};
pub use models::{
    NewPhase, PhaseRecord, PhaseStatus, RunDetail, RunStatus, WorkflowRun, is_valid_transition,
};
