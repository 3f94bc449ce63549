use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, params};

use crate::errors::StoreError;

use super::models::*;

/// Async-safe handle to the phase store.
///
/// Wraps `PhaseStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PhaseStore>>,
}

impl DbHandle {
    pub fn new(store: PhaseStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&PhaseStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("store lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task panicked: {}", e)))?
    }

}

/// Durable, queryable record of every workflow run and phase.
///
/// All mutations are atomic single-row updates; the dependency graph is
/// read-only once inserted, so no multi-row transactions are needed after
/// submission. Status transitions are guarded in SQL (`WHERE status = ...`)
/// so a late or duplicate update cannot move a record backward.
pub struct PhaseStore {
    conn: Connection,
}

impl PhaseStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS workflow_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_ref TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS phase_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                phase_index INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                depends_on TEXT NOT NULL DEFAULT '[]',
                payload TEXT NOT NULL DEFAULT 'null',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                workdir TEXT,
                port_a INTEGER,
                port_b INTEGER,
                pid INTEGER,
                queued_at TEXT NOT NULL DEFAULT (datetime('now')),
                started_at TEXT,
                finished_at TEXT,
                error TEXT,
                UNIQUE(run_id, name)
            );

            CREATE INDEX IF NOT EXISTS idx_phase_records_status ON phase_records(status);
            CREATE INDEX IF NOT EXISTS idx_phase_records_run ON phase_records(run_id);
            CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status);
            ",
        )?;
        Ok(())
    }

    // ── Submission ────────────────────────────────────────────────────

    /// Insert a workflow run and all of its phases in one transaction.
    ///
    /// Dependencies arrive as sibling names plus pre-existing row ids; both
    /// are resolved to row ids here, after which the edge set is immutable.
    /// The caller has already validated the graph (acyclic, names resolvable,
    /// external ids present) — on any failure the transaction rolls back and
    /// nothing is persisted.
    pub fn insert_run(
        &self,
        issue_ref: &str,
        phases: &[NewPhase],
    ) -> Result<RunDetail, StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO workflow_runs (issue_ref) VALUES (?1)",
            params![issue_ref],
        )?;
        let run_id = tx.last_insert_rowid();

        let mut name_to_id = std::collections::HashMap::new();
        for (index, phase) in phases.iter().enumerate() {
            let payload = serde_json::to_string(&phase.payload)
                .map_err(|e| StoreError::Corrupt(format!("unserializable payload: {}", e)))?;
            tx.execute(
                "INSERT INTO phase_records (run_id, name, phase_index, payload, max_attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, phase.name, index as i64, payload, phase.max_attempts],
            )?;
            name_to_id.insert(phase.name.clone(), tx.last_insert_rowid());
        }

        for phase in phases {
            let mut dep_ids: Vec<i64> = phase.external_deps.clone();
            for dep_name in &phase.depends_on {
                let id = name_to_id.get(dep_name).ok_or_else(|| {
                    StoreError::Corrupt(format!("unresolved dependency '{}'", dep_name))
                })?;
                dep_ids.push(*id);
            }
            let deps_json = serde_json::to_string(&dep_ids)
                .map_err(|e| StoreError::Corrupt(format!("unserializable deps: {}", e)))?;
            let phase_id = name_to_id[&phase.name];
            tx.execute(
                "UPDATE phase_records SET depends_on = ?1 WHERE id = ?2",
                params![deps_json, phase_id],
            )?;
        }

        tx.commit()?;
        self.get_run_detail(run_id)?
            .ok_or(StoreError::RunNotFound { id: run_id })
    }

    /// Check that every given phase row id exists (external dependency
    /// validation at submission time).
    pub fn phases_exist(&self, ids: &[i64]) -> Result<Option<i64>, StoreError> {
        for id in ids {
            let count: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM phase_records WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if count == 0 {
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }

    // ── Run queries ───────────────────────────────────────────────────

    pub fn get_run(&self, id: i64) -> Result<Option<WorkflowRun>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_ref, status, created_at, completed_at
             FROM workflow_runs WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], read_run_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?.into_run()?)),
            None => Ok(None),
        }
    }

    pub fn list_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_ref, status, created_at, completed_at
             FROM workflow_runs ORDER BY id",
        )?;
        let rows = stmt.query_map([], read_run_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }

    pub fn list_active_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_ref, status, created_at, completed_at
             FROM workflow_runs WHERE status = 'active' ORDER BY id",
        )?;
        let rows = stmt.query_map([], read_run_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }

    pub fn get_run_detail(&self, id: i64) -> Result<Option<RunDetail>, StoreError> {
        let run = match self.get_run(id)? {
            Some(r) => r,
            None => return Ok(None),
        };
        let phases = self.list_phases_by_run(id)?;
        Ok(Some(RunDetail { run, phases }))
    }

    pub fn update_run_status(&self, id: i64, status: RunStatus) -> Result<(), StoreError> {
        if status.is_terminal() {
            self.conn.execute(
                "UPDATE workflow_runs SET status = ?1, completed_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        } else {
            // Reactivation (explicit retry of a phase in a finished run).
            self.conn.execute(
                "UPDATE workflow_runs SET status = ?1, completed_at = NULL WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        }
        Ok(())
    }

    // ── Phase queries ─────────────────────────────────────────────────

    pub fn get_phase(&self, id: i64) -> Result<Option<PhaseRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", SELECT_PHASE))?;
        let mut rows = stmt.query_map(params![id], read_phase_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?.into_phase()?)),
            None => Ok(None),
        }
    }

    pub fn list_phases_by_run(&self, run_id: i64) -> Result<Vec<PhaseRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE run_id = ?1 ORDER BY phase_index",
            SELECT_PHASE
        ))?;
        let rows = stmt.query_map(params![run_id], read_phase_row)?;
        collect_phases(rows)
    }

    /// Phases with the given status, in ascending creation (row id) order.
    /// The FIFO admission guarantee rests on this ordering.
    pub fn list_phases_with_status(
        &self,
        status: PhaseStatus,
    ) -> Result<Vec<PhaseRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status = ?1 ORDER BY id",
            SELECT_PHASE
        ))?;
        let rows = stmt.query_map(params![status.as_str()], read_phase_row)?;
        collect_phases(rows)
    }

    /// Ids of every completed phase, across all runs. The dependency resolver
    /// recomputes readiness against this set on every tick.
    pub fn completed_phase_ids(&self) -> Result<std::collections::HashSet<i64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM phase_records WHERE status = 'completed'")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = std::collections::HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    /// Number of phases currently holding an admission slot. The in-memory
    /// semaphore is reconstructed from this on startup, so a coordinator
    /// restart cannot drift the concurrency invariant.
    pub fn count_in_flight(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM phase_records WHERE status IN ('admitted', 'running')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Running phases whose `started_at` is older than the given duration.
    pub fn find_stale_running(
        &self,
        older_than: Duration,
    ) -> Result<Vec<PhaseRecord>, StoreError> {
        let cutoff = format!("-{} seconds", older_than.as_secs());
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status = 'running' AND started_at <= datetime('now', ?1) ORDER BY id",
            SELECT_PHASE
        ))?;
        let rows = stmt.query_map(params![cutoff], read_phase_row)?;
        collect_phases(rows)
    }

    // ── Phase transitions ─────────────────────────────────────────────
    //
    // Each returns whether a row actually changed. The status guard in the
    // WHERE clause enforces the state machine at the storage layer, which
    // makes duplicate or stale updates harmless no-ops.

    pub fn mark_ready(&self, id: i64) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE phase_records SET status = 'ready' WHERE id = ?1 AND status = 'queued'",
            params![id],
        )?;
        Ok(n > 0)
    }

    pub fn mark_admitted(&self, id: i64) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE phase_records SET status = 'admitted' WHERE id = ?1 AND status = 'ready'",
            params![id],
        )?;
        Ok(n > 0)
    }

    pub fn mark_running(
        &self,
        id: i64,
        pid: i64,
        workdir: &str,
        port_a: u16,
        port_b: u16,
    ) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE phase_records
             SET status = 'running', pid = ?2, workdir = ?3, port_a = ?4, port_b = ?5,
                 started_at = datetime('now')
             WHERE id = ?1 AND status = 'admitted'",
            params![id, pid, workdir, port_a, port_b],
        )?;
        Ok(n > 0)
    }

    pub fn mark_completed(&self, id: i64) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE phase_records
             SET status = 'completed', finished_at = datetime('now')
             WHERE id = ?1 AND status = 'running'",
            params![id],
        )?;
        Ok(n > 0)
    }

    pub fn mark_failed(&self, id: i64, error: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE phase_records
             SET status = 'failed', error = ?2, finished_at = datetime('now')
             WHERE id = ?1 AND status IN ('admitted', 'running')",
            params![id, error],
        )?;
        Ok(n > 0)
    }

    pub fn mark_cancelled(&self, id: i64) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE phase_records
             SET status = 'cancelled', finished_at = datetime('now')
             WHERE id = ?1 AND status IN ('queued', 'ready', 'admitted', 'running')",
            params![id],
        )?;
        Ok(n > 0)
    }

    /// Reset a failed phase for another attempt. History is not resurrected:
    /// the record returns to `queued` with a fresh attempt counter and its
    /// leased resources cleared.
    pub fn requeue(&self, id: i64) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE phase_records
             SET status = 'queued', attempt_count = attempt_count + 1,
                 pid = NULL, workdir = NULL, port_a = NULL, port_b = NULL,
                 started_at = NULL, finished_at = NULL, error = NULL,
                 queued_at = datetime('now')
             WHERE id = ?1 AND status = 'failed' AND attempt_count + 1 < max_attempts",
            params![id],
        )?;
        Ok(n > 0)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

const SELECT_PHASE: &str = "SELECT id, run_id, name, phase_index, status, depends_on, payload, \
     attempt_count, max_attempts, workdir, port_a, port_b, pid, \
     queued_at, started_at, finished_at, error FROM phase_records";

/// Intermediate row struct for reading phases from SQLite before converting
/// status / depends_on / payload strings into typed values.
struct PhaseRow {
    id: i64,
    run_id: i64,
    name: String,
    phase_index: i32,
    status: String,
    depends_on: String,
    payload: String,
    attempt_count: u32,
    max_attempts: u32,
    workdir: Option<String>,
    port_a: Option<i64>,
    port_b: Option<i64>,
    pid: Option<i64>,
    queued_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    error: Option<String>,
}

fn read_phase_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhaseRow> {
    Ok(PhaseRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        name: row.get(2)?,
        phase_index: row.get(3)?,
        status: row.get(4)?,
        depends_on: row.get(5)?,
        payload: row.get(6)?,
        attempt_count: row.get(7)?,
        max_attempts: row.get(8)?,
        workdir: row.get(9)?,
        port_a: row.get(10)?,
        port_b: row.get(11)?,
        pid: row.get(12)?,
        queued_at: row.get(13)?,
        started_at: row.get(14)?,
        finished_at: row.get(15)?,
        error: row.get(16)?,
    })
}

impl PhaseRow {
    fn into_phase(self) -> Result<PhaseRecord, StoreError> {
        let status = PhaseStatus::from_str(&self.status)
            .map_err(|e| StoreError::Corrupt(format!("phase {}: {}", self.id, e)))?;
        let depends_on: Vec<i64> = serde_json::from_str(&self.depends_on).map_err(|e| {
            StoreError::Corrupt(format!(
                "phase {}: bad depends_on JSON '{}': {}",
                self.id, self.depends_on, e
            ))
        })?;
        let payload: serde_json::Value = serde_json::from_str(&self.payload).map_err(|e| {
            StoreError::Corrupt(format!("phase {}: bad payload JSON: {}", self.id, e))
        })?;
        Ok(PhaseRecord {
            id: self.id,
            run_id: self.run_id,
            name: self.name,
            phase_index: self.phase_index,
            status,
            depends_on,
            payload,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            workdir: self.workdir,
            port_a: self.port_a.map(|p| p as u16),
            port_b: self.port_b.map(|p| p as u16),
            pid: self.pid,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error,
        })
    }
}

struct RunRow {
    id: i64,
    issue_ref: String,
    status: String,
    created_at: String,
    completed_at: Option<String>,
}

fn read_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        issue_ref: row.get(1)?,
        status: row.get(2)?,
        created_at: row.get(3)?,
        completed_at: row.get(4)?,
    })
}

impl RunRow {
    fn into_run(self) -> Result<WorkflowRun, StoreError> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| StoreError::Corrupt(format!("run {}: {}", self.id, e)))?;
        Ok(WorkflowRun {
            id: self.id,
            issue_ref: self.issue_ref,
            status,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

fn collect_phases<'a>(
    rows: impl Iterator<Item = rusqlite::Result<PhaseRow>> + 'a,
) -> Result<Vec<PhaseRecord>, StoreError> {
    let mut phases = Vec::new();
    for row in rows {
        phases.push(row?.into_phase()?);
    }
    Ok(phases)
}

// ── Tests ─────────────────────────────────────────────────────────────
