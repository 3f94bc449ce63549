//! Execution context leasing: isolated working directory plus a reserved
//! port pair, exclusively owned by one phase from admission until its
//! terminal state.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::ExecError;

/// A leased execution context for one phase.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub phase_id: i64,
    pub workdir: PathBuf,
    pub port_a: u16,
    pub port_b: u16,
}

/// Provisioning collaborator contract. Must never double-allocate a
/// directory or port pair; releasing is infallible by policy (failures are
/// logged, not propagated).
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, phase_id: i64) -> Result<ExecutionContext, ExecError>;
    async fn release(&self, phase_id: i64);
}

/// Port pair pool over a fixed inclusive range.
struct PortPool {
    free: BTreeSet<u16>,
    leased: HashMap<i64, (u16, u16)>,
}

impl PortPool {
    fn new(start: u16, end: u16) -> Self {
        Self {
            free: (start..=end).collect(),
            leased: HashMap::new(),
        }
    }

    fn allocate(&mut self, phase_id: i64) -> Result<(u16, u16), ExecError> {
        if self.leased.contains_key(&phase_id) {
            return Err(ExecError::AlreadyLeased { phase_id });
        }
        let a = self.take_lowest(phase_id)?;
        let b = match self.take_lowest(phase_id) {
            Ok(b) => b,
            Err(e) => {
                self.free.insert(a);
                return Err(e);
            }
        };
        self.leased.insert(phase_id, (a, b));
        Ok((a, b))
    }

    fn take_lowest(&mut self, phase_id: i64) -> Result<u16, ExecError> {
        let port = self.free.first().copied().ok_or(ExecError::ProvisioningFailed {
            phase_id,
            message: "port range exhausted".to_string(),
        })?;
        self.free.remove(&port);
        Ok(port)
    }

    fn release(&mut self, phase_id: i64) -> Option<(u16, u16)> {
        let pair = self.leased.remove(&phase_id)?;
        self.free.insert(pair.0);
        self.free.insert(pair.1);
        Some(pair)
    }

    fn adopt(&mut self, phase_id: i64, port_a: u16, port_b: u16) {
        self.free.remove(&port_a);
        self.free.remove(&port_b);
        self.leased.insert(phase_id, (port_a, port_b));
    }
}

/// Filesystem-backed provisioner: one directory per phase under a workspace
/// root, ports leased from a configured range.
pub struct WorkspaceProvisioner {
    root: PathBuf,
    // Held only for map bookkeeping, never across an await.
    pool: Mutex<PortPool>,
}

impl WorkspaceProvisioner {
    pub fn new(root: PathBuf, port_range_start: u16, port_range_end: u16) -> Self {
        Self {
            root,
            pool: Mutex::new(PortPool::new(port_range_start, port_range_end)),
        }
    }

    fn workdir_for(&self, phase_id: i64) -> PathBuf {
        self.root.join(format!("phase-{}", phase_id))
    }

    /// Re-register a lease recorded in the store for a phase that was already
    /// running before a coordinator restart, so its ports are not handed to
    /// anyone else.
    pub fn adopt(&self, phase_id: i64, port_a: u16, port_b: u16) {
        let mut pool = self.pool.lock().expect("port pool lock poisoned");
        pool.adopt(phase_id, port_a, port_b);
        debug!(phase_id, port_a, port_b, "adopted existing context lease");
    }
}

#[async_trait]
impl Provisioner for WorkspaceProvisioner {
    async fn provision(&self, phase_id: i64) -> Result<ExecutionContext, ExecError> {
        let (port_a, port_b) = {
            let mut pool = self.pool.lock().expect("port pool lock poisoned");
            pool.allocate(phase_id)?
        };

        let workdir = self.workdir_for(phase_id);
        if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
            let mut pool = self.pool.lock().expect("port pool lock poisoned");
            pool.release(phase_id);
            return Err(ExecError::ProvisioningFailed {
                phase_id,
                message: format!("create {}: {}", workdir.display(), e),
            });
        }

        debug!(phase_id, workdir = %workdir.display(), port_a, port_b, "provisioned context");
        Ok(ExecutionContext {
            phase_id,
            workdir,
            port_a,
            port_b,
        })
    }

    async fn release(&self, phase_id: i64) {
        {
            let mut pool = self.pool.lock().expect("port pool lock poisoned");
            pool.release(phase_id);
        }
        // The directory may predate this process (restart recovery) or have
        // never been created (partial provision); a missing path is fine.
        let workdir = self.workdir_for(phase_id);
        match tokio::fs::remove_dir_all(&workdir).await {
            Ok(()) => debug!(phase_id, "released context"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(phase_id, workdir = %workdir.display(), "failed to remove workdir: {}", e),
        }
    }
}
