//! Launching and supervising external execution agents.
//!
//! An agent is a detached background process. It receives its working
//! directory, reserved ports, and callback URL through environment variables,
//! reads its payload from `payload.json` in the workdir, and reports its
//! outcome by POSTing to the callback URL exactly once. The engine never
//! waits on the process; liveness is probed by the recovery sweeper.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::ExecError;
use crate::store::PhaseRecord;

use super::context::ExecutionContext;

/// Process launch collaborator contract.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Start the agent for a phase inside its context. Returns the pid.
    async fn launch(&self, phase: &PhaseRecord, ctx: &ExecutionContext) -> Result<i64, ExecError>;
    /// Whether the process for a phase is still alive.
    async fn is_alive(&self, phase_id: i64, pid: i64) -> bool;
    /// Signal termination to the process, if it is still around.
    async fn terminate(&self, phase_id: i64, pid: i64);
    /// Kill every process this launcher started. Called on engine shutdown;
    /// phases left `running` in the store are recovered on the next start.
    async fn shutdown(&self);
}

/// Real launcher backed by `tokio::process`.
///
/// Children spawned by this process are tracked in an in-memory registry so
/// liveness can be answered from `try_wait` without pid probing. Phases
/// adopted after a coordinator restart are not in the registry; for those the
/// recorded pid is probed directly.
pub struct ProcessLauncher {
    agent_cmd: String,
    callback_base: String,
    children: Arc<Mutex<HashMap<i64, Child>>>,
}

impl ProcessLauncher {
    pub fn new(agent_cmd: &str, callback_base: &str) -> Self {
        Self {
            agent_cmd: agent_cmd.to_string(),
            callback_base: callback_base.trim_end_matches('/').to_string(),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn callback_url(&self, phase_id: i64) -> String {
        format!("{}/api/phases/{}/complete", self.callback_base, phase_id)
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, phase: &PhaseRecord, ctx: &ExecutionContext) -> Result<i64, ExecError> {
        let phase_id = phase.id;
        let fail = |message: String| ExecError::LaunchFailed { phase_id, message };

        // The payload is opaque to the engine; it is handed to the agent
        // byte-for-byte as a file in its workdir.
        let payload = serde_json::to_vec_pretty(&phase.payload)
            .map_err(|e| fail(format!("serialize payload: {}", e)))?;
        tokio::fs::write(ctx.workdir.join("payload.json"), payload)
            .await
            .map_err(|e| fail(format!("write payload.json: {}", e)))?;

        let mut tokens = self.agent_cmd.split_whitespace();
        let program = tokens.next().ok_or_else(|| fail("empty agent_cmd".to_string()))?;

        let log = std::fs::File::create(ctx.workdir.join("agent.log"))
            .map_err(|e| fail(format!("create agent.log: {}", e)))?;
        let log_err = log.try_clone().map_err(|e| fail(e.to_string()))?;

        let child = Command::new(program)
            .args(tokens)
            .current_dir(&ctx.workdir)
            .env("FOREMAN_PHASE_ID", phase_id.to_string())
            .env("FOREMAN_RUN_ID", phase.run_id.to_string())
            .env("FOREMAN_PHASE_NAME", &phase.name)
            .env("FOREMAN_PORT_A", ctx.port_a.to_string())
            .env("FOREMAN_PORT_B", ctx.port_b.to_string())
            .env("FOREMAN_CALLBACK_URL", self.callback_url(phase_id))
            .env("FOREMAN_PAYLOAD", "payload.json")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| fail(format!("spawn '{}': {}", program, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| fail("process exited before pid was observed".to_string()))?
            as i64;

        self.children.lock().await.insert(phase_id, child);
        info!(phase_id, pid, "launched agent");
        Ok(pid)
    }

    async fn is_alive(&self, phase_id: i64, pid: i64) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(&phase_id) {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!(phase_id, %status, "agent exited");
                    children.remove(&phase_id);
                    false
                }
                Err(e) => {
                    warn!(phase_id, "try_wait failed: {}", e);
                    children.remove(&phase_id);
                    false
                }
            },
            // Adopted after a restart: probe the recorded pid.
            None => pid_alive(pid),
        }
    }

    async fn terminate(&self, phase_id: i64, pid: i64) {
        let child = self.children.lock().await.remove(&phase_id);
        match child {
            Some(mut child) => {
                if let Err(e) = child.kill().await {
                    warn!(phase_id, "failed to kill agent: {}", e);
                }
            }
            None => signal_terminate(pid),
        }
    }

    async fn shutdown(&self) {
        let mut children = self.children.lock().await;
        for (phase_id, mut child) in children.drain() {
            info!(phase_id, "terminating agent on shutdown");
            if let Err(e) = child.kill().await {
                warn!(phase_id, "failed to kill agent: {}", e);
            }
        }
    }
}

/// Probe whether a pid names a live process. Signal 0 checks existence
/// without delivering anything; ESRCH means the process is gone.
#[cfg(unix)]
fn pid_alive(pid: i64) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: i64) -> bool {
    false
}

#[cfg(unix)]
fn signal_terminate(pid: i64) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, "SIGTERM not delivered: {}", e);
    }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: i64) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PhaseStatus;

    fn test_phase(id: i64) -> PhaseRecord {
        PhaseRecord {
            id,
            run_id: 1,
            name: "build".to_string(),
            phase_index: 0,
            status: PhaseStatus::Admitted,
            depends_on: vec![],
            payload: serde_json::json!({"version": 1, "instructions": "noop"}),
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

    fn test_ctx(id: i64, dir: &std::path::Path) -> ExecutionContext {
        ExecutionContext {
            phase_id: id,
            workdir: dir.to_path_buf(),
            port_a: 42000,
            port_b: 42001,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_and_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("sleep 30", "http://127.0.0.1:4170");
        let ctx = test_ctx(1, dir.path());

        let pid = launcher.launch(&test_phase(1), &ctx).await.unwrap();
        assert!(pid > 0);
        assert!(launcher.is_alive(1, pid).await);
        assert!(ctx.workdir.join("payload.json").exists());
        assert!(ctx.workdir.join("agent.log").exists());

        launcher.terminate(1, pid).await;
        assert!(!launcher.is_alive(1, pid).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_process_reported_dead() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("true", "http://127.0.0.1:4170");
        let ctx = test_ctx(1, dir.path());

        let pid = launcher.launch(&test_phase(1), &ctx).await.unwrap();
        // Give the process a moment to exit on its own.
        for _ in 0..50 {
            if !launcher.is_alive(1, pid).await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("process never observed as exited");
    }

    #[tokio::test]
    async fn test_launch_unknown_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("foreman-no-such-agent-binary", "http://127.0.0.1:4170");
        let ctx = test_ctx(1, dir.path());

        let err = launcher.launch(&test_phase(1), &ctx).await.unwrap_err();
        assert!(matches!(err, ExecError::LaunchFailed { phase_id: 1, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_adopted_pid_probe() {
        let launcher = ProcessLauncher::new("sleep 30", "http://127.0.0.1:4170");
        // Not in the registry: falls back to probing the pid. Our own pid is
        // certainly alive.
        assert!(launcher.is_alive(99, std::process::id() as i64).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_children() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("sleep 30", "http://127.0.0.1:4170");
        let a = launcher
            .launch(&test_phase(1), &test_ctx(1, dir.path()))
            .await
            .unwrap();

        launcher.shutdown().await;
        assert!(!launcher.is_alive(1, a).await);
    }

    #[test]
    fn test_callback_url_shape() {
        let launcher = ProcessLauncher::new("agent", "http://127.0.0.1:9000/");
        assert_eq!(
            launcher.callback_url(12),
            "http://127.0.0.1:9000/api/phases/12/complete"
        );
    }
}
