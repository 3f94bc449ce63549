//! Configuration for the coordination engine and its API server.
//!
//! Loaded from `.foreman/foreman.toml` in the project directory; every field
//! is optional and falls back to a default, so a missing or partial file is
//! fine. Environment variables (`FOREMAN_*`) override the file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

/// Runtime configuration for the coordinator, sweeper, launcher, and server.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    /// Concurrency ceiling: maximum phases in {admitted, running} at once.
    pub max_parallel: usize,
    /// Wall-clock ceiling for a running phase before the sweeper fails it.
    pub phase_timeout_secs: u64,
    /// Coordinator tick interval.
    pub tick_interval_ms: u64,
    /// Recovery sweeper cadence (slower than the tick).
    pub sweep_interval_secs: u64,
    /// Default retry budget per phase.
    pub max_attempts: u32,
    /// Command line for the external execution agent. Split on whitespace;
    /// the first token is the program, the rest are leading arguments.
    pub agent_cmd: String,
    /// API server port.
    pub port: u16,
    pub db_path: PathBuf,
    pub workspace_root: PathBuf,
    /// Inclusive range the provisioner leases phase port pairs from.
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            phase_timeout_secs: 1800,
            tick_interval_ms: 500,
            sweep_interval_secs: 15,
            max_attempts: 3,
            agent_cmd: "foreman-agent".to_string(),
            port: 4170,
            db_path: PathBuf::from(".foreman/foreman.db"),
            workspace_root: PathBuf::from(".foreman/workspaces"),
            port_range_start: 42000,
            port_range_end: 42199,
        }
    }
}

/// Raw TOML structure for `.foreman/foreman.toml`.
#[derive(Debug, Deserialize)]
struct ForemanToml {
    coordinator: Option<CoordinatorSection>,
    server: Option<ServerSection>,
}

#[derive(Debug, Deserialize)]
struct CoordinatorSection {
    max_parallel: Option<usize>,
    phase_timeout_secs: Option<u64>,
    tick_interval_ms: Option<u64>,
    sweep_interval_secs: Option<u64>,
    max_attempts: Option<u32>,
    agent_cmd: Option<String>,
    workspace_root: Option<PathBuf>,
    port_range_start: Option<u16>,
    port_range_end: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    db_path: Option<PathBuf>,
}

impl ForemanConfig {
    /// Load config from `.foreman/foreman.toml` under the project directory,
    /// then apply `FOREMAN_*` environment overrides. Returns defaults if the
    /// file doesn't exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(".foreman").join("foreman.toml");
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let toml: ForemanToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            Self::from_toml(toml)
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        // Paths in the file are relative to the project directory.
        if config.db_path.is_relative() {
            config.db_path = project_dir.join(&config.db_path);
        }
        if config.workspace_root.is_relative() {
            config.workspace_root = project_dir.join(&config.workspace_root);
        }

        Ok(config)
    }

    fn from_toml(toml: ForemanToml) -> Self {
        let mut config = Self::default();
        if let Some(section) = toml.coordinator {
            if let Some(max_parallel) = section.max_parallel {
                config.max_parallel = max_parallel;
            }
            if let Some(timeout) = section.phase_timeout_secs {
                config.phase_timeout_secs = timeout;
            }
            if let Some(tick) = section.tick_interval_ms {
                config.tick_interval_ms = tick;
            }
            if let Some(sweep) = section.sweep_interval_secs {
                config.sweep_interval_secs = sweep;
            }
            if let Some(attempts) = section.max_attempts {
                config.max_attempts = attempts;
            }
            if let Some(agent_cmd) = section.agent_cmd {
                config.agent_cmd = agent_cmd;
            }
            if let Some(root) = section.workspace_root {
                config.workspace_root = root;
            }
            if let Some(start) = section.port_range_start {
                config.port_range_start = start;
            }
            if let Some(end) = section.port_range_end {
                config.port_range_end = end;
            }
        }
        if let Some(section) = toml.server {
            if let Some(port) = section.port {
                config.port = port;
            }
            if let Some(db_path) = section.db_path {
                config.db_path = db_path;
            }
        }
        config
    }

    fn apply_env_overrides(&mut self) {
        env_override("FOREMAN_MAX_PARALLEL", &mut self.max_parallel);
        env_override("FOREMAN_PHASE_TIMEOUT_SECS", &mut self.phase_timeout_secs);
        env_override("FOREMAN_TICK_INTERVAL_MS", &mut self.tick_interval_ms);
        env_override("FOREMAN_SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs);
        env_override("FOREMAN_MAX_ATTEMPTS", &mut self.max_attempts);
        env_override("FOREMAN_AGENT_CMD", &mut self.agent_cmd);
        env_override("FOREMAN_PORT", &mut self.port);
        if let Ok(v) = std::env::var("FOREMAN_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FOREMAN_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(v);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            anyhow::bail!("max_parallel must be at least 1");
        }
        if self.port_range_end <= self.port_range_start {
            anyhow::bail!(
                "port range is empty: {}..{}",
                self.port_range_start,
                self.port_range_end
            );
        }
        if self.agent_cmd.trim().is_empty() {
            anyhow::bail!("agent_cmd must not be empty");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    /// Base URL of the local API server, used for the agent callback contract
    /// and the CLI client default.
    pub fn server_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, raw = %raw, "ignoring unparseable environment override"),
        }
    }
}
