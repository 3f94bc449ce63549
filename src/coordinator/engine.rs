//! The coordinator loop.
//!
//! One task drives all state transitions. Each tick: drain pending events,
//! promote queued phases whose dependencies completed, admit ready phases
//! under the concurrency ceiling, launch them, and finalize runs with no
//! remaining work. Between ticks the task suspends on a timer, an event
//! arrival, or an explicit wake; it never blocks on an agent process.
//!
//! Store failures abort the current pass and are retried on the next tick.
//! A completion signal dropped that way is not lost: the sweeper's liveness
//! poll re-derives it from the process state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ForemanConfig;
use crate::errors::StoreError;
use crate::exec::{AgentLauncher, Provisioner};
use crate::store::{DbHandle, PhaseRecord, PhaseStatus, RunStatus};

use super::{
    AdmissionController, CompletionSignal, EngineEvent, EngineHandle, Outcome, SignalOrigin,
    Sweeper, resolver,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

enum Pulse {
    Tick,
    Sweep,
    Event(EngineEvent),
    Shutdown,
}

pub struct Coordinator {
    db: DbHandle,
    provisioner: Arc<dyn Provisioner>,
    launcher: Arc<dyn AgentLauncher>,
    admission: AdmissionController,
    sweeper: Sweeper,
    config: ForemanConfig,
    events: mpsc::Receiver<EngineEvent>,
    wake: Arc<Notify>,
}

impl Coordinator {
    pub fn new(
        db: DbHandle,
        config: ForemanConfig,
        provisioner: Arc<dyn Provisioner>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let wake = Arc::new(Notify::new());
        let handle = EngineHandle::new(tx, wake.clone());
        let admission = AdmissionController::new(config.max_parallel);
        let sweeper = Sweeper::new(db.clone(), launcher.clone(), config.phase_timeout());
        (
            Self {
                db,
                provisioner,
                launcher,
                admission,
                sweeper,
                config,
                events: rx,
                wake,
            },
            handle,
        )
    }

    /// Run until shutdown is signalled. Terminates live agents on exit;
    /// their phases stay `running` in the store and are recovered on the
    /// next start.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let in_flight = loop {
            match self.restore().await {
                Ok(n) => break n,
                Err(e) => {
                    warn!("store unavailable during startup recovery, retrying: {}", e);
                    tokio::time::sleep(self.config.tick_interval()).await;
                }
            }
        };
        info!(
            in_flight,
            ceiling = self.admission.ceiling(),
            "coordinator started"
        );

        let wake = self.wake.clone();
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let pulse = tokio::select! {
                _ = tick.tick() => Pulse::Tick,
                _ = sweep.tick() => Pulse::Sweep,
                event = self.events.recv() => match event {
                    Some(event) => Pulse::Event(event),
                    None => Pulse::Shutdown,
                },
                _ = wake.notified() => Pulse::Tick,
                _ = shutdown.changed() => Pulse::Shutdown,
            };

            match pulse {
                Pulse::Shutdown => break,
                Pulse::Sweep => {
                    if let Err(e) = self.sweep_once().await {
                        warn!("sweep failed, retrying next interval: {}", e);
                    }
                }
                Pulse::Event(event) => {
                    if let Err(e) = self.handle_event(event).await {
                        warn!("store unavailable handling event: {}", e);
                    }
                }
                Pulse::Tick => {}
            }

            if let Err(e) = self.tick().await {
                warn!("tick aborted, retrying next tick: {}", e);
            }
        }

        info!("coordinator shutting down");
        self.launcher.shutdown().await;
    }

    /// Startup recovery. Phases stuck in `admitted` (a crash hit between
    /// admission and launch) are failed and, with attempts remaining,
    /// re-queued. Returns the in-flight count reconstructed from the store.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let admitted = self
            .db
            .call(|store| store.list_phases_with_status(PhaseStatus::Admitted))
            .await?;
        for phase in admitted {
            let id = phase.id;
            warn!(phase_id = id, "phase was admitted but never launched; failing");
            self.db
                .call(move |store| store.mark_failed(id, "coordinator restarted before launch"))
                .await?;
            self.provisioner.release(id).await;
            if phase.attempts_remaining() {
                self.db.call(move |store| store.requeue(id)).await?;
            }
        }

        let in_flight = self.db.call(|store| store.count_in_flight()).await?;
        Ok(in_flight)
    }

    /// One scheduling round. Safe to call repeatedly; every step is a
    /// stateless function of current store contents.
    pub async fn tick(&mut self) -> Result<(), StoreError> {
        self.drain_events().await?;
        self.promote_ready().await?;
        self.admit_and_launch().await?;
        self.finalize_runs().await?;
        Ok(())
    }

    /// Run the sweeper and feed its findings through the same completion
    /// path as agent callbacks.
    pub async fn sweep_once(&mut self) -> Result<(), StoreError> {
        let signals = self.sweeper.sweep().await?;
        for signal in signals {
            self.handle_completion(signal).await?;
        }
        Ok(())
    }

    async fn drain_events(&mut self) -> Result<(), StoreError> {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: EngineEvent) -> Result<(), StoreError> {
        match event {
            EngineEvent::Completion(signal) => self.handle_completion(signal).await,
            EngineEvent::CancelRun { run_id } => self.cancel_run(run_id).await,
            EngineEvent::RetryPhase { phase_id } => self.retry_phase(phase_id).await,
        }
    }

    // ── Resolution and admission ──────────────────────────────────────

    async fn promote_ready(&self) -> Result<(), StoreError> {
        let queued = self
            .db
            .call(|store| store.list_phases_with_status(PhaseStatus::Queued))
            .await?;
        if queued.is_empty() {
            return Ok(());
        }
        let completed = self.db.call(|store| store.completed_phase_ids()).await?;
        for id in resolver::resolve_ready(&queued, &completed) {
            if self.db.call(move |store| store.mark_ready(id)).await? {
                debug!(phase_id = id, "phase ready");
            }
        }
        Ok(())
    }

    async fn admit_and_launch(&self) -> Result<(), StoreError> {
        // Occupied slots are re-read from the store every pass rather than
        // tracked in a counter, so the ceiling invariant holds across
        // restarts and cancellations without reconciliation.
        let in_flight = self.db.call(|store| store.count_in_flight()).await?;
        if self.admission.capacity(in_flight) == 0 {
            return Ok(());
        }
        let ready = self
            .db
            .call(|store| store.list_phases_with_status(PhaseStatus::Ready))
            .await?;
        for phase in self.admission.admit(in_flight, &ready) {
            let id = phase.id;
            if !self.db.call(move |store| store.mark_admitted(id)).await? {
                continue;
            }
            info!(phase_id = id, run_id = phase.run_id, name = %phase.name, "admitted phase");
            self.launch_phase(phase).await?;
        }
        Ok(())
    }

    /// Provision a context and start the agent for an admitted phase. Any
    /// failure on the way fails the phase and releases whatever was
    /// allocated; no partially admitted phase keeps resources.
    async fn launch_phase(&self, phase: &PhaseRecord) -> Result<(), StoreError> {
        let id = phase.id;

        let ctx = match self.provisioner.provision(id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(phase_id = id, "provisioning failed: {}", e);
                self.provisioner.release(id).await;
                let msg = e.to_string();
                self.db
                    .call(move |store| store.mark_failed(id, &msg))
                    .await?;
                return Ok(());
            }
        };

        let pid = match self.launcher.launch(phase, &ctx).await {
            Ok(pid) => pid,
            Err(e) => {
                warn!(phase_id = id, "launch failed: {}", e);
                self.provisioner.release(id).await;
                let msg = e.to_string();
                self.db
                    .call(move |store| store.mark_failed(id, &msg))
                    .await?;
                return Ok(());
            }
        };

        let workdir = ctx.workdir.to_string_lossy().into_owned();
        let (port_a, port_b) = (ctx.port_a, ctx.port_b);
        let recorded = self
            .db
            .call(move |store| store.mark_running(id, pid, &workdir, port_a, port_b))
            .await?;
        if !recorded {
            // The row refused the transition; don't leave an orphan behind.
            error!(phase_id = id, pid, "could not record launch; terminating agent");
            self.launcher.terminate(id, pid).await;
            self.provisioner.release(id).await;
            self.db
                .call(move |store| store.mark_failed(id, "launch bookkeeping failed"))
                .await?;
        }
        Ok(())
    }

    // ── Completion, cancellation, retry ───────────────────────────────

    async fn handle_completion(&self, signal: CompletionSignal) -> Result<(), StoreError> {
        let id = signal.phase_id;
        let phase = match self.db.call(move |store| store.get_phase(id)).await? {
            Some(phase) => phase,
            None => {
                warn!(phase_id = id, "completion signal for unknown phase ignored");
                return Ok(());
            }
        };
        if phase.status.is_terminal() {
            debug!(phase_id = id, "duplicate or late completion signal ignored");
            return Ok(());
        }

        match signal.outcome {
            Outcome::Success => {
                if self.db.call(move |store| store.mark_completed(id)).await? {
                    info!(phase_id = id, run_id = phase.run_id, "phase completed");
                    self.provisioner.release(id).await;
                }
            }
            Outcome::Failure => {
                let detail = signal.detail.unwrap_or_else(|| "failed".to_string());
                let msg = detail.clone();
                if self.db.call(move |store| store.mark_failed(id, &msg)).await? {
                    warn!(phase_id = id, run_id = phase.run_id, %detail, "phase failed");
                    if let Some(pid) = phase.pid {
                        self.launcher.terminate(id, pid).await;
                    }
                    self.provisioner.release(id).await;
                    // Sweeper findings retry automatically while attempts
                    // remain; agent-reported failures wait for an explicit
                    // retry.
                    if signal.origin == SignalOrigin::Sweeper
                        && phase.attempts_remaining()
                        && self.db.call(move |store| store.requeue(id)).await?
                    {
                        info!(
                            phase_id = id,
                            attempt = phase.attempt_count + 1,
                            "re-queued after process loss"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn cancel_run(&self, run_id: i64) -> Result<(), StoreError> {
        let run = match self.db.call(move |store| store.get_run(run_id)).await? {
            Some(run) => run,
            None => {
                warn!(run_id, "cancel for unknown run ignored");
                return Ok(());
            }
        };
        if run.status.is_terminal() {
            debug!(run_id, "cancel for finished run ignored");
            return Ok(());
        }

        let phases = self
            .db
            .call(move |store| store.list_phases_by_run(run_id))
            .await?;
        for phase in phases.iter().filter(|p| !p.status.is_terminal()) {
            let id = phase.id;
            if let Some(pid) = phase.pid {
                self.launcher.terminate(id, pid).await;
            }
            if self.db.call(move |store| store.mark_cancelled(id)).await?
                && phase.status.is_in_flight()
            {
                self.provisioner.release(id).await;
            }
        }
        self.db
            .call(move |store| store.update_run_status(run_id, RunStatus::Cancelled))
            .await?;
        info!(run_id, "run cancelled");
        Ok(())
    }

    async fn retry_phase(&self, phase_id: i64) -> Result<(), StoreError> {
        if self.db.call(move |store| store.requeue(phase_id)).await? {
            // A finished run gets another shot once one of its phases does.
            if let Some(phase) = self.db.call(move |store| store.get_phase(phase_id)).await? {
                let run_id = phase.run_id;
                self.db
                    .call(move |store| store.update_run_status(run_id, RunStatus::Active))
                    .await?;
            }
            info!(phase_id, "phase re-queued for retry");
        } else {
            debug!(phase_id, "retry refused (not failed, or attempts exhausted)");
        }
        Ok(())
    }

    // ── Run finalization ──────────────────────────────────────────────

    async fn finalize_runs(&self) -> Result<(), StoreError> {
        let runs = self.db.call(|store| store.list_active_runs()).await?;
        for run in runs {
            let run_id = run.id;
            let phases = self
                .db
                .call(move |store| store.list_phases_by_run(run_id))
                .await?;

            let mut statuses: HashMap<i64, PhaseStatus> =
                phases.iter().map(|p| (p.id, p.status)).collect();
            // External dependencies live in other runs; fetch their status.
            for phase in &phases {
                for dep in &phase.depends_on {
                    if !statuses.contains_key(dep) {
                        let dep_id = *dep;
                        if let Some(dep_phase) =
                            self.db.call(move |store| store.get_phase(dep_id)).await?
                        {
                            statuses.insert(dep_id, dep_phase.status);
                        }
                    }
                }
            }

            if let Some(outcome) = resolver::run_outcome(&phases, &statuses) {
                self.db
                    .call(move |store| store.update_run_status(run_id, outcome))
                    .await?;
                info!(run_id, status = %outcome, "run finished");
            }
        }
        Ok(())
    }
}
