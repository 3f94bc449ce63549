//! HTTP surface: work submission, completion callbacks, and the read-only
//! observability queries, plus the wiring that brings the store, the
//! execution collaborators, and the coordinator task up together.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ForemanConfig;
use crate::coordinator::Coordinator;
use crate::exec::{AgentLauncher, ProcessLauncher, Provisioner, WorkspaceProvisioner};
use crate::store::{DbHandle, PhaseStatus, PhaseStore};

pub use api::{AppState, SharedState};

/// Build the application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the engine and its API server; runs until ctrl-c.
pub async fn start_server(config: ForemanConfig, dev_mode: bool) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store =
        PhaseStore::new(&config.db_path).context("Failed to initialize the phase store")?;
    let db = DbHandle::new(store);

    // Leases recorded for phases that were running before a restart are
    // re-adopted so their ports cannot be handed out twice.
    let provisioner = WorkspaceProvisioner::new(
        config.workspace_root.clone(),
        config.port_range_start,
        config.port_range_end,
    );
    let running = db
        .call(|store| store.list_phases_with_status(PhaseStatus::Running))
        .await
        .context("Failed to scan running phases")?;
    for phase in &running {
        if let (Some(port_a), Some(port_b)) = (phase.port_a, phase.port_b) {
            provisioner.adopt(phase.id, port_a, port_b);
        }
    }
    if !running.is_empty() {
        info!(count = running.len(), "re-adopted running phases from a previous session");
    }

    let provisioner: Arc<dyn Provisioner> = Arc::new(provisioner);
    let launcher: Arc<dyn AgentLauncher> =
        Arc::new(ProcessLauncher::new(&config.agent_cmd, &config.server_url()));

    let (coordinator, engine) =
        Coordinator::new(db.clone(), config.clone(), provisioner, launcher);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator_task = tokio::spawn(coordinator.run(shutdown_rx.clone()));

    let state = Arc::new(AppState {
        db,
        engine,
        default_max_attempts: config.max_attempts,
    });
    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("foreman listening on http://{}", listener.local_addr()?);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await
        .context("Server error")?;

    coordinator_task
        .await
        .context("Coordinator task panicked")?;
    info!("shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{EngineEvent, EngineHandle};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tokio::sync::{Notify, mpsc};
    use tower::ServiceExt;

    fn test_state() -> (SharedState, mpsc::Receiver<EngineEvent>) {
        let db = DbHandle::new(PhaseStore::new_in_memory().unwrap());
        let (tx, rx) = mpsc::channel(16);
        let engine = EngineHandle::new(tx, Arc::new(Notify::new()));
        (
            Arc::new(AppState {
                db,
                engine,
                default_max_attempts: 3,
            }),
            rx,
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn submit_body() -> serde_json::Value {
        serde_json::json!({
            "issue_ref": "ISSUE-7",
            "phases": [
                {"name": "plan", "payload": {"version": 1}},
                {"name": "build", "depends_on": ["plan"]},
                {"name": "verify", "depends_on": ["plan"]}
            ]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _rx) = test_state();
        let resp = build_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_run() {
        let (state, _rx) = test_state();
        let resp = build_router(state.clone())
            .oneshot(post_json("/api/runs", submit_body()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let detail: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(detail["issue_ref"], "ISSUE-7");
        assert_eq!(detail["phases"].as_array().unwrap().len(), 3);
        // Dependency names resolved to row ids.
        let plan_id = detail["phases"][0]["id"].as_i64().unwrap();
        assert_eq!(detail["phases"][1]["depends_on"][0].as_i64(), Some(plan_id));
    }

    #[tokio::test]
    async fn test_cyclic_submission_rejected_with_nothing_persisted() {
        let (state, _rx) = test_state();
        let body = serde_json::json!({
            "issue_ref": "ISSUE-8",
            "phases": [
                {"name": "a", "depends_on": ["b"]},
                {"name": "b", "depends_on": ["a"]}
            ]
        });
        let resp = build_router(state.clone())
            .oneshot(post_json("/api/runs", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = build_router(state)
            .oneshot(Request::builder().uri("/api/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let runs: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_external_dependency_rejected() {
        let (state, _rx) = test_state();
        let body = serde_json::json!({
            "issue_ref": "ISSUE-9",
            "phases": [{"name": "ship", "external_deps": [9999]}]
        });
        let resp = build_router(state)
            .oneshot(post_json("/api/runs", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_unknown_run_is_404() {
        let (state, _rx) = test_state();
        let resp = build_router(state)
            .oneshot(Request::builder().uri("/api/runs/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_callback_for_unknown_phase_is_404() {
        let (state, _rx) = test_state();
        let resp = build_router(state)
            .oneshot(post_json(
                "/api/phases/999/complete",
                serde_json::json!({"outcome": "success"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_callback_enqueues_completion_event() {
        let (state, mut rx) = test_state();
        let app = build_router(state.clone());
        app.clone()
            .oneshot(post_json("/api/runs", submit_body()))
            .await
            .unwrap();

        let resp = app
            .oneshot(post_json(
                "/api/phases/1/complete",
                serde_json::json!({"outcome": "failure", "detail": "tests failed"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        match rx.try_recv().unwrap() {
            EngineEvent::Completion(signal) => {
                assert_eq!(signal.phase_id, 1);
                assert_eq!(signal.detail.as_deref(), Some("tests failed"));
            }
            other => panic!("Expected completion event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_active_run_accepted() {
        let (state, mut rx) = test_state();
        let app = build_router(state);
        app.clone()
            .oneshot(post_json("/api/runs", submit_body()))
            .await
            .unwrap();

        let resp = app
            .oneshot(post_json("/api/runs/1/cancel", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::CancelRun { run_id: 1 }
        ));
    }

    #[tokio::test]
    async fn test_retry_of_non_failed_phase_is_conflict() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        app.clone()
            .oneshot(post_json("/api/runs", submit_body()))
            .await
            .unwrap();

        let resp = app
            .oneshot(post_json("/api/phases/1/retry", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
