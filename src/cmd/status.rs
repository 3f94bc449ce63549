use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};

use foreman::store::{PhaseRecord, RunDetail, WorkflowRun};

use super::read_response;

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

pub async fn cmd_status(server_url: &str, run: Option<i64>) -> Result<()> {
    match run {
        Some(id) => show_run(server_url, id).await,
        None => list_runs(server_url).await,
    }
}

async fn list_runs(server_url: &str) -> Result<()> {
    let resp = reqwest::Client::new()
        .get(format!("{}/api/runs", server_url))
        .send()
        .await
        .with_context(|| format!("Failed to reach foreman server at {}", server_url))?;
    let body = read_response(resp).await?;
    let runs: Vec<WorkflowRun> = serde_json::from_value(body).context("Unexpected response")?;

    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    println!("{:<6} {:<24} {:<11} CREATED", "ID", "ISSUE", "STATUS");
    for run in runs {
        println!(
            "{:<6} {:<24} {:<11} {}",
            run.id, run.issue_ref, run.status, run.created_at
        );
    }
    Ok(())
}

async fn show_run(server_url: &str, id: i64) -> Result<()> {
    let resp = reqwest::Client::new()
        .get(format!("{}/api/runs/{}", server_url, id))
        .send()
        .await
        .with_context(|| format!("Failed to reach foreman server at {}", server_url))?;
    let body = read_response(resp).await?;
    let detail: RunDetail = serde_json::from_value(body).context("Unexpected response")?;

    println!(
        "Run {} [{}]  {}  created {}",
        detail.run.id, detail.run.status, detail.run.issue_ref, detail.run.created_at
    );
    println!(
        "{:<6} {:<16} {:<11} {:<9} {:<9} ERROR",
        "ID", "PHASE", "STATUS", "ATTEMPT", "ELAPSED"
    );
    let total = detail.phases.len();
    for phase in &detail.phases {
        println!(
            "{:<6} {:<16} {:<11} {:<9} {:<9} {}",
            phase.id,
            format!("{} ({}/{})", phase.name, phase.phase_index + 1, total),
            phase.status,
            format!("{}/{}", phase.attempt_count + 1, phase.max_attempts),
            elapsed(phase),
            phase.error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Human-readable time a phase has spent (or spent) running.
fn elapsed(phase: &PhaseRecord) -> String {
    let Some(started) = phase
        .started_at
        .as_deref()
        .and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FMT).ok())
    else {
        return "-".to_string();
    };
    let end = phase
        .finished_at
        .as_deref()
        .and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FMT).ok())
        .unwrap_or_else(|| Utc::now().naive_utc());
    let secs = (end - started).num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman::store::PhaseStatus;

    fn phase(started: Option<&str>, finished: Option<&str>) -> PhaseRecord {
        PhaseRecord {
            id: 1,
            run_id: 1,
            name: "build".to_string(),
            phase_index: 0,
            status: PhaseStatus::Running,
            depends_on: vec![],
            payload: serde_json::Value::Null,
            attempt_count: 0,
            max_attempts: 3,
            workdir: None,
            port_a: None,
            port_b: None,
            pid: None,
            queued_at: "2026-01-01 00:00:00".to_string(),
            started_at: started.map(String::from),
            finished_at: finished.map(String::from),
            error: None,
        }
    }

    #[test]
    fn test_elapsed_formats() {
        let p = phase(Some("2026-01-01 00:00:00"), Some("2026-01-01 00:00:42"));
        assert_eq!(elapsed(&p), "42s");

        let p = phase(Some("2026-01-01 00:00:00"), Some("2026-01-01 00:05:07"));
        assert_eq!(elapsed(&p), "5m07s");

        let p = phase(Some("2026-01-01 00:00:00"), Some("2026-01-01 02:30:00"));
        assert_eq!(elapsed(&p), "2h30m");
    }

    #[test]
    fn test_elapsed_without_start_is_dash() {
        assert_eq!(elapsed(&phase(None, None)), "-");
    }
}
