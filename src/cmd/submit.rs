use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::read_response;

/// TOML description of a workflow run.
///
/// ```toml
/// issue = "ISSUE-42"
///
/// [[phases]]
/// name = "plan"
///
/// [phases.payload]
/// version = 1
/// instructions = "Draft an implementation plan"
///
/// [[phases]]
/// name = "build"
/// depends_on = ["plan"]
/// ```
#[derive(Debug, Deserialize)]
struct RunFile {
    issue: String,
    #[serde(default)]
    phases: Vec<PhaseEntry>,
}

#[derive(Debug, Deserialize)]
struct PhaseEntry {
    name: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    external_deps: Vec<i64>,
    max_attempts: Option<u32>,
    payload: Option<toml::Value>,
}

impl RunFile {
    fn into_request(self) -> Result<serde_json::Value> {
        let mut phases = Vec::with_capacity(self.phases.len());
        for entry in self.phases {
            let payload = match entry.payload {
                Some(value) => serde_json::to_value(value)
                    .with_context(|| format!("Invalid payload for phase '{}'", entry.name))?,
                None => serde_json::Value::Null,
            };
            phases.push(serde_json::json!({
                "name": entry.name,
                "depends_on": entry.depends_on,
                "external_deps": entry.external_deps,
                "max_attempts": entry.max_attempts,
                "payload": payload,
            }));
        }
        Ok(serde_json::json!({
            "issue_ref": self.issue,
            "phases": phases,
        }))
    }
}

pub async fn cmd_submit(server_url: &str, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let run: RunFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", file.display()))?;
    let body = run.into_request()?;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/runs", server_url))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach foreman server at {}", server_url))?;
    let detail = read_response(resp).await?;

    let phase_count = detail["phases"].as_array().map_or(0, |p| p.len());
    println!(
        "Submitted run {} for {} ({} phases)",
        detail["id"], detail["issue_ref"], phase_count
    );
    Ok(())
}
