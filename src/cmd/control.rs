use anyhow::{Context, Result};

use super::read_response;

pub async fn cmd_cancel(server_url: &str, run: i64) -> Result<()> {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/runs/{}/cancel", server_url, run))
        .send()
        .await
        .with_context(|| format!("Failed to reach foreman server at {}", server_url))?;
    read_response(resp).await?;
    println!("Cancelling run {}.", run);
    Ok(())
}

pub async fn cmd_retry(server_url: &str, phase: i64) -> Result<()> {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/phases/{}/retry", server_url, phase))
        .send()
        .await
        .with_context(|| format!("Failed to reach foreman server at {}", server_url))?;
    read_response(resp).await?;
    println!("Phase {} re-queued.", phase);
    Ok(())
}
