//! CLI command implementations.
//!
//! | Module    | Commands handled    |
//! |-----------|---------------------|
//! | `serve`   | `Serve`             |
//! | `submit`  | `Submit`            |
//! | `status`  | `Status`            |
//! | `control` | `Cancel`, `Retry`   |
//!
//! Everything except `serve` is a thin JSON client against a running
//! foreman server.

pub mod control;
pub mod serve;
pub mod status;
pub mod submit;

pub use control::{cmd_cancel, cmd_retry};
pub use serve::cmd_serve;
pub use status::cmd_status;
pub use submit::cmd_submit;

use anyhow::Result;

/// Turn an API response into its JSON body, converting error statuses into
/// a readable failure carrying the server's `error` message.
pub(crate) async fn read_response(resp: reqwest::Response) -> Result<serde_json::Value> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown error");
        anyhow::bail!("Server returned {}: {}", status, message);
    }
    Ok(body)
}
