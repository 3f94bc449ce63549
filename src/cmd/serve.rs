use anyhow::Result;

use foreman::config::ForemanConfig;
use foreman::server;

pub async fn cmd_serve(mut config: ForemanConfig, port: Option<u16>, dev: bool) -> Result<()> {
    if let Some(port) = port {
        config.port = port;
    }
    server::start_server(config, dev).await
}
