use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use foreman::config::ForemanConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Phase coordination engine - drive issue workflows through isolated, agent-executed phases")]
pub struct Cli {
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Base URL of a running foreman server (client subcommands only)
    #[arg(long, global = true)]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the coordination engine and its API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// Permissive CORS for a local dashboard dev server
        #[arg(long)]
        dev: bool,
    },
    /// Submit a workflow run described in a TOML file
    Submit {
        file: PathBuf,
    },
    /// List runs, or show one run with its phases
    Status {
        run: Option<i64>,
    },
    /// Cancel an active run
    Cancel {
        run: i64,
    },
    /// Retry a failed phase
    Retry {
        phase: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("foreman=info")),
        )
        .init();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = ForemanConfig::load(&project_dir)?;
    let server_url = cli.server.clone().unwrap_or_else(|| config.server_url());

    match &cli.command {
        Commands::Serve { port, dev } => {
            cmd::cmd_serve(config, *port, *dev).await?;
        }
        Commands::Submit { file } => {
            cmd::cmd_submit(&server_url, file).await?;
        }
        Commands::Status { run } => {
            cmd::cmd_status(&server_url, *run).await?;
        }
        Commands::Cancel { run } => {
            cmd::cmd_cancel(&server_url, *run).await?;
        }
        Commands::Retry { phase } => {
            cmd::cmd_retry(&server_url, *phase).await?;
        }
    }

    Ok(())
}
