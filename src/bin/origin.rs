//! Veiltun origin node
//!
//! Sits outside the restricted network: maintains the session pool towards
//! one or more edge nodes and dials the final targets that edge-side user
//! flows request.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;
use veiltun::config::Mode;
use veiltun::origin::OriginClient;
use veiltun::Config;

/// Veiltun Origin - session pool and target dialing
#[derive(Parser, Debug)]
#[command(name = "veiltun-origin")]
#[command(about = "Veiltun origin node - dials targets outside the restricted network")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/veiltun/config.toml")]
    config: String,

    /// Edge address (overrides the first configured path)
    #[arg(short, long)]
    edge: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let mut config = Config::load(&args.config).context("failed to load configuration")?;
    if config.mode != Mode::Client {
        return Err(anyhow!("config mode is not \"client\"; use veiltun-edge for server mode"));
    }
    if let Some(edge) = args.edge {
        let first = config
            .paths
            .first_mut()
            .ok_or_else(|| anyhow!("no paths configured"))?;
        first.addr = edge;
    }

    info!("veiltun origin v{}", veiltun::VERSION);

    let client = OriginClient::new(config).context("failed to initialize origin client")?;

    tokio::select! {
        result = client.run() => {
            result.context("origin client failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down...");
        }
    }

    Ok(())
}
