//! Veiltun edge node
//!
//! Sits inside the restricted network: fronts the tunnel listeners and the
//! user-facing port mappings, relaying every flow through pooled sessions to
//! an origin node outside.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;
use veiltun::config::Mode;
use veiltun::edge::EdgeServer;
use veiltun::Config;

/// Veiltun Edge - tunnel listeners and port mappings
#[derive(Parser, Debug)]
#[command(name = "veiltun-edge")]
#[command(about = "Veiltun edge node - fronts user traffic inside the restricted network")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/veiltun/config.toml")]
    config: String,

    /// Tunnel listen address (appended to the configured listeners)
    #[arg(short, long)]
    listen: Option<String>,

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
    if config.mode != Mode::Server {
        return Err(anyhow!("config mode is not \"server\"; use veiltun-origin for client mode"));
    }
    if let Some(listen) = args.listen {
        config.listen_ports.push(listen);
    }

    info!("veiltun edge v{}", veiltun::VERSION);

    let server = EdgeServer::new(config).context("failed to initialize edge server")?;

    tokio::select! {
        result = server.run() => {
            result.context("edge server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down...");
        }
    }

    Ok(())
}
