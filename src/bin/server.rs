//! jailrun HTTP server
//!
//! Serves `POST /execute` and `GET /health` on top of the sandbox.

use anyhow::Context;
use clap::Parser;
use jailrun::config::{load_config, load_config_from_path, apply_env_overrides, validate_config};
use jailrun::{create_sandbox, gateway, VERSION};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "jailrun-server",
    version = VERSION,
    about = "HTTP server for sandboxed Python execution"
)]
struct Args {
    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(long, short)]
    port: Option<u16>,

    /// Configuration file (JSON5 or TOML)
    #[arg(long, short, env = "JAILRUN_CONFIG")]
    config: Option<PathBuf>,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let mut config = load_config_from_path(path)?;
            apply_env_overrides(&mut config)?;
            config
        }
        None => load_config()?,
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    config.log.init_tracing();

    for warning in validate_config(&config).into_result()? {
        warn!("Config: {}", warning);
    }

    let sandbox = create_sandbox(&config.sandbox);
    let health = sandbox.health();
    if health.available {
        info!(
            nsjail = ?health.nsjail,
            interpreter = ?health.interpreter,
            "Sandbox ready with {} profile(s)",
            sandbox.profiles().len()
        );
    } else {
        warn!("Sandbox is not available on this host: {:?}", health);
    }

    let app = gateway::router(sandbox, &config.server);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("jailrun {} listening on {}", VERSION, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
