//! flotillad — the Flotilla daemon.
//!
//! Single binary that assembles:
//! - State store (redb)
//! - Capacity sources
//! - Provisioning loop
//! - Reaper
//! - REST API
//!
//! # Usage
//!
//! ```text
//! flotillad run --config /etc/flotilla/flotilla.toml
//! flotillad check-config --config flotilla.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use flotillad::{App, FlotillaConfig};

#[derive(Parser)]
#[command(name = "flotillad", about = "Flotilla elastic capacity daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the provisioning loop, reaper and API server.
    Run {
        /// Path to flotilla.toml.
        #[arg(long, default_value = "flotilla.toml")]
        config: PathBuf,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Emit logs as JSON.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and exit.
    CheckConfig {
        #[arg(long, default_value = "flotilla.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = FlotillaConfig::from_file(&config)?;
            if let Some(port) = port {
                config.daemon.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.daemon.data_dir = data_dir;
            }
            run(config).await
        }
        Command::CheckConfig { config } => {
            init_tracing(false);
            let parsed = FlotillaConfig::from_file(&config)?;
            println!(
                "{}: ok ({} sources)",
                config.display(),
                parsed.sources.len()
            );
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,flotillad=debug,flotilla=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: FlotillaConfig) -> anyhow::Result<()> {
    info!("Flotilla daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.daemon.data_dir)?;
    let db_path = config.daemon.data_dir.join("flotilla.redb");

    let store = flotilla_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let app = App::build(&config, store)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let handles = app.spawn_background(shutdown_rx);

    // ── Start API server ───────────────────────────────────────

    let router = app.router();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.daemon.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    for handle in handles {
        let _ = handle.await;
    }

    info!("Flotilla daemon stopped");
    Ok(())
}
