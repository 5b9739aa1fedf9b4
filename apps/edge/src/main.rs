//! # canopy-edge
//!
//! Edge agent binary.
//!
//! ```text
//! canopy-edge [CONFIG_PATH]
//! ```
//!
//! Without a path the platform config directory is used (see
//! [`EdgeConfig::default_config_path`]).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use canopy_edge::{EdgeAgent, EdgeConfig, SimulatedSensors};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting Canopy edge agent...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = EdgeConfig::load(config_path).context("Invalid configuration")?;
    info!(
        site = %config.site.name,
        db = %config.database.path.display(),
        broker = ?config.broker.connect,
        "Configuration loaded"
    );

    warn!("No sensor driver configured, using simulated readings");
    let agent = EdgeAgent::start(config, Arc::new(SimulatedSensors))
        .await
        .context("Failed to start edge agent")?;

    shutdown_signal().await;
    agent.shutdown().await;

    info!("Edge agent shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if std::env::var("CANOPY_LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
