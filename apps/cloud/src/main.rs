//! # canopy-cloud
//!
//! Relay binary: opens storage, starts the broker bridge, the registry, the
//! inbound router and the liveness monitor, then serves viewers until
//! Ctrl-C or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use canopy_bridge::{Bridge, InboundRoutes, Listen, Topic, Transport};
use canopy_core::SystemClock;
use canopy_db::{Database, DbConfig};

use canopy_cloud::hub::{self, AppState};
use canopy_cloud::{
    CloudConfig, CommandForwarder, DbAccessPolicy, InboundRouter, JwtManager, LivenessMonitor, RegistryActor,
};

/// Queue between the bridge and the inbound router.
const INBOUND_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting Canopy cloud relay...");

    let config = CloudConfig::load().context("Invalid configuration")?;
    info!(
        port = config.http_port,
        db = %config.database_path.display(),
        broker = ?config.broker.connect,
        "Configuration loaded"
    );

    let db = Database::new(DbConfig::new(&config.database_path))
        .await
        .context("Failed to open database")?;

    // Bridge: every uplink topic from every site.
    let mut routes = InboundRoutes::new();
    let inbound_rx = routes.route_many(
        &[
            Topic::Telemetry,
            Topic::Status,
            Topic::Alarm,
            Topic::Heartbeat,
            Topic::DailySummary,
        ],
        INBOUND_QUEUE,
    );
    let bridge_handle = Transport::spawn(config.broker.clone(), Listen::AllUplinks, routes);
    let bridge: Arc<dyn Bridge> = Arc::new(bridge_handle.clone());

    let jwt = Arc::new(JwtManager::new(&config.jwt_secret));
    let policy = Arc::new(DbAccessPolicy::new(db.clone(), jwt));
    let registry = RegistryActor::new(bridge.clone(), policy.clone()).start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let router = InboundRouter::new(db.clone(), registry.clone());
    let router_task = tokio::spawn(router.run(inbound_rx, shutdown_rx.clone()));

    let monitor = LivenessMonitor::new(
        db.clone(),
        SystemClock,
        config.offline_threshold(),
        config.liveness_interval(),
    )
    .with_registry(registry.clone());
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let state = AppState {
        registry: registry.clone(),
        db: db.clone(),
        bridge: bridge.clone(),
        forwarder: Arc::new(CommandForwarder::new(db.clone(), bridge)),
        policy,
        config: Arc::new(config.clone()),
    };

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address()))?;

    hub::serve(listener, state, shutdown_signal()).await?;

    // Drain background work.
    let _ = shutdown_tx.send(true);
    let _ = router_task.await;
    let _ = monitor_task.await;
    let _ = registry.shutdown().await;
    let _ = bridge_handle.shutdown().await;
    db.close().await;

    info!("Cloud relay shutdown complete");
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
