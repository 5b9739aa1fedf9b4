//! # Edge Agent
//!
//! Wires the edge components together and owns their lifetime.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        EdgeAgent Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         EdgeAgent                                │  │
//! │  │  • opens storage and the broker bridge                           │  │
//! │  │  • spawns one task per loop, all watching one shutdown flag      │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │    ┌──────────────┬───────────┼──────────────┬──────────────────┐      │
//! │    ▼              ▼           ▼              ▼                  ▼      │
//! │  downlink      sampler     streamer      heartbeat         daily sync  │
//! │  handler       (detail)    (on demand)   (30s)             (00:05)     │
//! │    │                                                                    │
//! │    └──► Controller (shared by every task through Arc)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use canopy_bridge::{Bridge, BridgeHandle, InboundRoutes, Listen, Topic, Transport};
use canopy_core::{Clock, ControllerState, SystemClock};
use canopy_db::{Database, DbConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EdgeConfig;
use crate::controller::Controller;
use crate::error::EdgeResult;
use crate::heartbeat::Heartbeat;
use crate::inbound::DownlinkHandler;
use crate::scheduler::DailySync;
use crate::telemetry::{Sensors, Telemetry};

/// Queue between the bridge and the downlink handler.
const DOWNLINK_QUEUE: usize = 64;

/// Every topic the cloud sends to a site.
const DOWNLINK_TOPICS: [Topic; 4] = [Topic::Command, Topic::ConfigUpdate, Topic::RequestStart, Topic::RequestStop];

pub struct EdgeAgent {
    db: Database,
    bridge: BridgeHandle,
    controller: Arc<Controller>,
    telemetry: Arc<Telemetry>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl EdgeAgent {
    /// Opens storage and the broker session, then starts every loop.
    pub async fn start(config: EdgeConfig, sensors: Arc<dyn Sensors>) -> EdgeResult<Self> {
        let fire_at = config.fire_at()?;
        let db = Database::new(DbConfig::new(&config.database.path)).await?;

        let mut routes = InboundRoutes::new();
        let downlink_rx = routes.route_many(&DOWNLINK_TOPICS, DOWNLINK_QUEUE);
        let bridge_handle = Transport::spawn(
            config.broker.clone(),
            Listen::Downlink {
                site: config.site.name.clone(),
            },
            routes,
        );
        let bridge: Arc<dyn Bridge> = Arc::new(bridge_handle.clone());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let controller = Arc::new(Controller::new(
            config.site.id.clone(),
            config.site.name.clone(),
            ControllerState::new(config.site.channels.iter().cloned()),
            db.clone(),
            bridge.clone(),
            clock.clone(),
        ));

        let telemetry = Arc::new(Telemetry::new(
            controller.clone(),
            sensors,
            db.clone(),
            bridge.clone(),
            clock.clone(),
            config.sample_interval(),
            config.publish_interval(),
        ));

        let heartbeat = Heartbeat::new(controller.clone(), bridge.clone(), clock.clone(), config.heartbeat_interval());

        let downlink = DownlinkHandler::new(controller.clone(), telemetry.clone(), db.clone(), clock.clone());

        let daily = DailySync::new(
            config.site.id.clone(),
            config.site.name.clone(),
            db.clone(),
            bridge,
            clock,
            chrono::Local,
            fire_at,
            config.sync.catch_up_days,
            config.retention,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            ("downlink", tokio::spawn(downlink.run(downlink_rx, shutdown_rx.clone()))),
            ("sampler", tokio::spawn(telemetry.clone().run_sampler(shutdown_rx.clone()))),
            ("streamer", tokio::spawn(telemetry.clone().run_streamer(shutdown_rx.clone()))),
            ("heartbeat", tokio::spawn(heartbeat.run(shutdown_rx.clone()))),
            ("daily-sync", tokio::spawn(daily.run(shutdown_rx))),
        ];

        info!(
            site = %config.site.name,
            channels = ?config.site.channels,
            fire_at = %fire_at,
            "Edge agent started"
        );

        Ok(EdgeAgent {
            db,
            bridge: bridge_handle,
            controller,
            telemetry,
            shutdown_tx,
            tasks,
        })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Stops every loop, then the bridge, then storage.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Task ended abnormally");
            }
        }

        if let Err(e) = self.bridge.shutdown().await {
            warn!(error = %e, "Bridge shutdown failed");
        }
        self.db.close().await;

        info!("Edge agent stopped");
    }
}
