//! # Downlink Handler
//!
//! Handles every cloud → edge message for this site.
//!
//! | Topic            | Effect                                              |
//! |------------------|-----------------------------------------------------|
//! | `command`        | [`Controller::execute`] with origin `remote`        |
//! | `config-update`  | replace stored program config if version is newer  |
//! | `request/start`  | live telemetry on (no-op if already on)             |
//! | `request/stop`   | live telemetry off (no-op if already off)           |
//!
//! Every row above tolerates redelivery: commands are keyed by the cloud's
//! record id, config by version, and demand by target value.

use std::sync::Arc;

use canopy_bridge::{ConfigUpdateMessage, InboundMessage, SiteMessage};
use canopy_core::Clock;
use canopy_db::Database;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::controller::{CommandRequest, Controller};
use crate::error::EdgeResult;
use crate::telemetry::Telemetry;

pub struct DownlinkHandler {
    controller: Arc<Controller>,
    telemetry: Arc<Telemetry>,
    db: Database,
    clock: Arc<dyn Clock>,
}

impl DownlinkHandler {
    pub fn new(controller: Arc<Controller>, telemetry: Arc<Telemetry>, db: Database, clock: Arc<dyn Clock>) -> Self {
        DownlinkHandler {
            controller,
            telemetry,
            db,
            clock,
        }
    }

    /// Drains `rx` until it closes or `shutdown` flips.
    pub async fn run(self, mut rx: mpsc::Receiver<InboundMessage>, mut shutdown: watch::Receiver<bool>) {
        info!("Downlink handler started");
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(inbound) = msg else { break };
                    let topic = inbound.topic;
                    if let Err(e) = self.handle(inbound).await {
                        error!(topic = %topic, error = %e, "Downlink message failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Downlink handler stopped");
    }

    pub async fn handle(&self, inbound: InboundMessage) -> EdgeResult<()> {
        if inbound.site != self.controller.site_name() {
            warn!(site = %inbound.site, topic = %inbound.topic, "Message for another site");
            return Ok(());
        }

        match &inbound.message {
            SiteMessage::Command(cmd) => {
                self.controller.execute(CommandRequest::from(cmd)).await?;
            }
            SiteMessage::ConfigUpdate(update) => {
                self.apply_config(update).await?;
            }
            SiteMessage::RequestStart(_) => {
                self.telemetry.start_streaming();
            }
            SiteMessage::RequestStop(_) => {
                self.telemetry.stop_streaming();
            }
            other => {
                debug!(topic = %other.topic(), "Ignoring uplink topic on downlink route");
            }
        }

        Ok(())
    }

    async fn apply_config(&self, update: &ConfigUpdateMessage) -> EdgeResult<()> {
        let replaced = self
            .db
            .edge_config()
            .replace_if_newer(update.version, &update.document, self.clock.now())
            .await?;

        if replaced {
            info!(version = update.version, "Program configuration replaced");
        } else {
            debug!(version = update.version, "Stale or duplicate configuration ignored");
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
