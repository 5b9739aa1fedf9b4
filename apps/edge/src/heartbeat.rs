//! # Heartbeat
//!
//! Tells the cloud the site is alive. The relay's liveness monitor only sees
//! `last_contact_at`, so this loop is what keeps an idle site ONLINE.
//!
//! On every disconnected → connected edge a status snapshot goes out first,
//! so viewers that subscribed during the outage see the current state
//! without waiting for the next command.

use std::sync::Arc;
use std::time::{Duration, Instant};

use canopy_bridge::{Bridge, HeartbeatMessage, SiteMessage};
use canopy_core::Clock;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::controller::Controller;

pub struct Heartbeat {
    controller: Arc<Controller>,
    bridge: Arc<dyn Bridge>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    started: Instant,
    was_connected: bool,
}

impl Heartbeat {
    pub fn new(controller: Arc<Controller>, bridge: Arc<dyn Bridge>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Heartbeat {
            controller,
            bridge,
            clock,
            interval,
            started: Instant::now(),
            was_connected: false,
        }
    }

    /// One beat.
    ///
    /// ## Returns
    /// `true` if the heartbeat was handed to the broker.
    pub fn beat(&mut self) -> bool {
        let connected = self.bridge.is_connected();
        if connected && !self.was_connected {
            info!(site = %self.controller.site_name(), "Broker reachable, publishing status snapshot");
            if let Err(e) = self
                .controller
                .publish_status(self.controller.snapshot(), Some("connected".to_string()))
            {
                debug!(error = %e, "Status snapshot dropped");
            }
        }
        self.was_connected = connected;

        let message = SiteMessage::Heartbeat(HeartbeatMessage {
            timestamp: self.clock.now(),
            uptime_secs: self.started.elapsed().as_secs(),
            state: self.controller.operating_state(),
        });

        match self.bridge.publish(self.controller.site_name(), &message) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Heartbeat dropped");
                false
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.beat();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Heartbeat stopped");
    }
}
