//! # Telemetry
//!
//! Two loops share one sensor source:
//!
//! ```text
//!  sampler  ── every sample_interval ──► sensor_readings (detail data)
//!                                        + fold into the open program run
//!
//!  streamer ── while demanded, every publish_interval ──► up/telemetry
//!              ▲
//!              └── request/start · request/stop  (demand flag)
//! ```
//!
//! Demand is a flag, not a counter: a repeated `request/start` leaves an
//! active stream as it is, and a repeated `request/stop` is a no-op.

use std::sync::Arc;
use std::time::Duration;

use canopy_bridge::{Bridge, BridgeResult, SiteMessage, TelemetryMessage};
use canopy_core::{Clock, ControllerState, SensorReading};
use canopy_db::Database;
use chrono::{DateTime, Timelike, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::error::EdgeResult;

// =============================================================================
// Sensor Source
// =============================================================================

/// Where readings come from. The hardware driver implements this.
pub trait Sensors: Send + Sync {
    fn read(&self, site_id: &str, at: DateTime<Utc>, controller: &ControllerState) -> SensorReading;
}

/// Plausible readings for bench setups without probes attached.
///
/// EC and pH drift slowly with the minute of the hour; flow is only
/// reported while an actuator is on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedSensors;

impl Sensors for SimulatedSensors {
    fn read(&self, site_id: &str, at: DateTime<Utc>, controller: &ControllerState) -> SensorReading {
        let phase = f64::from(at.minute()) / 60.0 * std::f64::consts::TAU;
        SensorReading {
            site_id: site_id.to_string(),
            recorded_at: at,
            ec: 1.9 + 0.1 * phase.sin(),
            ph: 6.0 + 0.05 * phase.cos(),
            temperature_c: 20.0 + 2.0 * phase.sin(),
            flow_rate_lpm: if controller.any_output_on() { 12.0 } else { 0.0 },
        }
    }
}

// =============================================================================
// Telemetry Service
// =============================================================================

pub struct Telemetry {
    controller: Arc<Controller>,
    sensors: Arc<dyn Sensors>,
    db: Database,
    bridge: Arc<dyn Bridge>,
    clock: Arc<dyn Clock>,
    demand: watch::Sender<bool>,
    sample_interval: Duration,
    publish_interval: Duration,
}

impl Telemetry {
    pub fn new(
        controller: Arc<Controller>,
        sensors: Arc<dyn Sensors>,
        db: Database,
        bridge: Arc<dyn Bridge>,
        clock: Arc<dyn Clock>,
        sample_interval: Duration,
        publish_interval: Duration,
    ) -> Self {
        let (demand, _) = watch::channel(false);
        Telemetry {
            controller,
            sensors,
            db,
            bridge,
            clock,
            demand,
            sample_interval,
            publish_interval,
        }
    }

    // =========================================================================
    // Demand
    // =========================================================================

    /// Turns the live stream on.
    ///
    /// ## Returns
    /// `false` if it was already on.
    pub fn start_streaming(&self) -> bool {
        let started = self.demand.send_if_modified(|on| !std::mem::replace(on, true));
        if started {
            info!(site = %self.controller.site_name(), "Live telemetry requested");
        }
        started
    }

    /// Turns the live stream off.
    ///
    /// ## Returns
    /// `false` if it was already off.
    pub fn stop_streaming(&self) -> bool {
        let stopped = self.demand.send_if_modified(|on| std::mem::replace(on, false));
        if stopped {
            info!(site = %self.controller.site_name(), "Live telemetry released");
        }
        stopped
    }

    pub fn is_streaming(&self) -> bool {
        *self.demand.borrow()
    }

    // =========================================================================
    // Single Steps
    // =========================================================================

    /// Takes one reading, stores it and credits it to the open run.
    pub async fn sample_once(&self) -> EdgeResult<SensorReading> {
        let snapshot = self.controller.snapshot();
        let reading = self
            .sensors
            .read(self.controller.site_id(), self.clock.now(), &snapshot);

        self.db.readings().insert(&reading).await?;
        self.controller.observe(&reading, self.sample_interval);

        Ok(reading)
    }

    /// Publishes one live snapshot.
    pub fn publish_snapshot(&self) -> BridgeResult<()> {
        let now = self.clock.now();
        let controller = self.controller.snapshot();
        let reading = self.sensors.read(self.controller.site_id(), now, &controller);

        let message = SiteMessage::Telemetry(TelemetryMessage {
            timestamp: now,
            reading,
            controller,
        });
        self.bridge.publish(self.controller.site_name(), &message)
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Stores a reading every `sample_interval` until `shutdown` flips.
    pub async fn run_sampler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sample_once().await {
                        warn!(error = %e, "Sensor sample not stored");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Sampler stopped");
    }

    /// Publishes snapshots while demand is on, until `shutdown` flips.
    pub async fn run_streamer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut demand = self.demand.subscribe();

        loop {
            if !*demand.borrow_and_update() {
                tokio::select! {
                    changed = demand.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
            }

            // First tick completes immediately: a viewer sees data at once.
            let mut ticker = tokio::time::interval(self.publish_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.publish_snapshot() {
                            debug!(error = %e, "Telemetry snapshot dropped");
                        }
                    }
                    changed = demand.changed() => {
                        if changed.is_err() || !*demand.borrow_and_update() {
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Streamer stopped");
                            return;
                        }
                    }
                }
            }
        }
        debug!("Streamer stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_bridge::testing::RecordingBridge;
    use canopy_bridge::Topic;
    use canopy_core::ManualClock;
    use canopy_db::DbConfig;
    use chrono::TimeZone;

    const SITE: &str = "farm-01";

    async fn setup() -> (Arc<Telemetry>, Database, Arc<RecordingBridge>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let bridge = Arc::new(RecordingBridge::connected());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()));
        let controller = Arc::new(Controller::new(
            "site-uuid",
            SITE,
            ControllerState::new(["pump", "valve-1"]),
            db.clone(),
            bridge.clone(),
            clock.clone(),
        ));
        let telemetry = Arc::new(Telemetry::new(
            controller,
            Arc::new(SimulatedSensors),
            db.clone(),
            bridge.clone(),
            clock,
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        (telemetry, db, bridge)
    }

    #[tokio::test]
    async fn test_demand_flag_is_idempotent() {
        let (telemetry, _db, _bridge) = setup().await;

        assert!(telemetry.start_streaming());
        assert!(!telemetry.start_streaming());
        assert!(telemetry.is_streaming());

        assert!(telemetry.stop_streaming());
        assert!(!telemetry.stop_streaming());
        assert!(!telemetry.is_streaming());
    }

    #[tokio::test]
    async fn test_repeated_start_keeps_one_stream() {
        let (telemetry, _db, bridge) = setup().await;
        tokio::time::pause();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(telemetry.clone().run_streamer(shutdown_rx));

        telemetry.start_streaming();
        tokio::time::sleep(Duration::from_secs(1)).await;
        telemetry.start_streaming();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // One immediate snapshot; a restarted stream would have sent a second.
        assert_eq!(bridge.count(SITE, Topic::Telemetry), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(bridge.count(SITE, Topic::Telemetry), 2);

        telemetry.stop_streaming();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let after_stop = bridge.count(SITE, Topic::Telemetry);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(bridge.count(SITE, Topic::Telemetry), after_stop);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_sample_is_stored() {
        let (telemetry, db, bridge) = setup().await;

        let reading = telemetry.sample_once().await.unwrap();

        assert_eq!(db.readings().count().await.unwrap(), 1);
        assert_eq!(db.readings().latest("site-uuid").await.unwrap(), Some(reading));
        assert!(bridge.published().is_empty());
    }

    #[test]
    fn test_simulated_flow_follows_outputs() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 15, 0).unwrap();
        let mut state = ControllerState::new(["pump"]);
        assert_eq!(SimulatedSensors.read("s", at, &state).flow_rate_lpm, 0.0);

        state.actuators.insert("pump".into(), true);
        assert!(SimulatedSensors.read("s", at, &state).flow_rate_lpm > 0.0);
    }
}
