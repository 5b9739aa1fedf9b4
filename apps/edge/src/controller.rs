//! # Controller
//!
//! Owns the site's operating state and is the only place that changes it.
//! Every command, whatever its origin, goes through [`Controller::execute`].
//!
//! ## Command Path
//! ```text
//!  CommandRequest ──► already recorded? (remote id) ──yes──► ignored
//!        │
//!        ▼
//!  ControlAction::parse ──✗──► failure record (unknown type / bad args)
//!        │
//!        ▼
//!  ControllerState::apply ──✗──► failure record (refused in this state)
//!        │
//!        ├── Unchanged ──► success record, "already in effect"
//!        │
//!        └── Changed ────► close / open program run
//!                          publish status
//!                          success record
//!
//!  exactly one commands.append per executed request
//! ```
//!
//! ## Program Runs
//! While RUNNING, each stored sensor sample is folded into the open run.
//! Leaving RUNNING (or switching program) closes the run into a
//! `program_runs` row, which the daily sync later rolls up.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use canopy_bridge::{Bridge, BridgeResult, CommandMessage, SiteMessage, StatusMessage};
use canopy_core::{
    ChannelVolume, Clock, CommandOrigin, CommandRecord, ControlAction, ControllerState, OperatingState, ProgramRun,
    SensorReading, Transition,
};
use canopy_db::Database;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EdgeResult;

// =============================================================================
// Requests
// =============================================================================

/// A command on its way into the controller.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub detail: Value,
    pub origin: CommandOrigin,
    pub issued_by: Option<String>,

    /// Cloud audit id. Reused as the local record id, so a redelivered
    /// message is recognised and skipped.
    pub command_id: Option<String>,
}

impl CommandRequest {
    /// A command raised on the site itself (panel, schedule, alarm logic).
    pub fn local(command: impl Into<String>, detail: Value, origin: CommandOrigin) -> Self {
        CommandRequest {
            command: command.into(),
            detail,
            origin,
            issued_by: None,
            command_id: None,
        }
    }
}

impl From<&CommandMessage> for CommandRequest {
    fn from(msg: &CommandMessage) -> Self {
        CommandRequest {
            command: msg.command.clone(),
            detail: msg.detail.clone(),
            origin: CommandOrigin::Remote,
            issued_by: msg.issued_by.clone(),
            command_id: Some(msg.command_id.clone()),
        }
    }
}

// =============================================================================
// Run Tracking
// =============================================================================

/// Accumulates samples for the program currently running.
#[derive(Debug)]
struct OpenRun {
    program_id: String,
    started_at: DateTime<Utc>,
    ec_sum: f64,
    ph_sum: f64,
    samples: u32,
    water_l: f64,
    channels: BTreeMap<String, f64>,
}

impl OpenRun {
    fn new(program_id: String, started_at: DateTime<Utc>) -> Self {
        OpenRun {
            program_id,
            started_at,
            ec_sum: 0.0,
            ph_sum: 0.0,
            samples: 0,
            water_l: 0.0,
            channels: BTreeMap::new(),
        }
    }

    /// Folds one sample taken over `period` into the run.
    ///
    /// Water is credited to the open valves in equal shares; with no valve
    /// open it is credited to the pump.
    fn observe(&mut self, reading: &SensorReading, period: Duration, state: &ControllerState) {
        self.ec_sum += reading.ec;
        self.ph_sum += reading.ph;
        self.samples += 1;

        let litres = reading.flow_rate_lpm * period.as_secs_f64() / 60.0;
        self.water_l += litres;

        let open: Vec<&String> = state
            .actuators
            .iter()
            .filter(|(channel, on)| **on && channel.as_str() != canopy_core::control::PUMP_CHANNEL)
            .map(|(channel, _)| channel)
            .collect();

        if open.is_empty() {
            *self
                .channels
                .entry(canopy_core::control::PUMP_CHANNEL.to_string())
                .or_default() += litres;
        } else {
            let share = litres / open.len() as f64;
            for channel in open {
                *self.channels.entry(channel.clone()).or_default() += share;
            }
        }
    }

    fn close(self, site_id: &str, ended_at: DateTime<Utc>, program: &ProgramInfo) -> ProgramRun {
        let samples = f64::from(self.samples.max(1));
        ProgramRun {
            id: Uuid::new_v4().to_string(),
            site_id: site_id.to_string(),
            program_id: self.program_id,
            program_name: program.name.clone(),
            started_at: self.started_at,
            ended_at,
            target_ec: program.target_ec,
            target_ph: program.target_ph,
            avg_ec: self.ec_sum / samples,
            avg_ph: self.ph_sum / samples,
            water_l: self.water_l,
            fertilizer_l: self.water_l * program.fertilizer_ratio,
            channels: self
                .channels
                .into_iter()
                .map(|(channel, volume_l)| ChannelVolume { channel, volume_l })
                .collect(),
        }
    }
}

/// Program metadata from the stored configuration document.
///
/// ```json
/// { "programs": [ { "id": "p1", "name": "Tomatoes", "targetEc": 2.0,
///                   "targetPh": 6.0, "fertilizerRatio": 0.01 } ] }
/// ```
#[derive(Debug, Clone, PartialEq)]
struct ProgramInfo {
    name: String,
    target_ec: f64,
    target_ph: f64,
    fertilizer_ratio: f64,
}

impl ProgramInfo {
    fn lookup(document: Option<&Value>, program_id: &str) -> Self {
        let entry = document
            .and_then(|doc| doc.get("programs"))
            .and_then(Value::as_array)
            .and_then(|programs| {
                programs
                    .iter()
                    .find(|p| p.get("id").and_then(Value::as_str) == Some(program_id))
            });

        let number = |key: &str| entry.and_then(|p| p.get(key)).and_then(Value::as_f64).unwrap_or(0.0);

        ProgramInfo {
            name: entry
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or(program_id)
                .to_string(),
            target_ec: number("targetEc"),
            target_ph: number("targetPh"),
            fertilizer_ratio: number("fertilizerRatio"),
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

struct Inner {
    state: ControllerState,
    run: Option<OpenRun>,
}

pub struct Controller {
    site_id: String,
    site_name: String,
    inner: Mutex<Inner>,
    db: Database,
    bridge: Arc<dyn Bridge>,
    clock: Arc<dyn Clock>,
}

impl Controller {
    pub fn new(
        site_id: impl Into<String>,
        site_name: impl Into<String>,
        state: ControllerState,
        db: Database,
        bridge: Arc<dyn Bridge>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Controller {
            site_id: site_id.into(),
            site_name: site_name.into(),
            inner: Mutex::new(Inner { state, run: None }),
            db,
            bridge,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    /// Copy of the current state and actuator outputs.
    pub fn snapshot(&self) -> ControllerState {
        self.lock().state.clone()
    }

    pub fn operating_state(&self) -> OperatingState {
        self.lock().state.state
    }

    /// Executes one command and appends its audit record.
    ///
    /// ## Returns
    /// The appended record, or `None` for a remote command that was already
    /// recorded (broker redelivery).
    pub async fn execute(&self, request: CommandRequest) -> EdgeResult<Option<CommandRecord>> {
        if let Some(id) = &request.command_id {
            if self.db.commands().exists(id).await? {
                debug!(command_id = %id, command = %request.command, "Command already executed, ignoring");
                return Ok(None);
            }
        }

        let now = self.clock.now();
        let mut record = CommandRecord::new(
            &self.site_id,
            &request.command,
            request.detail.clone(),
            request.origin,
            request.issued_by.clone(),
            now,
        );
        if let Some(id) = request.command_id {
            record.id = id;
        }

        let applied = ControlAction::parse(&request.command, &request.detail).and_then(|action| self.apply(&action, now));

        let record = match applied {
            Ok((Transition::Changed, snapshot, closed)) => {
                info!(
                    site = %self.site_name,
                    command = %request.command,
                    origin = ?request.origin,
                    state = %snapshot.state,
                    "Command applied"
                );

                if let Some(run) = closed {
                    self.store_run(run).await;
                }

                match self.publish_status(snapshot, Some(request.command.clone())) {
                    Ok(()) => record,
                    Err(e) => {
                        warn!(site = %self.site_name, error = %e, "Status not published");
                        record.with_detail(format!("status not published: {e}"))
                    }
                }
            }
            Ok((Transition::Unchanged, _, _)) => {
                debug!(site = %self.site_name, command = %request.command, "Command already in effect");
                record.with_detail("already in effect")
            }
            Err(e) => {
                warn!(
                    site = %self.site_name,
                    command = %request.command,
                    origin = ?request.origin,
                    error = %e,
                    "Command rejected"
                );
                record.failed(e.to_string())
            }
        };

        self.db.commands().append(&record).await?;
        Ok(Some(record))
    }

    /// Applies `action` under the lock and keeps the open run in step with
    /// the active program.
    fn apply(
        &self,
        action: &ControlAction,
        now: DateTime<Utc>,
    ) -> Result<(Transition, ControllerState, Option<OpenRun>), canopy_core::CoreError> {
        let mut inner = self.lock();
        let before = inner.state.active_program.clone();
        let transition = inner.state.apply(action)?;

        let mut closed = None;
        if inner.state.active_program != before {
            closed = inner.run.take();
            if let Some(program_id) = inner.state.active_program.clone() {
                inner.run = Some(OpenRun::new(program_id, now));
            }
        }

        Ok((transition, inner.state.clone(), closed))
    }

    async fn store_run(&self, run: OpenRun) {
        let document = match self.db.edge_config().current().await {
            Ok(stored) => stored.map(|c| c.document),
            Err(e) => {
                warn!(error = %e, "Program configuration unavailable; run stored without targets");
                None
            }
        };

        let program = ProgramInfo::lookup(document.as_ref(), &run.program_id);
        let run = run.close(&self.site_id, self.clock.now(), &program);

        match self.db.summaries().record_run(&run).await {
            Ok(()) => info!(program = %run.program_id, water_l = run.water_l, "Program run recorded"),
            Err(e) => error!(program = %run.program_id, error = %e, "Failed to record program run"),
        }
    }

    /// Credits a stored sensor sample to the open run, if any.
    pub fn observe(&self, reading: &SensorReading, period: Duration) {
        let mut inner = self.lock();
        let Inner { state, run } = &mut *inner;
        if let Some(run) = run.as_mut() {
            run.observe(reading, period, state);
        }
    }

    /// Publishes the given state on `status`.
    pub fn publish_status(&self, controller: ControllerState, reason: Option<String>) -> BridgeResult<()> {
        let message = SiteMessage::Status(StatusMessage {
            timestamp: self.clock.now(),
            controller,
            reason,
        });
        self.bridge.publish(&self.site_name, &message)
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
    use canopy_core::{CommandResult, ManualClock};
    use canopy_db::DbConfig;
    use chrono::TimeZone;
    use serde_json::json;

    const SITE_ID: &str = "site-uuid";
    const SITE: &str = "farm-01";

    async fn setup() -> (Controller, Database, Arc<RecordingBridge>, Arc<ManualClock>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let bridge = Arc::new(RecordingBridge::connected());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()));
        let controller = Controller::new(
            SITE_ID,
            SITE,
            ControllerState::new(["pump", "valve-1", "valve-2"]),
            db.clone(),
            bridge.clone(),
            clock.clone(),
        );
        (controller, db, bridge, clock)
    }

    async fn run(controller: &Controller, command: &str, detail: Value) -> CommandRecord {
        controller
            .execute(CommandRequest::local(command, detail, CommandOrigin::LocalManual))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_emergency_stop_from_any_state() {
        let origins = [
            CommandOrigin::Remote,
            CommandOrigin::LocalManual,
            CommandOrigin::Scheduled,
            CommandOrigin::AutoAlarm,
        ];

        for (prior, origin) in ["idle", "running", "manual", "emergency"].into_iter().zip(origins) {
            let (controller, db, _bridge, _clock) = setup().await;
            match prior {
                "running" => {
                    run(&controller, "start", json!({"programId": "p1"})).await;
                }
                "manual" => {
                    run(&controller, "manual", json!({"channel": "valve-2", "on": true})).await;
                }
                "emergency" => {
                    run(&controller, "emergency-stop", json!({})).await;
                }
                _ => {}
            }
            let before = db.commands().count_for_site(SITE_ID).await.unwrap();

            let record = controller
                .execute(CommandRequest::local("emergency-stop", json!({}), origin))
                .await
                .unwrap()
                .unwrap();

            let state = controller.snapshot();
            assert_eq!(state.state, OperatingState::Emergency, "prior: {prior}");
            assert!(!state.any_output_on(), "prior: {prior}");
            assert_eq!(state.active_program, None);
            assert_eq!(record.result, CommandResult::Success);
            assert_eq!(record.origin, origin);
            assert_eq!(db.commands().count_for_site(SITE_ID).await.unwrap(), before + 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_command_is_recorded_as_failure() {
        let (controller, db, bridge, _clock) = setup().await;

        let record = run(&controller, "self-destruct", json!({})).await;

        assert_eq!(record.result, CommandResult::Failure);
        assert!(record.result_detail.unwrap().contains("self-destruct"));
        assert_eq!(controller.operating_state(), OperatingState::Idle);
        assert_eq!(db.commands().count_for_site(SITE_ID).await.unwrap(), 1);
        assert!(bridge.published().is_empty());
    }

    #[tokio::test]
    async fn test_refused_transition_leaves_state_untouched() {
        let (controller, _db, bridge, _clock) = setup().await;
        run(&controller, "emergency-stop", json!({})).await;
        bridge.clear();
        let before = controller.snapshot();

        let record = run(&controller, "start", json!({"programId": "p1"})).await;

        assert_eq!(record.result, CommandResult::Failure);
        assert_eq!(controller.snapshot(), before);
        assert!(bridge.published().is_empty());

        // reset is the way out
        run(&controller, "reset", json!({})).await;
        assert_eq!(controller.operating_state(), OperatingState::Idle);
    }

    #[tokio::test]
    async fn test_status_published_only_on_change() {
        let (controller, _db, bridge, _clock) = setup().await;

        run(&controller, "manual", json!({"channel": "valve-1", "on": true})).await;
        let repeat = run(&controller, "manual", json!({"channel": "valve-1", "on": true})).await;

        assert_eq!(repeat.result, CommandResult::Success);
        assert_eq!(repeat.result_detail.as_deref(), Some("already in effect"));

        let statuses = bridge.published_to(SITE, Topic::Status);
        assert_eq!(statuses.len(), 1);
        match &statuses[0] {
            SiteMessage::Status(status) => {
                assert!(status.controller.actuators["valve-1"]);
                assert_eq!(status.reason.as_deref(), Some("manual"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_failure_does_not_fail_command() {
        let (controller, _db, bridge, _clock) = setup().await;
        bridge.set_connected(false);

        let record = run(&controller, "emergency-stop", json!({})).await;

        assert_eq!(record.result, CommandResult::Success);
        assert!(record.result_detail.unwrap().starts_with("status not published"));
        assert_eq!(controller.operating_state(), OperatingState::Emergency);
    }

    #[tokio::test]
    async fn test_redelivered_remote_command_runs_once() {
        let (controller, db, _bridge, _clock) = setup().await;
        let msg = CommandMessage {
            timestamp: Utc::now(),
            command_id: "cloud-record-1".into(),
            command: "start".into(),
            detail: json!({"programId": "p1"}),
            issued_by: Some("op-1".into()),
        };

        let first = controller.execute(CommandRequest::from(&msg)).await.unwrap().unwrap();
        run(&controller, "stop", json!({})).await;
        let second = controller.execute(CommandRequest::from(&msg)).await.unwrap();

        assert_eq!(first.id, "cloud-record-1");
        assert_eq!(first.issued_by.as_deref(), Some("op-1"));
        assert!(second.is_none());
        assert_eq!(controller.operating_state(), OperatingState::Idle);
        assert_eq!(db.commands().count_for_site(SITE_ID).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_program_run_recorded_on_stop() {
        let (controller, db, _bridge, clock) = setup().await;
        db.edge_config()
            .replace_if_newer(
                1,
                &json!({"programs": [{"id": "p1", "name": "Tomatoes", "targetEc": 2.0, "targetPh": 6.0, "fertilizerRatio": 0.01}]}),
                clock.now(),
            )
            .await
            .unwrap();

        run(&controller, "start", json!({"programId": "p1"})).await;
        run(&controller, "manual", json!({"channel": "valve-1", "on": true})).await;

        for ec in [1.8, 2.2] {
            let reading = SensorReading {
                site_id: SITE_ID.into(),
                recorded_at: clock.now(),
                ec,
                ph: 6.0,
                temperature_c: 21.0,
                flow_rate_lpm: 10.0,
            };
            controller.observe(&reading, Duration::from_secs(60));
            clock.advance(chrono::Duration::minutes(1));
        }
        run(&controller, "stop", json!({})).await;

        let from = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        let date = from.date_naive();
        db.summaries().aggregate_day(SITE_ID, date, from, to).await.unwrap();

        let summaries = db.summaries().for_date(SITE_ID, date).await.unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.program_name, "Tomatoes");
        assert_eq!(summary.run_count, 1);
        assert!((summary.avg_ec - 2.0).abs() < 1e-9);
        assert!((summary.total_water_l - 20.0).abs() < 1e-9);
        assert!((summary.total_fertilizer_l - 0.2).abs() < 1e-9);
        assert_eq!(summary.channels.len(), 1);
        assert_eq!(summary.channels[0].channel, "valve-1");
    }

    #[test]
    fn test_program_info_defaults_to_id() {
        let info = ProgramInfo::lookup(None, "p9");
        assert_eq!(info.name, "p9");
        assert_eq!(info.target_ec, 0.0);
    }
}
