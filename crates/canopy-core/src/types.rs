//! # Domain Types
//!
//! Core domain types shared by the cloud relay and the edge agent.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Site       │   │  CommandRecord  │   │  AlarmEpisode   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  command_type   │   │  alarm_type     │       │
//! │  │  name (broker)  │   │  origin         │   │  occurred_at    │       │
//! │  │  tenant_id      │   │  result         │   │  resolved_at    │       │
//! │  │  last_contact   │   │  (append-only)  │   │  (open = NULL)  │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  DailySummary   │   │   ProgramRun    │   │  SensorReading  │       │
//! │  │  (site,date,    │◄──│  one irrigation │   │  detail-level   │       │
//! │  │   program)      │   │  run + channels │   │  time series    │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! Sites carry two keys: `id` (UUID, used in storage relations) and `name`
//! (used in broker key expressions, see [`crate::validation::validate_site_name`]).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Site
// =============================================================================

/// Lifecycle status of a site. Only `Active` sites are watched for liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Active,
    Inactive,
    Maintenance,
}

impl Default for SiteStatus {
    fn default() -> Self {
        SiteStatus::Active
    }
}

/// One edge controller installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
pub struct Site {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Broker-addressable name, used as the site segment of every topic.
    pub name: String,

    /// Owning tenant.
    pub tenant_id: String,

    /// Lifecycle status.
    pub status: SiteStatus,

    /// Last time any message from this site was processed.
    /// `None` until the site has been heard from at least once.
    pub last_contact_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Site {
    /// Whether the liveness monitor should evaluate this site.
    #[inline]
    pub fn is_monitored(&self) -> bool {
        self.status == SiteStatus::Active
    }
}

// =============================================================================
// Users & Roles
// =============================================================================

/// Role carried in a viewer's access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Admin,
    Operator,
    Viewer,
}

impl UserRole {
    /// Elevated roles see every site of their tenant without a per-site grant.
    pub fn is_elevated(&self) -> bool {
        matches!(self, UserRole::Owner | UserRole::Admin)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "kebab-case"))]
#[serde(rename_all = "kebab-case")]
pub enum CommandOrigin {
    /// Operator action relayed from the cloud.
    Remote,
    /// Operator at the site's local panel.
    LocalManual,
    /// Fired by a local schedule.
    Scheduled,
    /// Raised automatically by an alarm condition.
    AutoAlarm,
}

impl CommandOrigin {
    /// Automatic origins have no issuing identity.
    pub fn is_automatic(&self) -> bool {
        matches!(self, CommandOrigin::Scheduled | CommandOrigin::AutoAlarm)
    }
}

/// Outcome recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum CommandResult {
    Success,
    Failure,
}

/// One audited command. Append-only: created once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub id: String,
    pub site_id: String,
    /// Wire name, e.g. `emergency-stop`.
    pub command_type: String,
    /// Structured arguments as received.
    pub detail: serde_json::Value,
    pub origin: CommandOrigin,
    /// Issuing user. `None` for automatic origins.
    pub issued_by: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub result: CommandResult,
    pub result_detail: Option<String>,
}

impl CommandRecord {
    /// Builds a successful record with a fresh id.
    pub fn new(
        site_id: impl Into<String>,
        command_type: impl Into<String>,
        detail: serde_json::Value,
        origin: CommandOrigin,
        issued_by: Option<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        CommandRecord {
            id: Uuid::new_v4().to_string(),
            site_id: site_id.into(),
            command_type: command_type.into(),
            detail,
            origin,
            issued_by: if origin.is_automatic() { None } else { issued_by },
            issued_at,
            result: CommandResult::Success,
            result_detail: None,
        }
    }

    /// Marks the record as failed with a reason.
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.result = CommandResult::Failure;
        self.result_detail = Some(reason.into());
        self
    }

    /// Attaches a note to a successful record.
    pub fn with_detail(mut self, note: impl Into<String>) -> Self {
        self.result_detail = Some(note.into());
        self
    }
}

// =============================================================================
// Alarms
// =============================================================================

/// Alarm type used for liveness episodes.
pub const ALARM_OFFLINE: &str = "OFFLINE";

/// A tracked alarm span. Open while `resolved_at` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
pub struct AlarmEpisode {
    pub id: String,
    pub site_id: String,
    pub alarm_type: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlarmEpisode {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

// =============================================================================
// Program Runs & Daily Summaries
// =============================================================================

/// Water delivered through one actuator channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelVolume {
    pub channel: String,
    pub volume_l: f64,
}

/// One completed irrigation run on the edge. Detail-level data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramRun {
    pub id: String,
    pub site_id: String,
    pub program_id: String,
    pub program_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub target_ec: f64,
    pub target_ph: f64,
    pub avg_ec: f64,
    pub avg_ph: f64,
    pub water_l: f64,
    pub fertilizer_l: f64,
    pub channels: Vec<ChannelVolume>,
}

/// Per-site, per-program, per-date aggregate. Unique on (site, date, program).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub site_id: String,
    pub summary_date: NaiveDate,
    pub program_id: String,
    pub program_name: String,
    pub run_count: i64,
    pub target_ec: f64,
    pub target_ph: f64,
    pub avg_ec: f64,
    pub avg_ph: f64,
    pub total_water_l: f64,
    pub total_fertilizer_l: f64,
    /// Per-channel breakdown for the day.
    #[serde(default)]
    pub channels: Vec<ChannelVolume>,
    /// When this row was published to the cloud. Immutable afterwards.
    #[serde(skip)]
    pub synced_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Sensor Readings
// =============================================================================

/// A single time-series sample from the site's sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub site_id: String,
    pub recorded_at: DateTime<Utc>,
    pub ec: f64,
    pub ph: f64,
    pub temperature_c: f64,
    pub flow_rate_lpm: f64,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevated_roles() {
        assert!(UserRole::Owner.is_elevated());
        assert!(UserRole::Admin.is_elevated());
        assert!(!UserRole::Operator.is_elevated());
        assert!(!UserRole::Viewer.is_elevated());
    }

    #[test]
    fn test_automatic_origin_drops_issuer() {
        let record = CommandRecord::new(
            "site-1",
            "stop",
            serde_json::json!({}),
            CommandOrigin::Scheduled,
            Some("user-1".to_string()),
            Utc::now(),
        );
        assert_eq!(record.issued_by, None);
        assert_eq!(record.result, CommandResult::Success);

        let record = CommandRecord::new(
            "site-1",
            "stop",
            serde_json::json!({}),
            CommandOrigin::Remote,
            Some("user-1".to_string()),
            Utc::now(),
        )
        .failed("broker unavailable");
        assert_eq!(record.issued_by.as_deref(), Some("user-1"));
        assert_eq!(record.result, CommandResult::Failure);
        assert_eq!(record.result_detail.as_deref(), Some("broker unavailable"));
    }

    #[test]
    fn test_origin_wire_names() {
        assert_eq!(
            serde_json::to_string(&CommandOrigin::LocalManual).unwrap(),
            "\"local-manual\""
        );
        assert_eq!(
            serde_json::to_string(&CommandOrigin::AutoAlarm).unwrap(),
            "\"auto-alarm\""
        );
    }

    #[test]
    fn test_summary_serializes_without_sync_marker() {
        let summary = DailySummary {
            site_id: "s".into(),
            summary_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            program_id: "p1".into(),
            program_name: "Morning".into(),
            run_count: 2,
            target_ec: 1.8,
            target_ph: 6.0,
            avg_ec: 1.7,
            avg_ph: 6.1,
            total_water_l: 1200.0,
            total_fertilizer_l: 12.0,
            channels: vec![],
            synced_at: Some(Utc::now()),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["summaryDate"], "2024-05-01");
        assert!(json.get("syncedAt").is_none());
    }
}
