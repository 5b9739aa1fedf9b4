//! # Wire Protocol
//!
//! JSON documents carried on the topics of [`crate::topic`].
//!
//! ## Message Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Canopy Site Messages                              │
//! │                                                                         │
//! │  CLOUD → EDGE                                                          │
//! │  ────────────                                                          │
//! │  command         { commandId, command, detail, issuedBy }              │
//! │  config-update   { version, document }                                 │
//! │  request-start   { }           begin live telemetry                    │
//! │  request-stop    { }           end live telemetry                      │
//! │                                                                         │
//! │  EDGE → CLOUD                                                          │
//! │  ────────────                                                          │
//! │  telemetry       { reading, controller }                               │
//! │  status          { controller, reason }                                │
//! │  alarm           { alarmType, message, resolvedAt }                    │
//! │  heartbeat       { uptimeSecs, state }                                 │
//! │  daily-summary   { summaryDate, summaries: [...] }                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Internally tagged, so `type` and `timestamp` sit next to the payload
//! fields:
//! ```json
//! { "type": "heartbeat", "timestamp": "2024-06-01T10:05:00Z", "uptimeSecs": 3600, "state": "IDLE" }
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use canopy_core::{ControllerState, DailySummary, OperatingState, SensorReading};

use crate::error::{BridgeError, BridgeResult};
use crate::topic::Topic;

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// Every document exchanged between the cloud relay and an edge site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SiteMessage {
    // =========================================================================
    // Cloud → Edge
    // =========================================================================
    /// Operator command forwarded by the cloud.
    Command(CommandMessage),

    /// Full replacement of the edge's program configuration.
    ConfigUpdate(ConfigUpdateMessage),

    /// Demand signal: at least one viewer is watching.
    RequestStart(DemandMessage),

    /// Demand signal: the last viewer left.
    RequestStop(DemandMessage),

    // =========================================================================
    // Edge → Cloud
    // =========================================================================
    Telemetry(TelemetryMessage),

    Status(StatusMessage),

    Alarm(AlarmMessage),

    Heartbeat(HeartbeatMessage),

    DailySummary(DailySummaryMessage),
}

impl SiteMessage {
    /// The topic this message travels on.
    pub fn topic(&self) -> Topic {
        match self {
            SiteMessage::Command(_) => Topic::Command,
            SiteMessage::ConfigUpdate(_) => Topic::ConfigUpdate,
            SiteMessage::RequestStart(_) => Topic::RequestStart,
            SiteMessage::RequestStop(_) => Topic::RequestStop,
            SiteMessage::Telemetry(_) => Topic::Telemetry,
            SiteMessage::Status(_) => Topic::Status,
            SiteMessage::Alarm(_) => Topic::Alarm,
            SiteMessage::Heartbeat(_) => Topic::Heartbeat,
            SiteMessage::DailySummary(_) => Topic::DailySummary,
        }
    }

    /// When the sender produced the message.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SiteMessage::Command(m) => m.timestamp,
            SiteMessage::ConfigUpdate(m) => m.timestamp,
            SiteMessage::RequestStart(m) | SiteMessage::RequestStop(m) => m.timestamp,
            SiteMessage::Telemetry(m) => m.timestamp,
            SiteMessage::Status(m) => m.timestamp,
            SiteMessage::Alarm(m) => m.timestamp,
            SiteMessage::Heartbeat(m) => m.timestamp,
            SiteMessage::DailySummary(m) => m.timestamp,
        }
    }

    pub fn encode(&self) -> BridgeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a payload received on `topic`, rejecting a `type` that
    /// belongs to another topic.
    pub fn decode(topic: Topic, bytes: &[u8]) -> BridgeResult<Self> {
        let message: SiteMessage = serde_json::from_slice(bytes)?;
        if message.topic() != topic {
            return Err(BridgeError::TopicMismatch {
                expected: topic.suffix().to_string(),
                actual: message.topic().suffix().to_string(),
            });
        }
        Ok(message)
    }

    /// The message body without its `type` tag, as pushed to viewers.
    pub fn data(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(object) = value.as_object_mut() {
            object.remove("type");
        }
        value
    }
}

// =============================================================================
// Cloud → Edge Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub timestamp: DateTime<Utc>,

    /// Id of the cloud-side audit record, echoed in the edge's record.
    pub command_id: String,

    /// Command type, e.g. `emergency-stop`, `start`, `manual`.
    pub command: String,

    #[serde(default)]
    pub detail: serde_json::Value,

    pub issued_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdateMessage {
    pub timestamp: DateTime<Utc>,

    /// Monotonic version; the edge ignores anything not newer than what it has.
    pub version: i64,

    pub document: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandMessage {
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Edge → Cloud Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    pub timestamp: DateTime<Utc>,
    pub reading: SensorReading,
    pub controller: ControllerState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub timestamp: DateTime<Utc>,
    pub controller: ControllerState,

    /// What caused the change, e.g. the command type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmMessage {
    pub timestamp: DateTime<Utc>,
    pub alarm_type: String,
    pub message: String,

    /// Set when the edge reports the condition has cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub state: OperatingState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummaryMessage {
    pub timestamp: DateTime<Utc>,

    /// The day the firing aggregated. Catch-up rows may carry earlier dates.
    pub summary_date: NaiveDate,

    pub summaries: Vec<DailySummary>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 5, 0).unwrap()
    }

    #[test]
    fn test_wire_shape_has_type_and_timestamp() {
        let msg = SiteMessage::Heartbeat(HeartbeatMessage {
            timestamp: at(),
            uptime_secs: 3600,
            state: OperatingState::Idle,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["timestamp"], "2024-06-01T10:05:00Z");
        assert_eq!(value["uptimeSecs"], 3600);
        assert_eq!(value["state"], "IDLE");

        let msg = SiteMessage::RequestStart(DemandMessage { timestamp: at() });
        assert_eq!(serde_json::to_value(&msg).unwrap()["type"], "request-start");
    }

    #[test]
    fn test_decode_command_from_json() {
        let raw = json!({
            "type": "command",
            "timestamp": "2024-06-01T10:05:00Z",
            "commandId": "c-1",
            "command": "start",
            "detail": {"programId": "p1"},
            "issuedBy": "user-7"
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        let msg = SiteMessage::decode(Topic::Command, &bytes).unwrap();
        match msg {
            SiteMessage::Command(cmd) => {
                assert_eq!(cmd.command, "start");
                assert_eq!(cmd.detail["programId"], "p1");
                assert_eq!(cmd.issued_by.as_deref(), Some("user-7"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_mismatched_topic() {
        let msg = SiteMessage::RequestStop(DemandMessage { timestamp: at() });
        let bytes = msg.encode().unwrap();
        let err = SiteMessage::decode(Topic::RequestStart, &bytes).unwrap_err();
        assert!(matches!(err, BridgeError::TopicMismatch { .. }));

        assert!(SiteMessage::decode(Topic::Alarm, b"not json").is_err());
    }

    #[test]
    fn test_data_strips_type_tag() {
        let msg = SiteMessage::Alarm(AlarmMessage {
            timestamp: at(),
            alarm_type: "LOW_PRESSURE".to_string(),
            message: "pressure below 0.8 bar".to_string(),
            resolved_at: None,
        });
        let data = msg.data();
        assert!(data.get("type").is_none());
        assert_eq!(data["alarmType"], "LOW_PRESSURE");
        assert!(data.get("resolvedAt").is_none());
        assert_eq!(msg.timestamp(), at());
        assert_eq!(msg.topic(), Topic::Alarm);
    }
}
