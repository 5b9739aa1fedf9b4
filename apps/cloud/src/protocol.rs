//! Viewer WebSocket messages.
//!
//! ```text
//!  client → server   { "type": "subscribe", "siteId": "...", "token": "..." }
//!                    { "type": "unsubscribe" }
//!
//!  server → client   { "type": "subscribed", "siteId": "..." }
//!                    { "type": "error", "message": "..." }
//!                    { "type": "telemetry" | "status" | "alarm", "siteId": "...", "data": {...} }
//! ```

use serde::{Deserialize, Serialize};

/// Messages a viewer may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe { site_id: String, token: String },
    Unsubscribe,
}

/// Site event kinds relayed to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Telemetry,
    Status,
    Alarm,
}

/// Messages pushed to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Subscribed {
        site_id: String,
    },
    Error {
        message: String,
    },
    Telemetry {
        site_id: String,
        data: serde_json::Value,
    },
    Status {
        site_id: String,
        data: serde_json::Value,
    },
    Alarm {
        site_id: String,
        data: serde_json::Value,
    },
}

impl ServerMessage {
    pub fn push(kind: PushKind, site_id: String, data: serde_json::Value) -> Self {
        match kind {
            PushKind::Telemetry => ServerMessage::Telemetry { site_id, data },
            PushKind::Status => ServerMessage::Status { site_id, data },
            PushKind::Alarm => ServerMessage::Alarm { site_id, data },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","siteId":"s1","token":"t"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                site_id: "s1".to_string(),
                token: "t".to_string()
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"unsubscribe"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unsubscribe);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let push = ServerMessage::push(PushKind::Status, "s1".to_string(), json!({"state": "IDLE"}));
        assert_eq!(
            serde_json::to_value(&push).unwrap(),
            json!({"type": "status", "siteId": "s1", "data": {"state": "IDLE"}})
        );

        let ack = ServerMessage::Subscribed {
            site_id: "s1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "subscribed", "siteId": "s1"})
        );
    }
}
