//! Wire frames exchanged over tenant event channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of server-sent event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionConfirmed,
    SubscriptionConfirmed,
    TaskUpdate,
    QuotaUpdate,
    WorkspaceUpdate,
    Heartbeat,
}

/// Server-sent frame: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventFrame {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Client-sent frame. Unrecognized types deserialize to `Unknown` and are
/// logged and dropped, never interpreted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    HeartbeatResponse,
    SubscribeTask { task_id: String },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_frame_wire_shape() {
        let frame = EventFrame::new(EventKind::QuotaUpdate, json!({"status": "warning"}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "quota_update");
        assert_eq!(value["data"]["status"], "warning");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_client_frame_parsing() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "heartbeat_response"}"#).unwrap();
        assert_eq!(frame, ClientFrame::HeartbeatResponse);

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "subscribe_task", "task_id": "t-1"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::SubscribeTask {
                task_id: "t-1".to_string()
            }
        );
    }

    #[test]
    fn test_unrecognized_client_frame_falls_back() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "totally_new_thing", "extra": 1}"#).unwrap();
        assert_eq!(frame, ClientFrame::Unknown);
    }
}
