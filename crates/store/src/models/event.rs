use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use super::task::TaskStatus;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    StateChange,
    Output,
    Feedback,
    Error,
    System,
}

/// Append-only audit record. Sequence numbers are gapless and strictly
/// increasing per task, starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub sequence: u64,
    pub task_id: Uuid,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn state_change_payload(from: TaskStatus, to: TaskStatus) -> serde_json::Value {
        json!({ "from": from.to_string(), "to": to.to_string() })
    }

    pub fn error_payload(message: &str) -> serde_json::Value {
        json!({ "message": message })
    }

    pub fn system_payload(message: &str) -> serde_json::Value {
        json!({ "message": message })
    }

    pub fn feedback_payload(message: &str) -> serde_json::Value {
        json!({ "message": message })
    }

    pub fn output_payload(result: &str, stop_reason: &str, session_id: &str) -> serde_json::Value {
        json!({
            "result": result,
            "stop_reason": stop_reason,
            "session_id": session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_form() {
        assert_eq!(
            serde_json::to_string(&EventKind::StateChange).unwrap(),
            "\"state_change\""
        );
        assert_eq!("system".parse::<EventKind>().unwrap(), EventKind::System);
    }

    #[test]
    fn test_state_change_payload_carries_both_ends() {
        let payload =
            TaskEvent::state_change_payload(TaskStatus::InProgress, TaskStatus::Waiting);
        assert_eq!(payload["from"], "in_progress");
        assert_eq!(payload["to"], "waiting");
    }
}
