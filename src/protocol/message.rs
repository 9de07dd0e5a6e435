use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scheduler::task::ResultPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // master -> worker
    TaskRequest,
    ResourceRequest,
    Heartbeat,
    Disconnect,
    AuthChallenge,
    // worker -> master
    TaskResult,
    ResourceData,
    HeartbeatResponse,
    Ready,
    Error,
    ProgressUpdate,
    AuthResponse,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::TaskRequest,
        MessageType::ResourceRequest,
        MessageType::Heartbeat,
        MessageType::Disconnect,
        MessageType::AuthChallenge,
        MessageType::TaskResult,
        MessageType::ResourceData,
        MessageType::HeartbeatResponse,
        MessageType::Ready,
        MessageType::Error,
        MessageType::ProgressUpdate,
        MessageType::AuthResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "task_request",
            MessageType::ResourceRequest => "resource_request",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Disconnect => "disconnect",
            MessageType::AuthChallenge => "auth_challenge",
            MessageType::TaskResult => "task_result",
            MessageType::ResourceData => "resource_data",
            MessageType::HeartbeatResponse => "heartbeat_response",
            MessageType::Ready => "ready",
            MessageType::Error => "error",
            MessageType::ProgressUpdate => "progress_update",
            MessageType::AuthResponse => "auth_response",
        }
    }

    /// Messages accepted before the session is authenticated.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageType::AuthChallenge | MessageType::AuthResponse | MessageType::Disconnect
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Unix seconds.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn into_object(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        Value::Null => Some(Map::new()),
        _ => None,
    }
}

impl Message {
    pub fn new(kind: MessageType, data: Map<String, Value>) -> Self {
        Self {
            kind,
            data,
            timestamp: now_secs(),
            encrypted: None,
        }
    }

    /// Message with no payload.
    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Map::new())
    }

    /// Build a message from a typed payload, which must serialize to an object.
    pub fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(payload)?;
        let data = into_object(value).ok_or_else(|| {
            <serde_json::Error as serde::ser::Error>::custom("message payload must be a JSON object")
        })?;
        Ok(Self::new(kind, data))
    }

    /// Decode the data map as a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn from_slice(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }

    pub fn auth_challenge(challenge: &str) -> Self {
        Self::payload_message(MessageType::AuthChallenge, serde_json::json!({ "challenge": challenge }))
    }

    pub fn auth_response(response: &str) -> Self {
        Self::payload_message(MessageType::AuthResponse, serde_json::json!({ "response": response }))
    }

    pub fn disconnect(reason: &str) -> Self {
        Self::payload_message(MessageType::Disconnect, serde_json::json!({ "reason": reason }))
    }

    pub fn progress(task_id: &str, progress: u8) -> Self {
        Self::payload_message(
            MessageType::ProgressUpdate,
            serde_json::json!({ "task_id": task_id, "progress": progress }),
        )
    }

    pub fn error(task_id: Option<&str>, error: &str) -> Self {
        Self::payload_message(
            MessageType::Error,
            serde_json::json!({ "task_id": task_id, "error": error }),
        )
    }

    fn payload_message(kind: MessageType, value: Value) -> Self {
        Self::new(kind, into_object(value).unwrap_or_default())
    }
}

/// `task_request` data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub name: String,
}

/// `progress_update` data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub progress: i64,
}

/// `task_result` data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub result: ResultPayload,
}

/// `ready` data, sent by a worker once authenticated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub worker_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub max_concurrent_tasks: Option<u32>,
}

/// `error` data. `task_id` is absent for errors not tied to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default)]
    pub task_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub response: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::capacity::WorkerTelemetry;
    use serde_json::json;

    #[test]
    fn wire_shape() {
        let msg = Message::auth_challenge("abc");
        let line = msg.to_json().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "auth_challenge");
        assert_eq!(value["data"]["challenge"], "abc");
        assert!(value["timestamp"].as_f64().unwrap() > 1.0e9);
        assert!(value.get("encrypted").is_none());
    }

    #[test]
    fn every_type_survives_the_wire() {
        for kind in MessageType::ALL {
            let mut msg = Message::new(kind, into_object(json!({ "k": [1, "two\nlines"] })).unwrap());
            msg.encrypted = Some(true);
            let line = msg.to_json().unwrap();
            assert!(!line.contains('\n'));
            let back = Message::from_json(&line).unwrap();
            assert_eq!(back.kind, kind);
            assert_eq!(back.data, msg.data);
            assert!((back.timestamp - msg.timestamp).abs() < 1e-6);
            assert_eq!(back.encrypted, Some(true));
            assert_eq!(kind.as_str(), serde_json::to_value(kind).unwrap());
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let line = r#"{"type":"shutdown_now","data":{},"timestamp":1.0}"#;
        assert!(Message::from_json(line).is_err());
    }

    #[test]
    fn typed_payloads() {
        let telemetry = WorkerTelemetry {
            cpu_percent: 12.5,
            memory_available_mb: 2048.0,
            battery_percent: Some(80.0),
            ..Default::default()
        };
        let msg = Message::with_payload(MessageType::ResourceData, &telemetry).unwrap();
        assert_eq!(msg.data["cpu_percent"], json!(12.5));
        assert!(!msg.data.contains_key("active_containers"));
        assert_eq!(msg.payload::<WorkerTelemetry>().unwrap(), telemetry);

        let err = Message::error(Some("t1"), "bad request");
        let report: ErrorReport = err.payload().unwrap();
        assert_eq!(report.task_id.as_deref(), Some("t1"));
        assert_eq!(report.error, "bad request");

        assert!(Message::with_payload(MessageType::Ready, &42).is_err());
    }
}
