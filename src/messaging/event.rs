use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

use crate::device_manager::camera::CameraStatus;

/// Event types carried over the realtime channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A new or updated alert row
    Alert,
    /// Camera status row changes
    CameraStatus,
    /// System log and health notices
    SystemUpdate,
    /// Anything else, keyed by its tag
    Generic(String),
}

impl EventType {
    /// Parse the `type` tag of a push message.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "alert" | "new_alert" => Self::Alert,
            "camera_status" | "camera_update" => Self::CameraStatus,
            "system_update" | "system" => Self::SystemUpdate,
            other => Self::Generic(other.to_string()),
        }
    }

    /// Route a store change-feed envelope by its table name.
    pub fn from_table(table: &str) -> Self {
        match table {
            "alerts" => Self::Alert,
            "cameras" => Self::CameraStatus,
            "logs" => Self::SystemUpdate,
            other => Self::Generic(format!("table.{}", other)),
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alert => write!(f, "alert"),
            Self::CameraStatus => write!(f, "camera_status"),
            Self::SystemUpdate => write!(f, "system_update"),
            Self::Generic(name) => write!(f, "{}", name),
        }
    }
}

/// Row operation reported by the store change feed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Event message structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique event ID
    pub id: Uuid,
    /// Event type
    pub event_type: EventType,
    /// Row operation when the message came from the change feed
    pub change: Option<ChangeKind>,
    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Event data payload
    pub payload: serde_json::Value,
}

impl EventMessage {
    /// Create a new event message
    pub fn new<T: Serialize>(event_type: EventType, payload: T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type,
            change: None,
            timestamp: chrono::Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode a raw push frame.
    ///
    /// Two shapes are understood: tagged messages `{type, payload}` and store
    /// change-feed envelopes `{table, type: INSERT|UPDATE|DELETE, record}`.
    pub fn from_wire(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        if let Some(table) = value.get("table").and_then(|t| t.as_str()) {
            let change = value
                .get("type")
                .cloned()
                .map(serde_json::from_value::<ChangeKind>)
                .transpose()?;
            let payload = value
                .get("record")
                .or_else(|| value.get("old_record"))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            return Ok(Self {
                id: Uuid::new_v4(),
                event_type: EventType::from_table(table),
                change,
                timestamp: chrono::Utc::now(),
                payload,
            });
        }

        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("generic")
            .to_string();
        let timestamp = value
            .get("timestamp")
            .and_then(|t| t.as_str())
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);
        let payload = value
            .get("payload")
            .or_else(|| value.get("data"))
            .cloned()
            .unwrap_or(value);

        Ok(Self {
            id: Uuid::new_v4(),
            event_type: EventType::from_tag(&tag),
            change: None,
            timestamp,
            payload,
        })
    }
}

/// Published by the camera manager on every per-device status transition
#[derive(Debug, Clone, PartialEq)]
pub struct CameraStatusChange {
    pub device_id: String,
    pub previous: Option<CameraStatus>,
    pub status: CameraStatus,
    pub reason: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl CameraStatusChange {
    pub fn new(
        device_id: impl Into<String>,
        previous: Option<CameraStatus>,
        status: CameraStatus,
        reason: Option<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            previous,
            status,
            reason,
            timestamp: chrono::Utc::now(),
        }
    }
}
