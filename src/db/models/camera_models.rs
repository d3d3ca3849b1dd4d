use crate::device_manager::camera::{CameraConnection, CameraDevice, CameraStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row of the `cameras` table, mirrored from lifecycle status changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub device_id: String,
    pub name: String,
    pub status: CameraStatus,
    #[serde(default)]
    pub resolution: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl CameraRecord {
    pub fn new(device_id: impl Into<String>, name: impl Into<String>, status: CameraStatus) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            status,
            resolution: None,
            last_seen: Utc::now(),
        }
    }

    pub fn from_device(device: &CameraDevice, status: CameraStatus) -> Self {
        Self::new(&device.device_id, &device.label, status)
    }

    /// Attach the negotiated resolution of a live connection
    pub fn with_connection(mut self, connection: &CameraConnection) -> Self {
        self.resolution = Some(format!(
            "{}x{}",
            connection.negotiated.width, connection.negotiated.height
        ));
        self
    }
}
