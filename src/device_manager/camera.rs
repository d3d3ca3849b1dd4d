use super::capabilities::{ladders_for, Resolution, FRAME_RATE_FLOOR};
use super::media::{FacingMode, MediaConstraints, MediaDeviceInfo, MediaStream, MediaTrack, TrackCapabilities, TrackSettings};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// How the camera is attached, guessed from its label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMedium {
    Usb,
    BuiltIn,
    Wifi,
    Bluetooth,
    Unknown,
}

impl ConnectionMedium {
    pub fn from_label(label: &str) -> Self {
        let label = label.to_lowercase();
        if label.contains("usb") {
            ConnectionMedium::Usb
        } else if label.contains("bluetooth") {
            ConnectionMedium::Bluetooth
        } else if label.contains("wifi") || label.contains("wi-fi") || label.contains("wireless") || label.contains("ip camera") {
            ConnectionMedium::Wifi
        } else if label.contains("integrated")
            || label.contains("built-in")
            || label.contains("facetime")
            || label.contains("internal")
        {
            ConnectionMedium::BuiltIn
        } else {
            ConnectionMedium::Unknown
        }
    }
}

/// Per-device lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    Available,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl Display for CameraStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A discovered capture device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraDevice {
    pub device_id: String,
    pub label: String,
    pub capabilities: Option<TrackCapabilities>,
    /// Best first
    pub resolutions: Vec<Resolution>,
    /// Highest first
    pub frame_rates: Vec<u32>,
    pub facing_mode: Option<FacingMode>,
    pub medium: ConnectionMedium,
}

impl CameraDevice {
    pub fn new(info: &MediaDeviceInfo, capabilities: Option<TrackCapabilities>) -> Self {
        let capabilities = capabilities.filter(|c| !c.is_empty());
        let (resolutions, frame_rates) = ladders_for(capabilities.as_ref());
        let facing_mode = capabilities
            .as_ref()
            .and_then(|c| c.facing_mode.first().copied());
        let label = if info.label.is_empty() {
            format!("Camera {}", short_id(&info.device_id))
        } else {
            info.label.clone()
        };

        Self {
            device_id: info.device_id.clone(),
            medium: ConnectionMedium::from_label(&label),
            label,
            capabilities,
            resolutions,
            frame_rates,
            facing_mode,
        }
    }

    pub fn best_resolution(&self) -> Resolution {
        self.resolutions.first().copied().unwrap_or(Resolution::VGA_480)
    }

    pub fn best_frame_rate(&self) -> u32 {
        self.frame_rates.first().copied().unwrap_or(FRAME_RATE_FLOOR)
    }
}

fn short_id(device_id: &str) -> &str {
    let end = device_id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(device_id.len());
    &device_id[..end]
}

/// Caller preferences for a connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub facing_mode: Option<FacingMode>,
}

/// Settings the device actually delivered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NegotiatedSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub aspect_ratio: f64,
}

impl NegotiatedSettings {
    /// Fill gaps in what the track reports with what was requested.
    pub fn from_track(settings: &TrackSettings, requested: &MediaConstraints) -> Self {
        let width = settings
            .width
            .or(requested.width)
            .unwrap_or(Resolution::VGA_480.width);
        let height = settings
            .height
            .or(requested.height)
            .unwrap_or(Resolution::VGA_480.height);
        let frame_rate = settings
            .frame_rate
            .or(requested.frame_rate.map(f64::from))
            .unwrap_or(FRAME_RATE_FLOOR as f64);
        let aspect_ratio = if height == 0 { 0.0 } else { width as f64 / height as f64 };

        Self {
            width,
            height,
            frame_rate,
            aspect_ratio,
        }
    }
}

/// A live connection owned by the camera manager
#[derive(Debug)]
pub struct CameraConnection {
    pub id: Uuid,
    pub device_id: String,
    pub stream: MediaStream,
    pub requested: MediaConstraints,
    pub negotiated: NegotiatedSettings,
    pub created_at: chrono::DateTime<chrono::Utc>,
    active: AtomicBool,
}

impl CameraConnection {
    pub fn new(device_id: &str, stream: MediaStream, requested: MediaConstraints, negotiated: NegotiatedSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            stream,
            requested,
            negotiated,
            created_at: chrono::Utc::now(),
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn video_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.stream.live_video_track()
    }
}
