use crate::error::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;

/// Failures reported by the media capture layer
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    NotAllowed(String),

    #[error("No matching device: {0}")]
    NotFound(String),

    #[error("Device busy or unreadable: {0}")]
    NotReadable(String),

    #[error("Constraints cannot be satisfied: {0}")]
    Overconstrained(String),

    #[error("Capture not supported: {0}")]
    NotSupported(String),

    #[error("Media error: {0}")]
    Other(String),
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::NotAllowed(msg) => Error::PermissionDenied(msg),
            MediaError::NotFound(msg) => Error::HardwareNotFound(msg),
            MediaError::NotSupported(msg) => Error::UnsupportedEnvironment(msg),
            MediaError::NotReadable(msg) => Error::Camera(format!("Camera is in use or unreadable: {}", msg)),
            MediaError::Overconstrained(msg) => Error::Camera(format!("Requested settings not supported: {}", msg)),
            MediaError::Other(msg) => Error::Camera(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaDeviceKind {
    VideoInput,
    AudioInput,
    Other,
}

/// One entry of a device enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: MediaDeviceKind,
}

/// Which way a camera points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingMode {
    User,
    Environment,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange<T> {
    pub min: T,
    pub max: T,
}

/// Capability envelope a track reports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackCapabilities {
    pub width: Option<ValueRange<u32>>,
    pub height: Option<ValueRange<u32>>,
    pub frame_rate: Option<ValueRange<f64>>,
    pub facing_mode: Vec<FacingMode>,
    pub zoom: bool,
    pub torch: bool,
    pub focus: bool,
}

impl TrackCapabilities {
    pub fn is_empty(&self) -> bool {
        self.width.is_none() && self.height.is_none() && self.frame_rate.is_none()
    }
}

/// Settings actually in effect on a live track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub facing_mode: Option<FacingMode>,
    pub device_id: Option<String>,
}

/// Ideal (non-mandatory) capture constraints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub device_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub facing_mode: Option<FacingMode>,
}

impl MediaConstraints {
    /// Any camera, any settings. Used for the permission probe.
    pub fn any_video() -> Self {
        Self::default()
    }

    pub fn for_device(device_id: &str) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// One captured frame, tightly packed RGBA
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

/// Callback fired once when a track ends on its own
pub type EndedCallback = Box<dyn Fn() + Send + Sync>;

/// A live media track
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    fn label(&self) -> String;
    fn state(&self) -> TrackState;
    fn capabilities(&self) -> TrackCapabilities;
    fn settings(&self) -> TrackSettings;

    /// Release the device. Idempotent; does not fire the ended callbacks.
    fn stop(&self) -> Result<(), MediaError>;

    /// Register a callback for the track ending without `stop` (unplug,
    /// revoked permission, device reclaimed).
    fn on_ended(&self, callback: EndedCallback);

    async fn capture_frame(&self) -> Result<VideoFrame, MediaError>;
}

/// A set of tracks opened together
#[derive(Clone)]
pub struct MediaStream {
    pub id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// First video track that is still live
    pub fn live_video_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.video_tracks()
            .find(|t| t.state() == TrackState::Live)
            .cloned()
    }

    /// Stop every track, continuing past failures.
    pub fn stop_all(&self) -> Vec<MediaError> {
        self.tracks.iter().filter_map(|t| t.stop().err()).collect()
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Media capture collaborator
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Whether this host exposes a capture surface at all
    fn is_supported(&self) -> bool;

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError>;

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;

    /// Hot-plug notifications, or `None` when the backend cannot report them
    fn device_changes(&self) -> Option<mpsc::UnboundedReceiver<()>>;
}

/// Backend for hosts without capture support
#[derive(Debug, Default)]
pub struct UnsupportedMediaDevices;

#[async_trait]
impl MediaDevices for UnsupportedMediaDevices {
    fn is_supported(&self) -> bool {
        false
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        Err(MediaError::NotSupported("no capture backend compiled in".to_string()))
    }

    async fn get_user_media(&self, _constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        Err(MediaError::NotSupported("no capture backend compiled in".to_string()))
    }

    fn device_changes(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_errors_map_to_distinct_variants() {
        assert!(matches!(
            Error::from(MediaError::NotAllowed("user".into())),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            Error::from(MediaError::NotFound("none".into())),
            Error::HardwareNotFound(_)
        ));
        assert!(matches!(
            Error::from(MediaError::NotSupported("headless".into())),
            Error::UnsupportedEnvironment(_)
        ));
        assert!(matches!(
            Error::from(MediaError::NotReadable("busy".into())),
            Error::Camera(_)
        ));
    }
}
