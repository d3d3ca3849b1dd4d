pub mod camera;
pub mod capabilities;
#[cfg(feature = "gst")]
pub mod gst_media;
pub mod media;

pub use camera::{CameraConnection, CameraDevice, CameraStatus, ConnectOptions, ConnectionMedium, NegotiatedSettings};
pub use capabilities::Resolution;
#[cfg(feature = "gst")]
pub use gst_media::GstMediaDevices;
pub use media::{MediaDevices, MediaError, MediaStream, MediaTrack, UnsupportedMediaDevices};

use std::sync::Arc;

/// The capture backend compiled into this build
pub fn default_media_devices() -> Arc<dyn MediaDevices> {
    #[cfg(feature = "gst")]
    {
        match GstMediaDevices::new() {
            Ok(devices) => return Arc::new(devices),
            Err(e) => log::error!("Camera capture unavailable: {}", e),
        }
    }
    Arc::new(UnsupportedMediaDevices)
}
