use super::media::TrackCapabilities;
use serde::Serialize;

/// A resolution offered to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub label: &'static str,
}

impl Resolution {
    pub const UHD_4K: Resolution = Resolution { width: 3840, height: 2160, label: "4K" };
    pub const QHD_1440: Resolution = Resolution { width: 2560, height: 1440, label: "1440p" };
    pub const FHD_1080: Resolution = Resolution { width: 1920, height: 1080, label: "1080p" };
    pub const HD_720: Resolution = Resolution { width: 1280, height: 720, label: "720p" };
    pub const VGA_480: Resolution = Resolution { width: 640, height: 480, label: "480p" };

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

/// Floor frame rate every camera is assumed to manage
pub const FRAME_RATE_FLOOR: u32 = 15;

const GATED_RESOLUTIONS: [Resolution; 4] = [
    Resolution::UHD_4K,
    Resolution::QHD_1440,
    Resolution::FHD_1080,
    Resolution::HD_720,
];

const GATED_FRAME_RATES: [u32; 3] = [60, 30, 24];

/// Offerable resolutions, best first. 480p is always present.
pub fn resolution_ladder(max_width: Option<u32>) -> Vec<Resolution> {
    let max_width = max_width.unwrap_or(0);
    let mut ladder: Vec<Resolution> = GATED_RESOLUTIONS
        .iter()
        .copied()
        .filter(|r| max_width >= r.width)
        .collect();
    ladder.push(Resolution::VGA_480);
    ladder
}

/// Offerable frame rates, highest first. 15 fps is always present.
pub fn frame_rate_ladder(max_frame_rate: Option<f64>) -> Vec<u32> {
    let max = max_frame_rate.unwrap_or(0.0);
    let mut ladder: Vec<u32> = GATED_FRAME_RATES
        .iter()
        .copied()
        .filter(|fps| max >= *fps as f64)
        .collect();
    ladder.push(FRAME_RATE_FLOOR);
    ladder
}

pub fn ladders_for(capabilities: Option<&TrackCapabilities>) -> (Vec<Resolution>, Vec<u32>) {
    let max_width = capabilities.and_then(|c| c.width).map(|w| w.max);
    let max_fps = capabilities.and_then(|c| c.frame_rate).map(|f| f.max);
    (resolution_ladder(max_width), frame_rate_ladder(max_fps))
}
