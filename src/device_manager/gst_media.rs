use super::media::{
    EndedCallback, MediaConstraints, MediaDeviceInfo, MediaDeviceKind, MediaDevices, MediaError, MediaStream,
    MediaTrack, TrackCapabilities, TrackKind, TrackSettings, TrackState, ValueRange, VideoFrame,
};
use async_trait::async_trait;
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEVICE_CLASS: &str = "Video/Source";
const PATH_PROPERTIES: [&str; 3] = ["device.path", "api.v4l2.path", "object.path"];
const STATE_TIMEOUT_SECS: u64 = 5;
const FRAME_TIMEOUT_MS: u64 = 2000;
const BUS_POLL_MS: u64 = 250;

/// Stable identifier for a GStreamer device
fn device_id(device: &gst::Device) -> String {
    device
        .properties()
        .and_then(|props| {
            PATH_PROPERTIES
                .iter()
                .find_map(|key| props.get::<String>(*key).ok())
        })
        .unwrap_or_else(|| device.display_name().to_string())
}

fn frame_rate_of(fraction: gst::Fraction) -> f64 {
    if fraction.denom() == 0 {
        0.0
    } else {
        fraction.numer() as f64 / fraction.denom() as f64
    }
}

fn widen<T: PartialOrd + Copy>(range: &mut Option<ValueRange<T>>, min: T, max: T) {
    match range {
        Some(r) => {
            if min < r.min {
                r.min = min;
            }
            if max > r.max {
                r.max = max;
            }
        }
        None => *range = Some(ValueRange { min, max }),
    }
}

fn int_bounds(s: &gst::StructureRef, field: &str) -> Option<(u32, u32)> {
    if let Ok(v) = s.get::<i32>(field) {
        return Some((v.max(0) as u32, v.max(0) as u32));
    }
    s.get::<gst::IntRange<i32>>(field)
        .ok()
        .map(|r| (r.min().max(0) as u32, r.max().max(0) as u32))
}

fn rate_bounds(s: &gst::StructureRef) -> Option<(f64, f64)> {
    if let Ok(f) = s.get::<gst::Fraction>("framerate") {
        let rate = frame_rate_of(f);
        return Some((rate, rate));
    }
    if let Ok(r) = s.get::<gst::FractionRange>("framerate") {
        return Some((frame_rate_of(r.min()), frame_rate_of(r.max())));
    }
    if let Ok(list) = s.get::<gst::List>("framerate") {
        let rates: Vec<f64> = list
            .iter()
            .filter_map(|v| v.get::<gst::Fraction>().ok())
            .map(frame_rate_of)
            .collect();
        let min = rates.iter().copied().fold(f64::INFINITY, f64::min);
        let max = rates.iter().copied().fold(0.0, f64::max);
        if !rates.is_empty() {
            return Some((min, max));
        }
    }
    None
}

/// Capability envelope from the caps a device advertises
fn capabilities_from_caps(caps: &gst::Caps) -> TrackCapabilities {
    let mut capabilities = TrackCapabilities::default();
    for s in caps.iter() {
        if let Some((min, max)) = int_bounds(s, "width") {
            widen(&mut capabilities.width, min, max);
        }
        if let Some((min, max)) = int_bounds(s, "height") {
            widen(&mut capabilities.height, min, max);
        }
        if let Some((min, max)) = rate_bounds(s) {
            widen(&mut capabilities.frame_rate, min, max);
        }
    }
    capabilities
}

/// Native mode nearest to the requested size.
///
/// Requested dimensions are ideals: each advertised structure is clamped to
/// them and the closest one wins, so the opened size may differ.
fn closest_native_size(caps: &gst::Caps, width: Option<u32>, height: Option<u32>) -> (Option<u32>, Option<u32>) {
    if width.is_none() && height.is_none() {
        return (None, None);
    }
    let mut best: Option<(u32, Option<u32>, Option<u32>)> = None;
    for s in caps.iter() {
        let w = width.zip(int_bounds(s, "width")).map(|(want, (min, max))| want.clamp(min, max));
        let h = height.zip(int_bounds(s, "height")).map(|(want, (min, max))| want.clamp(min, max));
        let distance = w.zip(width).map_or(0, |(got, want)| got.abs_diff(want))
            + h.zip(height).map_or(0, |(got, want)| got.abs_diff(want));
        if best.map_or(true, |(d, _, _)| distance < d) {
            best = Some((distance, w, h));
        }
    }
    best.map_or((width, height), |(_, w, h)| (w, h))
}

fn map_gst_failure(context: &str, detail: &str) -> MediaError {
    let lowered = detail.to_lowercase();
    if lowered.contains("permission") || lowered.contains("not authorized") {
        MediaError::NotAllowed(format!("{}: {}", context, detail))
    } else if lowered.contains("busy") || lowered.contains("resource") {
        MediaError::NotReadable(format!("{}: {}", context, detail))
    } else if lowered.contains("not-negotiated") || lowered.contains("negotiat") {
        MediaError::Overconstrained(format!("{}: {}", context, detail))
    } else {
        MediaError::Other(format!("{}: {}", context, detail))
    }
}

struct TrackShared {
    stopped: AtomicBool,
    ended: AtomicBool,
    callbacks: Mutex<Vec<EndedCallback>>,
}

impl TrackShared {
    fn fire_ended(&self) {
        if self.stopped.load(Ordering::SeqCst) || self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner));
        for callback in callbacks {
            callback();
        }
    }
}

/// Video track backed by a `device source ! native mode ! convert ! appsink` pipeline
struct GstTrack {
    id: String,
    label: String,
    device_id: String,
    pipeline: gst::Pipeline,
    sink: gst_app::AppSink,
    capabilities: TrackCapabilities,
    shared: Arc<TrackShared>,
}

impl GstTrack {
    fn open(device: &gst::Device, constraints: &MediaConstraints) -> Result<Self, MediaError> {
        let id = Uuid::new_v4().to_string();
        let device_id = device_id(device);
        let build_err = |e: gst::glib::BoolError| MediaError::Other(format!("Failed to build pipeline: {}", e));

        let pipeline = gst::Pipeline::builder().name(format!("capture-{}", id)).build();
        let source = device
            .create_element(None)
            .map_err(|e| MediaError::NotReadable(format!("{}: {}", device_id, e)))?;
        let convert = gst::ElementFactory::make("videoconvert").build().map_err(build_err)?;

        // no scaler or rate converter: settings report what the device delivers
        let (width, height) = match device.caps() {
            Some(native) => closest_native_size(&native, constraints.width, constraints.height),
            None => (constraints.width, constraints.height),
        };
        let mut mode = gst::Caps::builder("video/x-raw");
        if let Some(width) = width {
            mode = mode.field("width", width as i32);
        }
        if let Some(height) = height {
            mode = mode.field("height", height as i32);
        }
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", mode.build())
            .build()
            .map_err(build_err)?;

        let sink = gst_app::AppSink::builder()
            .name(format!("frames-{}", id))
            .caps(&gst::Caps::builder("video/x-raw").field("format", "RGBA").build())
            .max_buffers(1)
            .drop(true)
            .sync(false)
            .build();

        pipeline
            .add_many([&source, &capsfilter, &convert, sink.upcast_ref()])
            .map_err(build_err)?;
        gst::Element::link_many([&source, &capsfilter, &convert, sink.upcast_ref()])
            .map_err(build_err)?;

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(map_gst_failure(&device_id, &Self::bus_error(&pipeline).unwrap_or_else(|| e.to_string())));
        }
        let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(STATE_TIMEOUT_SECS));
        if let Err(e) = result {
            let detail = Self::bus_error(&pipeline).unwrap_or_else(|| e.to_string());
            let _ = pipeline.set_state(gst::State::Null);
            return Err(map_gst_failure(&device_id, &detail));
        }

        let capabilities = device
            .caps()
            .map(|caps| capabilities_from_caps(&caps))
            .unwrap_or_default();

        let track = Self {
            id,
            label: device.display_name().to_string(),
            device_id,
            pipeline,
            sink,
            capabilities,
            shared: Arc::new(TrackShared {
                stopped: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        };
        track.watch_bus();
        debug!("Opened capture pipeline for {}", track.device_id);
        Ok(track)
    }

    fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
        let bus = pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        }
    }

    /// Fire the ended callbacks on EOS or error, until the track is stopped.
    fn watch_bus(&self) {
        let Some(bus) = self.pipeline.bus() else {
            warn!("Pipeline for {} has no bus; unplug will go unnoticed", self.device_id);
            return;
        };
        let shared = self.shared.clone();
        let device_id = self.device_id.clone();

        std::thread::spawn(move || loop {
            if shared.stopped.load(Ordering::SeqCst) {
                break;
            }
            let msg = bus.timed_pop_filtered(
                gst::ClockTime::from_mseconds(BUS_POLL_MS),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
            if let Some(msg) = msg {
                match msg.view() {
                    gst::MessageView::Error(err) => {
                        warn!("Capture error on {}: {}", device_id, err.error());
                    }
                    _ => info!("Capture stream ended on {}", device_id),
                }
                shared.fire_ended();
                break;
            }
        });
    }

    fn current_settings(&self) -> TrackSettings {
        let info = self
            .sink
            .static_pad("sink")
            .and_then(|pad| pad.current_caps())
            .and_then(|caps| gst_video::VideoInfo::from_caps(&caps).ok());

        TrackSettings {
            width: info.as_ref().map(|i| i.width()),
            height: info.as_ref().map(|i| i.height()),
            frame_rate: info.as_ref().map(|i| frame_rate_of(i.fps())).filter(|r| *r > 0.0),
            facing_mode: None,
            device_id: Some(self.device_id.clone()),
        }
    }
}

#[async_trait]
impl MediaTrack for GstTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> TrackState {
        if self.shared.ended.load(Ordering::SeqCst) || self.shared.stopped.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn capabilities(&self) -> TrackCapabilities {
        self.capabilities.clone()
    }

    fn settings(&self) -> TrackSettings {
        self.current_settings()
    }

    fn stop(&self) -> Result<(), MediaError> {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| MediaError::Other(format!("Failed to stop {}: {}", self.device_id, e)))?;
        debug!("Stopped capture pipeline for {}", self.device_id);
        Ok(())
    }

    fn on_ended(&self, callback: EndedCallback) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    async fn capture_frame(&self) -> Result<VideoFrame, MediaError> {
        if self.state() == TrackState::Ended {
            return Err(MediaError::NotReadable(format!("{} has ended", self.device_id)));
        }
        let sink = self.sink.clone();
        let device_id = self.device_id.clone();

        tokio::task::spawn_blocking(move || {
            let sample = sink
                .try_pull_sample(gst::ClockTime::from_mseconds(FRAME_TIMEOUT_MS))
                .ok_or_else(|| MediaError::NotReadable(format!("No frame from {}", device_id)))?;
            let caps = sample
                .caps()
                .ok_or_else(|| MediaError::Other("Sample without caps".to_string()))?;
            let info = gst_video::VideoInfo::from_caps(caps)
                .map_err(|e| MediaError::Other(format!("Unreadable frame caps: {}", e)))?;
            let buffer = sample
                .buffer()
                .ok_or_else(|| MediaError::Other("Sample without buffer".to_string()))?;
            let map = buffer
                .map_readable()
                .map_err(|e| MediaError::Other(format!("Failed to map buffer: {}", e)))?;

            Ok(VideoFrame {
                width: info.width(),
                height: info.height(),
                data: map.as_slice().to_vec(),
                captured_at: chrono::Utc::now(),
            })
        })
        .await
        .map_err(|e| MediaError::Other(format!("Frame capture task failed: {}", e)))?
    }
}

impl Drop for GstTrack {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Capture backend over the GStreamer device monitor
pub struct GstMediaDevices {
    monitor: gst::DeviceMonitor,
    devices: Mutex<HashMap<String, gst::Device>>,
}

impl GstMediaDevices {
    pub fn new() -> Result<Self, MediaError> {
        gst::init().map_err(|e| MediaError::NotSupported(format!("GStreamer init failed: {}", e)))?;

        let monitor = gst::DeviceMonitor::new();
        monitor.add_filter(Some(DEVICE_CLASS), None);
        monitor
            .start()
            .map_err(|e| MediaError::NotSupported(format!("Device monitor failed to start: {}", e)))?;
        info!("GStreamer device monitor started");

        Ok(Self {
            monitor,
            devices: Mutex::new(HashMap::new()),
        })
    }

    fn refresh(&self) -> Vec<(String, gst::Device)> {
        let found: Vec<(String, gst::Device)> = self
            .monitor
            .devices()
            .into_iter()
            .map(|device| (device_id(&device), device))
            .collect();

        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices.clear();
        for (id, device) in &found {
            devices.insert(id.clone(), device.clone());
        }
        found
    }

    fn find(&self, constraints: &MediaConstraints) -> Result<gst::Device, MediaError> {
        let lookup = |id: &str| {
            self.devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(id)
                .cloned()
        };

        match constraints.device_id.as_deref() {
            Some(id) => lookup(id)
                .or_else(|| {
                    self.refresh();
                    lookup(id)
                })
                .ok_or_else(|| MediaError::NotFound(format!("No camera with id {}", id))),
            None => self
                .refresh()
                .into_iter()
                .next()
                .map(|(_, device)| device)
                .ok_or_else(|| MediaError::NotFound("No video capture devices".to_string())),
        }
    }
}

impl Drop for GstMediaDevices {
    fn drop(&mut self) {
        self.monitor.stop();
    }
}

#[async_trait]
impl MediaDevices for GstMediaDevices {
    fn is_supported(&self) -> bool {
        true
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        Ok(self
            .refresh()
            .into_iter()
            .map(|(device_id, device)| MediaDeviceInfo {
                device_id,
                label: device.display_name().to_string(),
                kind: MediaDeviceKind::VideoInput,
            })
            .collect())
    }

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        let device = self.find(constraints)?;
        let constraints = constraints.clone();

        let track = tokio::task::spawn_blocking(move || GstTrack::open(&device, &constraints))
            .await
            .map_err(|e| MediaError::Other(format!("Pipeline setup task failed: {}", e)))??;

        let stream_id = format!("stream-{}", track.id);
        let track: Arc<dyn MediaTrack> = Arc::new(track);
        Ok(MediaStream::new(stream_id, vec![track]))
    }

    fn device_changes(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        let bus = self.monitor.bus();
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || loop {
            if tx.is_closed() {
                break;
            }
            let msg = bus.timed_pop_filtered(
                gst::ClockTime::from_mseconds(BUS_POLL_MS),
                &[gst::MessageType::DeviceAdded, gst::MessageType::DeviceRemoved],
            );
            if msg.is_some() && tx.send(()).is_err() {
                break;
            }
        });

        Some(rx)
    }
}
