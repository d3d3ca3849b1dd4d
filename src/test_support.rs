//! Scripted collaborators shared by unit tests.

use crate::backend::realtime::{RealtimeConnection, RealtimeConnector};
use crate::backend::{HttpRequest, HttpResponse, HttpTransport};
use crate::db::models::{Alert, AlertType};
use crate::device_manager::camera::CameraConnection;
use crate::device_manager::media::{
    EndedCallback, MediaConstraints, MediaDeviceInfo, MediaDeviceKind, MediaDevices, MediaError, MediaStream,
    MediaTrack, TrackCapabilities, TrackKind, TrackSettings, TrackState, VideoFrame,
};
use crate::error::{Error, Result};
use crate::inference::{Classifier, InferenceResult};
use crate::services::{AlertSink, NotificationOutcome, Notifier};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Replays queued responses, then a repeating one, then network errors.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    repeating: Mutex<Option<Result<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<HttpResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeating: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(response: Result<HttpResponse>) -> Self {
        let transport = Self::new(Vec::new());
        transport.set_repeating(response);
        transport
    }

    pub fn set_repeating(&self, response: Result<HttpResponse>) {
        *self.repeating.lock().unwrap() = Some(response);
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        self.repeating
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(Error::Network("script exhausted".into())))
    }
}

/// One scripted realtime connect attempt
pub enum ScriptedSession {
    Fail,
    /// Deliver these frames, then the peer closes
    Messages(Vec<String>),
}

impl ScriptedSession {
    pub fn messages(frames: Vec<&str>) -> Self {
        ScriptedSession::Messages(frames.into_iter().map(str::to_string).collect())
    }
}

/// Plays scripted sessions in order; once exhausted every connect fails.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<ScriptedSession>>,
    calls: AtomicUsize,
    tokens: Mutex<Vec<Option<String>>>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<ScriptedSession>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn connect_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }
}

struct ScriptedConnection {
    frames: VecDeque<String>,
}

#[async_trait]
impl RealtimeConnection for ScriptedConnection {
    async fn next_message(&mut self) -> Option<Result<String>> {
        self.frames.pop_front().map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RealtimeConnector for ScriptedConnector {
    async fn connect(&self, token: Option<&str>) -> Result<Box<dyn RealtimeConnection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.map(str::to_string));
        match self.script.lock().unwrap().pop_front() {
            Some(ScriptedSession::Messages(frames)) => Ok(Box::new(ScriptedConnection {
                frames: frames.into(),
            })),
            Some(ScriptedSession::Fail) | None => Err(Error::Realtime("connection refused".into())),
        }
    }
}

/// In-memory track; `end` simulates an unplug
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    capabilities: TrackCapabilities,
    settings: TrackSettings,
    ended: AtomicBool,
    stop_calls: AtomicUsize,
    fail_stop: AtomicBool,
    end_on_settings: AtomicBool,
    captures: AtomicUsize,
    callbacks: Mutex<Vec<EndedCallback>>,
}

impl FakeTrack {
    fn build(id: &str, kind: TrackKind, capabilities: TrackCapabilities, settings: TrackSettings) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            capabilities,
            settings,
            ended: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
            fail_stop: AtomicBool::new(false),
            end_on_settings: AtomicBool::new(false),
            captures: AtomicUsize::new(0),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn live(id: &str) -> Arc<Self> {
        let settings = TrackSettings {
            width: Some(640),
            height: Some(480),
            frame_rate: Some(30.0),
            ..TrackSettings::default()
        };
        Self::build(id, TrackKind::Video, TrackCapabilities::default(), settings)
    }

    /// End the track as the device would, firing ended callbacks
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
        for callback in &callbacks {
            callback();
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn fail_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }

    /// Frames requested, including ones refused after the track ended
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn label(&self) -> String {
        format!("fake {}", self.id)
    }

    fn state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn capabilities(&self) -> TrackCapabilities {
        self.capabilities.clone()
    }

    fn settings(&self) -> TrackSettings {
        if self.end_on_settings.swap(false, Ordering::SeqCst) {
            self.end();
        }
        self.settings.clone()
    }

    fn stop(&self) -> std::result::Result<(), MediaError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.ended.store(true, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(MediaError::Other("device wedged".into()));
        }
        Ok(())
    }

    fn on_ended(&self, callback: EndedCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    async fn capture_frame(&self) -> std::result::Result<VideoFrame, MediaError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.ended.load(Ordering::SeqCst) {
            return Err(MediaError::NotReadable("track ended".into()));
        }
        Ok(VideoFrame {
            width: self.settings.width.unwrap_or(640),
            height: self.settings.height.unwrap_or(480),
            data: vec![0; 16],
            captured_at: chrono::Utc::now(),
        })
    }
}

pub fn stream_of(track: &Arc<FakeTrack>) -> MediaStream {
    let track: Arc<dyn MediaTrack> = track.clone();
    MediaStream::new(format!("stream-{}", track.id()), vec![track])
}

#[derive(Default)]
struct FakeMediaState {
    devices: Vec<(MediaDeviceInfo, TrackCapabilities)>,
    next_error: Option<MediaError>,
    next_without_video: bool,
    end_next_on_settings: bool,
    opened: Vec<Arc<FakeTrack>>,
    enumerate_calls: usize,
    change_tx: Option<mpsc::UnboundedSender<()>>,
}

/// Scriptable capture backend
pub struct FakeMediaDevices {
    supported: bool,
    hotplug: bool,
    state: Mutex<FakeMediaState>,
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self {
            supported: true,
            hotplug: true,
            state: Mutex::new(FakeMediaState::default()),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    pub fn without_hotplug() -> Self {
        Self {
            hotplug: false,
            ..Self::new()
        }
    }

    pub fn add_device(&self, id: &str, label: &str, capabilities: TrackCapabilities) {
        let info = MediaDeviceInfo {
            device_id: id.to_string(),
            label: label.to_string(),
            kind: MediaDeviceKind::VideoInput,
        };
        self.state.lock().unwrap().devices.push((info, capabilities));
    }

    pub fn remove_device(&self, id: &str) {
        self.state.lock().unwrap().devices.retain(|(info, _)| info.device_id != id);
    }

    pub fn fail_next_open(&self, error: MediaError) {
        self.state.lock().unwrap().next_error = Some(error);
    }

    /// The next stream carries only an audio track
    pub fn next_open_without_video(&self) {
        self.state.lock().unwrap().next_without_video = true;
    }

    /// The next track ends as soon as its settings are read
    pub fn end_next_track_on_settings(&self) {
        self.state.lock().unwrap().end_next_on_settings = true;
    }

    pub fn opened_tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn track_for(&self, connection: &CameraConnection) -> Option<Arc<FakeTrack>> {
        let state = self.state.lock().unwrap();
        connection
            .stream
            .tracks()
            .iter()
            .find_map(|t| state.opened.iter().find(|f| f.id == t.id()).cloned())
    }

    pub fn enumerate_calls(&self) -> usize {
        self.state.lock().unwrap().enumerate_calls
    }

    pub fn notify_change(&self) {
        if let Some(tx) = &self.state.lock().unwrap().change_tx {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn enumerate_devices(&self) -> std::result::Result<Vec<MediaDeviceInfo>, MediaError> {
        let mut state = self.state.lock().unwrap();
        state.enumerate_calls += 1;
        Ok(state.devices.iter().map(|(info, _)| info.clone()).collect())
    }

    async fn get_user_media(&self, constraints: &MediaConstraints) -> std::result::Result<MediaStream, MediaError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.next_error.take() {
            return Err(err);
        }

        let (info, capabilities) = match &constraints.device_id {
            Some(id) => state
                .devices
                .iter()
                .find(|(info, _)| &info.device_id == id)
                .cloned()
                .ok_or_else(|| MediaError::NotFound(id.clone()))?,
            None => state
                .devices
                .first()
                .cloned()
                .ok_or_else(|| MediaError::NotFound("no video input".into()))?,
        };

        let settings = TrackSettings {
            width: constraints
                .width
                .or(capabilities.width.map(|w| w.max))
                .or(Some(640)),
            height: constraints
                .height
                .or(capabilities.height.map(|h| h.max))
                .or(Some(480)),
            frame_rate: constraints
                .frame_rate
                .map(f64::from)
                .or(capabilities.frame_rate.map(|f| f.max))
                .or(Some(30.0)),
            facing_mode: constraints.facing_mode,
            device_id: Some(info.device_id.clone()),
        };
        let kind = if std::mem::take(&mut state.next_without_video) {
            TrackKind::Audio
        } else {
            TrackKind::Video
        };

        let track_id = format!("track-{}", state.opened.len() + 1);
        let track = FakeTrack::build(&track_id, kind, capabilities, settings);
        if std::mem::take(&mut state.end_next_on_settings) {
            track.end_on_settings.store(true, Ordering::SeqCst);
        }
        state.opened.push(track.clone());

        let track: Arc<dyn MediaTrack> = track;
        Ok(MediaStream::new(format!("stream-{}", track_id), vec![track]))
    }

    fn device_changes(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        if !self.hotplug {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().change_tx = Some(tx);
        Some(rx)
    }
}

/// Returns the same result on every call
pub struct FakeClassifier {
    result: InferenceResult,
    delay: Option<Duration>,
    fail_first: usize,
    calls: AtomicUsize,
}

impl FakeClassifier {
    pub fn new(result: InferenceResult) -> Self {
        Self {
            result,
            delay: None,
            fail_first: 0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_first(mut self, calls: usize) -> Self {
        self.fail_first = calls;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    fn name(&self) -> &str {
        "fake"
    }

    async fn classify(&self, _frame: &VideoFrame, _camera_id: &str) -> Result<InferenceResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call < self.fail_first {
            return Err(Error::Inference("model unavailable".into()));
        }
        Ok(self.result.clone())
    }
}

/// Records alerts, failing for chosen types
#[derive(Default)]
pub struct FakeSink {
    recorded: Mutex<Vec<Alert>>,
    failing: Mutex<HashSet<AlertType>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_type(&self, alert_type: AlertType) {
        self.failing.lock().unwrap().insert(alert_type);
    }

    pub fn recorded(&self) -> Vec<Alert> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for FakeSink {
    async fn record(&self, alert: Alert) -> Result<Alert> {
        if self.failing.lock().unwrap().contains(&alert.alert_type) {
            return Err(Error::ServiceUnavailable("store down".into()));
        }
        self.recorded.lock().unwrap().push(alert.clone());
        Ok(alert)
    }
}

/// Records which alerts it was asked about
pub struct FakeNotifier {
    fail: bool,
    notified: Mutex<Vec<uuid::Uuid>>,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self {
            fail: false,
            notified: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn notified(&self) -> Vec<uuid::Uuid> {
        self.notified.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, alert: &Alert) -> Result<NotificationOutcome> {
        self.notified.lock().unwrap().push(alert.id);
        if self.fail {
            return Err(Error::Notification("gateway unreachable".into()));
        }
        Ok(NotificationOutcome {
            sms_sent: 1,
            ..NotificationOutcome::default()
        })
    }
}
