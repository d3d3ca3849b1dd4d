use super::alert_service::AlertSink;
use super::cooldown::CooldownTracker;
use super::periodic::PeriodicTask;
use crate::config::DetectionConfig;
use crate::db::models::{Alert, AlertType};
use crate::device_manager::media::{MediaStream, MediaTrack};
use crate::error::{Error, Result};
use crate::inference::{AlertCandidate, Classifier};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Observable sampler state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionStatus {
    pub active: bool,
    pub camera_id: Option<String>,
    pub frames_processed: u64,
    pub in_flight: bool,
    pub queue_depth: usize,
    pub skipped_ticks: u64,
    pub alerts_persisted: u64,
    pub alerts_suppressed: u64,
    pub alerts_failed: u64,
    pub inference_errors: u64,
}

enum Step {
    Persist(Alert),
    Suppressed,
    Drained,
}

struct Session {
    id: u64,
    camera_id: String,
    cancel: CancellationToken,
    in_flight: Arc<AtomicBool>,
}

#[derive(Default)]
struct Counters {
    frames_processed: u64,
    skipped_ticks: u64,
    persisted: u64,
    suppressed: u64,
    failed: u64,
    inference_errors: u64,
}

struct SamplerState {
    session: Option<Session>,
    next_session: u64,
    counters: Counters,
    queue: VecDeque<AlertCandidate>,
    cooldown: CooldownTracker<(AlertType, String)>,
}

struct SamplerInner {
    classifier: Arc<dyn Classifier>,
    sink: Arc<dyn AlertSink>,
    config: DetectionConfig,
    state: Mutex<SamplerState>,
}

impl SamplerInner {
    fn lock_state(&self) -> MutexGuard<'_, SamplerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `update` only while `session` is still the current one.
    fn with_session<R>(&self, session: u64, update: impl FnOnce(&mut SamplerState) -> R) -> Option<R> {
        let mut state = self.lock_state();
        if state.session.as_ref().map(|s| s.id) != Some(session) {
            return None;
        }
        Some(update(&mut state))
    }

    async fn run_cycle(&self, session: u64, camera_id: &str, track: Arc<dyn MediaTrack>) {
        let frame = match track.capture_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Frame capture failed on {}: {}", camera_id, e);
                return;
            }
        };
        let Some(frame_number) = self.with_session(session, |s| {
            s.counters.frames_processed += 1;
            s.counters.frames_processed
        }) else {
            return;
        };

        let result = match self.classifier.classify(&frame, camera_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Inference failed for frame {} on {}: {}", frame_number, camera_id, e);
                self.with_session(session, |s| s.counters.inference_errors += 1);
                return;
            }
        };

        let persons = result.persons.len() as u32;
        let min_confidence = self.config.min_confidence;
        let queued = self.with_session(session, |s| {
            let before = s.queue.len();
            s.queue.extend(
                result
                    .candidates
                    .into_iter()
                    .filter(|c| c.confidence >= min_confidence),
            );
            s.queue.len() - before
        });
        if let Some(queued) = queued.filter(|n| *n > 0) {
            debug!("Frame {}: {} candidate(s) queued", frame_number, queued);
        }

        loop {
            let next = self.with_session(session, |s| {
                let Some(candidate) = s.queue.pop_front() else {
                    return Step::Drained;
                };
                let location = candidate
                    .location
                    .clone()
                    .unwrap_or_else(|| self.config.location.clone());
                if !s.cooldown.try_fire((candidate.alert_type, location.clone())) {
                    s.counters.suppressed += 1;
                    return Step::Suppressed;
                }
                Step::Persist(self.build_alert(candidate, location, frame_number, persons))
            });

            let alert = match next {
                None | Some(Step::Drained) => break,
                Some(Step::Suppressed) => continue,
                Some(Step::Persist(alert)) => alert,
            };

            let alert_type = alert.alert_type;
            match self.sink.record(alert).await {
                Ok(stored) => {
                    self.with_session(session, |s| s.counters.persisted += 1);
                    info!("{} alert {} raised on {}", alert_type, stored.id, camera_id);
                }
                Err(e) => {
                    self.with_session(session, |s| s.counters.failed += 1);
                    error!("Failed to persist {} alert from {}: {}", alert_type, camera_id, e);
                }
            }
        }
    }

    fn build_alert(&self, candidate: AlertCandidate, location: String, frame_number: u64, persons: u32) -> Alert {
        let description = if candidate.description.is_empty() {
            format!("{} detected", candidate.alert_type)
        } else {
            candidate.description
        };
        let person_count = if candidate.person_count > 0 {
            candidate.person_count
        } else {
            persons
        };
        let severity = candidate
            .severity
            .unwrap_or_else(|| candidate.alert_type.default_severity());

        Alert::new(candidate.alert_type, candidate.confidence, location)
            .with_description(description)
            .with_frame(frame_number, person_count)
            .with_severity(severity)
    }
}

/// Periodic capture, classify and alert loop over one stream
pub struct DetectionService {
    inner: Arc<SamplerInner>,
    task: PeriodicTask,
}

impl DetectionService {
    pub fn new(classifier: Arc<dyn Classifier>, sink: Arc<dyn AlertSink>, config: DetectionConfig) -> Self {
        let cooldown = CooldownTracker::new(config.cooldown());
        let task = PeriodicTask::new("detection", config.interval());
        Self {
            inner: Arc::new(SamplerInner {
                classifier,
                sink,
                config,
                state: Mutex::new(SamplerState {
                    session: None,
                    next_session: 0,
                    counters: Counters::default(),
                    queue: VecDeque::new(),
                    cooldown,
                }),
            }),
            task,
        }
    }

    /// Start sampling `stream`. The stream stays owned by its connection.
    pub fn start_detection(&self, camera_id: &str, stream: &MediaStream) -> Result<()> {
        let (session_id, token, in_flight, track) = {
            let mut state = self.inner.lock_state();
            if state.session.is_some() {
                return Err(Error::Detection("Detection is already running".to_string()));
            }
            let track = stream.live_video_track().ok_or_else(|| {
                Error::InvalidStream(format!("Stream {} has no live video track", stream.id))
            })?;

            state.next_session += 1;
            let session = Session {
                id: state.next_session,
                camera_id: camera_id.to_string(),
                cancel: CancellationToken::new(),
                in_flight: Arc::new(AtomicBool::new(false)),
            };
            let handles = (session.id, session.cancel.clone(), session.in_flight.clone(), track);
            state.session = Some(session);
            handles
        };

        let inner = self.inner.clone();
        let camera = camera_id.to_string();
        self.task.start(move || {
            if in_flight.swap(true, Ordering::SeqCst) {
                inner.with_session(session_id, |s| s.counters.skipped_ticks += 1);
                debug!("Detection tick skipped; previous cycle still running");
                return;
            }

            let inner = inner.clone();
            let token = token.clone();
            let in_flight = in_flight.clone();
            let track = track.clone();
            let camera = camera.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = inner.run_cycle(session_id, &camera, track) => {}
                }
                in_flight.store(false, Ordering::SeqCst);
            });
        });

        info!(
            "Detection started on {} every {:?}",
            camera_id,
            self.task.period()
        );
        Ok(())
    }

    /// Stop sampling and reset counters. Safe to call when not running.
    ///
    /// Cooldowns survive a stop so a quick restart does not re-raise alerts.
    pub fn stop_detection(&self) {
        self.stop_where(|_| true);
    }

    /// Stop only if `camera_id` is the camera being sampled.
    pub fn stop_detection_for(&self, camera_id: &str) -> bool {
        self.stop_where(|session| session.camera_id == camera_id)
    }

    fn stop_where(&self, matches: impl FnOnce(&Session) -> bool) -> bool {
        let mut state = self.inner.lock_state();
        if state.session.as_ref().map_or(false, |s| !matches(s)) {
            return false;
        }
        self.task.stop();
        let stopped = state.session.take();
        if let Some(session) = &stopped {
            session.cancel.cancel();
            info!(
                "Detection stopped on {} after {} frame(s)",
                session.camera_id, state.counters.frames_processed
            );
        }
        state.counters = Counters::default();
        state.queue.clear();
        stopped.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock_state().session.is_some()
    }

    pub fn status(&self) -> DetectionStatus {
        let state = self.inner.lock_state();
        let counters = &state.counters;
        DetectionStatus {
            active: state.session.is_some(),
            camera_id: state.session.as_ref().map(|s| s.camera_id.clone()),
            frames_processed: counters.frames_processed,
            in_flight: state
                .session
                .as_ref()
                .map_or(false, |s| s.in_flight.load(Ordering::SeqCst)),
            queue_depth: state.queue.len(),
            skipped_ticks: counters.skipped_ticks,
            alerts_persisted: counters.persisted,
            alerts_suppressed: counters.suppressed,
            alerts_failed: counters.failed,
            inference_errors: counters.inference_errors,
        }
    }

    /// Camera currently sampled
    pub fn camera_id(&self) -> Option<String> {
        self.inner.lock_state().session.as_ref().map(|s| s.camera_id.clone())
    }
}

impl Drop for DetectionService {
    fn drop(&mut self) {
        self.stop_detection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Severity;
    use crate::inference::InferenceResult;
    use crate::test_support::{stream_of, FakeClassifier, FakeSink, FakeTrack};
    use std::time::Duration;

    fn candidate(alert_type: AlertType, confidence: f32) -> AlertCandidate {
        AlertCandidate::new(alert_type, confidence)
    }

    fn result_with(candidates: Vec<AlertCandidate>) -> InferenceResult {
        InferenceResult {
            persons: Vec::new(),
            candidates,
        }
    }

    fn service(classifier: Arc<FakeClassifier>, sink: Arc<FakeSink>) -> DetectionService {
        DetectionService::new(classifier, sink, DetectionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_ticks_are_skipped() {
        let classifier = Arc::new(
            FakeClassifier::new(result_with(Vec::new())).with_delay(Duration::from_millis(2500)),
        );
        let sampler = service(classifier, Arc::new(FakeSink::new()));
        let track = FakeTrack::live("video-1");

        sampler.start_detection("cam-1", &stream_of(&track)).unwrap();
        tokio::time::sleep(Duration::from_millis(5500)).await;

        let status = sampler.status();
        assert_eq!(status.frames_processed, 2);
        assert_eq!(status.skipped_ticks, 3);
        assert!(status.in_flight);
        sampler.stop_detection();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_duplicates() {
        let mut fight = candidate(AlertType::Fight, 0.9);
        fight.location = Some("Lobby".into());
        let classifier = Arc::new(FakeClassifier::new(result_with(vec![fight])));
        let sink = Arc::new(FakeSink::new());
        let sampler = service(classifier, sink.clone());

        sampler
            .start_detection("cam-1", &stream_of(&FakeTrack::live("v")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5500)).await;

        let status = sampler.status();
        assert_eq!(status.frames_processed, 5);
        assert_eq!(status.alerts_persisted, 1);
        assert_eq!(status.alerts_suppressed, 4);
        let recorded = sink.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].location, "Lobby");
        assert_eq!(recorded[0].severity, Severity::High);
        sampler.stop_detection();
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_dropped_and_persistence_isolated() {
        let classifier = Arc::new(FakeClassifier::new(result_with(vec![
            candidate(AlertType::Fall, 0.3),
            candidate(AlertType::Fight, 0.9),
            candidate(AlertType::Fire, 0.8),
        ])));
        let sink = Arc::new(FakeSink::new());
        sink.fail_type(AlertType::Fight);
        let sampler = service(classifier, sink.clone());

        sampler
            .start_detection("cam-1", &stream_of(&FakeTrack::live("v")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let status = sampler.status();
        assert_eq!(status.alerts_failed, 1);
        assert_eq!(status.alerts_persisted, 1);
        assert_eq!(status.queue_depth, 0);
        let recorded = sink.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].alert_type, AlertType::Fire);
        assert_eq!(recorded[0].location, "Camera 1");
        assert_eq!(recorded[0].frame_number, 1);
        sampler.stop_detection();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inference_errors_do_not_stop_cycles() {
        let classifier = Arc::new(
            FakeClassifier::new(result_with(vec![candidate(AlertType::Weapon, 0.95)])).fail_first(2),
        );
        let sink = Arc::new(FakeSink::new());
        let sampler = service(classifier, sink.clone());

        sampler
            .start_detection("cam-1", &stream_of(&FakeTrack::live("v")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let status = sampler.status();
        assert_eq!(status.inference_errors, 2);
        assert_eq!(status.frames_processed, 3);
        assert_eq!(sink.recorded().len(), 1);
        sampler.stop_detection();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejections() {
        let classifier = Arc::new(FakeClassifier::new(InferenceResult::default()));
        let sampler = service(classifier.clone(), Arc::new(FakeSink::new()));
        let stream = stream_of(&FakeTrack::live("v"));

        sampler.start_detection("cam-1", &stream).unwrap();
        let err = sampler.start_detection("cam-1", &stream).unwrap_err();
        assert!(matches!(err, Error::Detection(_)));
        sampler.stop_detection();

        let ended = FakeTrack::live("gone");
        ended.end();
        let other = service(classifier, Arc::new(FakeSink::new()));
        let err = other.start_detection("cam-2", &stream_of(&ended)).unwrap_err();
        assert!(matches!(err, Error::InvalidStream(_)));
        assert!(!other.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_survives_restart() {
        let mut fire = candidate(AlertType::Fire, 0.9);
        fire.location = Some("Kitchen".into());
        let classifier = Arc::new(FakeClassifier::new(result_with(vec![fire])));
        let sink = Arc::new(FakeSink::new());
        let sampler = service(classifier, sink.clone());

        sampler
            .start_detection("cam-1", &stream_of(&FakeTrack::live("v")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sink.recorded().len(), 1);
        sampler.stop_detection();

        sampler
            .start_detection("cam-1", &stream_of(&FakeTrack::live("v")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(sink.recorded().len(), 1);
        assert_eq!(sampler.status().alerts_suppressed, 1);
        sampler.stop_detection();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_for_other_camera_is_ignored() {
        let classifier = Arc::new(FakeClassifier::new(InferenceResult::default()));
        let sampler = service(classifier, Arc::new(FakeSink::new()));

        sampler
            .start_detection("cam-1", &stream_of(&FakeTrack::live("v")))
            .unwrap();

        assert!(!sampler.stop_detection_for("cam-2"));
        assert!(sampler.is_active());
        assert!(sampler.stop_detection_for("cam-1"));
        assert!(!sampler.is_active());
        assert!(!sampler.stop_detection_for("cam-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_resets_and_halts() {
        let classifier = Arc::new(FakeClassifier::new(InferenceResult::default()));
        let sampler = service(classifier.clone(), Arc::new(FakeSink::new()));

        sampler
            .start_detection("cam-1", &stream_of(&FakeTrack::live("v")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(sampler.status().frames_processed, 2);

        sampler.stop_detection();
        sampler.stop_detection();
        let calls = classifier.calls();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(classifier.calls(), calls);
        assert_eq!(sampler.status(), DetectionStatus::default());

        // restart works after a stop
        sampler
            .start_detection("cam-1", &stream_of(&FakeTrack::live("v")))
            .unwrap();
        assert_eq!(sampler.camera_id().as_deref(), Some("cam-1"));
        sampler.stop_detection();
    }
}
