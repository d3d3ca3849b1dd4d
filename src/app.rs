//! Composition root: builds every service and owns their lifecycle.

use crate::backend::{BackendClient, HttpTransport, RealtimeConnector, ReqwestTransport, WebSocketConnector};
use crate::config::Config;
use crate::db::models::{CameraRecord, LogLevel};
use crate::db::repositories::{AlertsRepository, CamerasRepository, LogsRepository};
use crate::device_manager::{default_media_devices, CameraStatus, ConnectOptions, MediaDevices};
use crate::error::Result;
use crate::identity::{AuthEvent, IdentityProvider, PasswordIdentityProvider, TokenStore};
use crate::inference::{build_classifier, Classifier};
use crate::messaging::{CameraStatusChange, Subscription};
use crate::services::{AlertService, CameraManager, DetectionService, HttpNotifier, PeriodicTask};
use log::{error, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// External collaborators, swappable for tests
pub struct Collaborators {
    pub transport: Arc<dyn HttpTransport>,
    pub connector: Arc<dyn RealtimeConnector>,
    pub media: Arc<dyn MediaDevices>,
    pub classifier: Arc<dyn Classifier>,
}

impl Collaborators {
    /// Production adapters for the configured endpoints
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            transport: Arc::new(ReqwestTransport::new()?),
            connector: Arc::new(WebSocketConnector::new(
                &config.realtime.url,
                &config.backend.api_key,
            )),
            media: default_media_devices(),
            classifier: build_classifier(&config.detection)?,
        })
    }
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct App {
    config: Config,
    tokens: Arc<TokenStore>,
    identity: Arc<dyn IdentityProvider>,
    client: Arc<BackendClient>,
    cameras: CameraManager,
    camera_records: CamerasRepository,
    logs: LogsRepository,
    alerts: Arc<AlertService>,
    detection: Arc<DetectionService>,
    health: PeriodicTask,
    supervisor: Mutex<Option<Supervisor>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl App {
    pub fn build(config: Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::with_collaborators(config, collaborators))
    }

    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Self {
        let tokens = Arc::new(TokenStore::new());
        let notifier = Arc::new(HttpNotifier::new(
            collaborators.transport.clone(),
            config.notifications.clone(),
        ));
        let identity: Arc<dyn IdentityProvider> = Arc::new(PasswordIdentityProvider::new(
            collaborators.transport.clone(),
            &config.backend.base_url,
            &config.backend.api_key,
            tokens.clone(),
        ));
        let client = Arc::new(BackendClient::new(
            &config.backend,
            &config.realtime,
            collaborators.transport,
            collaborators.connector,
            tokens.clone(),
        ));

        let alerts = Arc::new(AlertService::new(AlertsRepository::new(client.clone())).with_notifier(notifier));
        let detection = Arc::new(DetectionService::new(
            collaborators.classifier,
            alerts.clone(),
            config.detection.clone(),
        ));
        let cameras = CameraManager::new(collaborators.media, config.camera.clone());
        let health = PeriodicTask::new(
            "health",
            Duration::from_secs(config.logging.health_interval_secs.max(1)),
        );

        Self {
            camera_records: CamerasRepository::new(client.clone()),
            logs: LogsRepository::new(client.clone()),
            config,
            tokens,
            identity,
            client,
            cameras,
            alerts,
            detection,
            health,
            supervisor: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Sign in, connect realtime, bring up cameras and start detection.
    ///
    /// Camera failures are logged and leave the rest of the system running.
    pub async fn start(&self) -> Result<()> {
        info!("Starting SafeZone monitor against {}", self.config.backend.base_url);

        if let Some((email, password)) = self.config.identity.credentials() {
            if let Err(e) = self.identity.sign_in(email, password).await {
                error!("Sign-in failed: {}", e.user_message());
            }
        } else {
            warn!("No operator credentials configured; using the API key only");
        }

        self.start_supervisor();

        if self.config.realtime.enabled {
            self.client.connect_realtime();
        }

        match self.cameras.initialize().await {
            Ok(devices) => {
                if self.config.camera.monitor_hotplug {
                    self.cameras.start_device_monitoring();
                }
                if self.config.camera.auto_connect {
                    if let Some(device) = devices.first() {
                        self.start_camera(&device.device_id).await;
                    }
                }
            }
            Err(e) => error!("Camera initialization failed: {}", e.user_message()),
        }

        self.start_health_logging();
        self.audit(LogLevel::Info, "Monitoring started").await;
        Ok(())
    }

    async fn start_camera(&self, device_id: &str) {
        let connection = match self.cameras.connect_to_camera(device_id, ConnectOptions::default()).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Could not connect camera {}: {}", device_id, e.user_message());
                return;
            }
        };
        if let Err(e) = self.detection.start_detection(device_id, &connection.stream) {
            error!("Could not start detection on {}: {}", device_id, e);
        }
    }

    /// Mirror camera status into the store, halt detection on a lost camera
    /// and retry sign-in once per burst of authentication-required events.
    fn start_supervisor(&self) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if supervisor.is_some() {
            return;
        }

        let (status_tx, mut status_rx) = mpsc::unbounded_channel::<CameraStatusChange>();
        let (auth_tx, mut auth_rx) = mpsc::unbounded_channel::<String>();

        {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
            // runs inside teardown, so sampling halts before its next tick
            let detection = Arc::downgrade(&self.detection);
            subscriptions.push(self.cameras.on_status_change(move |change| {
                if matches!(change.status, CameraStatus::Disconnected | CameraStatus::Failed) {
                    if let Some(detection) = detection.upgrade() {
                        if detection.stop_detection_for(&change.device_id) {
                            warn!("Detection halted: camera {} is {}", change.device_id, change.status);
                        }
                    }
                }
                let _ = status_tx.send(change.clone());
            }));
            subscriptions.push(self.tokens.on_auth_event(move |event| {
                if let AuthEvent::AuthenticationRequired { reason } = event {
                    let _ = auth_tx.send(reason.clone());
                }
            }));
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let cameras = self.cameras.clone();
        let records = self.camera_records.clone();
        let identity = self.identity.clone();
        let credentials = self
            .config
            .identity
            .credentials()
            .map(|(e, p)| (e.to_string(), p.to_string()));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(change) = status_rx.recv() => {
                        let mut record = cameras
                            .devices()
                            .iter()
                            .find(|d| d.device_id == change.device_id)
                            .map(|d| CameraRecord::from_device(d, change.status))
                            .unwrap_or_else(|| CameraRecord::new(&change.device_id, &change.device_id, change.status));
                        if let Some(connection) = cameras.connection(&change.device_id) {
                            record = record.with_connection(&connection);
                        }
                        if let Err(e) = records.upsert_status(&record).await {
                            warn!("Failed to mirror status of {}: {}", change.device_id, e);
                        }
                    }
                    Some(reason) = auth_rx.recv() => {
                        // coalesce a burst of 401s into one attempt
                        while auth_rx.try_recv().is_ok() {}
                        let Some((email, password)) = &credentials else {
                            warn!("Session expired ({}) and no credentials to renew it", reason);
                            continue;
                        };
                        info!("Session expired ({}); signing in again", reason);
                        if let Err(e) = identity.sign_in(email, password).await {
                            error!("Re-sign-in failed: {}", e.user_message());
                        }
                    }
                }
            }
        });

        *supervisor = Some(Supervisor { cancel, handle });
    }

    fn start_health_logging(&self) {
        let client = self.client.clone();
        let detection = self.detection.clone();
        self.health.start(move || {
            let metrics = client.metrics();
            let status = detection.status();
            info!(
                "Health: {} requests, {:.0}% ok, {:.0}% cache hits, {:.0}ms avg, circuit {:?}, realtime {}",
                metrics.total_requests,
                metrics.success_rate * 100.0,
                metrics.cache_hit_rate * 100.0,
                metrics.average_latency_ms,
                metrics.circuit_state,
                if metrics.realtime_connected { "up" } else { "down" },
            );
            if status.active {
                info!(
                    "Detection: {} frames, {} skipped, {} alerts ({} suppressed, {} failed)",
                    status.frames_processed,
                    status.skipped_ticks,
                    status.alerts_persisted,
                    status.alerts_suppressed,
                    status.alerts_failed,
                );
            }
        });
    }

    async fn audit(&self, level: LogLevel, message: &str) {
        if let Err(e) = self.logs.log_event(level, message, "app").await {
            warn!("Audit log write failed: {}", e);
        }
    }

    /// Stop detection, release cameras and close the backend connections.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.health.stop();
        self.detection.stop_detection();
        self.cameras.dispose().await;
        self.audit(LogLevel::Info, "Monitoring stopped").await;
        self.client.disconnect_realtime().await;

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.handle.await {
                warn!("Supervisor task ended abnormally: {}", e);
            }
        }
        for subscription in self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            subscription.unsubscribe();
        }

        if self.identity.session().is_some() {
            if let Err(e) = self.identity.sign_out().await {
                warn!("Sign-out failed: {}", e);
            }
        }
        info!("Shutdown complete");
    }

    pub fn client(&self) -> &Arc<BackendClient> {
        &self.client
    }

    pub fn cameras(&self) -> &CameraManager {
        &self.cameras
    }

    pub fn alerts(&self) -> &Arc<AlertService> {
        &self.alerts
    }

    pub fn detection(&self) -> &Arc<DetectionService> {
        &self.detection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HttpResponse;
    use crate::config::IdentityConfig;
    use crate::device_manager::media::TrackCapabilities;
    use crate::inference::InferenceResult;
    use crate::test_support::{FakeClassifier, FakeMediaDevices, ScriptedConnector, ScriptedTransport};
    use serde_json::json;

    fn test_app(config: Config, transport: Arc<ScriptedTransport>, media: Arc<FakeMediaDevices>) -> App {
        App::with_collaborators(
            config,
            Collaborators {
                transport,
                connector: Arc::new(ScriptedConnector::always_failing()),
                media,
                classifier: Arc::new(FakeClassifier::new(InferenceResult::default())),
            },
        )
    }

    fn offline_config() -> Config {
        let mut config = Config::default();
        config.realtime.enabled = false;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects_camera_and_detection() {
        let transport = Arc::new(ScriptedTransport::repeating(Ok(HttpResponse {
            status: 201,
            body: serde_json::Value::Null,
        })));
        let media = Arc::new(FakeMediaDevices::new());
        media.add_device("cam-1", "USB Camera", TrackCapabilities::default());
        let app = test_app(offline_config(), transport.clone(), media);

        app.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(app.cameras().status("cam-1"), Some(CameraStatus::Connected));
        assert!(app.detection().is_active());
        let mirrored = transport
            .requests()
            .iter()
            .filter(|r| r.url.ends_with("/rest/v1/cameras"))
            .count();
        assert!(mirrored >= 1);

        app.shutdown().await;
        assert!(!app.detection().is_active());
        assert!(app.cameras().connection("cam-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_camera_halts_detection() {
        let transport = Arc::new(ScriptedTransport::repeating(Ok(HttpResponse {
            status: 201,
            body: serde_json::Value::Null,
        })));
        let media = Arc::new(FakeMediaDevices::new());
        media.add_device("cam-1", "USB Camera", TrackCapabilities::default());
        let app = test_app(offline_config(), transport, media.clone());

        app.start().await.unwrap();
        let connection = app.cameras().connection("cam-1").unwrap();
        let track = media.track_for(&connection).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(track.capture_count(), 2);

        track.end();

        assert!(!app.detection().is_active());
        assert_eq!(app.cameras().status("cam-1"), Some(CameraStatus::Disconnected));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(track.capture_count(), 2);
        app.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_does_not_block_start() {
        let transport = Arc::new(ScriptedTransport::repeating(Ok(HttpResponse::ok(json!([])))));
        let app = test_app(offline_config(), transport, Arc::new(FakeMediaDevices::unsupported()));

        app.start().await.unwrap();

        assert!(!app.detection().is_active());
        app.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_required_triggers_one_sign_in() {
        let transport = Arc::new(ScriptedTransport::repeating(Ok(HttpResponse::ok(json!({
            "access_token": "header.payload.sig",
            "expires_in": 3600,
            "user": {"id": "user-1", "email": "operator@example.com"}
        })))));
        let mut config = offline_config();
        config.identity = IdentityConfig {
            email: Some("operator@example.com".into()),
            password: Some("pw".into()),
        };
        let app = test_app(config, transport.clone(), Arc::new(FakeMediaDevices::unsupported()));
        let sign_ins = || {
            transport
                .requests()
                .iter()
                .filter(|r| r.url.ends_with("/auth/v1/token"))
                .count()
        };

        app.start().await.unwrap();
        assert_eq!(sign_ins(), 1);

        app.client().tokens().clear_for_reauth("test expiry");
        app.client().tokens().clear_for_reauth("test expiry");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sign_ins(), 2);
        assert_eq!(app.client().tokens().token().as_deref(), Some("header.payload.sig"));
        app.shutdown().await;
    }
}
