use crate::config::CameraConfig;
use crate::device_manager::camera::{CameraConnection, CameraDevice, CameraStatus, ConnectOptions, NegotiatedSettings};
use crate::device_manager::media::{MediaConstraints, MediaDeviceKind, MediaDevices, MediaError, TrackState};
use crate::error::{Error, Result};
use crate::messaging::{CameraStatusChange, EventBus, Subscription};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Quiet period that coalesces a burst of hot-plug notifications
const HOTPLUG_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Unknown,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringMode {
    Inactive,
    HotPlug,
    /// The backend cannot report device changes; call `discover_devices`
    ManualRefreshOnly,
}

struct ManagerState {
    initialized: bool,
    permission: PermissionState,
    devices: Vec<CameraDevice>,
    connections: HashMap<String, Arc<CameraConnection>>,
    statuses: HashMap<String, CameraStatus>,
    monitoring: MonitoringMode,
}

impl ManagerState {
    /// Record a status and return the change to publish once the lock is released.
    fn set_status(&mut self, device_id: &str, status: CameraStatus, reason: Option<String>) -> Option<CameraStatusChange> {
        let previous = self.statuses.insert(device_id.to_string(), status);
        if previous == Some(status) {
            return None;
        }
        Some(CameraStatusChange::new(device_id, previous, status, reason))
    }
}

struct MonitorWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ManagerInner {
    media: Arc<dyn MediaDevices>,
    config: CameraConfig,
    state: Mutex<ManagerState>,
    status_bus: EventBus<CameraStatusChange>,
    monitor: Mutex<Option<MonitorWorker>>,
    discovery: tokio::sync::Mutex<()>,
}

impl ManagerInner {
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, change: Option<CameraStatusChange>) {
        if let Some(change) = change {
            debug!(
                "Camera {} status {:?} -> {}",
                change.device_id, change.previous, change.status
            );
            self.status_bus.publish(&change);
        }
    }

    /// The single cleanup path for explicit disconnects and ended tracks.
    ///
    /// With `expected` set, only that connection is torn down, so a late
    /// ended notification cannot remove a newer connection to the same device.
    fn teardown(&self, device_id: &str, expected: Option<Uuid>, reason: &str) -> bool {
        let (connection, change) = {
            let mut state = self.lock_state();
            let matches = state
                .connections
                .get(device_id)
                .map_or(false, |c| expected.map_or(true, |id| id == c.id));
            if !matches {
                return false;
            }
            let connection = state.connections.remove(device_id);
            let change = state.set_status(device_id, CameraStatus::Disconnected, Some(reason.to_string()));
            (connection, change)
        };

        if let Some(connection) = connection {
            connection.mark_inactive();
            for err in connection.stream.stop_all() {
                warn!("Failed to stop track for {}: {}", device_id, err);
            }
            info!("Camera {} disconnected ({})", device_id, reason);
        }
        self.publish(change);
        true
    }
}

/// Owns camera discovery, connections and their teardown
#[derive(Clone)]
pub struct CameraManager {
    inner: Arc<ManagerInner>,
}

impl CameraManager {
    pub fn new(media: Arc<dyn MediaDevices>, config: CameraConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                media,
                config,
                state: Mutex::new(ManagerState {
                    initialized: false,
                    permission: PermissionState::Unknown,
                    devices: Vec::new(),
                    connections: HashMap::new(),
                    statuses: HashMap::new(),
                    monitoring: MonitoringMode::Inactive,
                }),
                status_bus: EventBus::new(),
                monitor: Mutex::new(None),
                discovery: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Check support, obtain permission with a throwaway stream, then discover.
    pub async fn initialize(&self) -> Result<Vec<CameraDevice>> {
        if self.inner.lock_state().initialized {
            return Ok(self.devices());
        }

        if !self.inner.media.is_supported() {
            return Err(Error::UnsupportedEnvironment(
                "No video capture backend available".to_string(),
            ));
        }

        match self.inner.media.get_user_media(&MediaConstraints::any_video()).await {
            Ok(stream) => {
                for err in stream.stop_all() {
                    warn!("Failed to stop permission probe: {}", err);
                }
                self.inner.lock_state().permission = PermissionState::Granted;
            }
            Err(err) => {
                if matches!(err, MediaError::NotAllowed(_)) {
                    self.inner.lock_state().permission = PermissionState::Denied;
                }
                error!("Camera permission probe failed: {}", err);
                return Err(err.into());
            }
        }

        let devices = self.discover_devices().await?;
        self.inner.lock_state().initialized = true;
        info!("Camera manager initialized with {} device(s)", devices.len());
        Ok(devices)
    }

    /// Enumerate and probe every video input, replacing the device table.
    pub async fn discover_devices(&self) -> Result<Vec<CameraDevice>> {
        let _pass = self.inner.discovery.lock().await;

        let infos = self.inner.media.enumerate_devices().await?;
        let mut seen = HashSet::new();
        let mut devices = Vec::new();

        for info in infos.into_iter().filter(|i| i.kind == MediaDeviceKind::VideoInput) {
            if !seen.insert(info.device_id.clone()) {
                warn!("Duplicate camera id {} in enumeration; keeping the first", info.device_id);
                continue;
            }

            let live = self.connection(&info.device_id).and_then(|c| c.video_track());
            let capabilities = match live {
                Some(track) => Some(track.capabilities()),
                None => self.probe_capabilities(&info.device_id).await,
            };
            devices.push(CameraDevice::new(&info, capabilities));
        }

        let changes = {
            let mut state = self.inner.lock_state();
            let ids: HashSet<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
            let connections = &state.connections;
            let stale: Vec<String> = state
                .statuses
                .keys()
                .filter(|id| !ids.contains(id.as_str()) && !connections.contains_key(*id))
                .cloned()
                .collect();
            for id in stale {
                state.statuses.remove(&id);
            }

            let mut changes = Vec::new();
            for device in &devices {
                let current = state.statuses.get(&device.device_id).copied();
                if matches!(current, None | Some(CameraStatus::Disconnected)) {
                    changes.push(state.set_status(&device.device_id, CameraStatus::Available, None));
                }
            }
            state.devices = devices.clone();
            changes
        };
        for change in changes {
            self.inner.publish(change);
        }

        debug!("Discovery found {} camera(s)", devices.len());
        Ok(devices)
    }

    /// Open and immediately stop a stream to read a device's capabilities.
    async fn probe_capabilities(&self, device_id: &str) -> Option<crate::device_manager::media::TrackCapabilities> {
        if !self.inner.config.probe_capabilities {
            return None;
        }
        match self
            .inner
            .media
            .get_user_media(&MediaConstraints::for_device(device_id))
            .await
        {
            Ok(stream) => {
                let capabilities = stream.live_video_track().map(|t| t.capabilities());
                for err in stream.stop_all() {
                    warn!("Failed to stop capability probe for {}: {}", device_id, err);
                }
                capabilities
            }
            Err(err) => {
                warn!("Could not probe {}: {}", device_id, err);
                None
            }
        }
    }

    fn build_constraints(&self, device: &CameraDevice, options: &ConnectOptions) -> MediaConstraints {
        let config = &self.inner.config;
        let best = device.best_resolution();
        MediaConstraints {
            device_id: Some(device.device_id.clone()),
            width: options.width.or(config.preferred_width).or(Some(best.width)),
            height: options.height.or(config.preferred_height).or(Some(best.height)),
            frame_rate: options
                .frame_rate
                .or(config.preferred_frame_rate)
                .or(Some(device.best_frame_rate())),
            facing_mode: options.facing_mode.or(device.facing_mode),
        }
    }

    /// Connect to a discovered device. Connecting twice returns the same connection.
    pub async fn connect_to_camera(&self, device_id: &str, options: ConnectOptions) -> Result<Arc<CameraConnection>> {
        let (device, change) = {
            let mut state = self.inner.lock_state();
            if let Some(existing) = state.connections.get(device_id) {
                return Ok(existing.clone());
            }
            if state.statuses.get(device_id) == Some(&CameraStatus::Connecting) {
                return Err(Error::Camera(format!("Camera {} is already connecting", device_id)));
            }
            let device = state
                .devices
                .iter()
                .find(|d| d.device_id == device_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("Camera {}", device_id)))?;
            let change = state.set_status(device_id, CameraStatus::Connecting, None);
            (device, change)
        };
        self.inner.publish(change);

        let constraints = self.build_constraints(&device, &options);
        let stream = match self.inner.media.get_user_media(&constraints).await {
            Ok(stream) => stream,
            Err(err) => {
                let change = self
                    .inner
                    .lock_state()
                    .set_status(device_id, CameraStatus::Failed, Some(err.to_string()));
                self.inner.publish(change);
                error!("Failed to open camera {}: {}", device_id, err);
                return Err(err.into());
            }
        };

        let Some(track) = stream.live_video_track() else {
            for err in stream.stop_all() {
                warn!("Failed to stop rejected stream: {}", err);
            }
            let change = self.inner.lock_state().set_status(
                device_id,
                CameraStatus::Failed,
                Some("no live video track".to_string()),
            );
            self.inner.publish(change);
            return Err(Error::InvalidStream(format!(
                "Camera {} returned no live video track",
                device_id
            )));
        };

        let negotiated = NegotiatedSettings::from_track(&track.settings(), &constraints);
        let connection = Arc::new(CameraConnection::new(device_id, stream, constraints, negotiated));

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let ended_device = device_id.to_string();
        let connection_id = connection.id;
        track.on_ended(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.teardown(&ended_device, Some(connection_id), "track ended");
            }
        }));

        let change = {
            let mut state = self.inner.lock_state();
            // dispose() may have run while the stream was opening
            if state.statuses.get(device_id) != Some(&CameraStatus::Connecting) {
                drop(state);
                connection.mark_inactive();
                for err in connection.stream.stop_all() {
                    warn!("Failed to stop abandoned stream: {}", err);
                }
                return Err(Error::Camera(format!("Connection to {} was cancelled", device_id)));
            }
            state.connections.insert(device_id.to_string(), connection.clone());
            state.set_status(device_id, CameraStatus::Connected, None)
        };
        self.inner.publish(change);

        if track.state() == TrackState::Ended {
            self.inner.teardown(device_id, Some(connection_id), "track ended during connect");
            return Err(Error::InvalidStream(format!(
                "Camera {} stopped delivering video while connecting",
                device_id
            )));
        }

        info!(
            "Connected camera {} at {}x{} @ {:.0}fps",
            device_id, connection.negotiated.width, connection.negotiated.height, connection.negotiated.frame_rate
        );
        Ok(connection)
    }

    /// Stop every track of the device's connection. Safe to call repeatedly.
    pub fn disconnect_camera(&self, device_id: &str) {
        if !self.inner.teardown(device_id, None, "disconnected") {
            debug!("Camera {} was not connected", device_id);
        }
    }

    /// Rediscover on hot-plug notifications, or fall back to manual refresh.
    pub fn start_device_monitoring(&self) -> MonitoringMode {
        let mut monitor = self.inner.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.as_ref().map_or(false, |w| !w.handle.is_finished()) {
            return self.monitoring_mode();
        }

        let Some(mut changes) = self.inner.media.device_changes() else {
            info!("Device change notifications unsupported; manual refresh only");
            self.inner.lock_state().monitoring = MonitoringMode::ManualRefreshOnly;
            return MonitoringMode::ManualRefreshOnly;
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    change = changes.recv() => {
                        if change.is_none() {
                            break;
                        }
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(HOTPLUG_SETTLE) => {}
                }
                while changes.try_recv().is_ok() {}

                let Some(inner) = weak.upgrade() else { break };
                let manager = CameraManager { inner };
                match manager.discover_devices().await {
                    Ok(devices) => info!("Device change: {} camera(s) present", devices.len()),
                    Err(e) => warn!("Rediscovery after device change failed: {}", e),
                }
            }
        });

        *monitor = Some(MonitorWorker { cancel, handle });
        self.inner.lock_state().monitoring = MonitoringMode::HotPlug;
        info!("Camera hot-plug monitoring started");
        MonitoringMode::HotPlug
    }

    pub async fn stop_device_monitoring(&self) {
        let worker = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!("Device monitor task ended abnormally: {}", e);
            }
        }
        self.inner.lock_state().monitoring = MonitoringMode::Inactive;
    }

    /// Disconnect everything and forget all state. Repeatable.
    pub async fn dispose(&self) {
        self.stop_device_monitoring().await;

        let device_ids: Vec<String> = self.inner.lock_state().connections.keys().cloned().collect();
        for device_id in device_ids {
            self.inner.teardown(&device_id, None, "disposed");
        }

        let mut state = self.inner.lock_state();
        state.connections.clear();
        state.statuses.clear();
        state.devices.clear();
        state.initialized = false;
        debug!("Camera manager disposed");
    }

    pub fn devices(&self) -> Vec<CameraDevice> {
        self.inner.lock_state().devices.clone()
    }

    pub fn connection(&self, device_id: &str) -> Option<Arc<CameraConnection>> {
        self.inner.lock_state().connections.get(device_id).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<CameraConnection>> {
        self.inner.lock_state().connections.values().cloned().collect()
    }

    pub fn status(&self, device_id: &str) -> Option<CameraStatus> {
        self.inner.lock_state().statuses.get(device_id).copied()
    }

    pub fn permission(&self) -> PermissionState {
        self.inner.lock_state().permission
    }

    pub fn monitoring_mode(&self) -> MonitoringMode {
        self.inner.lock_state().monitoring
    }

    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CameraStatusChange) + Send + Sync + 'static,
    {
        self.inner.status_bus.subscribe(callback)
    }
}
