pub mod alert_service;
pub mod camera_manager;
pub mod cooldown;
pub mod detection;
pub mod notifier;
pub mod periodic;

pub use alert_service::{AlertService, AlertSink};
pub use camera_manager::{CameraManager, MonitoringMode, PermissionState};
pub use cooldown::CooldownTracker;
pub use detection::{DetectionService, DetectionStatus};
pub use notifier::{HttpNotifier, NotificationOutcome, Notifier};
pub use periodic::PeriodicTask;
