pub mod alert_models;
pub mod camera_models;
pub mod log_models;

pub use alert_models::{Acknowledgment, Alert, AlertQuery, AlertRecord, AlertStats, AlertType, Severity};
pub use camera_models::CameraRecord;
pub use log_models::{LogEntry, LogLevel};
