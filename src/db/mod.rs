//! Table access for alerts, cameras and the audit log.
//!
//! Every call goes through [`BackendClient`](crate::backend::BackendClient),
//! so repositories inherit its caching, retries and circuit breaking.

pub mod models;
pub mod repositories;

pub use models::{Alert, AlertQuery, AlertStats, AlertType, CameraRecord, LogEntry, LogLevel, Severity};
pub use repositories::{AlertsRepository, CamerasRepository, LogsRepository};
