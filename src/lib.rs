pub mod app;
pub mod backend;
pub mod config;
pub mod db;
pub mod device_manager;
pub mod error;
pub mod identity;
pub mod inference;
pub mod messaging;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main components for easier use
pub use app::App;
pub use backend::{BackendClient, RequestOptions};
pub use error::{Error, Result};
pub use services::{AlertService, CameraManager, DetectionService};
