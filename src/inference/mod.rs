//! Inference collaborator seam.
//!
//! The sampler only depends on [`Classifier`]; the model behind it is opaque.

pub mod remote;
pub mod simulated;

pub use remote::RemoteClassifier;
pub use simulated::SimulatedClassifier;

use crate::config::{ClassifierConfig, DetectionConfig};
use crate::db::models::{AlertType, Severity};
use crate::device_manager::media::VideoFrame;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A person found in the frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPerson {
    /// x, y, width, height in pixels
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// A classified event that may become an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCandidate {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub confidence: f32,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub person_count: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Option<Severity>,
}

impl AlertCandidate {
    pub fn new(alert_type: AlertType, confidence: f32) -> Self {
        Self {
            alert_type,
            confidence,
            location: None,
            person_count: 0,
            description: String::new(),
            severity: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    #[serde(default)]
    pub persons: Vec<DetectedPerson>,
    #[serde(default)]
    pub candidates: Vec<AlertCandidate>,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, frame: &VideoFrame, camera_id: &str) -> Result<InferenceResult>;
}

/// Build the configured classifier
pub fn build_classifier(config: &DetectionConfig) -> Result<Arc<dyn Classifier>> {
    match &config.classifier {
        ClassifierConfig::Simulated { seed } => Ok(Arc::new(SimulatedClassifier::new(
            *seed,
            config.crowd_threshold,
        ))),
        ClassifierConfig::Remote { url, timeout_secs } => Ok(Arc::new(RemoteClassifier::new(
            url,
            Duration::from_secs(*timeout_secs),
        )?)),
    }
}
