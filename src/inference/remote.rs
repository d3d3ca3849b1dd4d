use super::{Classifier, InferenceResult};
use crate::device_manager::media::VideoFrame;
use crate::error::{Error, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::multipart::{Form, Part};
use std::time::Duration;

/// Posts each frame to an HTTP inference service.
///
/// The frame goes up as a multipart form (`frame` as raw RGBA bytes plus
/// `width`, `height`, `camera_id` and `timestamp` fields); the service answers
/// with an [`InferenceResult`] JSON body.
pub struct RemoteClassifier {
    client: reqwest::Client,
    url: String,
}

impl RemoteClassifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        url::Url::parse(url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Inference(format!("Failed to build inference client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    fn name(&self) -> &str {
        "remote"
    }

    async fn classify(&self, frame: &VideoFrame, camera_id: &str) -> Result<InferenceResult> {
        let form = Form::new()
            .part(
                "frame",
                Part::bytes(frame.data.clone())
                    .file_name("frame.rgba")
                    .mime_str("application/octet-stream")
                    .map_err(|e| Error::Inference(e.to_string()))?,
            )
            .text("width", frame.width.to_string())
            .text("height", frame.height.to_string())
            .text("camera_id", camera_id.to_string())
            .text("timestamp", frame.captured_at.to_rfc3339());

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("Inference request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Inference(format!(
                "Inference service returned {}: {}",
                status, body
            )));
        }

        let result: InferenceResult = response
            .json()
            .await
            .map_err(|e| Error::Inference(format!("Malformed inference response: {}", e)))?;
        debug!(
            "Inference for {}: {} person(s), {} candidate(s)",
            camera_id,
            result.persons.len(),
            result.candidates.len()
        );
        Ok(result)
    }
}
