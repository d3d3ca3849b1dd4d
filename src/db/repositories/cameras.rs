use crate::backend::{BackendClient, RequestOptions};
use crate::db::models::CameraRecord;
use crate::error::Result;
use std::sync::Arc;

const TABLE: &str = "cameras";

/// Cameras repository over the backend client
#[derive(Clone)]
pub struct CamerasRepository {
    client: Arc<BackendClient>,
}

impl CamerasRepository {
    pub fn new(client: Arc<BackendClient>) -> Self {
        Self { client }
    }

    /// Insert or update the row keyed by device id
    pub async fn upsert_status(&self, record: &CameraRecord) -> Result<()> {
        let body = serde_json::to_value(record)?;
        let options = RequestOptions::post(body)
            .query("on_conflict", "device_id")
            .header("Prefer", "resolution=merge-duplicates");
        self.client.request(TABLE, options).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<CameraRecord>> {
        let options = RequestOptions::get()
            .query("select", "*")
            .query("order", "name.asc");
        let value = self.client.request(TABLE, options).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }
}
