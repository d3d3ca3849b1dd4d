use crate::backend::{BackendClient, RequestOptions};
use crate::db::models::{LogEntry, LogLevel};
use crate::error::Result;
use std::sync::Arc;

const TABLE: &str = "logs";

/// Operator audit log stored in the `logs` table
#[derive(Clone)]
pub struct LogsRepository {
    client: Arc<BackendClient>,
}

impl LogsRepository {
    pub fn new(client: Arc<BackendClient>) -> Self {
        Self { client }
    }

    pub async fn log_event(&self, level: LogLevel, message: &str, module: &str) -> Result<()> {
        let entry = LogEntry::new(level, message, module);
        self.client
            .request(TABLE, RequestOptions::post(serde_json::to_value(&entry)?))
            .await?;
        Ok(())
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let options = RequestOptions::get()
            .query("select", "*")
            .query("order", "timestamp.desc")
            .query("limit", limit.to_string());
        let value = self.client.request(TABLE, options).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }
}
