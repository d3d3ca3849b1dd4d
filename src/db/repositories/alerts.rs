use crate::backend::{BackendClient, RequestOptions};
use crate::db::models::{Alert, AlertQuery, AlertStats};
use crate::error::{Error, Result};
use crate::identity::TokenStore;
use chrono::{Duration as ChronoDuration, Utc};
use log::debug;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const TABLE: &str = "alerts";

/// Alerts repository over the backend client
#[derive(Clone)]
pub struct AlertsRepository {
    client: Arc<BackendClient>,
}

impl AlertsRepository {
    pub fn new(client: Arc<BackendClient>) -> Self {
        Self { client }
    }

    /// Session of the operator this repository acts for
    pub fn tokens(&self) -> &Arc<TokenStore> {
        self.client.tokens()
    }

    /// Insert an alert and return the stored row
    pub async fn create(&self, alert: &Alert) -> Result<Alert> {
        let body = serde_json::to_value(alert)?;
        let response = self
            .client
            .request(
                TABLE,
                RequestOptions::post(body).header("Prefer", "return=representation"),
            )
            .await?;

        let mut rows = decode_rows(response)?;
        Ok(if rows.is_empty() { alert.clone() } else { rows.remove(0) })
    }

    pub async fn list(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let mut options = RequestOptions::get();
        for (key, value) in query.to_params() {
            options = options.query(key, value);
        }
        decode_rows(self.client.request(TABLE, options).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Alert>> {
        let options = RequestOptions::get()
            .query("select", "*")
            .query("id", format!("eq.{}", id));
        let mut rows = decode_rows(self.client.request(TABLE, options).await?)?;
        Ok(rows.pop())
    }

    /// Acknowledge an alert.
    ///
    /// The update is conditional on `acknowledged=false`, so an already
    /// acknowledged row is never rewritten. Returns `None` when no row changed.
    pub async fn acknowledge(&self, id: Uuid, by: &str) -> Result<Option<Alert>> {
        let body = json!({
            "acknowledged": true,
            "acknowledged_by": by,
            "acknowledged_at": Utc::now(),
        });
        let options = RequestOptions::patch(body)
            .query("id", format!("eq.{}", id))
            .query("acknowledged", "eq.false")
            .header("Prefer", "return=representation");

        let mut rows = decode_rows(self.client.request(TABLE, options).await?)?;
        if rows.is_empty() {
            debug!("Alert {} not acknowledged: missing or already acknowledged", id);
        }
        Ok(rows.pop())
    }

    /// Delete every alert
    pub async fn clear_all(&self) -> Result<()> {
        // The store refuses unfiltered deletes
        let options = RequestOptions::delete().query("id", "not.is.null");
        self.client.request(TABLE, options).await?;
        Ok(())
    }

    /// Statistics over the last `hours` hours
    pub async fn stats(&self, hours: u32) -> Result<AlertStats> {
        let query = AlertQuery {
            since: Some(Utc::now() - ChronoDuration::hours(i64::from(hours))),
            ..AlertQuery::default()
        };
        let alerts = self.list(&query).await?;
        Ok(AlertStats::from_alerts(&alerts))
    }
}

/// Decode a row array, or a single row object, into alerts
fn decode_rows(value: serde_json::Value) -> Result<Vec<Alert>> {
    match value {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(_) => Ok(serde_json::from_value(value)?),
        serde_json::Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
        other => Err(Error::Serialization(format!("Unexpected alerts payload: {}", other))),
    }
}
