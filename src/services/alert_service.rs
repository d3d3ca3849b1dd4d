use super::notifier::Notifier;
use crate::db::models::{Alert, AlertQuery, AlertStats, AlertType};
use crate::db::repositories::AlertsRepository;
use crate::error::Result;
use crate::identity::ROLE_ADMIN;
use crate::messaging::{EventBus, Subscription};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

/// Where accepted alerts go
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Persist one alert, returning the stored copy
    async fn record(&self, alert: Alert) -> Result<Alert>;
}

/// Alert persistence, local fan-out and outbound notification
pub struct AlertService {
    alerts: AlertsRepository,
    bus: EventBus<Alert>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl AlertService {
    pub fn new(alerts: AlertsRepository) -> Self {
        Self {
            alerts,
            bus: EventBus::new(),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Persist an alert, then tell listeners and send notifications.
    ///
    /// Notifications go out in the background; their failure is logged and
    /// never fails the alert.
    pub async fn record(&self, alert: Alert) -> Result<Alert> {
        let stored = self.alerts.create(&alert).await?;
        info!(
            "Alert {} recorded: {} at {} ({:.0}%)",
            stored.id,
            stored.alert_type,
            stored.location,
            stored.confidence * 100.0
        );
        self.bus.publish(&stored);

        if let Some(notifier) = &self.notifier {
            let notifier = notifier.clone();
            let alert = stored.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&alert).await {
                    warn!("Notifications for alert {} failed: {}", alert.id, e);
                }
            });
        }
        Ok(stored)
    }

    pub async fn send_test_alert(&self, location: &str) -> Result<Alert> {
        let alert = Alert::new(AlertType::Test, 1.0, location)
            .with_description("Test alert triggered by operator");
        self.record(alert).await
    }

    /// Acknowledge once. A second acknowledgment leaves the first in place
    /// and returns `None`.
    pub async fn acknowledge(&self, id: Uuid, by: &str) -> Result<Option<Alert>> {
        let updated = self.alerts.acknowledge(id, by).await?;
        match &updated {
            Some(alert) => info!("Alert {} acknowledged by {}", alert.id, by),
            None => warn!("Alert {} was not acknowledged (missing or already acknowledged)", id),
        }
        Ok(updated)
    }

    /// Delete every alert. Admin only.
    pub async fn clear_all(&self) -> Result<()> {
        self.alerts.tokens().require_role(ROLE_ADMIN)?;
        self.alerts.clear_all().await?;
        info!("All alerts cleared");
        Ok(())
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<Alert>> {
        self.alerts.list(&AlertQuery::recent(limit)).await
    }

    pub async fn stats(&self, hours: u32) -> Result<AlertStats> {
        self.alerts.stats(hours).await
    }

    pub fn on_alert<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }
}

#[async_trait]
impl AlertSink for AlertService {
    async fn record(&self, alert: Alert) -> Result<Alert> {
        AlertService::record(self, alert).await
    }
}
