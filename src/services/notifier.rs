//! Outbound SMS and email for accepted alerts.

use crate::backend::{HttpRequest, HttpTransport, Method};
use crate::config::NotificationConfig;
use crate::db::models::Alert;
use crate::error::{Error, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Deliveries made for one alert
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotificationOutcome {
    pub sms_sent: usize,
    pub sms_failed: usize,
    pub email_sent: usize,
    pub email_failed: usize,
}

impl NotificationOutcome {
    pub fn attempted(&self) -> usize {
        self.sms_sent + self.sms_failed + self.email_sent + self.email_failed
    }

    pub fn any_sent(&self) -> bool {
        self.sms_sent + self.email_sent > 0
    }
}

/// Tells people about an alert that has been stored
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Fails only when every attempted delivery failed.
    async fn notify(&self, alert: &Alert) -> Result<NotificationOutcome>;
}

/// SMS through a Twilio-compatible messages API and email through a
/// SendGrid-compatible mail API, one request per recipient.
pub struct HttpNotifier {
    transport: Arc<dyn HttpTransport>,
    config: NotificationConfig,
}

impl HttpNotifier {
    pub fn new(transport: Arc<dyn HttpTransport>, config: NotificationConfig) -> Self {
        if !config.sms_enabled() && !config.email_enabled() {
            info!("No notification channel configured; alerts are stored only");
        }
        Self { transport, config }
    }

    fn sms_request(&self, to: &str, text: &str) -> HttpRequest {
        let config = &self.config;
        HttpRequest {
            form: Some(vec![
                ("To".to_string(), to.to_string()),
                ("From".to_string(), config.sms_from.clone()),
                ("Body".to_string(), text.to_string()),
            ]),
            basic_auth: Some((config.sms_account_sid.clone(), config.sms_auth_token.clone())),
            timeout: Some(config.timeout()),
            ..HttpRequest::new(
                Method::Post,
                format!(
                    "{}/2010-04-01/Accounts/{}/Messages.json",
                    config.sms_api_url.trim_end_matches('/'),
                    config.sms_account_sid
                ),
            )
        }
    }

    fn email_request(&self, to: &str, subject: &str, text: &str) -> HttpRequest {
        let config = &self.config;
        HttpRequest {
            headers: vec![("Authorization".to_string(), format!("Bearer {}", config.email_api_key))],
            body: Some(json!({
                "personalizations": [{"to": [{"email": to}]}],
                "from": {"email": config.email_from},
                "subject": subject,
                "content": [{"type": "text/plain", "value": text}],
            })),
            timeout: Some(config.timeout()),
            ..HttpRequest::new(
                Method::Post,
                format!("{}/v3/mail/send", config.email_api_url.trim_end_matches('/')),
            )
        }
    }

    async fn deliver(&self, channel: &str, to: &str, request: HttpRequest) -> bool {
        match self.transport.execute(request).await {
            Ok(response) if response.is_success() => {
                debug!("{} sent to {}", channel, to);
                true
            }
            Ok(response) => {
                warn!("{} to {} rejected with {}: {}", channel, to, response.status, response.body);
                false
            }
            Err(e) => {
                warn!("{} to {} failed: {}", channel, to, e);
                false
            }
        }
    }
}

fn event_name(alert: &Alert) -> String {
    alert.alert_type.as_str().replace('_', " ")
}

fn sms_text(alert: &Alert) -> String {
    format!(
        "SAFETY ALERT\nEvent: {}\nLocation: {}\nTime: {}\nDetails: {}\nConfidence: {:.0}%",
        event_name(alert).to_uppercase(),
        alert.location,
        alert.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        alert.description,
        alert.confidence * 100.0
    )
}

fn email_subject(alert: &Alert) -> String {
    format!("SafeZone alert: {} detected at {}", event_name(alert), alert.location)
}

fn email_text(alert: &Alert) -> String {
    format!(
        "Safety event detected\n\nEvent type: {}\nSeverity: {}\nLocation: {}\nTimestamp: {}\nConfidence: {:.0}%\nDescription: {}\n\nPlease investigate immediately and take appropriate action.",
        event_name(alert),
        alert.severity,
        alert.location,
        alert.timestamp.to_rfc3339(),
        alert.confidence * 100.0,
        alert.description
    )
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, alert: &Alert) -> Result<NotificationOutcome> {
        let mut outcome = NotificationOutcome::default();

        if self.config.sms_enabled() {
            let text = sms_text(alert);
            for to in &self.config.phone_numbers {
                if self.deliver("SMS", to, self.sms_request(to, &text)).await {
                    outcome.sms_sent += 1;
                } else {
                    outcome.sms_failed += 1;
                }
            }
        }

        if self.config.email_enabled() {
            let subject = email_subject(alert);
            let text = email_text(alert);
            for to in &self.config.email_addresses {
                if self.deliver("Email", to, self.email_request(to, &subject, &text)).await {
                    outcome.email_sent += 1;
                } else {
                    outcome.email_failed += 1;
                }
            }
        }

        if outcome.attempted() > 0 && !outcome.any_sent() {
            return Err(Error::Notification(format!(
                "all {} deliveries for alert {} failed",
                outcome.attempted(),
                alert.id
            )));
        }
        info!(
            "Notified about {} alert {}: {} SMS, {} email",
            alert.alert_type, alert.id, outcome.sms_sent, outcome.email_sent
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HttpResponse;
    use crate::db::models::AlertType;
    use crate::test_support::ScriptedTransport;

    fn config() -> NotificationConfig {
        NotificationConfig {
            sms_api_url: "https://sms.example.com".into(),
            sms_account_sid: "AC123".into(),
            sms_auth_token: "secret".into(),
            sms_from: "+15550000".into(),
            email_api_url: "https://mail.example.com".into(),
            email_api_key: "mail-key".into(),
            phone_numbers: vec!["+15550001".into(), "+15550002".into()],
            email_addresses: vec!["guard@example.com".into()],
            ..NotificationConfig::default()
        }
    }

    fn alert() -> Alert {
        Alert::new(AlertType::SuspiciousObject, 0.87, "Platform 2").with_description("Unattended bag")
    }

    #[tokio::test]
    async fn test_every_recipient_gets_one_request() {
        let transport = Arc::new(ScriptedTransport::repeating(Ok(HttpResponse {
            status: 201,
            body: serde_json::Value::Null,
        })));
        let notifier = HttpNotifier::new(transport.clone(), config());

        let outcome = notifier.notify(&alert()).await.unwrap();

        assert_eq!(outcome.sms_sent, 2);
        assert_eq!(outcome.email_sent, 1);
        let requests = transport.requests();
        assert_eq!(requests.len(), 3);

        let sms = &requests[0];
        assert_eq!(sms.url, "https://sms.example.com/2010-04-01/Accounts/AC123/Messages.json");
        assert_eq!(sms.basic_auth, Some(("AC123".to_string(), "secret".to_string())));
        assert_eq!(sms.form_field("To"), Some("+15550001"));
        assert_eq!(sms.form_field("From"), Some("+15550000"));
        let body = sms.form_field("Body").unwrap();
        assert!(body.contains("SUSPICIOUS OBJECT"));
        assert!(body.contains("Confidence: 87%"));

        let email = &requests[2];
        assert_eq!(email.url, "https://mail.example.com/v3/mail/send");
        assert_eq!(email.header("Authorization"), Some("Bearer mail-key"));
        let payload = email.body.as_ref().unwrap();
        assert_eq!(payload["personalizations"][0]["to"][0]["email"], "guard@example.com");
        assert_eq!(payload["subject"], "SafeZone alert: suspicious object detected at Platform 2");
    }

    #[tokio::test]
    async fn test_partial_failure_still_succeeds() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(Error::Network("sms gateway down".into())),
            Ok(HttpResponse { status: 201, body: serde_json::Value::Null }),
            Ok(HttpResponse { status: 401, body: json!({"errors": ["bad key"]}) }),
        ]));
        let notifier = HttpNotifier::new(transport, config());

        let outcome = notifier.notify(&alert()).await.unwrap();

        assert_eq!(
            outcome,
            NotificationOutcome {
                sms_sent: 1,
                sms_failed: 1,
                email_sent: 0,
                email_failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_all_failed_is_an_error_and_unconfigured_is_quiet() {
        let transport = Arc::new(ScriptedTransport::repeating(Err(Error::Network("offline".into()))));
        let notifier = HttpNotifier::new(transport.clone(), config());
        assert!(matches!(notifier.notify(&alert()).await, Err(Error::Notification(_))));

        let quiet = HttpNotifier::new(transport.clone(), NotificationConfig::default());
        let calls = transport.call_count();
        assert_eq!(quiet.notify(&alert()).await.unwrap(), NotificationOutcome::default());
        assert_eq!(transport.call_count(), calls);
    }
}
