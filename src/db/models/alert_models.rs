use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Kind of safety event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    #[serde(alias = "violence")]
    Fight,
    Fall,
    Overcrowding,
    Loitering,
    Weapon,
    Fire,
    SuspiciousObject,
    Test,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fight => "fight",
            Self::Fall => "fall",
            Self::Overcrowding => "overcrowding",
            Self::Loitering => "loitering",
            Self::Weapon => "weapon",
            Self::Fire => "fire",
            Self::SuspiciousObject => "suspicious_object",
            Self::Test => "test",
        }
    }

    /// Severity used when the classifier does not supply one
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Fight | Self::Fall | Self::Weapon | Self::Fire => Severity::High,
            Self::Overcrowding | Self::SuspiciousObject => Severity::Medium,
            Self::Loitering | Self::Test => Severity::Low,
        }
    }
}

impl Display for AlertType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Who acknowledged an alert and when
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgment {
    pub by: String,
    pub at: DateTime<Utc>,
}

/// A detected safety event.
///
/// Acknowledgment is all-or-nothing and one way; see [`Alert::acknowledge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AlertRecord", into = "AlertRecord")]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub frame_number: u64,
    pub person_count: u32,
    pub description: String,
    pub location: String,
    pub severity: Severity,
    pub acknowledgment: Option<Acknowledgment>,
}

impl Alert {
    pub fn new(alert_type: AlertType, confidence: f32, location: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
            frame_number: 0,
            person_count: 0,
            description: String::new(),
            location: location.into(),
            severity: alert_type.default_severity(),
            acknowledgment: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_frame(mut self, frame_number: u64, person_count: u32) -> Self {
        self.frame_number = frame_number;
        self.person_count = person_count;
        self
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledgment.is_some()
    }

    /// Mark acknowledged. Returns false, changing nothing, if already acknowledged.
    pub fn acknowledge(&mut self, by: impl Into<String>) -> bool {
        if self.acknowledgment.is_some() {
            return false;
        }
        self.acknowledgment = Some(Acknowledgment {
            by: by.into(),
            at: Utc::now(),
        });
        true
    }
}

/// Row shape of the `alerts` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub frame_number: u64,
    #[serde(default)]
    pub person_count: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl TryFrom<AlertRecord> for Alert {
    type Error = String;

    fn try_from(record: AlertRecord) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&record.confidence) {
            return Err(format!(
                "alert {} confidence {} outside [0, 1]",
                record.id, record.confidence
            ));
        }

        let acknowledgment = match (record.acknowledged, record.acknowledged_by, record.acknowledged_at) {
            (false, None, None) => None,
            (true, Some(by), Some(at)) => Some(Acknowledgment { by, at }),
            _ => {
                return Err(format!(
                    "alert {} has a partial acknowledgment",
                    record.id
                ))
            }
        };

        Ok(Alert {
            id: record.id,
            alert_type: record.alert_type,
            confidence: record.confidence,
            timestamp: record.timestamp,
            frame_number: record.frame_number,
            person_count: record.person_count,
            description: record.description,
            location: record.location,
            severity: record
                .severity
                .unwrap_or_else(|| record.alert_type.default_severity()),
            acknowledgment,
        })
    }
}

impl From<Alert> for AlertRecord {
    fn from(alert: Alert) -> Self {
        let (acknowledged_by, acknowledged_at) = match alert.acknowledgment {
            Some(ack) => (Some(ack.by), Some(ack.at)),
            None => (None, None),
        };
        Self {
            id: alert.id,
            alert_type: alert.alert_type,
            confidence: alert.confidence,
            timestamp: alert.timestamp,
            frame_number: alert.frame_number,
            person_count: alert.person_count,
            description: alert.description,
            location: alert.location,
            severity: Some(alert.severity),
            acknowledged: acknowledged_by.is_some(),
            acknowledged_by,
            acknowledged_at,
        }
    }
}

/// Filter for listing alerts, newest first
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub limit: Option<usize>,
    pub alert_type: Option<AlertType>,
    pub acknowledged: Option<bool>,
    pub since: Option<DateTime<Utc>>,
}

impl AlertQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn unacknowledged() -> Self {
        Self {
            acknowledged: Some(false),
            ..Self::default()
        }
    }

    /// Filter parameters in the store's `column=op.value` syntax
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("select", "*".to_string()), ("order", "timestamp.desc".to_string())];
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(alert_type) = self.alert_type {
            params.push(("type", format!("eq.{}", alert_type)));
        }
        if let Some(acknowledged) = self.acknowledged {
            params.push(("acknowledged", format!("eq.{}", acknowledged)));
        }
        if let Some(since) = self.since {
            params.push(("timestamp", format!("gte.{}", since.to_rfc3339())));
        }
        params
    }
}

/// Aggregates over a look-back window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertStats {
    pub total: usize,
    pub by_type: BTreeMap<AlertType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    /// Keyed by UTC hour of day
    pub by_hour: BTreeMap<u32, usize>,
    pub average_confidence: f32,
    pub unacknowledged: usize,
}

impl AlertStats {
    pub fn from_alerts(alerts: &[Alert]) -> Self {
        let mut stats = AlertStats {
            total: alerts.len(),
            ..AlertStats::default()
        };
        let mut confidence_sum = 0.0;

        for alert in alerts {
            *stats.by_type.entry(alert.alert_type).or_default() += 1;
            *stats.by_severity.entry(alert.severity).or_default() += 1;
            *stats.by_hour.entry(alert.timestamp.hour()).or_default() += 1;
            confidence_sum += alert.confidence;
            if !alert.is_acknowledged() {
                stats.unacknowledged += 1;
            }
        }

        if !alerts.is_empty() {
            stats.average_confidence = confidence_sum / alerts.len() as f32;
        }
        stats
    }
}
