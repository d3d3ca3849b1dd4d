use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Interval in seconds between health summaries
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_interval() -> u64 {
    60
}

/// Hosted backend (REST tables) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL of the hosted backend, e.g. https://project.example.co
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    /// Public API key sent with every request
    #[serde(default)]
    pub api_key: String,
    /// Default cache time-to-live for reads, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Maximum number of cached responses
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single retry delay in milliseconds
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a probe is allowed
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,
    /// Optional per-request timeout; unset means the transport default
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

fn default_backend_url() -> String {
    "http://localhost:54321".to_string()
}

fn default_cache_ttl() -> u64 {
    300 // 5 minutes
}

fn default_cache_max_entries() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    60
}

impl BackendConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Realtime push channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RealtimeConfig {
    /// WebSocket URL of the push channel
    #[serde(default = "default_realtime_url")]
    pub url: String,
    /// Connect the channel on startup
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,
    /// Upper bound for a reconnect delay in milliseconds
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_realtime_url() -> String {
    "ws://localhost:54321/realtime/v1/websocket".to_string()
}

fn default_reconnect_base_delay() -> u64 {
    1000
}

fn default_reconnect_max_delay() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

/// Operator credentials for the identity provider
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct IdentityConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl IdentityConfig {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.email.as_deref(), self.password.as_deref()) {
            (Some(email), Some(password)) if !email.is_empty() => Some((email, password)),
            _ => None,
        }
    }
}

/// Camera lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraConfig {
    /// Preferred capture width; the device's best capability is used when unset
    #[serde(default)]
    pub preferred_width: Option<u32>,
    /// Preferred capture height
    #[serde(default)]
    pub preferred_height: Option<u32>,
    /// Preferred frame rate
    #[serde(default)]
    pub preferred_frame_rate: Option<u32>,
    /// Open a short probe stream per device to read its capabilities
    #[serde(default = "default_true")]
    pub probe_capabilities: bool,
    /// Re-run discovery on hot-plug notifications
    #[serde(default = "default_true")]
    pub monitor_hotplug: bool,
    /// Connect the first discovered camera on startup
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

/// Frame sampling and alerting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    /// Period of the capture-and-classify cycle in milliseconds
    #[serde(default = "default_detection_interval")]
    pub interval_ms: u64,
    /// Suppression window per (type, location)
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_secs: u64,
    /// Candidates below this confidence are dropped
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// People count that the simulated classifier treats as overcrowding
    #[serde(default = "default_crowd_threshold")]
    pub crowd_threshold: u32,
    /// Location label attached to alerts from the connected camera
    #[serde(default = "default_location")]
    pub location: String,
    /// Inference strategy
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

fn default_detection_interval() -> u64 {
    1000
}

fn default_alert_cooldown() -> u64 {
    5
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_crowd_threshold() -> u32 {
    10
}

fn default_location() -> String {
    "Camera 1".to_string()
}

fn default_true() -> bool {
    true
}

impl DetectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }
}

/// Outbound SMS and email for accepted alerts.
///
/// A channel is active only when its credentials and at least one recipient
/// are set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    #[serde(default = "default_sms_api_url")]
    pub sms_api_url: String,
    #[serde(default)]
    pub sms_account_sid: String,
    #[serde(default)]
    pub sms_auth_token: String,
    /// Sender number for SMS
    #[serde(default)]
    pub sms_from: String,
    #[serde(default = "default_email_api_url")]
    pub email_api_url: String,
    #[serde(default)]
    pub email_api_key: String,
    #[serde(default = "default_email_from")]
    pub email_from: String,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    #[serde(default)]
    pub email_addresses: Vec<String>,
    /// Per-delivery timeout in seconds
    #[serde(default = "default_notification_timeout")]
    pub timeout_secs: u64,
}

fn default_sms_api_url() -> String {
    "https://api.twilio.com".to_string()
}

fn default_email_api_url() -> String {
    "https://api.sendgrid.com".to_string()
}

fn default_email_from() -> String {
    "alerts@safezoneai.com".to_string()
}

fn default_notification_timeout() -> u64 {
    10
}

impl NotificationConfig {
    pub fn sms_enabled(&self) -> bool {
        !self.sms_account_sid.is_empty()
            && !self.sms_auth_token.is_empty()
            && !self.sms_from.is_empty()
            && !self.phone_numbers.is_empty()
    }

    pub fn email_enabled(&self) -> bool {
        !self.email_api_key.is_empty() && !self.email_addresses.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            sms_api_url: default_sms_api_url(),
            sms_account_sid: String::new(),
            sms_auth_token: String::new(),
            sms_from: String::new(),
            email_api_url: default_email_api_url(),
            email_api_key: String::new(),
            email_from: default_email_from(),
            phone_numbers: Vec::new(),
            email_addresses: Vec::new(),
            timeout_secs: default_notification_timeout(),
        }
    }
}

/// Comma-separated recipient list, blanks dropped
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Which inference collaborator to plug into the sampler
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierConfig {
    /// Random detections, for demos and tests
    Simulated {
        #[serde(default)]
        seed: Option<u64>,
    },
    /// HTTP inference service
    Remote {
        url: String,
        #[serde(default = "default_inference_timeout")]
        timeout_secs: u64,
    },
}

fn default_inference_timeout() -> u64 {
    10
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig::Simulated { seed: None }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            health_interval_secs: default_health_interval(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            api_key: String::new(),
            cache_ttl_secs: default_cache_ttl(),
            cache_max_entries: default_cache_max_entries(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout(),
            request_timeout_secs: None,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: default_realtime_url(),
            enabled: true,
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            preferred_width: None,
            preferred_height: None,
            preferred_frame_rate: None,
            probe_capabilities: true,
            monitor_hotplug: true,
            auto_connect: true,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_detection_interval(),
            alert_cooldown_secs: default_alert_cooldown(),
            min_confidence: default_min_confidence(),
            crowd_threshold: default_crowd_threshold(),
            location: default_location(),
            classifier: ClassifierConfig::default(),
        }
    }
}

/// Load configuration from a file or use default
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = match config_path {
        Some(path) => {
            let config_str = std::fs::read_to_string(path)
                .context(format!("Failed to read config file: {:?}", path))?;

            if path.extension().map_or(false, |ext| ext == "json") {
                serde_json::from_str(&config_str).context("Failed to parse JSON config")?
            } else if path.extension().map_or(false, |ext| ext == "toml") {
                toml::from_str(&config_str).context("Failed to parse TOML config")?
            } else {
                return Err(anyhow::anyhow!("Unsupported config file format"));
            }
        }
        None => Config::default(),
    };

    Ok(apply_env_overrides(config, |key| std::env::var(key).ok()))
}

/// Secrets and deployment URLs may come from the environment instead of the file.
fn apply_env_overrides<F>(mut config: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("SAFEZONE_BACKEND_URL") {
        config.backend.base_url = url;
    }
    if let Some(key) = lookup("SAFEZONE_API_KEY") {
        config.backend.api_key = key;
    }
    if let Some(url) = lookup("SAFEZONE_REALTIME_URL") {
        config.realtime.url = url;
    }
    if let Some(email) = lookup("SAFEZONE_EMAIL") {
        config.identity.email = Some(email);
    }
    if let Some(password) = lookup("SAFEZONE_PASSWORD") {
        config.identity.password = Some(password);
    }

    let notifications = &mut config.notifications;
    if let Some(sid) = lookup("SAFEZONE_SMS_ACCOUNT_SID") {
        notifications.sms_account_sid = sid;
    }
    if let Some(token) = lookup("SAFEZONE_SMS_AUTH_TOKEN") {
        notifications.sms_auth_token = token;
    }
    if let Some(from) = lookup("SAFEZONE_SMS_FROM") {
        notifications.sms_from = from;
    }
    if let Some(key) = lookup("SAFEZONE_EMAIL_API_KEY") {
        notifications.email_api_key = key;
    }
    if let Some(numbers) = lookup("SAFEZONE_ALERT_PHONE_NUMBERS") {
        notifications.phone_numbers = split_list(&numbers);
    }
    if let Some(addresses) = lookup("SAFEZONE_ALERT_EMAILS") {
        notifications.email_addresses = split_list(&addresses);
    }
    config
}
