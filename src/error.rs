use thiserror::Error;

/// Result type used across the library
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("Camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("Camera hardware not found: {0}")]
    HardwareNotFound(String),

    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    #[error("Invalid stream: {0}")]
    InvalidStream(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Detection error: {0}")]
    Detection(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient failures worth another attempt: transport errors and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether this failure says something about backend health.
    ///
    /// Client-side rejections (4xx, auth) prove the backend answered, so they
    /// never move the circuit breaker.
    pub fn counts_against_circuit(&self) -> bool {
        self.is_retryable()
    }

    /// Operator-facing text with a remediation hint where one exists.
    pub fn user_message(&self) -> String {
        match self {
            Error::ServiceUnavailable(_) => {
                "The monitoring backend is temporarily unavailable. Requests will resume automatically within a minute.".to_string()
            }
            Error::AuthenticationRequired(_) => {
                "Your session has expired. Please sign in again.".to_string()
            }
            Error::Forbidden(_) => "This action requires an administrator account.".to_string(),
            Error::PermissionDenied(_) => {
                "Camera access was denied. Grant camera permission in your system settings and retry.".to_string()
            }
            Error::HardwareNotFound(_) => {
                "No camera was found. Connect a camera and refresh the device list.".to_string()
            }
            Error::UnsupportedEnvironment(_) => {
                "This environment does not support camera capture. Use a supported host with video capture enabled.".to_string()
            }
            Error::InvalidStream(_) => {
                "The camera opened but delivered no video. Check that no other application is using it.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Error::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Error::Network(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Realtime(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(format!("Invalid URL: {}", err))
    }
}
