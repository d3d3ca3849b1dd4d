use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// HTTP verbs used against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Method {
    /// Reads are cacheable; everything else invalidates.
    pub fn is_read(&self) -> bool {
        matches!(self, Method::Get)
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Patch => write!(f, "PATCH"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A fully resolved request handed to the transport.
///
/// `body` is sent as JSON and `form` as `application/x-www-form-urlencoded`;
/// at most one of them is set.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: BTreeMap<String, String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub form: Option<Vec<(String, String)>>,
    /// HTTP basic credentials as (user, password)
    pub basic_auth: Option<(String, String)>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: BTreeMap::new(),
            headers: Vec::new(),
            body: None,
            form: None,
            basic_auth: None,
            timeout: None,
        }
    }

    /// Value of a form field
    pub fn form_field(&self, name: &str) -> Option<&str> {
        self.form
            .as_ref()?
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Raw response; status interpretation is left to the client
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl HttpResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network seam of the backend client.
///
/// Implementations return `Err` only for transport failures (connect, DNS,
/// reset, timeout). Any HTTP status, including 4xx/5xx, comes back as `Ok`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut req = self.client.request(method, &request.url);
        if !request.query.is_empty() {
            req = req.query(&request.query);
        }
        for (key, value) in &request.headers {
            req = req.header(key, value);
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        } else if let Some(form) = &request.form {
            req = req.form(form);
        }
        if let Some((user, password)) = &request.basic_auth {
            req = req.basic_auth(user, Some(password));
        }
        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} {} failed: {}", request.method, request.url, e)))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read response body: {}", e)))?;

        // Empty bodies (204, return=minimal) and plain-text errors are both legal.
        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };

        Ok(HttpResponse { status, body })
    }
}
