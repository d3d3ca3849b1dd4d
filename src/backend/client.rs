use super::cache::{cache_key, RequestCache};
use super::circuit_breaker::{Admission, CircuitBreaker, CircuitState};
use super::metrics::{ClientMetrics, MetricsCounters};
use super::realtime::{RealtimeChannel, RealtimeConnector};
use super::retry::BackoffPolicy;
use super::transport::{HttpRequest, HttpResponse, HttpTransport, Method};
use crate::config::{BackendConfig, RealtimeConfig};
use crate::error::{Error, Result};
use crate::identity::TokenStore;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Per-call options for [`BackendClient::request`]
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub query: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    /// Overrides the default TTL for this read
    pub cache_ttl: Option<Duration>,
    /// Bypass the cache for this read (the response is still stored)
    pub skip_cache: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get()
    }
}

impl RequestOptions {
    fn with_method(method: Method, body: Option<serde_json::Value>) -> Self {
        Self {
            method,
            query: BTreeMap::new(),
            body,
            headers: Vec::new(),
            cache_ttl: None,
            skip_cache: false,
        }
    }

    pub fn get() -> Self {
        Self::with_method(Method::Get, None)
    }

    pub fn post(body: serde_json::Value) -> Self {
        Self::with_method(Method::Post, Some(body))
    }

    pub fn patch(body: serde_json::Value) -> Self {
        Self::with_method(Method::Patch, Some(body))
    }

    pub fn delete() -> Self {
        Self::with_method(Method::Delete, None)
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.insert(key.to_string(), value.into());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn fresh(mut self) -> Self {
        self.skip_cache = true;
        self
    }
}

struct ClientState {
    cache: RequestCache,
    breaker: CircuitBreaker,
    counters: MetricsCounters,
}

/// Single chokepoint for store reads/writes and the realtime channel
pub struct BackendClient {
    base_url: String,
    api_key: String,
    request_timeout: Option<Duration>,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenStore>,
    retry: BackoffPolicy,
    state: Mutex<ClientState>,
    realtime: RealtimeChannel,
}

impl BackendClient {
    pub fn new(
        config: &BackendConfig,
        realtime_config: &RealtimeConfig,
        transport: Arc<dyn HttpTransport>,
        connector: Arc<dyn RealtimeConnector>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        let retry = BackoffPolicy::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
            config.max_retries,
        );
        let reconnect = BackoffPolicy::new(
            Duration::from_millis(realtime_config.reconnect_base_delay_ms),
            Duration::from_millis(realtime_config.reconnect_max_delay_ms),
            realtime_config.max_reconnect_attempts,
        );

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_timeout: config.request_timeout_secs.map(Duration::from_secs),
            transport,
            tokens: tokens.clone(),
            retry,
            state: Mutex::new(ClientState {
                cache: RequestCache::new(config.cache_max_entries, config.cache_ttl()),
                breaker: CircuitBreaker::new(config.failure_threshold, config.reset_timeout()),
                counters: MetricsCounters::default(),
            }),
            realtime: RealtimeChannel::new(connector, tokens, reconnect),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Perform a store call with caching, circuit breaking and retries.
    ///
    /// `endpoint` is the table path under `/rest/v1/`.
    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> Result<serde_json::Value> {
        let is_read = options.method.is_read();
        let key = cache_key(endpoint, &options.query);

        let generation = if is_read {
            let mut state = self.lock_state();
            if !options.skip_cache {
                if let Some(payload) = state.cache.get(&key) {
                    state.counters.cache_hits += 1;
                    debug!("Cache hit for {}", key);
                    return Ok(payload);
                }
                state.counters.cache_misses += 1;
            }
            state.cache.generation(endpoint)
        } else {
            0
        };

        let admission = {
            let mut state = self.lock_state();
            let admission = state.breaker.try_acquire();
            if admission == Admission::Rejected {
                state.counters.rejected_requests += 1;
            }
            admission
        };
        if admission == Admission::Rejected {
            return Err(Error::ServiceUnavailable(format!(
                "Circuit open, refusing {} {}",
                options.method, endpoint
            )));
        }
        if admission == Admission::Probe {
            debug!("Probing backend health with {} {}", options.method, endpoint);
        }

        let started = Instant::now();
        let result = self.execute_with_retry(endpoint, &options).await;

        let mut state = self.lock_state();
        state.counters.total_requests += 1;
        match result {
            Ok(payload) => {
                state.breaker.record_success();
                state.counters.record_latency(started.elapsed());
                if is_read {
                    let stored = state.cache.insert_if_current(
                        key,
                        endpoint,
                        payload.clone(),
                        options.cache_ttl,
                        generation,
                    );
                    if !stored {
                        debug!("Not caching {}: written to while the read was in flight", endpoint);
                    }
                } else {
                    state.cache.invalidate_endpoint(endpoint);
                }
                Ok(payload)
            }
            Err(err) => {
                state.counters.failed_requests += 1;
                if err.counts_against_circuit() {
                    state.breaker.record_failure(admission);
                } else if admission == Admission::Probe {
                    state.breaker.release_probe();
                }
                Err(err)
            }
        }
    }

    async fn execute_with_retry(&self, endpoint: &str, options: &RequestOptions) -> Result<serde_json::Value> {
        let mut attempt = 0;
        loop {
            let request = self.build_request(endpoint, options);
            let result = match self.transport.execute(request).await {
                Ok(response) => self.interpret(endpoint, response),
                Err(e) => Err(e),
            };

            match result {
                Err(err) if err.is_retryable() && self.retry.allows(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        "{} {} failed ({}), retry {}/{} in {:?}",
                        options.method, endpoint, err, attempt, self.retry.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    fn build_request(&self, endpoint: &str, options: &RequestOptions) -> HttpRequest {
        let bearer = self.tokens.token().unwrap_or_else(|| self.api_key.clone());
        let mut headers = vec![
            ("apikey".to_string(), self.api_key.clone()),
            ("Authorization".to_string(), format!("Bearer {}", bearer)),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        headers.extend(options.headers.iter().cloned());

        HttpRequest {
            query: options.query.clone(),
            headers,
            body: options.body.clone(),
            timeout: self.request_timeout,
            ..HttpRequest::new(
                options.method,
                format!("{}/rest/v1/{}", self.base_url, endpoint.trim_start_matches('/')),
            )
        }
    }

    fn interpret(&self, endpoint: &str, response: HttpResponse) -> Result<serde_json::Value> {
        if response.is_success() {
            return Ok(response.body);
        }
        if response.status == 401 {
            self.tokens
                .clear_for_reauth(&format!("{} returned 401", endpoint));
            return Err(Error::AuthenticationRequired(format!(
                "Session rejected by {}",
                endpoint
            )));
        }

        let message = response
            .body
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| response.body.to_string());
        Err(Error::Http {
            status: response.status,
            message,
        })
    }

    pub fn invalidate_cache(&self, endpoint: &str) -> usize {
        self.lock_state().cache.invalidate_endpoint(endpoint)
    }

    pub fn clear_cache(&self) {
        self.lock_state().cache.clear();
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock_state().breaker.state()
    }

    /// Snapshot of request counters; reading it changes nothing.
    pub fn metrics(&self) -> ClientMetrics {
        let state = self.lock_state();
        ClientMetrics::from_counters(
            &state.counters,
            state.breaker.state(),
            state.breaker.failure_count(),
            self.realtime.is_connected(),
        )
    }

    /// Start the push channel with the current token.
    pub fn connect_realtime(&self) {
        self.realtime.connect();
    }

    pub async fn disconnect_realtime(&self) {
        self.realtime.disconnect().await;
    }

    pub fn realtime(&self) -> &RealtimeChannel {
        &self.realtime
    }
}
