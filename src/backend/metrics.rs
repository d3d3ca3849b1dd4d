use super::circuit_breaker::CircuitState;
use serde::Serialize;
use std::time::Duration;

/// Raw counters owned by the backend client
#[derive(Debug, Default, Clone)]
pub(crate) struct MetricsCounters {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub average_latency_ms: f64,
    latency_samples: u64,
}

impl MetricsCounters {
    /// Fold one successful request into the running average.
    pub fn record_latency(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.latency_samples += 1;
        self.average_latency_ms += (sample - self.average_latency_ms) / self.latency_samples as f64;
    }
}

/// Point-in-time health snapshot of the backend client
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientMetrics {
    /// Requests that reached the network, successful or not
    pub total_requests: u64,
    /// Requests that failed after all retries
    pub failed_requests: u64,
    /// Calls refused while the circuit was open
    pub rejected_requests: u64,
    pub success_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub average_latency_ms: f64,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub realtime_connected: bool,
}

impl ClientMetrics {
    pub(crate) fn from_counters(
        counters: &MetricsCounters,
        circuit_state: CircuitState,
        consecutive_failures: u32,
        realtime_connected: bool,
    ) -> Self {
        let success_rate = if counters.total_requests == 0 {
            1.0
        } else {
            1.0 - counters.failed_requests as f64 / counters.total_requests as f64
        };
        let lookups = counters.cache_hits + counters.cache_misses;
        let cache_hit_rate = if lookups == 0 {
            0.0
        } else {
            counters.cache_hits as f64 / lookups as f64
        };

        Self {
            total_requests: counters.total_requests,
            failed_requests: counters.failed_requests,
            rejected_requests: counters.rejected_requests,
            success_rate,
            cache_hits: counters.cache_hits,
            cache_misses: counters.cache_misses,
            cache_hit_rate,
            average_latency_ms: counters.average_latency_ms,
            circuit_state,
            consecutive_failures,
            realtime_connected,
        }
    }
}
