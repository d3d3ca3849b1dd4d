use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker for permission to call the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call in the closed state
    Allowed,
    /// The single trial call after the reset timeout
    Probe,
    /// Fail fast without touching the network
    Rejected,
}

/// Consecutive-failure circuit breaker.
///
/// Not synchronized; the backend client keeps it behind its own lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            probe_in_flight: false,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn try_acquire(&mut self) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Rejected
                } else {
                    self.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.probe_in_flight = false;
    }

    /// Count a final failure of a call admitted as `admission`.
    ///
    /// A failed half-open trial reopens immediately. A closed breaker opens
    /// once the threshold is reached. Calls admitted before the breaker left
    /// the closed state are counted but never move it, so they cannot end a
    /// trial that is still running.
    pub fn record_failure(&mut self, admission: Admission) {
        self.failure_count = self.failure_count.saturating_add(1);

        match (admission, self.state) {
            (Admission::Probe, CircuitState::HalfOpen) => {
                self.probe_in_flight = false;
                self.last_failure = Some(Instant::now());
                log::warn!("Circuit breaker probe failed; reopening");
                self.state = CircuitState::Open;
            }
            (_, CircuitState::Closed) => {
                self.last_failure = Some(Instant::now());
                if self.failure_count >= self.failure_threshold {
                    log::warn!(
                        "Circuit breaker opened after {} consecutive failures",
                        self.failure_count
                    );
                    self.state = CircuitState::Open;
                }
            }
            _ => {}
        }
    }

    /// End a probe whose outcome says nothing about backend health (4xx).
    /// The next caller may probe again.
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }
}
