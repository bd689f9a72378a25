//! Circuit breaker for the auth dependency. Process-global: the state is
//! lazily initialised on first use and never torn down in normal operation,
//! so a module reload cannot silently close an open circuit.

use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone, Copy, Debug)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_for: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_for: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { consecutive_successes: u32 },
}

/// Observable snapshot for the stats endpoint.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a request may pass. An elapsed open interval transitions to
    /// half-open and admits the probe.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit poisoned");
        match &*inner {
            Inner::Closed { .. } | Inner::HalfOpen { .. } => true,
            Inner::Open { until } => {
                if Instant::now() >= *until {
                    *inner = Inner::HalfOpen {
                        consecutive_successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit poisoned");
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => *consecutive_failures = 0,
            Inner::HalfOpen {
                consecutive_successes,
            } => {
                *consecutive_successes += 1;
                if *consecutive_successes >= self.config.success_threshold {
                    *inner = Inner::Closed {
                        consecutive_failures: 0,
                    };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit poisoned");
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    *inner = Inner::Open {
                        until: Instant::now() + self.config.open_for,
                    };
                }
            }
            // A half-open probe failure reopens immediately.
            Inner::HalfOpen { .. } => {
                *inner = Inner::Open {
                    until: Instant::now() + self.config.open_for,
                };
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().expect("circuit poisoned");
        match &*inner {
            Inner::Closed {
                consecutive_failures,
            } => CircuitStats {
                state: CircuitState::Closed,
                consecutive_failures: *consecutive_failures,
                consecutive_successes: 0,
            },
            Inner::Open { .. } => CircuitStats {
                state: CircuitState::Open,
                consecutive_failures: 0,
                consecutive_successes: 0,
            },
            Inner::HalfOpen {
                consecutive_successes,
            } => CircuitStats {
                state: CircuitState::HalfOpen,
                consecutive_failures: 0,
                consecutive_successes: *consecutive_successes,
            },
        }
    }
}

/// The auth-dependency breaker singleton.
pub fn auth_circuit() -> &'static CircuitBreaker {
    static CIRCUIT: OnceLock<CircuitBreaker> = OnceLock::new();
    CIRCUIT.get_or_init(|| CircuitBreaker::new(CircuitConfig::default()))
}
