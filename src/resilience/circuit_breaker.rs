//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: testing if backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold
//! Open → Half-Open: after recovery timeout
//! Half-Open → Closed: probe request succeeds
//! Half-Open → Open: probe request fails
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-route breaker settings, carried in the state bag by filters or
/// supplied as the registry default. The host is filled in by the engine
/// from the outgoing host of the current request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Host the breaker guards. Set by the engine, not by filters.
    pub host: String,
    /// Consecutive failures that open the circuit. Zero disables.
    pub failures: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub timeout: Duration,
}

impl BreakerSettings {
    fn key(&self) -> String {
        format!("{}#{}#{}", self.host, self.failures, self.timeout.as_millis())
    }
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { probe_inflight: bool },
}

/// A single consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Ask whether a request may pass. Returns a completion handle when it
    /// may; the caller reports the outcome through it. `None` means the
    /// circuit is open.
    pub fn allow(self: &Arc<Self>) -> Option<BreakerDone> {
        let mut state = self.state.lock().expect("breaker state poisoned");
        match &mut *state {
            State::Closed { .. } => {}
            State::Open { since } => {
                if since.elapsed() < self.settings.timeout {
                    return None;
                }
                *state = State::HalfOpen {
                    probe_inflight: true,
                };
            }
            State::HalfOpen { probe_inflight } => {
                if *probe_inflight {
                    return None;
                }
                *probe_inflight = true;
            }
        }
        Some(BreakerDone {
            breaker: self.clone(),
        })
    }

    fn record(&self, success: bool) {
        let mut state = self.state.lock().expect("breaker state poisoned");
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                if success {
                    *consecutive_failures = 0;
                } else {
                    *consecutive_failures += 1;
                    if *consecutive_failures >= self.settings.failures {
                        tracing::warn!(host = %self.settings.host, "circuit breaker opened");
                        *state = State::Open {
                            since: Instant::now(),
                        };
                    }
                }
            }
            State::HalfOpen { .. } => {
                if success {
                    tracing::info!(host = %self.settings.host, "circuit breaker closed");
                    *state = State::Closed {
                        consecutive_failures: 0,
                    };
                } else {
                    *state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            State::Open { .. } => {}
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Open { .. })
    }
}

/// Completion handle returned by `allow`. Call sites may report more than
/// one outcome through the same handle (a failed attempt followed by its
/// retry); each call records one observation.
#[derive(Debug, Clone)]
pub struct BreakerDone {
    breaker: Arc<CircuitBreaker>,
}

impl BreakerDone {
    pub fn done(&self, success: bool) {
        self.breaker.record(success);
    }
}

/// Registry handing out breakers by settings. Externally owned; the engine
/// treats it as concurrent-safe.
pub struct BreakerRegistry {
    /// Applied when a route carries no settings of its own. Zero failure
    /// threshold means no breaker for such routes.
    default: Option<BreakerSettings>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default: Option<BreakerSettings>) -> Self {
        Self {
            default,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for the given settings, created on first use. Settings
    /// without a failure threshold fall back to the registry default.
    pub fn get(&self, mut settings: BreakerSettings) -> Option<Arc<CircuitBreaker>> {
        if settings.failures == 0 {
            let default = self.default.as_ref()?;
            let host = std::mem::take(&mut settings.host);
            settings = default.clone();
            settings.host = host;
        }
        if settings.failures == 0 {
            return None;
        }

        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        let breaker = breakers
            .entry(settings.key())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(settings)))
            .clone();
        Some(breaker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(failures: u32, timeout_ms: u64) -> BreakerSettings {
        BreakerSettings {
            host: "b.internal".into(),
            failures,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let b = Arc::new(CircuitBreaker::new(settings(2, 60_000)));

        b.allow().unwrap().done(false);
        assert!(!b.is_open());
        b.allow().unwrap().done(false);
        assert!(b.is_open());
        assert!(b.allow().is_none());
    }

    #[test]
    fn success_resets_failure_count() {
        let b = Arc::new(CircuitBreaker::new(settings(2, 60_000)));

        b.allow().unwrap().done(false);
        b.allow().unwrap().done(true);
        b.allow().unwrap().done(false);
        assert!(!b.is_open());
    }

    #[test]
    fn half_open_allows_single_probe() {
        let b = Arc::new(CircuitBreaker::new(settings(1, 0)));

        b.allow().unwrap().done(false);
        // Timeout of zero: the next allow transitions to half-open.
        let probe = b.allow().unwrap();
        assert!(b.allow().is_none(), "second probe must be rejected");
        probe.done(true);
        assert!(b.allow().is_some());
    }

    #[test]
    fn registry_reuses_breakers_and_honours_default() {
        let registry = BreakerRegistry::new(Some(settings(3, 1_000)));

        let a = registry.get(BreakerSettings {
            host: "x".into(),
            ..Default::default()
        });
        let b = registry.get(BreakerSettings {
            host: "x".into(),
            ..Default::default()
        });
        assert!(Arc::ptr_eq(a.as_ref().unwrap(), b.as_ref().unwrap()));

        let none = BreakerRegistry::new(None).get(BreakerSettings::default());
        assert!(none.is_none());
    }
}
