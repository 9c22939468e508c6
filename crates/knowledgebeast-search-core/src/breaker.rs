//! Circuit breaker for the vector backend.
//!
//! Classic three-state breaker with a fixed-interval count window:
//!
//! - **Closed**: failures are timestamped; entries older than `window` are
//!   pruned. Reaching `failure_threshold` live entries opens the circuit.
//! - **Open**: every call is rejected immediately with `CircuitOpen` (no
//!   backend contact). After `cooldown`, the next observation promotes the
//!   breaker to Half-Open.
//! - **Half-Open**: up to `half_open_probes` concurrent trial calls pass
//!   through. A single success closes the circuit and fully clears the
//!   failure history; any failure re-opens it with a fresh cooldown.
//!
//! All transitions happen under one mutex, so `state()` never observes a
//! state incompatible with the last recorded transition.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{SearchError, SearchResult};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast; calls are rejected without backend contact.
    Open,
    /// Testing recovery with a bounded number of probe calls.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `window` required to open the circuit.
    pub failure_threshold: u32,
    /// Width of the failure-counting window.
    pub window: Duration,
    /// How long the circuit stays Open before allowing probes.
    pub cooldown: Duration,
    /// Concurrent trial calls allowed while Half-Open.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }
}

enum Inner {
    Closed { failures: VecDeque<Instant> },
    Open { opened_at: Instant },
    HalfOpen { inflight: u32 },
}

/// Thread-safe circuit breaker. See the module docs for the state machine.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::Closed {
                failures: VecDeque::new(),
            }),
            config,
        }
    }

    /// Current state. Performs the time-based Open → Half-Open promotion.
    pub fn state(&self) -> CircuitState {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Self::promote(&mut inner, &self.config);
        match &*inner {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Failures currently counted in the Closed window. Zero in any other
    /// state (the history is consumed by the transition to Open).
    pub fn failure_count(&self) -> u32 {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Self::promote(&mut inner, &self.config);
        match &mut *inner {
            Inner::Closed { failures } => {
                Self::prune(failures, self.config.window);
                u32::try_from(failures.len()).unwrap_or(u32::MAX)
            }
            _ => 0,
        }
    }

    /// Ask permission to make a call.
    ///
    /// # Errors
    /// Returns [`SearchError::CircuitOpen`] when the circuit is Open, or when
    /// it is Half-Open and all probe slots are taken. A granted Half-Open
    /// permission occupies a probe slot until `on_success`/`on_failure`.
    pub fn check(&self) -> SearchResult<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Self::promote(&mut inner, &self.config);
        match &mut *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { opened_at } => {
                let remaining = self
                    .config
                    .cooldown
                    .saturating_sub(opened_at.elapsed());
                knowledgebeast_core::global_metrics()
                    .backend
                    .breaker_rejections_total
                    .inc();
                Err(SearchError::CircuitOpen(format!(
                    "circuit open; probes allowed in {:.1}s",
                    remaining.as_secs_f64()
                )))
            }
            Inner::HalfOpen { inflight } => {
                if *inflight < self.config.half_open_probes {
                    *inflight += 1;
                    Ok(())
                } else {
                    knowledgebeast_core::global_metrics()
                        .backend
                        .breaker_rejections_total
                        .inc();
                    Err(SearchError::CircuitOpen(
                        "circuit half-open; probe slots exhausted".to_string(),
                    ))
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// A Half-Open success closes the circuit and clears all failure history.
    pub fn on_success(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Self::promote(&mut inner, &self.config);
        match &mut *inner {
            Inner::HalfOpen { .. } => {
                tracing::info!("circuit breaker closed after successful probe");
                *inner = Inner::Closed {
                    failures: VecDeque::new(),
                };
            }
            // Late success from a call issued before the circuit opened:
            // the open decision stands until the cooldown runs its course.
            Inner::Closed { .. } | Inner::Open { .. } => {}
        }
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Self::promote(&mut inner, &self.config);
        match &mut *inner {
            Inner::Closed { failures } => {
                failures.push_back(Instant::now());
                Self::prune(failures, self.config.window);
                if failures.len() >= self.config.failure_threshold as usize {
                    tracing::warn!(
                        failures = failures.len(),
                        window_secs = self.config.window.as_secs(),
                        "circuit breaker opened"
                    );
                    knowledgebeast_core::global_metrics()
                        .backend
                        .breaker_opens_total
                        .inc();
                    *inner = Inner::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                tracing::warn!("circuit breaker re-opened by failed probe");
                knowledgebeast_core::global_metrics()
                    .backend
                    .breaker_opens_total
                    .inc();
                *inner = Inner::Open {
                    opened_at: Instant::now(),
                };
            }
            // Late failure while already Open: the cooldown timer is not
            // extended by stragglers.
            Inner::Open { .. } => {}
        }
    }

    /// Force the breaker Closed and clear the failure window.
    ///
    /// This clears state directly rather than relying on a transition, so it
    /// works even when the breaker is already Closed.
    pub fn reset(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *inner = Inner::Closed {
            failures: VecDeque::new(),
        };
    }

    fn promote(inner: &mut Inner, config: &BreakerConfig) {
        if let Inner::Open { opened_at } = inner
            && opened_at.elapsed() >= config.cooldown
        {
            *inner = Inner::HalfOpen { inflight: 0 };
        }
    }

    fn prune(failures: &mut VecDeque<Instant>, window: Duration) {
        while let Some(front) = failures.front() {
            if front.elapsed() > window {
                failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(10),
            cooldown: Duration::from_millis(30),
            half_open_probes: 2,
        }
    }

    #[test]
    fn opens_at_threshold_and_rejects() {
        let cb = CircuitBreaker::new(fast_config());
        assert_eq!(cb.state(), CircuitState::Closed);
        for _ in 0..3 {
            cb.check().unwrap();
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.check(), Err(SearchError::CircuitOpen(_))));
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_success() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.check().unwrap();
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0, "history fully cleared");
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_cooldown() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.check().unwrap();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.check(), Err(SearchError::CircuitOpen(_))));
    }

    #[test]
    fn half_open_probe_slots_are_bounded() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(40));

        cb.check().unwrap();
        cb.check().unwrap();
        assert!(
            matches!(cb.check(), Err(SearchError::CircuitOpen(_))),
            "third concurrent probe must be rejected"
        );
    }

    #[test]
    fn reset_clears_even_when_closed() {
        let cb = CircuitBreaker::new(fast_config());
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.failure_count(), 2);
        cb.reset();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn late_success_does_not_close_an_open_circuit() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.on_failure();
        }
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
