//! Bounded exponential-backoff retry for idempotent backend calls.
//!
//! The retry loop sits *outside* the circuit breaker, so every attempt is an
//! individual breaker decision: a `CircuitOpen` rejection is surfaced
//! immediately rather than burned through the attempt budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{SearchError, SearchResult};

/// Retry tuning parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (≥ 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Backoff growth factor per retry (≥ 1.0).
    pub multiplier: f64,
    /// Ceiling on any single delay.
    pub max_backoff: Duration,
    /// Uniform jitter as a ± fraction of the computed delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed retry count).
    ///
    /// Formula: `min(initial * multiplier^attempt, max)` ± `jitter` fraction.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64;
        let max_ms = self.max_backoff.as_millis() as f64;
        #[allow(clippy::cast_possible_wrap)]
        let exponent = attempt as i32;
        let raw = (base_ms * self.multiplier.powi(exponent)).min(max_ms);
        let jittered = raw.mul_add(self.jitter * jitter_factor(), raw);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Execute `op` with retries.
    ///
    /// `retry_on` decides per failure whether another attempt is worthwhile;
    /// failures it rejects are surfaced immediately. `CircuitOpen` is never
    /// retried regardless of the predicate.
    ///
    /// # Errors
    /// Returns the final error once attempts are exhausted, or the first
    /// non-retryable error.
    pub fn execute<T, F, P>(&self, mut op: F, retry_on: P) -> SearchResult<T>
    where
        F: FnMut() -> SearchResult<T>,
        P: Fn(&SearchError) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                knowledgebeast_core::global_metrics().backend.retries_total.inc();
                std::thread::sleep(self.delay_for_attempt(attempt - 1));
            }

            match op() {
                Ok(v) => return Ok(v),
                Err(e @ SearchError::CircuitOpen(_)) => return Err(e),
                Err(e) if retry_on(&e) => {
                    tracing::debug!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "retryable backend failure"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| SearchError::Internal("retry loop exhausted with no error".into())))
    }
}

/// Jitter factor in `[-1.0, 1.0]` from a process-global LCG.
///
/// This only needs to break retry synchronization across callers, not be
/// cryptographically random, so we avoid a `rand` dependency.
#[allow(clippy::cast_precision_loss)]
fn jitter_factor() -> f64 {
    static SEED: AtomicU64 = AtomicU64::new(0);

    let prev = SEED.load(Ordering::Relaxed);
    if prev == 0 {
        let init = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0x9e37_79b9, |d| {
                let ns = d.as_nanos();
                #[allow(clippy::cast_possible_truncation)]
                let v = (ns & u128::from(u64::MAX)) as u64;
                v | 1
            });
        SEED.compare_exchange(0, init, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
    }

    let a: u64 = 6_364_136_223_846_793_005;
    let c: u64 = 1_442_695_040_888_963_407;
    let old = SEED.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
        Some(x.wrapping_mul(a).wrapping_add(c))
    });
    let val = old.unwrap_or(42);
    (val as f64 / u64::MAX as f64).mul_add(2.0, -1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
            jitter: 0.0,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let out = fast_policy().execute(
            || {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SearchError::BackendUnavailable("transient".into()))
                } else {
                    Ok(7)
                }
            },
            SearchError::is_retryable,
        );
        assert_eq!(out.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn non_retryable_surfaces_immediately() {
        let attempts = AtomicU32::new(0);
        let out: SearchResult<()> = fast_policy().execute(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(SearchError::InvalidQuery("bad".into()))
            },
            SearchError::is_retryable,
        );
        assert!(out.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn circuit_open_is_never_retried() {
        let attempts = AtomicU32::new(0);
        let out: SearchResult<()> = fast_policy().execute(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(SearchError::CircuitOpen("open".into()))
            },
            // Even an always-retry predicate must not override CircuitOpen.
            |_| true,
        );
        assert!(matches!(out, Err(SearchError::CircuitOpen(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_attempts_return_last_error() {
        let out: SearchResult<()> = fast_policy().execute(
            || Err(SearchError::BackendUnavailable("still down".into())),
            SearchError::is_retryable,
        );
        assert!(matches!(out, Err(SearchError::BackendUnavailable(_))));
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..fast_policy()
        };
        let d0 = policy.delay_for_attempt(0);
        let d1 = policy.delay_for_attempt(1);
        let d9 = policy.delay_for_attempt(9);
        assert!(d0 <= d1);
        assert!(d9 <= policy.max_backoff);
    }
}
