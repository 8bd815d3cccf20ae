// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker pattern using recloser crate.
//!
//! The device may report itself online while the API is unreachable (captive
//! portal, server outage). Wrapping remote calls in a breaker stops every
//! save from waiting on a dead endpoint: once it trips, calls fail fast and
//! the caller takes the offline path (queue or cache).
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Service unhealthy, requests fail-fast without attempting
//! - HalfOpen: Testing if service recovered, limited requests allowed

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CircuitConfig {
    /// Calls a closed circuit observes before it may trip. With every call
    /// failing, the circuit opens on exactly this many failures and the
    /// next call is rejected. Values below 2 behave as 2.
    pub failure_threshold: u32,
    /// Failure ratio over the most recent `failure_threshold - 1` calls
    /// that trips the circuit (0.0 - 1.0)
    pub error_rate: f32,
    /// Trial calls in half-open before deciding to close. Values below 2
    /// behave as 2.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open)
    #[serde(deserialize_with = "deserialize_millis")]
    pub recovery_timeout: Duration,
}

fn deserialize_millis<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_rate: 0.8,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            error_rate: 0.5,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

fn ring_len(calls: u32) -> usize {
    calls.saturating_sub(1).max(1) as usize
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        // recloser fills its ring before judging, then decides on the call
        // after: a ring of n - 1 decides on the n-th call.
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(ring_len(config.failure_threshold))
            .half_open_len(ring_len(config.success_threshold))
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call succeeded");
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", &CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", &CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.successes(), 0);
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let config = CircuitConfig {
            recovery_timeout: Duration::from_secs(60),
            ..CircuitConfig::test()
        };
        let cb = CircuitBreaker::new("test", &config);

        for _ in 0..config.failure_threshold {
            let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
            assert!(matches!(result, Err(CircuitError::Inner("fail"))));
        }

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;
        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert_eq!(cb.failures(), u64::from(config.failure_threshold));
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test]
    async fn test_default_circuit_opens_on_fifth_failure() {
        let config = CircuitConfig {
            recovery_timeout: Duration::from_secs(60),
            ..CircuitConfig::default()
        };
        let cb = CircuitBreaker::new("test", &config);

        for attempt in 1..=5 {
            let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
            assert!(matches!(result, Err(CircuitError::Inner(_))), "attempt {attempt}");
        }
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(CircuitError::Rejected)));
    }

    #[test]
    fn test_ring_len_decides_on_threshold_call() {
        assert_eq!(ring_len(5), 4);
        assert_eq!(ring_len(2), 1);
        assert_eq!(ring_len(1), 1);
        assert_eq!(ring_len(0), 1);
    }

    #[tokio::test]
    async fn test_failure_rate_calculation() {
        let config = CircuitConfig {
            failure_threshold: 100,
            error_rate: 0.99,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("test", &config);

        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("x") }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(2) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("y") }).await;

        assert_eq!(cb.calls_total(), 4);
        assert!((cb.failure_rate() - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_circuit_with_async_state() {
        let cb = CircuitBreaker::new("test", &CircuitConfig::test());
        let counter = std::sync::Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let result: Result<usize, CircuitError<&str>> = cb
            .call(|| async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok(counter_clone.load(Ordering::SeqCst))
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_config_from_json() {
        let config: CircuitConfig = serde_json::from_str(
            r#"{"failure_threshold": 10, "error_rate": 0.5, "success_threshold": 3, "recovery_timeout": 1500}"#,
        )
        .unwrap();
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.recovery_timeout, Duration::from_millis(1500));
    }
}
