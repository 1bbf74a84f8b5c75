// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker around the remote endpoint, using the recloser crate.
//!
//! Only transport failures (timeouts, refused connections) count against
//! the breaker. An HTTP response of any status is a working transport, so
//! a burst of validation rejections never opens the circuit.
//!
//! States:
//! - Closed: calls pass through
//! - Open: calls fail fast with [`CircuitError::Rejected`], which the drain
//!   treats as a transient failure
//! - HalfOpen: a few probe calls decide whether to close again

use recloser::{Recloser, AsyncRecloser, Error as RecloserError};
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

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure ratio over the closed window that trips the circuit (0.0 - 1.0)
    pub error_rate: f32,
    /// Calls observed while closed before the ratio is evaluated
    pub window: usize,
    /// Probe calls allowed while half-open
    pub half_open_probes: usize,
    /// How long to stay open before probing
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            window: 10,
            half_open_probes: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            error_rate: 0.5,
            window: 2,
            half_open_probes: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call counters
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.window)
            .half_open_len(config.half_open_probes)
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

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// The returned future is only polled when the circuit lets the call through.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
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

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("remote", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("remote", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("refused") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("refused"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_repeated_failures() {
        let config = CircuitConfig {
            error_rate: 0.5,
            window: 2,
            half_open_probes: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("remote", config);

        for _ in 0..4 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
        }
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;

        // Exact trip point depends on recloser's ring buffer
        assert!(cb.rejections() >= 1);
    }

    #[tokio::test]
    async fn test_rejected_call_does_not_run_operation() {
        let config = CircuitConfig {
            error_rate: 0.5,
            window: 2,
            half_open_probes: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("remote", config);
        for _ in 0..4 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
        }

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();
        let result: Result<i32, CircuitError<&str>> = cb
            .call(|| async move {
                ran_clone.store(true, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        if matches!(result, Err(CircuitError::Rejected)) {
            assert!(!ran.load(Ordering::SeqCst));
        }
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let cb = CircuitBreaker::with_defaults("remote");

        for i in 0..4 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async move { Ok(i) }).await;
        }

        assert_eq!(cb.name(), "remote");
        assert_eq!(cb.calls_total(), 4);
        assert_eq!(cb.successes(), 4);
    }
}
