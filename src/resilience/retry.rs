// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two uses:
//! - [`retry`] loops an operation in place (opening the durable store).
//! - [`RetryConfig::delay_for_attempt`] spaces out automatic replays of a
//!   queue entry that keeps failing, without ever giving up on it.
//!
//! # Example
//!
//! ```
//! use offline_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Replay: never give up, back off to at most 15 minutes
//! let replay = RetryConfig::replay();
//! assert_eq!(replay.max_retries, None);
//! assert_eq!(replay.delay_for_attempt(0), Duration::ZERO);
//! assert_eq!(replay.delay_for_attempt(1), Duration::from_secs(5));
//! assert_eq!(replay.delay_for_attempt(100), Duration::from_secs(15 * 60));
//! ```

use std::time::Duration;
use tokio::time::sleep;
use tracing::{warn, info};
use std::future::Future;

/// Configuration for retry behavior.
///
/// - [`RetryConfig::startup()`] - Fast-fail for opening local resources
/// - [`RetryConfig::replay()`] - Backoff between automatic replays of one entry
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::replay()
    }
}

impl RetryConfig {
    /// 5 attempts, ~3 seconds total. A store that can't open by then is misconfigured.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Spacing for periodic replays of a failing entry. Unbounded: entries
    /// leave the queue only by succeeding or by explicit user action.
    #[must_use]
    pub fn replay() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15 * 60),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay to wait after `failed_attempts` consecutive failures.
    ///
    /// Zero before the first failure, then `initial_delay * factor^(n-1)`
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = (failed_attempts - 1).min(63) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = ?config.max_retries,
                    error = %err,
                    next_retry = ?delay,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}
