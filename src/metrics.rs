// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the offline sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host app is
//! responsible for installing an exporter.
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `queue`: approval-action, form-response, signature, serial-generation
//! - `outcome`: succeeded, failed, needs_attention, suppressed, offline, cancelled
//! - `result`: fresh, stale, miss

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record an entry persisted to a queue
pub fn record_enqueue(queue: &str) {
    counter!(
        "offline_sync_enqueued_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Set the number of entries currently waiting in a queue
pub fn set_pending(queue: &str, count: usize) {
    gauge!(
        "offline_sync_pending_entries",
        "queue" => queue.to_string()
    )
    .set(count as f64);
}

/// Record the outcome of a single entry replay
pub fn record_replay(queue: &str, outcome: &str) {
    counter!(
        "offline_sync_replays_total",
        "queue" => queue.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a drain run
pub fn record_drain(queue: &str, outcome: &str, duration: Duration) {
    counter!(
        "offline_sync_drains_total",
        "queue" => queue.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "offline_sync_drain_seconds",
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record remote call latency
pub fn record_remote_latency(queue: &str, step: &str, duration: Duration) {
    histogram!(
        "offline_sync_remote_call_seconds",
        "queue" => queue.to_string(),
        "step" => step.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a remote call that hit its timeout
pub fn record_timeout(queue: &str, step: &str) {
    counter!(
        "offline_sync_timeouts_total",
        "queue" => queue.to_string(),
        "step" => step.to_string()
    )
    .increment(1);
}

/// Record a cache read
pub fn record_cache_read(result: &str) {
    counter!(
        "offline_sync_cache_reads_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record a stale value served while a background refresh runs
pub fn record_cache_fallback() {
    counter!("offline_sync_cache_fallbacks_total").increment(1);
}

/// Record detection of an unreadable persisted record
pub fn record_corruption(key: &str) {
    counter!(
        "offline_sync_corruption_detected_total",
        "key" => key.to_string()
    )
    .increment(1);
}

/// Set connectivity (1 = online, 0 = offline)
pub fn set_online(online: bool) {
    gauge!("offline_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// Record connectivity transition
pub fn record_transition(to: &str) {
    counter!(
        "offline_sync_connectivity_transitions_total",
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "offline_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Elapsed-time helper for the latency histograms
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
