// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replays queued mutations against the remote endpoint.
//!
//! # Drain of one queue
//!
//! ```text
//! offline? ──yes──► Offline (no calls)
//!    │
//! already draining? ──yes──► Suppressed (no calls)
//!    │
//! snapshot entries (creation order, skip NeedsAttention)
//!    │
//! for each entry, one at a time:
//!    cancelled? ──► Cancelled
//!    replay steps from cursor ──► all 2xx      → remove + fold into cache
//!                             ──► transient    → keep, attempt_count += 1
//!                             ──► permanent    → NeedsAttention
//! ```
//!
//! Only one drain per queue runs at a time (atomic flag, reset by an RAII
//! guard). Different queues can drain concurrently. The queue's mutex is
//! taken per bookkeeping update, never across a remote call, so the UI can
//! keep enqueueing while a drain is in flight. Those entries are picked up
//! by the next drain.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cache::CacheLayer;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityObserver;
use crate::metrics::LatencyTimer;
use crate::queue::{EntryId, MutationQueue, QueueEntry, QueueName};
use crate::reconcile::{next_step, policy_for, Disposition};
use crate::remote::{
    AttachmentResolver, RemoteEndpoint, RemoteRequest, RemoteResponse, TransportError,
};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::resilience::retry::RetryConfig;

/// What asked for a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    /// Connectivity came back (or the platform repeated an online signal)
    Reconnected,
    /// App returned to the foreground with pending entries
    Foreground,
    /// User pressed retry
    UserRetry,
    /// Retry tick while online. The only trigger that honours per-entry backoff.
    Periodic,
}

impl DrainTrigger {
    fn respects_backoff(self) -> bool {
        matches!(self, Self::Periodic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every eligible entry was attempted
    Completed,
    Offline,
    /// Another drain of the same queue was in flight
    Suppressed,
    Cancelled,
    /// The queue couldn't be read
    StorageFailed,
}

impl DrainOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Offline => "offline",
            Self::Suppressed => "suppressed",
            Self::Cancelled => "cancelled",
            Self::StorageFailed => "storage_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub queue: QueueName,
    pub succeeded: Vec<EntryId>,
    /// Transient failures, still queued
    pub failed: Vec<EntryId>,
    /// Newly flagged during this drain
    pub needs_attention: Vec<EntryId>,
    /// Still backing off, not attempted by a periodic drain
    pub deferred: Vec<EntryId>,
    pub outcome: DrainOutcome,
}

impl DrainReport {
    fn new(queue: QueueName, outcome: DrainOutcome) -> Self {
        Self {
            queue,
            succeeded: Vec::new(),
            failed: Vec::new(),
            needs_attention: Vec::new(),
            deferred: Vec::new(),
            outcome,
        }
    }

    #[must_use]
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.needs_attention.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrainEvent {
    Completed(DrainReport),
    NeedsAttention {
        queue: QueueName,
        id: EntryId,
        reason: String,
        status: Option<u16>,
    },
}

/// Result of replaying one entry's remaining steps.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// Every step acknowledged. Carries the last step's response.
    Succeeded(RemoteResponse),
    /// Worth trying again later
    Transient { error: String },
    /// The remote side (or the local data) rules out ever succeeding
    Permanent { reason: String, status: Option<u16> },
}

struct DrainSettings {
    request_timeout: Duration,
    max_attempts: Option<u32>,
}

/// Resets the per-queue in-flight flag when the drain ends, however it ends.
struct DrainGuard(Arc<AtomicBool>);

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DrainScheduler {
    queue: Arc<MutationQueue>,
    cache: Arc<CacheLayer>,
    endpoint: Arc<dyn RemoteEndpoint>,
    attachments: Arc<dyn AttachmentResolver>,
    connectivity: ConnectivityObserver,
    clock: Arc<dyn Clock>,
    circuit: CircuitBreaker,
    backoff: RetryConfig,
    settings: RwLock<DrainSettings>,
    in_flight: DashMap<QueueName, Arc<AtomicBool>>,
    cancel_epoch: AtomicU64,
    events: broadcast::Sender<DrainEvent>,
}

impl DrainScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &SyncConfig,
        queue: Arc<MutationQueue>,
        cache: Arc<CacheLayer>,
        endpoint: Arc<dyn RemoteEndpoint>,
        attachments: Arc<dyn AttachmentResolver>,
        connectivity: ConnectivityObserver,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            queue,
            cache,
            endpoint,
            attachments,
            connectivity,
            clock,
            circuit: CircuitBreaker::new("remote", CircuitConfig::default()),
            backoff: RetryConfig::replay(),
            settings: RwLock::new(DrainSettings {
                request_timeout: config.request_timeout(),
                max_attempts: config.max_attempts,
            }),
            in_flight: DashMap::new(),
            cancel_epoch: AtomicU64::new(0),
            events,
        }
    }

    #[must_use]
    pub fn with_circuit_config(mut self, config: CircuitConfig) -> Self {
        self.circuit = CircuitBreaker::new("remote", config);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn apply_config(&self, config: &SyncConfig) {
        let mut settings = self.settings.write();
        settings.request_timeout = config.request_timeout();
        settings.max_attempts = config.max_attempts;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DrainEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    fn flag_for(&self, queue: QueueName) -> Arc<AtomicBool> {
        self.in_flight
            .entry(queue)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    #[must_use]
    pub fn is_draining(&self, queue: QueueName) -> bool {
        self.in_flight
            .get(&queue)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Stop running drains before their next entry. In-flight calls finish.
    pub fn cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::AcqRel);
        info!("Drain cancellation requested");
    }

    fn emit(&self, event: DrainEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Drain every queue in turn.
    pub async fn drain_all(&self, trigger: DrainTrigger) -> Vec<DrainReport> {
        let mut reports = Vec::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL {
            reports.push(self.drain(queue, trigger).await);
        }
        reports
    }

    /// Replay one queue. Never returns an error: failures end up in the
    /// report, in persisted entry state and in the event stream.
    #[tracing::instrument(skip(self), fields(queue = %queue))]
    pub async fn drain(&self, queue: QueueName, trigger: DrainTrigger) -> DrainReport {
        let timer = LatencyTimer::start();
        let report = self.drain_inner(queue, trigger).await;

        crate::metrics::record_drain(queue.as_str(), report.outcome.as_str(), timer.elapsed());
        if report.outcome != DrainOutcome::Suppressed {
            if report.attempted() > 0 || !report.deferred.is_empty() {
                info!(
                    outcome = report.outcome.as_str(),
                    succeeded = report.succeeded.len(),
                    failed = report.failed.len(),
                    needs_attention = report.needs_attention.len(),
                    deferred = report.deferred.len(),
                    "Drain finished"
                );
            }
            self.emit(DrainEvent::Completed(report.clone()));
        }
        report
    }

    async fn drain_inner(&self, queue: QueueName, trigger: DrainTrigger) -> DrainReport {
        if !self.connectivity.current() {
            debug!("Offline, drain skipped");
            return DrainReport::new(queue, DrainOutcome::Offline);
        }

        let flag = self.flag_for(queue);
        if flag.swap(true, Ordering::AcqRel) {
            debug!("Drain already in flight, suppressed");
            return DrainReport::new(queue, DrainOutcome::Suppressed);
        }
        let _guard = DrainGuard(flag);

        let epoch = self.cancel_epoch.load(Ordering::Acquire);
        let mut report = DrainReport::new(queue, DrainOutcome::Completed);

        let entries = match self.queue.list(queue).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Could not read queue for drain");
                report.outcome = DrainOutcome::StorageFailed;
                return report;
            }
        };

        for snapshot in entries {
            if self.cancel_epoch.load(Ordering::Acquire) != epoch {
                report.outcome = DrainOutcome::Cancelled;
                break;
            }
            if !self.connectivity.current() {
                report.outcome = DrainOutcome::Offline;
                break;
            }
            if !snapshot.is_pending() {
                continue;
            }
            // Discarded or flagged since the snapshot was taken
            let entry = match self.queue.get(queue, snapshot.id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    debug!(id = %snapshot.id, "Entry left the queue mid-drain, skipped");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Could not re-read queue mid-drain");
                    report.outcome = DrainOutcome::StorageFailed;
                    break;
                }
            };
            if !entry.is_pending() {
                continue;
            }
            if trigger.respects_backoff() && entry.next_attempt_at > self.clock.now_millis() {
                report.deferred.push(entry.id);
                continue;
            }

            self.drain_entry(entry, &mut report).await;
        }

        report
    }

    async fn drain_entry(&self, mut entry: QueueEntry, report: &mut DrainReport) {
        let queue = entry.queue_name;
        let id = entry.id;

        match self.replay_entry(&mut entry, true).await {
            ReplayOutcome::Succeeded(response) => {
                if let Err(e) = self.queue.remove(queue, id).await {
                    // Stays queued; the replay repeats with the same idempotency keys
                    error!(id = %id, error = %e, "Replayed entry could not be removed");
                    report.failed.push(id);
                    return;
                }
                self.fold(&entry, &response).await;
                crate::metrics::record_replay(queue.as_str(), "succeeded");
                debug!(id = %id, "Entry replayed");
                report.succeeded.push(id);
            }
            ReplayOutcome::Transient { error } => {
                self.handle_transient(&entry, &error, report).await;
            }
            ReplayOutcome::Permanent { reason, status } => {
                warn!(id = %id, reason = %reason, ?status, "Entry rejected, needs attention");
                self.flag(&entry, &reason, status, report).await;
            }
        }
    }

    async fn handle_transient(&self, entry: &QueueEntry, error: &str, report: &mut DrainReport) {
        let queue = entry.queue_name;
        let delay = self.backoff.delay_for_attempt(entry.attempt_count.saturating_add(1));
        let next_attempt_at = self
            .clock
            .now_millis()
            .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));

        let attempts = match self
            .queue
            .record_failure(queue, entry.id, error, next_attempt_at)
            .await
        {
            Ok(Some(attempts)) => attempts,
            // Discarded by the user mid-drain
            Ok(None) => return,
            Err(e) => {
                error!(id = %entry.id, error = %e, "Could not record replay failure");
                report.failed.push(entry.id);
                return;
            }
        };

        let max_attempts = self.settings.read().max_attempts;
        if let Some(max) = max_attempts {
            if attempts >= max {
                let reason = format!("gave up after {} attempts: {}", attempts, error);
                warn!(id = %entry.id, attempts, "Attempt limit reached, needs attention");
                self.flag(entry, &reason, None, report).await;
                return;
            }
        }

        crate::metrics::record_replay(queue.as_str(), "failed");
        debug!(id = %entry.id, attempts, error = %error, "Replay failed, will retry");
        report.failed.push(entry.id);
    }

    async fn flag(
        &self,
        entry: &QueueEntry,
        reason: &str,
        status: Option<u16>,
        report: &mut DrainReport,
    ) {
        let queue = entry.queue_name;
        match self.queue.flag_needs_attention(queue, entry.id, reason, status).await {
            Ok(true) => {
                crate::metrics::record_replay(queue.as_str(), "needs_attention");
                report.needs_attention.push(entry.id);
                self.emit(DrainEvent::NeedsAttention {
                    queue,
                    id: entry.id,
                    reason: reason.to_string(),
                    status,
                });
            }
            Ok(false) => {}
            Err(e) => {
                error!(id = %entry.id, error = %e, "Could not flag entry");
                report.failed.push(entry.id);
            }
        }
    }

    /// Write the policy's authoritative view into the cache. Best effort.
    pub(crate) async fn fold(&self, entry: &QueueEntry, response: &RemoteResponse) {
        let Some(update) = policy_for(entry.queue_name).fold(entry, response) else {
            return;
        };
        if let Err(e) = self.cache.write(&update.key, update.class, update.value).await {
            warn!(key = %update.key, error = %e, "Could not fold replay result into cache");
        }
    }

    /// Send the entry's remaining steps in order.
    ///
    /// `cursor` and `target_id` on `entry` advance as steps are acknowledged.
    /// With `persist_progress` each acknowledgement is also written to the
    /// queue before the next step goes out.
    pub async fn replay_entry(&self, entry: &mut QueueEntry, persist_progress: bool) -> ReplayOutcome {
        let policy = policy_for(entry.queue_name);
        let queue_label = entry.queue_name.as_str();
        let mut last_response = RemoteResponse::new(200, Value::Null);

        loop {
            let step = match next_step(policy, entry) {
                Ok(Some(step)) => step,
                Ok(None) => return ReplayOutcome::Succeeded(last_response),
                Err(e) => {
                    return ReplayOutcome::Permanent {
                        reason: e.to_string(),
                        status: None,
                    }
                }
            };

            let mut resolved = Vec::new();
            if step.with_attachments {
                for attachment in &entry.attachments {
                    match self.attachments.resolve(attachment).await {
                        Ok(file) => resolved.push(file),
                        Err(e) if e.is_permanent() => {
                            return ReplayOutcome::Permanent {
                                reason: e.to_string(),
                                status: None,
                            }
                        }
                        Err(e) => return ReplayOutcome::Transient { error: e.to_string() },
                    }
                }
            }

            let request = RemoteRequest::new(step.method, step.path.clone())
                .with_body(step.body.clone())
                .with_attachments(resolved)
                .with_idempotency_key(step.idempotency_key(entry));

            let response = match self.send(&request, queue_label, step.kind.as_str()).await {
                Ok(response) => response,
                Err(e) if e.is_permanent() => {
                    return ReplayOutcome::Permanent {
                        reason: e.to_string(),
                        status: None,
                    }
                }
                Err(e) => return ReplayOutcome::Transient { error: e.to_string() },
            };

            match policy.classify(response.status) {
                Disposition::Success => {
                    if entry.target_id.is_none() {
                        entry.target_id = policy.created_target(&step, &response);
                    }
                    entry.cursor = step.index + 1;
                    if persist_progress {
                        if let Err(e) = self
                            .queue
                            .record_progress(entry.queue_name, entry.id, entry.cursor, entry.target_id.clone())
                            .await
                        {
                            return ReplayOutcome::Transient {
                                error: format!("progress not saved: {}", e),
                            };
                        }
                    }
                    last_response = response;
                }
                Disposition::Retryable => {
                    return ReplayOutcome::Transient {
                        error: format!("HTTP {}: {}", response.status, response.error_message()),
                    }
                }
                Disposition::Permanent => {
                    return ReplayOutcome::Permanent {
                        reason: response.error_message(),
                        status: Some(response.status),
                    }
                }
            }
        }
    }

    /// One remote call through the circuit breaker, bounded by the request timeout.
    /// A call that times out is a failure even if the server later applies it.
    async fn send(
        &self,
        request: &RemoteRequest,
        queue: &str,
        step: &str,
    ) -> Result<RemoteResponse, TransportError> {
        let timeout = self.settings.read().request_timeout;
        let timer = LatencyTimer::start();

        let result = self
            .circuit
            .call(|| async {
                match tokio::time::timeout(timeout, self.endpoint.send(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(timeout)),
                }
            })
            .await;

        crate::metrics::record_remote_latency(queue, step, timer.elapsed());
        match result {
            Ok(response) => Ok(response),
            Err(CircuitError::Rejected) => Err(TransportError::CircuitOpen),
            Err(CircuitError::Inner(e)) => {
                if matches!(e, TransportError::Timeout(_)) {
                    crate::metrics::record_timeout(queue, step);
                }
                Err(e)
            }
        }
    }
}
