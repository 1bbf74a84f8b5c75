// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connectivity tracking.
//!
//! Two feeds set the state:
//! - the platform (`set_online`, `notify_online`)
//! - optional active probes (`record_probe`), where `failure_threshold`
//!   consecutive failures report offline and one success reports online
//!
//! Consumers either register a callback with [`ConnectivityObserver::subscribe`]
//! or hold a [`watch::Receiver`] from [`ConnectivityObserver::watch`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type Callback = Arc<dyn Fn(bool) + Send + Sync>;

struct Inner {
    tx: watch::Sender<bool>,
    callbacks: RwLock<HashMap<u64, Callback>>,
    next_id: AtomicU64,
    consecutive_failures: AtomicU64,
    failure_threshold: AtomicU64,
}

impl Inner {
    fn emit(&self, online: bool) {
        // Snapshot so a callback may unsubscribe without deadlocking
        let callbacks: Vec<Callback> = self.callbacks.read().values().cloned().collect();
        for callback in callbacks {
            callback(online);
        }
    }
}

#[derive(Clone)]
pub struct ConnectivityObserver {
    inner: Arc<Inner>,
}

impl ConnectivityObserver {
    pub fn new(initially_online: bool, failure_threshold: u64) -> Self {
        let (tx, _) = watch::channel(initially_online);
        crate::metrics::set_online(initially_online);
        Self {
            inner: Arc::new(Inner {
                tx,
                callbacks: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                consecutive_failures: AtomicU64::new(0),
                failure_threshold: AtomicU64::new(failure_threshold.max(1)),
            }),
        }
    }

    /// Last known state. Never blocks.
    #[must_use]
    pub fn current(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Register a callback for transitions. Dropping the handle unsubscribes.
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe(&self, on_change: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.write().insert(id, Arc::new(on_change));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Receiver that wakes on every transition and on repeated online notifications.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Platform connectivity report. Only an actual change is emitted.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.inner.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            let to = if online { "online" } else { "offline" };
            info!(to, "Connectivity changed");
            crate::metrics::set_online(online);
            crate::metrics::record_transition(to);
            self.inner.emit(online);
        }
        changed
    }

    /// A platform "online" signal, delivered even when already online.
    ///
    /// Platforms re-send online notifications (network switches, app resume),
    /// so everything downstream of this must tolerate duplicates.
    pub fn notify_online(&self) {
        if self.set_online(true) {
            return;
        }
        debug!("Duplicate online notification");
        self.inner.tx.send_modify(|current| *current = true);
        self.inner.emit(true);
    }

    /// Feed a probe result. Returns the state after applying it.
    pub fn record_probe(&self, ok: bool) -> bool {
        if ok {
            self.inner.consecutive_failures.store(0, Ordering::Relaxed);
            self.set_online(true);
        } else {
            let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            let threshold = self.inner.failure_threshold.load(Ordering::Relaxed);
            if failures >= threshold {
                if self.set_online(false) {
                    warn!(failures, threshold, "Connectivity probe failing, reporting offline");
                }
            } else {
                debug!(failures, threshold, "Connectivity probe failed");
            }
        }
        self.current()
    }

    pub fn set_failure_threshold(&self, threshold: u64) {
        self.inner
            .failure_threshold
            .store(threshold.max(1), Ordering::Relaxed);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.callbacks.read().len()
    }
}

/// Handle to a registered connectivity callback.
pub struct Subscription {
    inner: Weak<Inner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.callbacks.write().remove(&self.id);
        }
    }
}

/// Active reachability check.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// HEAD request against the remote base URL. Any HTTP response counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.head(&self.url).timeout(self.timeout).send().await {
            Ok(response) => {
                debug!(status = response.status().as_u16(), "Probe reached remote");
                true
            }
            Err(e) => {
                debug!(error = %e, "Probe failed");
                false
            }
        }
    }
}
