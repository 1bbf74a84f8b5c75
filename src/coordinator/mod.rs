// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine facade.
//!
//! The [`SyncEngine`] ties the pieces together for the UI layer:
//! - submissions go out in the foreground when possible and fall back to the
//!   durable queue
//! - the run loop turns connectivity changes and timers into drains
//! - reads go through the last-known-good cache
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{
//!     EngineState, HttpEndpoint, InMemoryStore, SyncConfig, SyncEngine,
//! };
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::default();
//! let endpoint = HttpEndpoint::new("https://forms.example.com/api", Duration::from_secs(15))?;
//! let engine = SyncEngine::builder(config)
//!     .store(Arc::new(InMemoryStore::new()))
//!     .endpoint(Arc::new(endpoint))
//!     .build()?;
//!
//! assert_eq!(engine.state(), EngineState::Created);
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{EngineState, Mutation, SubmitOutcome, SyncError};

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::cache::CacheLayer;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityObserver, ConnectivityProbe};
use crate::drain::DrainScheduler;
use crate::queue::MutationQueue;
use crate::remote::{AttachmentResolver, FsAttachmentResolver, RemoteEndpoint};
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::storage::memory::InMemoryStore;
use crate::storage::traits::DurableStore;

/// Offline-first mutation and read engine.
///
/// `Send + Sync`; share it behind an `Arc` between the UI and the task
/// running [`run()`](Self::run).
pub struct SyncEngine {
    /// Configuration (can be updated at runtime via watch channel)
    pub(super) config: RwLock<SyncConfig>,

    /// Runtime config updates (Mutex so run() can take &self)
    pub(super) config_rx: Mutex<Option<watch::Receiver<SyncConfig>>>,

    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Tells the run loop to stop
    pub(super) shutdown_tx: watch::Sender<bool>,

    pub(super) queue: Arc<MutationQueue>,
    pub(super) cache: Arc<CacheLayer>,
    pub(super) scheduler: Arc<DrainScheduler>,
    pub(super) connectivity: ConnectivityObserver,
    pub(super) endpoint: Arc<dyn RemoteEndpoint>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) probe: Option<Arc<dyn ConnectivityProbe>>,

    /// Background drains started by the run loop, awaited on shutdown
    pub(super) drains: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Platform connectivity feed and subscriptions.
    #[must_use]
    pub fn connectivity(&self) -> &ConnectivityObserver {
        &self.connectivity
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<DrainScheduler> {
        &self.scheduler
    }

    /// Push new settings into every component.
    pub(super) fn apply_config(&self, config: SyncConfig) {
        self.cache.apply_config(&config);
        self.scheduler.apply_config(&config);
        self.connectivity.set_failure_threshold(config.probe_failure_threshold);
        *self.config.write() = config;
    }
}

/// Assembles a [`SyncEngine`] from its collaborators.
///
/// Only the remote endpoint is required. The store defaults to in-memory,
/// attachments to the filesystem resolver, the clock to the system clock.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    config_rx: Option<watch::Receiver<SyncConfig>>,
    store: Option<Arc<dyn DurableStore>>,
    endpoint: Option<Arc<dyn RemoteEndpoint>>,
    attachments: Option<Arc<dyn AttachmentResolver>>,
    clock: Option<Arc<dyn Clock>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    connectivity: Option<ConnectivityObserver>,
    circuit: Option<CircuitConfig>,
}

impl SyncEngineBuilder {
    fn new(config: SyncConfig) -> Self {
        Self {
            config,
            config_rx: None,
            store: None,
            endpoint: None,
            attachments: None,
            clock: None,
            probe: None,
            connectivity: None,
            circuit: None,
        }
    }

    #[must_use]
    pub fn config_updates(mut self, rx: watch::Receiver<SyncConfig>) -> Self {
        self.config_rx = Some(rx);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn endpoint(mut self, endpoint: Arc<dyn RemoteEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn attachments(mut self, resolver: Arc<dyn AttachmentResolver>) -> Self {
        self.attachments = Some(resolver);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Share an observer the platform layer already feeds.
    #[must_use]
    pub fn connectivity(mut self, observer: ConnectivityObserver) -> Self {
        self.connectivity = Some(observer);
        self
    }

    #[must_use]
    pub fn circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = Some(config);
        self
    }

    pub fn build(self) -> Result<SyncEngine, SyncError> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| SyncError::Config("a remote endpoint is required".into()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn DurableStore>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let attachments = self
            .attachments
            .unwrap_or_else(|| Arc::new(FsAttachmentResolver) as Arc<dyn AttachmentResolver>);
        // Assume online until told otherwise; a failed attempt just queues
        let connectivity = self
            .connectivity
            .unwrap_or_else(|| ConnectivityObserver::new(true, self.config.probe_failure_threshold));

        let queue = Arc::new(MutationQueue::new(store.clone(), clock.clone()));
        let cache = Arc::new(CacheLayer::new(store, clock.clone(), &self.config));
        let mut scheduler = DrainScheduler::new(
            &self.config,
            queue.clone(),
            cache.clone(),
            endpoint.clone(),
            attachments,
            connectivity.clone(),
            clock.clone(),
        );
        if let Some(circuit) = self.circuit {
            scheduler = scheduler.with_circuit_config(circuit);
        }

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(SyncEngine {
            config: RwLock::new(self.config),
            config_rx: Mutex::new(self.config_rx),
            state: state_tx,
            state_rx,
            shutdown_tx,
            queue,
            cache,
            scheduler: Arc::new(scheduler),
            connectivity,
            endpoint,
            clock,
            probe: self.probe,
            drains: parking_lot::Mutex::new(Vec::new()),
        })
    }
}
