// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: connect, run loop, shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::HttpProbe;
use crate::drain::DrainTrigger;
use crate::remote::HttpEndpoint;
use crate::storage::memory::InMemoryStore;
use crate::storage::sql::SqliteStore;
use crate::storage::traits::DurableStore;

use super::{EngineState, SyncEngine, SyncError};

/// `None` when the period is zero (disabled).
fn ticker(secs: u64) -> Option<Interval> {
    if secs == 0 {
        return None;
    }
    let period = Duration::from_secs(secs);
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl SyncEngine {
    /// Build a production engine from configuration alone.
    ///
    /// Opens the SQLite store at `store_url` (in-memory when unset, which
    /// loses pending mutations on restart) and talks HTTP to `remote_base_url`.
    #[tracing::instrument(skip(config, config_rx))]
    pub async fn connect(
        config: SyncConfig,
        config_rx: Option<watch::Receiver<SyncConfig>>,
    ) -> Result<Self, SyncError> {
        let store: Arc<dyn DurableStore> = match config.store_url {
            Some(ref url) => {
                info!(url = %url, "Opening durable store");
                Arc::new(SqliteStore::connect(url).await?)
            }
            None => {
                warn!("No store_url configured, pending mutations will not survive a restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let base_url = config
            .remote_base_url
            .clone()
            .ok_or_else(|| SyncError::Config("remote_base_url is required".into()))?;
        let mut endpoint = HttpEndpoint::new(base_url.clone(), config.request_timeout())?;
        if let Some(ref token) = config.api_token {
            endpoint = endpoint.with_api_token(token.clone());
        }

        let mut builder = SyncEngine::builder(config.clone())
            .store(store)
            .endpoint(Arc::new(endpoint));
        if config.probe_interval_secs > 0 {
            builder = builder.probe(Arc::new(HttpProbe::new(base_url, config.request_timeout())));
        }
        if let Some(rx) = config_rx {
            builder = builder.config_updates(rx);
        }
        builder.build()
    }

    fn spawn_drain(&self, trigger: DrainTrigger) {
        let scheduler = self.scheduler.clone();
        let handle = tokio::spawn(async move {
            scheduler.drain_all(trigger).await;
        });

        let mut drains = self.drains.lock();
        drains.retain(|h| !h.is_finished());
        drains.push(handle);
    }

    async fn has_pending(&self) -> bool {
        match self.queue.pending_total().await {
            Ok(count) => count > 0,
            Err(e) => {
                warn!(error = %e, "Could not count pending entries");
                false
            }
        }
    }

    /// Run the main event loop until [`shutdown()`](Self::shutdown).
    ///
    /// - online transition (or repeated online signal) → drain every queue
    /// - retry tick while online with pending entries → periodic drain
    /// - probe tick → feed the connectivity observer
    /// - config update → applied to every component
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) {
        if self.state() == EngineState::ShuttingDown {
            return;
        }
        let _ = self.state.send(EngineState::Running);
        info!("Sync engine running");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        let mut online_rx = self.connectivity.watch();
        online_rx.borrow_and_update();

        let (drain_secs, probe_secs) = {
            let config = self.config.read();
            (config.drain_interval_secs, config.probe_interval_secs)
        };
        let mut drain_tick = ticker(drain_secs);
        let mut probe_tick = if self.probe.is_some() { ticker(probe_secs) } else { None };

        // Whatever survived the last session goes out first
        if self.connectivity.current() && self.has_pending().await {
            self.spawn_drain(DrainTrigger::Reconnected);
        }

        let mut config_rx = self.config_rx.lock().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,

                Ok(()) = async {
                    match config_rx.as_mut() {
                        Some(rx) => rx.changed().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(rx) = config_rx.as_mut() else { continue };
                    let new_config = rx.borrow_and_update().clone();
                    info!(
                        drain_interval_secs = new_config.drain_interval_secs,
                        probe_interval_secs = new_config.probe_interval_secs,
                        "Config updated"
                    );
                    if new_config.drain_interval_secs != period_secs(&drain_tick) {
                        drain_tick = ticker(new_config.drain_interval_secs);
                    }
                    if self.probe.is_some() && new_config.probe_interval_secs != period_secs(&probe_tick) {
                        probe_tick = ticker(new_config.probe_interval_secs);
                    }
                    self.apply_config(new_config);
                }

                Ok(()) = online_rx.changed() => {
                    let online = *online_rx.borrow_and_update();
                    if online {
                        debug!("Online signal, draining");
                        self.spawn_drain(DrainTrigger::Reconnected);
                    }
                }

                _ = tick(&mut drain_tick) => {
                    if self.connectivity.current() && self.has_pending().await {
                        self.spawn_drain(DrainTrigger::Periodic);
                    }
                }

                _ = tick(&mut probe_tick) => {
                    if let Some(ref probe) = self.probe {
                        let ok = probe.probe().await;
                        self.connectivity.record_probe(ok);
                    }
                }
            }
        }

        info!("Sync engine run loop stopped");
    }

    /// Cancel drains, stop the run loop and wait for in-flight calls to finish.
    ///
    /// Nothing is lost: entries not yet replayed stay in the durable queue.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Initiating sync engine shutdown...");
        let _ = self.state.send(EngineState::ShuttingDown);
        self.scheduler.cancel();
        let _ = self.shutdown_tx.send(true);

        let drains: Vec<_> = std::mem::take(&mut *self.drains.lock());
        for handle in drains {
            if let Err(e) = handle.await {
                warn!(error = %e, "Drain task ended abnormally");
            }
        }
        info!("Sync engine shutdown complete");
    }
}

fn period_secs(interval: &Option<Interval>) -> u64 {
    interval.as_ref().map_or(0, |i| i.period().as_secs())
}
