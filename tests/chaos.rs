//! Chaos Testing for the Offline Sync Engine
//!
//! This module tests failure scenarios using:
//! 1. **FailingStore wrapper** - precise error injection at specific call counts
//! 2. **Misbehaving endpoints** - flaky, hanging and connection-dropping remotes
//! 3. **Data corruption** - garbage and tampered bytes in the durable store
//!
//! Every scenario checks the same promise: a submitted mutation is either
//! still in its queue or was applied remotely exactly once.
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use offline_sync::{
    CircuitConfig, ConnectivityObserver, DrainOutcome, DrainTrigger, DurableStore, InMemoryStore,
    Mutation, NewEntry, QueueName, RemoteEndpoint, RemoteRequest, RemoteResponse, StorageError,
    SubmitOutcome, SyncConfig, SyncEngine, SyncError, TransportError,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps a store and fails `set` on chosen call numbers (1-indexed), or
/// every `get`/`set` while switched to outage mode.
pub struct FailingStore<S: DurableStore> {
    inner: S,
    set_calls: AtomicU64,
    fail_sets_on: Mutex<Vec<u64>>,
    outage: AtomicBool,
}

impl<S: DurableStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            set_calls: AtomicU64::new(0),
            fail_sets_on: Mutex::new(Vec::new()),
            outage: AtomicBool::new(false),
        }
    }

    /// Fail the `set` calls with these numbers, counted from the start.
    pub fn fail_sets_on(&self, calls: Vec<u64>) {
        *self.fail_sets_on.lock() = calls;
    }

    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    fn outage_error(&self) -> Result<(), StorageError> {
        if self.outage.load(Ordering::SeqCst) {
            Err(StorageError::Backend("chaos: store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: DurableStore> DurableStore for FailingStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.outage_error()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let call = self.set_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.outage_error()?;
        if self.fail_sets_on.lock().contains(&call) {
            return Err(StorageError::Backend(format!("chaos: set #{} failed", call)));
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.outage_error()?;
        self.inner.remove(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.outage_error()?;
        self.inner.keys_with_prefix(prefix).await
    }
}

// =============================================================================
// Misbehaving Endpoints
// =============================================================================

/// Remote that dedupes on Idempotency-Key like the real API, and can be told
/// to drop connections, hang after applying, or knock connectivity out.
#[derive(Default)]
struct ChaosEndpoint {
    calls: AtomicU64,
    /// Every key the server has applied, with how often it was sent
    applied: Mutex<HashMap<String, u32>>,
    /// Fail calls where `call % n == 0`
    flaky_every: Option<u64>,
    always_fail: bool,
    /// Apply, then hang past the client timeout, on these call numbers
    hang_after_apply_on: Vec<u64>,
    /// Report offline when this call number arrives
    drop_connectivity_on: Option<(u64, ConnectivityObserver)>,
}

impl ChaosEndpoint {
    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn distinct_applied(&self) -> usize {
        self.applied.lock().len()
    }
}

#[async_trait]
impl RemoteEndpoint for ChaosEndpoint {
    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((on, observer)) = &self.drop_connectivity_on {
            if call == *on {
                observer.set_online(false);
                return Err(TransportError::Connection("chaos: network lost".into()));
            }
        }
        if self.always_fail || self.flaky_every.is_some_and(|n| call % n == 0) {
            return Err(TransportError::Connection("chaos: connection reset".into()));
        }

        let key = request.idempotency_key.clone().unwrap_or_default();
        *self.applied.lock().entry(key).or_default() += 1;

        if self.hang_after_apply_on.contains(&call) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(RemoteResponse::new(200, json!({"ok": true})))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn approval(response_id: u64) -> Mutation {
    Mutation::new(
        QueueName::ApprovalAction,
        NewEntry::new(json!({"response_id": response_id, "status": "aprobado"})),
    )
}

fn quiet_circuit() -> CircuitConfig {
    // Never evaluates within these tests
    CircuitConfig {
        window: 10_000,
        ..Default::default()
    }
}

fn build(
    config: SyncConfig,
    store: Arc<dyn DurableStore>,
    endpoint: Arc<ChaosEndpoint>,
    connectivity: ConnectivityObserver,
    circuit: CircuitConfig,
) -> SyncEngine {
    SyncEngine::builder(config)
        .store(store)
        .endpoint(endpoint)
        .connectivity(connectivity)
        .circuit(circuit)
        .build()
        .expect("engine builds")
}

async fn queued(engine: &SyncEngine, mutation: Mutation) -> offline_sync::EntryId {
    match engine.submit(mutation).await.unwrap() {
        SubmitOutcome::Queued(id) => id,
        other => panic!("expected queued, got {:?}", other),
    }
}

// =============================================================================
// Store failures
// =============================================================================

#[tokio::test]
async fn chaos_enqueue_write_failure_surfaces_and_leaves_nothing() {
    let store = Arc::new(FailingStore::new(InMemoryStore::new()));
    store.fail_sets_on(vec![1]);
    let endpoint = Arc::new(ChaosEndpoint::default());
    let engine = build(
        SyncConfig::default(),
        store.clone(),
        endpoint,
        ConnectivityObserver::new(false, 3),
        quiet_circuit(),
    );

    let err = engine.submit(approval(1)).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)));
    assert!(engine.list_pending(QueueName::ApprovalAction).await.unwrap().is_empty());

    // The store recovers; the next submit is durable
    queued(&engine, approval(2)).await;
    assert_eq!(engine.list_pending(QueueName::ApprovalAction).await.unwrap().len(), 1);
}

#[tokio::test]
async fn chaos_remove_failure_after_ack_does_not_resend() {
    let store = Arc::new(FailingStore::new(InMemoryStore::new()));
    let endpoint = Arc::new(ChaosEndpoint::default());
    let connectivity = ConnectivityObserver::new(false, 3);
    let engine = build(
        SyncConfig::default(),
        store.clone(),
        endpoint.clone(),
        connectivity.clone(),
        quiet_circuit(),
    );
    let id = queued(&engine, approval(42)).await;
    assert_eq!(store.set_calls(), 1);

    // set #2 saves progress after the ack, set #3 is the removal
    store.fail_sets_on(vec![3]);
    connectivity.set_online(true);
    let report = engine.scheduler().drain(QueueName::ApprovalAction, DrainTrigger::UserRetry).await;
    assert_eq!(report.failed, vec![id]);
    assert_eq!(engine.list_pending(QueueName::ApprovalAction).await.unwrap().len(), 1);

    // Progress says the only step was acknowledged: finishing needs no remote call
    let report = engine.scheduler().drain(QueueName::ApprovalAction, DrainTrigger::UserRetry).await;
    assert_eq!(report.succeeded, vec![id]);
    assert_eq!(endpoint.calls(), 1);
    assert!(engine.list_pending(QueueName::ApprovalAction).await.unwrap().is_empty());
}

#[tokio::test]
async fn chaos_store_outage_during_drain_keeps_entries() {
    let store = Arc::new(FailingStore::new(InMemoryStore::new()));
    let endpoint = Arc::new(ChaosEndpoint::default());
    let connectivity = ConnectivityObserver::new(false, 3);
    let engine = build(
        SyncConfig::default(),
        store.clone(),
        endpoint.clone(),
        connectivity.clone(),
        quiet_circuit(),
    );
    queued(&engine, approval(1)).await;
    queued(&engine, approval(2)).await;

    store.set_outage(true);
    connectivity.set_online(true);
    let report = engine.scheduler().drain(QueueName::ApprovalAction, DrainTrigger::UserRetry).await;
    assert_eq!(report.outcome, DrainOutcome::StorageFailed);
    assert_eq!(endpoint.calls(), 0);

    store.set_outage(false);
    let report = engine.scheduler().drain(QueueName::ApprovalAction, DrainTrigger::UserRetry).await;
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(endpoint.distinct_applied(), 2);
}

// =============================================================================
// Data corruption
// =============================================================================

#[tokio::test]
async fn chaos_garbage_queue_blob_is_quarantined() {
    let store = Arc::new(InMemoryStore::new());
    store
        .set("queue/approval-action", b"\x00\xffnot json at all")
        .await
        .unwrap();
    let endpoint = Arc::new(ChaosEndpoint::default());
    let engine = build(
        SyncConfig::default(),
        store.clone(),
        endpoint,
        ConnectivityObserver::new(false, 3),
        quiet_circuit(),
    );

    assert!(engine.list_pending(QueueName::ApprovalAction).await.unwrap().is_empty());

    queued(&engine, approval(1)).await;
    assert_eq!(engine.list_pending(QueueName::ApprovalAction).await.unwrap().len(), 1);

    let preserved = store
        .keys_with_prefix("queue/approval-action.corrupt-")
        .await
        .unwrap();
    assert_eq!(preserved.len(), 1);
    let bytes = store.get(&preserved[0]).await.unwrap().unwrap();
    assert_eq!(bytes, b"\x00\xffnot json at all");
}

#[tokio::test]
async fn chaos_tampered_payload_fails_closed() {
    let store = Arc::new(InMemoryStore::new());
    let endpoint = Arc::new(ChaosEndpoint::default());
    let connectivity = ConnectivityObserver::new(false, 3);
    let engine = build(
        SyncConfig::default(),
        store.clone(),
        endpoint.clone(),
        connectivity.clone(),
        quiet_circuit(),
    );
    queued(&engine, approval(7)).await;

    // Flip the decision without updating the payload hash
    let raw = store.get("queue/approval-action").await.unwrap().unwrap();
    let mut doc: Value = serde_json::from_slice(&raw).unwrap();
    doc["data"][0]["payload"]["status"] = json!("rechazado");
    store
        .set("queue/approval-action", &serde_json::to_vec(&doc).unwrap())
        .await
        .unwrap();

    assert!(engine.list_pending(QueueName::ApprovalAction).await.unwrap().is_empty());
    connectivity.set_online(true);
    engine.request_drain().await.unwrap();
    assert_eq!(endpoint.calls(), 0);
}

// =============================================================================
// Misbehaving remote
// =============================================================================

#[tokio::test]
async fn chaos_lost_response_replays_with_same_key() {
    let endpoint = Arc::new(ChaosEndpoint {
        hang_after_apply_on: vec![1],
        ..Default::default()
    });
    let connectivity = ConnectivityObserver::new(false, 3);
    let engine = build(
        SyncConfig {
            request_timeout_ms: 50,
            ..Default::default()
        },
        Arc::new(InMemoryStore::new()),
        endpoint.clone(),
        connectivity.clone(),
        quiet_circuit(),
    );
    let id = queued(&engine, approval(42)).await;
    connectivity.set_online(true);

    let report = engine.scheduler().drain(QueueName::ApprovalAction, DrainTrigger::UserRetry).await;
    assert_eq!(report.failed, vec![id]);
    let entry = &engine.list_pending(QueueName::ApprovalAction).await.unwrap()[0];
    assert!(entry.last_error.as_deref().unwrap().contains("timed out"));

    let report = engine.scheduler().drain(QueueName::ApprovalAction, DrainTrigger::UserRetry).await;
    assert_eq!(report.succeeded, vec![id]);

    // Sent twice, applied once server-side
    assert_eq!(endpoint.calls(), 2);
    assert_eq!(endpoint.distinct_applied(), 1);
    assert_eq!(*endpoint.applied.lock().get(&format!("{}:0", id)).unwrap(), 2);
}

#[tokio::test]
async fn chaos_flaky_remote_delivers_everything_once() {
    let endpoint = Arc::new(ChaosEndpoint {
        flaky_every: Some(3),
        ..Default::default()
    });
    let connectivity = ConnectivityObserver::new(false, 3);
    let engine = build(
        SyncConfig::default(),
        Arc::new(InMemoryStore::new()),
        endpoint.clone(),
        connectivity.clone(),
        quiet_circuit(),
    );
    for response_id in 0..20 {
        queued(&engine, approval(response_id)).await;
    }
    connectivity.set_online(true);

    let mut rounds = 0;
    while engine.pending_count().await.unwrap() > 0 {
        rounds += 1;
        assert!(rounds <= 20, "queue never drained");
        engine.request_drain().await.unwrap();
    }

    assert_eq!(endpoint.distinct_applied(), 20);
    assert!(endpoint.applied.lock().values().all(|&sent| sent == 1));
    assert!(engine.needs_attention().await.unwrap().is_empty());
}

#[tokio::test]
async fn chaos_open_circuit_stops_hammering_remote() {
    let endpoint = Arc::new(ChaosEndpoint {
        always_fail: true,
        ..Default::default()
    });
    let connectivity = ConnectivityObserver::new(false, 3);
    let engine = build(
        SyncConfig::default(),
        Arc::new(InMemoryStore::new()),
        endpoint.clone(),
        connectivity.clone(),
        CircuitConfig {
            error_rate: 0.5,
            window: 2,
            half_open_probes: 1,
            recovery_timeout: Duration::from_secs(60),
        },
    );
    for response_id in 0..6 {
        queued(&engine, approval(response_id)).await;
    }
    connectivity.set_online(true);

    let report = engine.scheduler().drain(QueueName::ApprovalAction, DrainTrigger::UserRetry).await;

    assert_eq!(report.failed.len(), 6);
    assert!(endpoint.calls() < 6);
    let entries = engine.list_pending(QueueName::ApprovalAction).await.unwrap();
    assert!(entries
        .iter()
        .any(|e| e.last_error.as_deref().is_some_and(|err| err.contains("circuit breaker open"))));
    assert!(entries.iter().all(|e| e.is_pending() && e.attempt_count == 1));
}

#[tokio::test]
async fn chaos_connectivity_lost_mid_drain_stops_cleanly() {
    let connectivity = ConnectivityObserver::new(false, 3);
    let endpoint = Arc::new(ChaosEndpoint {
        drop_connectivity_on: Some((2, connectivity.clone())),
        ..Default::default()
    });
    let engine = build(
        SyncConfig::default(),
        Arc::new(InMemoryStore::new()),
        endpoint.clone(),
        connectivity.clone(),
        quiet_circuit(),
    );
    let first = queued(&engine, approval(1)).await;
    let second = queued(&engine, approval(2)).await;
    queued(&engine, approval(3)).await;
    connectivity.set_online(true);

    let report = engine.scheduler().drain(QueueName::ApprovalAction, DrainTrigger::Reconnected).await;

    assert_eq!(report.outcome, DrainOutcome::Offline);
    assert_eq!(report.succeeded, vec![first]);
    assert_eq!(report.failed, vec![second]);
    let remaining = engine.list_pending(QueueName::ApprovalAction).await.unwrap();
    assert_eq!(remaining.len(), 2);
    // The third entry was never touched
    assert_eq!(remaining[1].attempt_count, 0);
    assert_eq!(endpoint.calls(), 2);
}
