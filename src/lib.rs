//! # Offline Sync Engine
//!
//! Offline-first synchronization for a mobile business-forms client. Users
//! keep approving requests, submitting form responses, attaching signatures
//! and generating serials while disconnected; every intent is recorded
//! durably and later reconciled with the remote API exactly once, in order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   SyncEngine (coordinator)                  │
//! │  • submit(): foreground attempt, else queue + optimistic    │
//! │  • run(): connectivity / timers → drains                    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │  MutationQueue   │ │  DrainScheduler  │ │    CacheLayer    │
//! │  one list per    │ │  replay via the  │ │  last-known-good │
//! │  QueueName, FIFO │ │  reconcile policy│ │  reads, TTL hint │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!          │                    │                     │
//!          │           RemoteEndpoint (HTTP)          │
//!          ▼                                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        DurableStore: SQLite (WAL) or in-memory              │
//! │        queue/{name}  and  cache/{key}, versioned            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_sync::{Mutation, NewEntry, QueueName, SubmitOutcome, SyncConfig, SyncEngine};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         store_url: Some("sqlite:./offline.db?mode=rwc".into()),
//!         remote_base_url: Some("https://forms.example.com/api".into()),
//!         ..Default::default()
//!     };
//!
//!     let engine = Arc::new(SyncEngine::connect(config, None).await.expect("Failed to start"));
//!     let runner = engine.clone();
//!     tokio::spawn(async move { runner.run().await });
//!
//!     let outcome = engine
//!         .submit(Mutation::new(
//!             QueueName::ApprovalAction,
//!             NewEntry::new(json!({"response_id": 42, "status": "aprobado"})),
//!         ))
//!         .await
//!         .expect("Submit failed");
//!
//!     if let SubmitOutcome::Queued(id) = outcome {
//!         println!("Offline, queued as {}", id);
//!     }
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`SyncEngine`] facade and run loop
//! - [`queue`]: Durable per-kind mutation queues
//! - [`drain`]: Replay of queued mutations
//! - [`reconcile`]: Per-kind request shapes and status classification
//! - [`cache`]: Last-known-good read cache
//! - [`connectivity`]: Online/offline tracking and probes
//! - [`remote`]: Remote endpoint and attachment resolution
//! - [`storage`]: Durable store backends (SQLite, memory)
//! - [`resilience`]: Circuit breaker and retry backoff

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod drain;
pub mod envelope;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod resilience;
pub mod storage;

pub use cache::{CacheClass, CacheError, CacheLayer, CacheRecord, CachedValue};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityObserver, ConnectivityProbe, HttpProbe, Subscription};
pub use coordinator::{EngineState, Mutation, SubmitOutcome, SyncEngine, SyncEngineBuilder, SyncError};
pub use drain::{DrainEvent, DrainOutcome, DrainReport, DrainScheduler, DrainTrigger, ReplayOutcome};
pub use queue::{Attachment, EntryId, EntryState, MutationQueue, NewEntry, QueueEntry, QueueName};
pub use reconcile::{policy_for, CacheUpdate, Disposition, ReconciliationPolicy, Step, StepKind};
pub use remote::{
    AttachmentError, AttachmentResolver, FsAttachmentResolver, HttpEndpoint, Method, RemoteEndpoint,
    RemoteRequest, RemoteResponse, ResolvedAttachment, TransportError,
};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{DurableStore, StorageError};
pub use storage::{InMemoryStore, SqliteStore};
pub use metrics::LatencyTimer;
