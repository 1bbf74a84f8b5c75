// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-sync usage example.
//!
//! Demonstrates:
//! 1. Opening a SQLite-backed engine with an in-process stand-in for the API
//! 2. Approving a request while offline (queued, optimistic cache entry)
//! 3. Coming back online and watching the queue drain
//! 4. Reading the reconciled state from the cache
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

use offline_sync::{
    CacheClass, ConnectivityObserver, DrainEvent, Mutation, NewEntry, QueueName, RemoteEndpoint,
    RemoteRequest, RemoteResponse, SqliteStore, SubmitOutcome, SyncConfig, SyncEngine,
    TransportError,
};

/// Accepts everything and echoes the body back, like a well-behaved API.
struct EchoApi;

#[async_trait]
impl RemoteEndpoint for EchoApi {
    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse, TransportError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let body = request.body.clone().unwrap_or_default();
        Ok(RemoteResponse::new(200, body))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           offline-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and build the engine, starting offline
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("offline.db");
    println!("📦 Opening store at {}", db_path.display());

    let store = Arc::new(SqliteStore::open(&db_path).await?);
    let connectivity = ConnectivityObserver::new(false, 3);
    let engine = Arc::new(
        SyncEngine::builder(SyncConfig::default())
            .store(store)
            .endpoint(Arc::new(EchoApi))
            .connectivity(connectivity.clone())
            .build()?,
    );
    println!("   State: {}", engine.state());

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.run().await });
    let mut events = engine.subscribe_events();

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Approve while offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Approving response 42 while offline...");
    let mutation = Mutation::new(
        QueueName::ApprovalAction,
        NewEntry::new(json!({"response_id": 42, "status": "aprobado"})),
    )
    .with_optimistic(
        "approval-42",
        CacheClass::Detail,
        json!({"id": 42, "status": "aprobado", "pending": true}),
    );

    match engine.submit(mutation).await? {
        SubmitOutcome::Queued(id) => println!("   └─ Queued as {}", id),
        SubmitOutcome::Applied(_) => println!("   └─ Applied immediately"),
    }
    for entry in engine.list_pending(QueueName::ApprovalAction).await? {
        println!("   └─ Pending: {} → {}", entry.id, entry.payload);
    }
    let optimistic = engine.read("approval-42").await?;
    println!("   └─ UI sees: {}", optimistic.value);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Back online
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📶 Network back, draining...");
    connectivity.set_online(true);

    let report = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(DrainEvent::Completed(report))) if report.attempted() > 0 => break report,
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err("no drain within 5s".into()),
        }
    };
    println!(
        "   └─ {}: {} succeeded, {} failed, {} need attention",
        report.queue,
        report.succeeded.len(),
        report.failed.len(),
        report.needs_attention.len()
    );
    println!("   └─ Still pending: {}", engine.pending_count().await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reconciled state
    // ─────────────────────────────────────────────────────────────────────────
    let reconciled = engine.read("approval-42").await?;
    println!("\n📖 Cache after reconcile: {} (stale: {})", reconciled.value, reconciled.is_stale);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    run.await?;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key
                .labels()
                .map(|l| format!("{}={}", l.key(), l.value()))
                .collect();
            let label_str = if labels.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", labels.join(","))
            };
            let rendered = match value {
                DebugValue::Counter(v) => format!("counter {}", v),
                DebugValue::Gauge(v) => format!("gauge {:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let count = samples.len();
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("histogram count={} sum={:.4}", count, sum)
                }
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();

    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
