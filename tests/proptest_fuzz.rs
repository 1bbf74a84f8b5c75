//! Property-based tests (fuzzing) for offline sync resilience.
//!
//! Uses proptest to generate random/malformed inputs and verify the engine
//! never panics, only returns clean errors, and never loses or reorders
//! queued mutations.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Value};

use offline_sync::envelope::{self, CURRENT_VERSION};
use offline_sync::queue::payload_digest;
use offline_sync::reconcile::{default_classify, next_step};
use offline_sync::{
    policy_for, Disposition, EntryId, InMemoryStore, ManualClock, MutationQueue, NewEntry,
    QueueEntry, QueueName, RetryConfig, StorageError,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        finite_f64_strategy().prop_map(|f| json!(f)),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,   // depth
        64,  // max nodes
        10,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10)
                    .prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

/// Finite floats only; JSON has no NaN or infinity
fn finite_f64_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![
        prop::num::f64::NORMAL | prop::num::f64::SUBNORMAL | prop::num::f64::ZERO,
        // Coordinates as a GPS answer would carry them
        (-90.0f64..90.0, 0u32..1_000_000).prop_map(|(deg, n)| deg + f64::from(n) * 1e-7),
    ]
}

fn queue_name_strategy() -> impl Strategy<Value = QueueName> {
    prop::sample::select(QueueName::ALL.to_vec())
}

/// Payloads shaped like the real ones, with the odd field missing or mistyped
fn form_payload_strategy() -> impl Strategy<Value = Value> {
    (
        prop::option::of(0u64..10_000),
        prop::collection::vec(arbitrary_json_strategy(), 0..5),
        prop::collection::vec("[A-Z]-[0-9]{4}", 0..4),
        arbitrary_json_strategy(),
    )
        .prop_map(|(response_id, answers, serials, extra)| {
            json!({
                "response_id": response_id,
                "answers": answers,
                "file_serials": serials,
                "status": extra,
            })
        })
}

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue,
    /// Remove the n-th live entry (modulo length)
    Remove(usize),
}

fn queue_ops_strategy() -> impl Strategy<Value = Vec<QueueOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(QueueOp::Enqueue),
            1 => any::<usize>().prop_map(QueueOp::Remove),
        ],
        0..40,
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Envelope Decoding Fuzz Tests
// =============================================================================

proptest! {
    /// Decoding should never panic on arbitrary bytes
    #[test]
    fn fuzz_envelope_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..10000)) {
        let result = envelope::decode::<Vec<QueueEntry>>("queue/fuzz", &bytes);
        if let Err(e) = result {
            prop_assert!(matches!(e, StorageError::Corruption { .. }), "expected StorageError::Corruption");
        }
    }

    /// Arbitrary JSON either happens to be a queue list or is rejected cleanly
    #[test]
    fn fuzz_envelope_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let serialized = serde_json::to_vec(&json).unwrap();
        let _ = envelope::decode::<Vec<QueueEntry>>("queue/fuzz", &serialized);

        let wrapped = serde_json::to_vec(&json!({"v": 1, "data": json})).unwrap();
        let _ = envelope::decode::<Vec<QueueEntry>>("queue/fuzz", &wrapped);
    }

    /// Corrupted envelopes should fail gracefully
    #[test]
    fn fuzz_corrupted_envelope(
        payload in arbitrary_json_strategy(),
        corruption in prop::collection::vec(any::<u8>(), 1..50),
        position in 0usize..10000,
    ) {
        let entry = QueueEntry::new(QueueName::FormResponse, NewEntry::new(payload), 0);
        let mut corrupted = envelope::encode(&vec![entry]).unwrap();

        let pos = position % corrupted.len();
        for (i, b) in corruption.iter().enumerate() {
            let idx = (pos + i) % corrupted.len();
            corrupted[idx] ^= b;
        }

        let _ = envelope::decode::<Vec<QueueEntry>>("queue/fuzz", &corrupted);
    }

    /// Records from a newer build are refused, never half-read
    #[test]
    fn prop_future_versions_refused(version in (CURRENT_VERSION + 1)..u32::MAX) {
        let bytes = serde_json::to_vec(&json!({"v": version, "data": []})).unwrap();
        let result = envelope::decode::<Vec<QueueEntry>>("queue/fuzz", &bytes);
        prop_assert!(matches!(result, Err(StorageError::Corruption { .. })), "expected Err(StorageError::Corruption)");
    }
}

// =============================================================================
// Payload Integrity Tests
// =============================================================================

proptest! {
    /// Digest survives a storage round-trip
    #[test]
    fn prop_digest_stable_across_storage(payload in arbitrary_json_strategy()) {
        let entry = QueueEntry::new(QueueName::SerialGeneration, NewEntry::new(payload), 1);
        let bytes = envelope::encode(&vec![entry.clone()]).unwrap();
        let decoded = envelope::decode::<Vec<QueueEntry>>("queue/fuzz", &bytes).unwrap();

        prop_assert_eq!(decoded.record.len(), 1);
        prop_assert!(decoded.record[0].payload_intact());
        prop_assert_eq!(&decoded.record[0].payload_hash, &entry.payload_hash);
    }

    /// Float answers keep their entry live across a reload
    #[test]
    fn prop_float_payloads_stay_queued(
        coords in prop::collection::vec((finite_f64_strategy(), finite_f64_strategy()), 1..8),
    ) {
        let rt = runtime();
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let mutations = MutationQueue::new(store.clone(), clock.clone());

        let ids: Vec<EntryId> = rt.block_on(async {
            let mut ids = Vec::new();
            for (lat, lng) in &coords {
                clock.advance_millis(1);
                let payload = json!({"answers": [{"q": "gps", "a": {"lat": lat, "lng": lng}}]});
                ids.push(mutations.enqueue(QueueName::FormResponse, NewEntry::new(payload)).await.unwrap());
            }
            ids
        });

        let reopened = MutationQueue::new(store, clock);
        let listed: Vec<EntryId> = rt
            .block_on(reopened.list(QueueName::FormResponse))
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        prop_assert_eq!(listed, ids);
    }

    /// Any change to the payload is detected
    #[test]
    fn prop_digest_detects_tampering(
        payload in arbitrary_json_strategy(),
        tamper in arbitrary_json_strategy(),
    ) {
        let original = json!({"data": payload.clone()});
        let tampered = json!({"data": payload, "x": tamper});
        prop_assert_ne!(payload_digest(&original), payload_digest(&tampered));
    }
}

// =============================================================================
// Reconciliation Tests
// =============================================================================

proptest! {
    /// Every status maps to exactly the documented class
    #[test]
    fn prop_classification_partition(status in 100u16..600) {
        let expected = if (200..300).contains(&status) {
            Disposition::Success
        } else if matches!(status, 408 | 425 | 429) || status >= 500 {
            Disposition::Retryable
        } else {
            Disposition::Permanent
        };
        prop_assert_eq!(default_classify(status), expected);
    }

    /// Policies turn any payload into steps or a clean error, and steps only move forward
    #[test]
    fn prop_policies_never_panic(
        queue in queue_name_strategy(),
        payload in form_payload_strategy(),
        cursor in 0u32..5,
        target in prop::option::of("[0-9]{1,6}"),
    ) {
        let mut new_entry = NewEntry::new(payload);
        if let Some(target) = target {
            new_entry = new_entry.with_target(target);
        }
        let mut entry = QueueEntry::new(queue, new_entry, 0);
        entry.cursor = cursor;

        let policy = policy_for(queue);
        if let Ok(Some(step)) = next_step(policy, &entry) {
            prop_assert!(step.index >= cursor);
            let key = step.idempotency_key(&entry);
            prop_assert!(key.starts_with(&entry.id.to_string()));
        }
    }

    /// Backoff never shrinks and never passes the cap
    #[test]
    fn prop_backoff_monotonic_and_capped(attempts in 0u32..10_000) {
        let config = RetryConfig::replay();
        let here = config.delay_for_attempt(attempts);
        let next = config.delay_for_attempt(attempts.saturating_add(1));
        prop_assert!(here <= next);
        prop_assert!(next <= config.max_delay);
    }
}

// =============================================================================
// Queue Ordering Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Under any mix of enqueues and removals the queue holds exactly the
    /// live entries, in the order they were enqueued
    #[test]
    fn prop_queue_fifo_and_no_loss(
        queue in queue_name_strategy(),
        ops in queue_ops_strategy(),
    ) {
        let rt = runtime();
        let clock = Arc::new(ManualClock::new(0));
        let mutations = MutationQueue::new(Arc::new(InMemoryStore::new()), clock.clone());
        let mut model: Vec<EntryId> = Vec::new();

        rt.block_on(async {
            for (seq, op) in ops.iter().enumerate() {
                match op {
                    QueueOp::Enqueue => {
                        clock.advance_millis(1);
                        let id = mutations
                            .enqueue(queue, NewEntry::new(json!({"seq": seq})))
                            .await
                            .unwrap();
                        model.push(id);
                    }
                    QueueOp::Remove(n) => {
                        if model.is_empty() {
                            continue;
                        }
                        let id = model.remove(n % model.len());
                        assert!(mutations.remove(queue, id).await.unwrap());
                        // Idempotent
                        assert!(!mutations.remove(queue, id).await.unwrap());
                    }
                }
            }
        });

        let listed: Vec<EntryId> = rt
            .block_on(mutations.list(queue))
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        prop_assert_eq!(listed, model);
    }
}
