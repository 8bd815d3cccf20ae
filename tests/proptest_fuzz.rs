//! Property-based tests (fuzzing) for assessment sync.
//!
//! Uses proptest to generate random/malformed inputs and verify the store,
//! queue and record decoding never panic, only return clean errors, and
//! that ordering guarantees hold for arbitrary data.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Value};

use assessment_sync::storage::traits::extract_key;
use assessment_sync::storage::{IndexValue, Partition, ScanOptions, Store};
use assessment_sync::{
    InMemoryRemote, ManualConnectivity, OperationKind, Record, SyncClient, SyncConfig, SyncOperation, SyncQueue,
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

/// Test codes the way the platform mints them
fn test_code_strategy() -> impl Strategy<Value = String> {
    "[A-Z0-9]{1,12}"
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Deserialization Fuzz Tests
// =============================================================================

proptest! {
    /// Record decoding should never panic on arbitrary bytes
    #[test]
    fn fuzz_record_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..10000)) {
        let result: Result<Record, _> = serde_json::from_slice(&bytes);
        let _ = result;
    }

    /// Record decoding should handle arbitrary JSON gracefully
    #[test]
    fn fuzz_record_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let result: Result<Record, _> = serde_json::from_value(json);
        let _ = result;
    }

    /// Queue entries read back from a damaged store fail cleanly
    #[test]
    fn fuzz_operation_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let result: Result<SyncOperation, _> = serde_json::from_value(json);
        if let Ok(op) = result {
            // Accessors tolerate whatever metadata came along
            let _ = (op.attempts(), op.next_attempt_at(), op.error(), op.record_key());
        }
    }

    /// Primary key extraction returns Err for unusable documents, never panics
    #[test]
    fn fuzz_extract_key(json in arbitrary_json_strategy()) {
        for partition in [Partition::TestData, Partition::UserData, Partition::Settings, Partition::SyncQueue] {
            let _ = extract_key(partition, &json);
        }
    }
}

// =============================================================================
// Ordering Properties
// =============================================================================

proptest! {
    /// Index sort keys compare the way the integers they encode compare
    #[test]
    fn prop_int_sort_key_preserves_order(a in any::<i64>(), b in any::<i64>()) {
        let ka = IndexValue::Int(a).sort_key();
        let kb = IndexValue::Int(b).sort_key();
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }

    /// Scans by timestamp agree with a sorted model, in both directions and
    /// for any page size
    #[test]
    fn prop_scan_order_matches_model(
        entries in prop::collection::btree_map(test_code_strategy(), -1_000i64..1_000, 0..40),
        page_size in 1usize..8,
    ) {
        let rt = runtime();
        let (ascending, descending) = rt.block_on(async {
            let store = Store::in_memory().with_page_size(page_size);
            for (key, ts) in &entries {
                let mut record = Record::new(key.as_str(), json!(ts));
                record.timestamp = *ts;
                store.put_record(Partition::TestData, &record).await.unwrap();
            }
            let asc: Vec<Record> = store
                .scan(Partition::TestData, ScanOptions::by_index("timestamp"))
                .collect()
                .await
                .unwrap();
            let desc: Vec<Record> = store
                .scan(Partition::TestData, ScanOptions::by_index("timestamp").descending())
                .collect()
                .await
                .unwrap();
            (asc, desc)
        });

        let mut model: Vec<(i64, String)> = entries.iter().map(|(k, ts)| (*ts, k.clone())).collect();
        model.sort();
        let asc_keys: Vec<(i64, String)> = ascending.iter().map(|r| (r.timestamp, r.key.clone())).collect();
        prop_assert_eq!(&asc_keys, &model);

        model.reverse();
        let desc_keys: Vec<(i64, String)> = descending.iter().map(|r| (r.timestamp, r.key.clone())).collect();
        prop_assert_eq!(&desc_keys, &model);
    }

    /// Queue ids strictly increase in enqueue order
    #[test]
    fn prop_queue_ids_monotonic(count in 1usize..30) {
        let rt = runtime();
        let ids = rt.block_on(async {
            let queue = SyncQueue::new(Store::in_memory());
            let mut ids = Vec::with_capacity(count);
            for i in 0..count {
                let id = queue
                    .enqueue(OperationKind::SaveTestData, json!({"key": format!("k{i}")}))
                    .await
                    .unwrap();
                ids.push(id);
            }
            ids
        });
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}

// =============================================================================
// Durability Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever is saved offline reads back unchanged
    #[test]
    fn prop_offline_save_reads_back(key in test_code_strategy(), payload in arbitrary_json_strategy()) {
        let rt = runtime();
        let (read, pending) = rt.block_on(async {
            let client = SyncClient::new(
                SyncConfig::default(),
                Store::in_memory(),
                Arc::new(InMemoryRemote::new()),
                Arc::new(ManualConnectivity::new(false)),
            )
            .await
            .unwrap();
            client.save_record(Record::new(key.as_str(), payload.clone())).await.unwrap();
            (client.get_record(&key).await.unwrap(), client.pending_operations())
        });
        prop_assert_eq!(read.data.payload, payload);
        prop_assert!(read.from_cache);
        prop_assert_eq!(pending, 1);
    }
}
