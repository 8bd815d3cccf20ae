//! Offline round trip with assessment-sync.
//!
//! Demonstrates:
//! 1. Opening a SQLite-backed client while offline
//! 2. Saving test results and user data with no network
//! 3. Reading them back from the local store
//! 4. Reconnecting: the background loop drains the queue on its own
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! The remote is an in-process [`InMemoryRemote`], so nothing needs to be
//! running.
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=assessment_sync=debug cargo run --example offline_roundtrip
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use assessment_sync::storage::Partition;
use assessment_sync::{FetchOptions, InMemoryRemote, ManualConnectivity, Record, SyncClient, SyncConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           assessment-sync: Offline Round Trip                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Open the client with the network down
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("assessment.db");
    println!("📦 Opening store at {}", db_path.display());

    let config = SyncConfig {
        db_path: Some(db_path.to_string_lossy().into_owned()),
        sync_interval_secs: 5,
        ..Default::default()
    };
    let remote = Arc::new(InMemoryRemote::new());
    let connectivity = Arc::new(ManualConnectivity::new(false));
    let client = Arc::new(SyncClient::open(config, remote.clone(), connectivity.clone()).await?);
    println!("   State: {:?}", client.status());

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .run(async {
                    let _ = stop_rx.await;
                })
                .await
        }
    });

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Save while offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Saving results offline...");
    let results = [
        ("ABC123", json!({"mbti": "INFP", "scores": {"E": 31, "N": 72}})),
        ("DEF456", json!({"mbti": "ESTJ", "scores": {"E": 80, "N": 22}})),
        ("GHI789", json!({"enneagram": 4})),
    ];
    for (code, payload) in &results {
        let saved = client.save_record(Record::new(*code, payload.clone())).await?;
        println!("   └─ {} queued as #{:?}", saved.key, saved.queued);
    }
    client.save_user_data("user-42", json!({"name": "Sam"})).await?;
    client.save_setting("locale", json!("en-GB")).await?;
    println!("   Pending operations: {}", client.pending_operations());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Read back from the local store
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading back offline...");
    let read = client.get_record("ABC123").await?;
    println!("   └─ ABC123 → {} (from_cache={})", read.data.payload, read.from_cache);
    let all = client.get_all_records(FetchOptions::default().newest_first()).await?;
    for record in &all.data {
        println!("   └─ {} (created {})", record.key, record.timestamp);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reconnect and wait for the drain
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌐 Going online...");
    let mut status = client.subscribe();
    connectivity.go_online();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.online && s.pending_operations == 0 && s.last_sync.is_some()),
    )
    .await??;

    let state = client.status();
    println!("   ✅ Drained: {:?}", state.last_sync);
    for (code, _) in &results {
        let delivered = remote.get(Partition::TestData, code).is_some();
        println!("   └─ remote has {}: {}", code, delivered);
    }
    println!("   └─ remote has user-42: {}", remote.get(Partition::UserData, "user-42").is_some());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    let _ = stop_tx.send(());
    worker.await?;
    println!("   ✅ Shutdown complete!");

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print captured counters and gauges, sorted by name
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            match value {
                DebugValue::Counter(v) => Some(format!("{}{} = {}", key.name(), label_str, v)),
                DebugValue::Gauge(v) => Some(format!("{}{} = {:.0}", key.name(), label_str, v.into_inner())),
                DebugValue::Histogram(samples) => Some(format!("{}{} (count={})", key.name(), label_str, samples.len())),
            }
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
