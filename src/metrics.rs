// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for assessment-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `assessment_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: client, remote, store
//! - `operation`: save_record, get_record, fetch, ...
//! - `status`: success, error, rejected
//! - `kind`: sync operation kind (saveTestData, ...)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::orchestrator::SyncReport;

/// Record the outcome of a call
pub fn record_operation(component: &str, operation: &str, status: &str) {
    counter!(
        "assessment_sync_operations_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record call latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "assessment_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "assessment_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE - Enqueue, drain and housekeeping
// ═══════════════════════════════════════════════════════════════════════════

/// Record an operation entering the sync queue
pub fn record_enqueue(kind: &str) {
    counter!(
        "assessment_sync_enqueued_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record the terminal status of a dispatched operation
pub fn record_operation_result(kind: &str, status: &str) {
    counter!(
        "assessment_sync_operation_results_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed drain
pub fn record_sync_run(report: &SyncReport, duration: Duration) {
    counter!("assessment_sync_runs_total").increment(1);
    counter!("assessment_sync_synced_total").increment(report.synced as u64);
    counter!("assessment_sync_failed_total").increment(report.failed as u64);
    histogram!("assessment_sync_run_seconds").record(duration.as_secs_f64());
}

/// Record a skipped drain (offline, in flight)
pub fn record_sync_skipped(reason: &str) {
    counter!(
        "assessment_sync_runs_skipped_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record failed operations returned to pending
pub fn record_requeue(count: usize) {
    counter!("assessment_sync_requeued_total").increment(count as u64);
}

/// Record terminal operations deleted from the queue
pub fn record_prune(count: usize) {
    counter!("assessment_sync_pruned_total").increment(count as u64);
}

/// Record operations enqueued by the reconcile pass
pub fn record_reconcile(enqueued: usize) {
    counter!("assessment_sync_reconcile_runs_total").increment(1);
    counter!("assessment_sync_reconcile_enqueued_total").increment(enqueued as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CLIENT STATE - Gauges the UI indicator mirrors
// ═══════════════════════════════════════════════════════════════════════════

/// Set the pending operation count
pub fn set_pending_operations(count: usize) {
    gauge!("assessment_sync_pending_operations").set(count as f64);
}

/// Set connectivity (1 = online, 0 = offline)
pub fn set_online(online: bool) {
    gauge!("assessment_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// Record a call served by the offline path (`cache` or `queue`)
pub fn record_fallback(operation: &str, path: &str) {
    counter!(
        "assessment_sync_fallbacks_total",
        "operation" => operation.to_string(),
        "path" => path.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
