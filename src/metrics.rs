//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Per-syncer command flow (pulled, pushed, bypassed)
//! - Target reply outcomes and sampled end-to-end latency
//! - Full-sync progress and restore counters
//! - Applied / source-reported replication offsets
//! - Source reconnects
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! counters end in `_total`, gauges represent current state, histograms
//! track distributions.
//!
//! The embedding daemon installs whatever `metrics` recorder it wants;
//! without one these calls are no-ops.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record commands decoded from the source stream.
pub fn record_pull_cmd(syncer_id: usize, count: u64) {
    counter!("relay_pull_cmd_total", "syncer" => syncer_id.to_string()).increment(count);
}

/// Record commands written into the target pipeline.
pub fn record_push_cmd(syncer_id: usize, count: u64) {
    counter!("relay_push_cmd_total", "syncer" => syncer_id.to_string()).increment(count);
}

/// Record commands dropped by policy (filter, unaccepted db, internal marker).
pub fn record_bypass_cmd(syncer_id: usize, count: u64) {
    counter!("relay_bypass_cmd_total", "syncer" => syncer_id.to_string()).increment(count);
}

/// Record payload bytes written to the target.
pub fn record_network_flow(syncer_id: usize, bytes: u64) {
    counter!("relay_network_flow_bytes_total", "syncer" => syncer_id.to_string()).increment(bytes);
}

/// Record a successful reply from the target.
pub fn record_success_reply(syncer_id: usize) {
    counter!("relay_target_replies_total", "syncer" => syncer_id.to_string(), "status" => "success")
        .increment(1);
}

/// Record a failed reply from the target.
pub fn record_fail_reply(syncer_id: usize) {
    counter!("relay_target_replies_total", "syncer" => syncer_id.to_string(), "status" => "failure")
        .increment(1);
}

/// Record a sampled send-to-reply delay.
pub fn record_delay(syncer_id: usize, delay: Duration) {
    histogram!("relay_delay_ms", "syncer" => syncer_id.to_string())
        .record(delay.as_secs_f64() * 1000.0);
}

/// Record a restored snapshot record.
pub fn record_entry_restored(syncer_id: usize) {
    counter!("relay_restore_entries_total", "syncer" => syncer_id.to_string(), "outcome" => "restored")
        .increment(1);
}

/// Record a snapshot record dropped by a filter.
pub fn record_entry_ignored(syncer_id: usize) {
    counter!("relay_restore_entries_total", "syncer" => syncer_id.to_string(), "outcome" => "ignored")
        .increment(1);
}

/// Set full-sync progress (0-100).
pub fn set_fullsync_progress(syncer_id: usize, percent: u64) {
    gauge!("relay_fullsync_progress_percent", "syncer" => syncer_id.to_string())
        .set(percent as f64);
}

/// Set the applied target-side offset.
pub fn set_target_offset(syncer_id: usize, offset: i64) {
    gauge!("relay_target_offset", "syncer" => syncer_id.to_string()).set(offset as f64);
}

/// Set the offset the source believes this replica has acknowledged.
pub fn set_source_offset(syncer_id: usize, offset: i64) {
    gauge!("relay_source_offset", "syncer" => syncer_id.to_string()).set(offset as f64);
}

/// Record a source connection reopen attempt.
pub fn record_source_reopen(syncer_id: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_source_reopens_total", "syncer" => syncer_id.to_string(), "status" => status)
        .increment(1);
}

/// Record a dropped delay sample (queue full).
pub fn record_delay_sample_dropped(syncer_id: usize) {
    counter!("relay_delay_samples_dropped_total", "syncer" => syncer_id.to_string()).increment(1);
}

/// Set the per-syncer status gauge (0=waitfull, 1=full, 2=incr, 3=reopen).
pub fn set_syncer_status(syncer_id: usize, status: &str) {
    let value = match status {
        "waitfull" => 0.0,
        "full" => 1.0,
        "incr" => 2.0,
        "reopen" => 3.0,
        _ => -1.0,
    };
    gauge!("relay_syncer_status", "syncer" => syncer_id.to_string()).set(value);
}
