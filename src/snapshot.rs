//! Immutable trace snapshots normalized to a capture tick.
//!
//! Three variants of the same record: active (transaction still running,
//! timings normalized to the supplied capture tick), partial (stored
//! intermediate record for a long-running transaction), and completed
//! (uses the transaction's own end tick and capture time). Reads of a live
//! transaction go through the same short critical sections the owning
//! thread uses; the engine holds no lock across user code.

use crate::transaction::entry::{EntrySnapshot, Existence};
use crate::transaction::probes::{GcActivity, ThreadStats};
use crate::transaction::timer::TimerSnapshot;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Immutable capture of a (possibly still running) transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSnapshot {
    /// Stable string form of the transaction's 128-bit id.
    pub id: String,
    pub active: bool,
    pub partial: bool,
    pub start_time_millis: i64,
    pub capture_time_millis: i64,
    pub duration_nanos: u64,
    pub transaction_type: String,
    pub transaction_name: String,
    pub headline: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attributes: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<serde_json::Value>,
    pub timers: TimerSnapshot,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thread_stats: Option<ThreadStats>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gc_activity: Option<Vec<GcActivity>>,
    pub entry_count: u64,
    pub profile_sample_count: u64,
    pub entries_existence: Existence,
    pub profile_existence: Existence,
}

/// Snapshot of a transaction still running, normalized to `capture_tick`.
pub fn capture_active(
    transaction: &Transaction,
    capture_tick: u64,
    capture_time_millis: i64,
) -> TraceSnapshot {
    build(transaction, capture_tick, capture_time_millis, true, false)
}

/// Intermediate stored record for a long-running transaction.
pub fn capture_partial(
    transaction: &Transaction,
    capture_tick: u64,
    capture_time_millis: i64,
) -> TraceSnapshot {
    build(transaction, capture_tick, capture_time_millis, true, true)
}

/// Snapshot of a completed transaction at its own end tick.
pub fn capture_completed(transaction: &Transaction) -> TraceSnapshot {
    let capture_tick = transaction.end_tick().unwrap_or_else(|| {
        warn!(transaction_id = %transaction.id(), "completed snapshot of a live transaction");
        transaction.start_tick()
    });
    let capture_time_millis = transaction
        .capture_time_millis()
        .unwrap_or_else(|| transaction.start_time_millis());
    build(transaction, capture_tick, capture_time_millis, false, false)
}

/// The entry tree with messages evaluated, for storage and display.
pub fn capture_entries(transaction: &Transaction) -> EntrySnapshot {
    transaction.entries_snapshot()
}

fn build(
    transaction: &Transaction,
    capture_tick: u64,
    capture_time_millis: i64,
    active: bool,
    partial: bool,
) -> TraceSnapshot {
    TraceSnapshot {
        id: transaction.id().to_string(),
        active,
        partial,
        start_time_millis: transaction.start_time_millis(),
        capture_time_millis,
        duration_nanos: capture_tick.saturating_sub(transaction.start_tick()),
        transaction_type: transaction.transaction_type(),
        transaction_name: transaction.transaction_name(),
        headline: transaction.headline(),
        error: transaction.error(),
        user: transaction.user(),
        attributes: transaction.attributes(),
        detail: transaction.detail(),
        timers: transaction.timer_snapshot(capture_tick),
        thread_stats: transaction.thread_stats(),
        gc_activity: transaction.gc_activity(),
        entry_count: transaction.entry_count(),
        profile_sample_count: transaction.profile_sample_count(),
        entries_existence: if transaction.entry_count() > 0 {
            Existence::Yes
        } else {
            Existence::No
        },
        profile_existence: if transaction.profile_sample_count() > 0 {
            Existence::Yes
        } else {
            Existence::No
        },
    }
}
