//! Per-bucket aggregation of completed transactions.
//!
//! One [`AggregateBuilder`] accumulates a single bucket — per transaction
//! type overall, or per (type, name) — over one wall-clock interval.
//! Durations fold in microseconds; timer trees merge by name into a
//! synthetic root so differently-shaped transactions combine.

pub mod histogram;

use crate::profile::Profile;
use crate::transaction::timer::TimerSnapshot;
use crate::transaction::Transaction;
use histogram::LazyHistogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Name of the synthetic root the real root timers fold into.
const SYNTHETIC_ROOT_NAME: &str = "<root>";

/// Bucket identity: per-type overall when `transaction_name` is `None`,
/// per-(type, name) otherwise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub transaction_type: String,
    pub transaction_name: Option<String>,
}

impl AggregateKey {
    pub fn overall(transaction_type: impl Into<String>) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            transaction_name: None,
        }
    }

    pub fn named(
        transaction_type: impl Into<String>,
        transaction_name: impl Into<String>,
    ) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            transaction_name: Some(transaction_name.into()),
        }
    }
}

/// Merged timer node. Children are keyed by name so merge order is
/// deterministic; totals accumulate without any nesting invariant across
/// transactions, since different transactions may nest differently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateTimer {
    pub name: String,
    pub total_micros: u64,
    pub count: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub children: BTreeMap<String, AggregateTimer>,
}

impl AggregateTimer {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total_micros: 0,
            count: 0,
            children: BTreeMap::new(),
        }
    }

    /// Fold one transaction's timer subtree into this node.
    fn add(&mut self, snapshot: &TimerSnapshot) {
        self.total_micros += snapshot.total_nanos / 1_000;
        self.count += snapshot.count;
        for child in &snapshot.children {
            self.children
                .entry(child.name.clone())
                .or_insert_with(|| AggregateTimer::new(child.name.clone()))
                .add(child);
        }
    }

    /// Fold another aggregate timer into this node.
    fn merge(&mut self, other: &AggregateTimer) {
        self.total_micros += other.total_micros;
        self.count += other.count;
        for (name, child) in &other.children {
            self.children
                .entry(name.clone())
                .or_insert_with(|| AggregateTimer::new(name.clone()))
                .merge(child);
        }
    }
}

/// Immutable rollup emitted by [`AggregateBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub capture_time_millis: i64,
    pub total_micros: u64,
    pub transaction_count: u64,
    pub error_count: u64,
    /// Transactions stored as full traces.
    pub trace_count: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_cpu_micros: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_blocked_micros: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_waited_micros: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_allocated_bytes: Option<u64>,
    /// Merged timer tree serialized as JSON.
    pub timers_json: String,
    /// Binary-encoded latency histogram (microseconds).
    pub histogram: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub profile_json: Option<String>,
    pub profile_sample_count: u64,
}

/// Incrementally folds completed transactions into one bucket.
#[derive(Debug, Clone)]
pub struct AggregateBuilder {
    total_micros: u64,
    transaction_count: u64,
    error_count: u64,
    trace_count: u64,
    total_cpu_micros: Option<u64>,
    total_blocked_micros: Option<u64>,
    total_waited_micros: Option<u64>,
    total_allocated_bytes: Option<u64>,
    histogram: LazyHistogram,
    root_timer: AggregateTimer,
    profile: Option<Profile>,
}

impl Default for AggregateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateBuilder {
    pub fn new() -> Self {
        Self {
            total_micros: 0,
            transaction_count: 0,
            error_count: 0,
            trace_count: 0,
            total_cpu_micros: None,
            total_blocked_micros: None,
            total_waited_micros: None,
            total_allocated_bytes: None,
            histogram: LazyHistogram::new(),
            root_timer: AggregateTimer::new(SYNTHETIC_ROOT_NAME),
            profile: None,
        }
    }

    /// Fold one completed transaction's scalars; `store_trace` marks
    /// transactions the collector will persist in full.
    pub fn add(&mut self, transaction: &Transaction, store_trace: bool) {
        let duration_micros = transaction.duration_nanos().unwrap_or_else(|| {
            warn!(transaction_id = %transaction.id(), "aggregating a transaction that has not completed");
            0
        }) / 1_000;
        self.total_micros += duration_micros;
        self.transaction_count += 1;
        if transaction.error().is_some() {
            self.error_count += 1;
        }
        if store_trace {
            self.trace_count += 1;
        }
        if let Some(stats) = transaction.thread_stats() {
            add_not_available_aware(&mut self.total_cpu_micros, stats.cpu_nanos.map(|n| n / 1_000));
            add_not_available_aware(
                &mut self.total_blocked_micros,
                stats.blocked_millis.map(|m| m * 1_000),
            );
            add_not_available_aware(
                &mut self.total_waited_micros,
                stats.waited_millis.map(|m| m * 1_000),
            );
            add_not_available_aware(&mut self.total_allocated_bytes, stats.allocated_bytes);
        }
        self.histogram.add(duration_micros);
    }

    /// Fold one transaction's timer tree: the real root's total and count
    /// land on the synthetic root, nested timers merge by name beneath it.
    pub fn add_timers(&mut self, root: &TimerSnapshot) {
        self.root_timer.add(root);
    }

    /// Fold one transaction's profile into the aggregate profile.
    pub fn add_profile(&mut self, profile: &Profile) {
        self.profile
            .get_or_insert_with(Profile::new)
            .merge(profile);
    }

    /// Fold another bucket into this one.
    pub fn merge(&mut self, other: &AggregateBuilder) {
        self.total_micros += other.total_micros;
        self.transaction_count += other.transaction_count;
        self.error_count += other.error_count;
        self.trace_count += other.trace_count;
        add_not_available_aware(&mut self.total_cpu_micros, other.total_cpu_micros);
        add_not_available_aware(&mut self.total_blocked_micros, other.total_blocked_micros);
        add_not_available_aware(&mut self.total_waited_micros, other.total_waited_micros);
        add_not_available_aware(&mut self.total_allocated_bytes, other.total_allocated_bytes);
        self.histogram.merge(&other.histogram);
        self.root_timer.merge(&other.root_timer);
        if let Some(profile) = &other.profile {
            self.add_profile(profile);
        }
    }

    pub fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    /// Emit the immutable record for this bucket.
    pub fn build(&self, capture_time_millis: i64) -> Aggregate {
        let timers_json = serde_json::to_string(&self.root_timer).unwrap_or_else(|err| {
            warn!(error = %err, "aggregate timer serialization failed");
            String::from("{}")
        });
        let profile_json = self.profile.as_ref().and_then(|profile| {
            serde_json::to_string(profile)
                .map_err(|err| warn!(error = %err, "aggregate profile serialization failed"))
                .ok()
        });
        Aggregate {
            capture_time_millis,
            total_micros: self.total_micros,
            transaction_count: self.transaction_count,
            error_count: self.error_count,
            trace_count: self.trace_count,
            total_cpu_micros: self.total_cpu_micros,
            total_blocked_micros: self.total_blocked_micros,
            total_waited_micros: self.total_waited_micros,
            total_allocated_bytes: self.total_allocated_bytes,
            timers_json,
            histogram: self.histogram.encode(),
            profile_json,
            profile_sample_count: self.profile.as_ref().map(|p| p.sample_count).unwrap_or(0),
        }
    }
}

/// Accumulate optional stats: a present value adds onto the (possibly
/// zero-initialized) total, an absent value leaves the total untouched.
fn add_not_available_aware(total: &mut Option<u64>, value: Option<u64>) {
    if let Some(value) = value {
        *total = Some(total.unwrap_or(0) + value);
    }
}
