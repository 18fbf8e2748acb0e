//! The transaction root aggregate.
//!
//! A transaction owns its entry tree and timer tree exclusively (arena
//! nodes addressed by index), tracks counters and completion state, and
//! carries the optional thread/GC probes and profile. All entry/timer
//! stack operations happen on the transaction's own thread; snapshot
//! threads read through the same short critical sections and atomics.

pub mod entry;
pub mod probes;
pub mod timer;

use crate::collector::ScheduledTask;
use crate::message::{ErrorMessage, MessageSupplier};
use crate::profile::Profile;
use crate::stack::StackFrame;
use entry::{EntryNode, EntrySnapshot};
use parking_lot::{Mutex, RwLock};
use probes::{GcActivity, GcInfoComponent, ThreadInfoComponent, ThreadStats};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use timer::{TimerArena, TimerName, TimerSnapshot};
use tracing::warn;
use uuid::Uuid;

/// Sentinel for "no per-transaction store threshold override".
const NO_THRESHOLD_OVERRIDE: i64 = -1;

struct TraceState {
    entries: Vec<EntryNode>,
    timers: TimerArena,
    /// Open entries, innermost last. The root entry stays at the bottom
    /// until completion.
    entry_stack: Vec<usize>,
    /// Innermost running timer; tracked separately from the entry stack
    /// because timers nest more finely than entries.
    current_timer: Option<usize>,
    limit_marker_added: bool,
}

/// The outermost unit of work traced, rooted on one thread.
pub struct Transaction {
    id: Uuid,
    start_time_millis: i64,
    start_tick: u64,

    transaction_type: RwLock<String>,
    transaction_name: RwLock<String>,
    user: RwLock<Option<String>>,
    error: RwLock<Option<String>>,
    attributes: RwLock<BTreeMap<String, Vec<String>>>,
    detail: RwLock<Option<Value>>,

    state: Mutex<TraceState>,

    /// Total entries created, including ones suppressed by the cap; never
    /// decremented.
    entry_count: AtomicU64,
    profile_sample_count: AtomicU64,
    end_tick: AtomicU64,
    capture_tick: AtomicU64,
    capture_time_millis: AtomicI64,
    completed: AtomicBool,
    store_threshold_override_millis: AtomicI64,

    thread_info: Option<ThreadInfoComponent>,
    gc_info: Option<GcInfoComponent>,
    profile: Mutex<Option<Profile>>,

    user_profile_task: Mutex<Option<Arc<dyn ScheduledTask>>>,
    immediate_store_task: Mutex<Option<Arc<dyn ScheduledTask>>>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transaction_type: String,
        transaction_name: String,
        message: Arc<dyn MessageSupplier>,
        timer_name: TimerName,
        start_time_millis: i64,
        start_tick: u64,
        thread_info: Option<ThreadInfoComponent>,
        gc_info: Option<GcInfoComponent>,
    ) -> Arc<Self> {
        let mut timers = TimerArena::new();
        let root_timer = timers.root(timer_name, start_tick);
        let root_entry = EntryNode {
            start_tick,
            end_tick: None,
            message: Some(message),
            error: None,
            stack_trace: None,
            timer: Some(root_timer),
            parent: None,
            children: Vec::new(),
            limit_exceeded_marker: false,
        };
        Arc::new(Self {
            id: Uuid::new_v4(),
            start_time_millis,
            start_tick,
            transaction_type: RwLock::new(transaction_type),
            transaction_name: RwLock::new(transaction_name),
            user: RwLock::new(None),
            error: RwLock::new(None),
            attributes: RwLock::new(BTreeMap::new()),
            detail: RwLock::new(None),
            state: Mutex::new(TraceState {
                entries: vec![root_entry],
                timers,
                entry_stack: vec![0],
                current_timer: Some(root_timer),
                limit_marker_added: false,
            }),
            entry_count: AtomicU64::new(1),
            profile_sample_count: AtomicU64::new(0),
            end_tick: AtomicU64::new(0),
            capture_tick: AtomicU64::new(0),
            capture_time_millis: AtomicI64::new(0),
            completed: AtomicBool::new(false),
            store_threshold_override_millis: AtomicI64::new(NO_THRESHOLD_OVERRIDE),
            thread_info,
            gc_info,
            profile: Mutex::new(None),
            user_profile_task: Mutex::new(None),
            immediate_store_task: Mutex::new(None),
        })
    }

    // ---- identity & classification ----

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn start_time_millis(&self) -> i64 {
        self.start_time_millis
    }

    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    pub fn transaction_type(&self) -> String {
        self.transaction_type.read().clone()
    }

    pub fn transaction_name(&self) -> String {
        self.transaction_name.read().clone()
    }

    /// User-visible short description, derived from the root entry's
    /// message supplier. Evaluated here, never on the hot path.
    pub fn headline(&self) -> String {
        let supplier = {
            let state = self.state.lock();
            state.entries[0].message.clone()
        };
        supplier.map(|s| s.get().text).unwrap_or_default()
    }

    pub fn user(&self) -> Option<String> {
        self.user.read().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    pub fn attributes(&self) -> BTreeMap<String, Vec<String>> {
        self.attributes.read().clone()
    }

    pub fn detail(&self) -> Option<Value> {
        self.detail.read().clone()
    }

    // ---- counters & completion ----

    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn profile_sample_count(&self) -> u64 {
        self.profile_sample_count.load(Ordering::Relaxed)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn end_tick(&self) -> Option<u64> {
        self.is_completed()
            .then(|| self.end_tick.load(Ordering::Acquire))
    }

    pub fn capture_tick(&self) -> Option<u64> {
        self.is_completed()
            .then(|| self.capture_tick.load(Ordering::Acquire))
    }

    pub fn capture_time_millis(&self) -> Option<i64> {
        self.is_completed()
            .then(|| self.capture_time_millis.load(Ordering::Acquire))
    }

    pub fn duration_nanos(&self) -> Option<u64> {
        self.end_tick().map(|end| end.saturating_sub(self.start_tick))
    }

    pub fn store_threshold_override_millis(&self) -> Option<i64> {
        let value = self.store_threshold_override_millis.load(Ordering::Relaxed);
        (value != NO_THRESHOLD_OVERRIDE).then_some(value)
    }

    // ---- probes & profile ----

    pub fn thread_stats(&self) -> Option<ThreadStats> {
        self.thread_info.as_ref().map(|component| component.stats())
    }

    pub fn gc_activity(&self) -> Option<Vec<GcActivity>> {
        self.gc_info.as_ref().map(|component| component.activity())
    }

    pub fn profile_snapshot(&self) -> Option<Profile> {
        self.profile.lock().clone()
    }

    /// Merge one stack sample into this transaction's profile; `stack` is
    /// ordered innermost frame first.
    pub fn add_profile_sample(&self, stack: &[StackFrame]) {
        if self.is_completed() {
            return;
        }
        self.profile
            .lock()
            .get_or_insert_with(Profile::new)
            .add_sample(stack);
        self.profile_sample_count.fetch_add(1, Ordering::Relaxed);
    }

    // ---- mutation until completion ----

    pub fn set_transaction_type(&self, transaction_type: &str) {
        if self.is_completed() {
            return;
        }
        *self.transaction_type.write() = transaction_type.to_string();
    }

    pub fn set_transaction_name(&self, transaction_name: &str) {
        if self.is_completed() {
            return;
        }
        *self.transaction_name.write() = transaction_name.to_string();
    }

    /// Returns true when this was the first user assignment.
    pub fn set_user(&self, user: &str) -> bool {
        if self.is_completed() {
            return false;
        }
        let mut slot = self.user.write();
        let first = slot.is_none();
        *slot = Some(user.to_string());
        first
    }

    pub fn set_error(&self, error: &str) {
        if self.is_completed() {
            return;
        }
        *self.error.write() = Some(error.to_string());
    }

    /// Multi-valued attribute add with set semantics per name.
    pub fn add_attribute(&self, name: &str, value: &str) {
        if self.is_completed() {
            return;
        }
        let mut attributes = self.attributes.write();
        let values = attributes.entry(name.to_string()).or_default();
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }

    pub fn set_detail(&self, detail: Value) {
        if self.is_completed() {
            return;
        }
        *self.detail.write() = Some(detail);
    }

    pub fn set_store_threshold_override_millis(&self, millis: i64) {
        if millis < 0 {
            warn!(millis, "negative store threshold override rejected");
            return;
        }
        self.store_threshold_override_millis
            .store(millis, Ordering::Relaxed);
    }

    // ---- scheduled task handles ----

    pub fn set_user_profile_task(&self, task: Arc<dyn ScheduledTask>) {
        *self.user_profile_task.lock() = Some(task);
    }

    pub fn has_user_profile_task(&self) -> bool {
        self.user_profile_task.lock().is_some()
    }

    pub fn set_immediate_store_task(&self, task: Arc<dyn ScheduledTask>) {
        *self.immediate_store_task.lock() = Some(task);
    }

    pub(crate) fn cancel_scheduled_tasks(&self) {
        if let Some(task) = self.immediate_store_task.lock().take() {
            task.cancel();
        }
        if let Some(task) = self.user_profile_task.lock().take() {
            task.cancel();
        }
    }

    // ---- timer operations (transaction thread only) ----

    /// Start a timer named `name` nested under the current timer; `None`
    /// when there is no current timer, which cannot happen while the
    /// transaction is live and is recovered as a no-op.
    pub(crate) fn start_nested_timer(&self, name: TimerName, tick: u64) -> Option<usize> {
        let mut state = self.state.lock();
        let Some(current) = state.current_timer else {
            warn!(transaction_id = %self.id, "no current timer on a live transaction");
            return None;
        };
        let idx = state.timers.start_nested(current, name, tick);
        state.current_timer = Some(idx);
        Some(idx)
    }

    pub(crate) fn stop_timer(&self, idx: usize, tick: u64) {
        let mut state = self.state.lock();
        if state.current_timer != Some(idx) {
            warn!(transaction_id = %self.id, "timer stopped out of order");
        }
        state.current_timer = state.timers.stop(idx, tick);
    }

    // ---- entry operations (transaction thread only) ----

    /// Push a new open entry under the innermost open entry.
    pub(crate) fn push_entry(
        &self,
        start_tick: u64,
        message: Arc<dyn MessageSupplier>,
        timer: Option<usize>,
    ) -> usize {
        let mut state = self.state.lock();
        let parent = state.entry_stack.last().copied();
        let idx = state.entries.len();
        state.entries.push(EntryNode {
            start_tick,
            end_tick: None,
            message: Some(message),
            error: None,
            stack_trace: None,
            timer,
            parent,
            children: Vec::new(),
            limit_exceeded_marker: false,
        });
        if let Some(parent) = parent {
            state.entries[parent].children.push(idx);
        }
        state.entry_stack.push(idx);
        drop(state);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        idx
    }

    /// Pop `idx` at `end_tick`, stopping its owning timer. Out-of-order
    /// pops are fixed up: open entries above the target are force-ended at
    /// the same tick. Returns true when the popped entry was the root.
    pub(crate) fn pop_entry(
        &self,
        idx: usize,
        end_tick: u64,
        error: Option<ErrorMessage>,
        stack_trace: Option<Vec<StackFrame>>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.entries[idx].end_tick.is_some() {
            warn!(transaction_id = %self.id, "entry ended more than once");
            return false;
        }
        if !state.entry_stack.contains(&idx) {
            warn!(transaction_id = %self.id, "entry ended but not on the open stack");
            return false;
        }
        while let Some(&top) = state.entry_stack.last() {
            if top == idx {
                break;
            }
            warn!(transaction_id = %self.id, "entry ended out of order, closing intermediate entry");
            state.entry_stack.pop();
            Self::finish_entry(&mut state, top, end_tick, None, None);
        }
        state.entry_stack.pop();
        Self::finish_entry(&mut state, idx, end_tick, error, stack_trace);
        state.entry_stack.is_empty()
    }

    fn finish_entry(
        state: &mut TraceState,
        idx: usize,
        end_tick: u64,
        error: Option<ErrorMessage>,
        stack_trace: Option<Vec<StackFrame>>,
    ) {
        let timer = state.entries[idx].timer;
        let node = &mut state.entries[idx];
        node.end_tick = Some(end_tick);
        if error.is_some() {
            node.error = error;
        }
        if stack_trace.is_some() {
            node.stack_trace = stack_trace;
        }
        if let Some(timer) = timer {
            state.current_timer = state.timers.stop(timer, end_tick);
        }
    }

    /// Append an already-ended entry under the innermost open entry,
    /// bypassing the stack. Used for error entries and cap-exceeded
    /// captures.
    pub(crate) fn add_entry(
        &self,
        start_tick: u64,
        end_tick: u64,
        message: Option<Arc<dyn MessageSupplier>>,
        error: Option<ErrorMessage>,
        stack_trace: Option<Vec<StackFrame>>,
    ) -> usize {
        let mut state = self.state.lock();
        let parent = state.entry_stack.last().copied();
        let idx = state.entries.len();
        state.entries.push(EntryNode {
            start_tick,
            end_tick: Some(end_tick),
            message,
            error,
            stack_trace,
            timer: None,
            parent,
            children: Vec::new(),
            limit_exceeded_marker: false,
        });
        if let Some(parent) = parent {
            state.entries[parent].children.push(idx);
        }
        drop(state);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        idx
    }

    /// Append the single cap-exceeded marker entry; idempotent. The marker
    /// does not count against the entry cap.
    pub(crate) fn add_limit_exceeded_marker(&self, tick: u64) {
        let mut state = self.state.lock();
        if state.limit_marker_added {
            return;
        }
        state.limit_marker_added = true;
        let parent = state.entry_stack.last().copied();
        let idx = state.entries.len();
        state.entries.push(EntryNode {
            start_tick: tick,
            end_tick: Some(tick),
            message: None,
            error: None,
            stack_trace: None,
            timer: None,
            parent,
            children: Vec::new(),
            limit_exceeded_marker: true,
        });
        if let Some(parent) = parent {
            state.entries[parent].children.push(idx);
        }
    }

    pub(crate) fn increment_entry_count(&self) {
        self.entry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn entry_start_tick(&self, idx: usize) -> Option<u64> {
        let state = self.state.lock();
        state.entries.get(idx).map(|node| node.start_tick)
    }

    pub(crate) fn entry_message(&self, idx: usize) -> Option<Arc<dyn MessageSupplier>> {
        let state = self.state.lock();
        state.entries.get(idx).and_then(|node| node.message.clone())
    }

    // ---- completion ----

    /// Finalize after the root entry pop: freeze ticks and probes,
    /// propagate a root-entry error into the transaction error if none was
    /// set explicitly. After this the transaction is immutable.
    pub(crate) fn complete(&self, end_tick: u64, capture_time_millis: i64) {
        self.end_tick.store(end_tick, Ordering::Release);
        self.capture_tick.store(end_tick, Ordering::Release);
        self.capture_time_millis
            .store(capture_time_millis, Ordering::Release);
        let root_error = {
            let state = self.state.lock();
            state.entries[0].error.as_ref().map(|e| e.message.clone())
        };
        if let Some(root_error) = root_error {
            let mut error = self.error.write();
            if error.is_none() {
                *error = Some(root_error);
            }
        }
        if let Some(thread_info) = &self.thread_info {
            thread_info.complete();
        }
        if let Some(gc_info) = &self.gc_info {
            gc_info.complete();
        }
        self.completed.store(true, Ordering::Release);
    }

    // ---- snapshots ----

    /// Timer tree normalized to `capture_tick`.
    pub fn timer_snapshot(&self, capture_tick: u64) -> TimerSnapshot {
        let state = self.state.lock();
        state.timers.snapshot(0, capture_tick)
    }

    /// The entry tree with messages evaluated.
    pub fn entries_snapshot(&self) -> EntrySnapshot {
        let state = self.state.lock();
        entry::snapshot_tree(&state.entries, 0)
    }
}
