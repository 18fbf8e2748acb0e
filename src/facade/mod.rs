//! The instrumentation-facing facade.
//!
//! Operations here run inside hot application code paths: every argument
//! is validated, config is read from lock-free caches refreshed by change
//! callbacks, and nothing ever panics or propagates an error into the
//! instrumented code — bad input logs and returns a no-op handle.

mod handles;

pub use handles::{Timer, TraceEntry};

use crate::clock::{SystemWallClock, Ticker, WallClock};
use crate::collector::{
    NopTransactionCollector, NopUserProfileScheduler, TransactionCollector, UserProfileScheduler,
};
use crate::config::{ConfigListener, ConfigService, PluginConfig};
use crate::message::{ErrorMessage, MessageSupplier};
use crate::registry::TransactionRegistry;
use crate::stack;
use crate::transaction::probes::{
    GcActivityProbe, GcInfoComponent, SystemThreadStatsProbe, ThreadInfoComponent,
    ThreadStatsProbe,
};
use crate::transaction::timer::{TimerName, TimerNameCache};
use crate::transaction::Transaction;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Shared wiring for one engine instance; facades for any number of
/// plugins are created from the same runtime.
pub struct TracingRuntime {
    pub config_service: Arc<dyn ConfigService>,
    pub registry: Arc<TransactionRegistry>,
    pub collector: Arc<dyn TransactionCollector>,
    pub user_profile_scheduler: Arc<dyn UserProfileScheduler>,
    pub timer_names: Arc<TimerNameCache>,
    pub ticker: Ticker,
    pub wall_clock: Arc<dyn WallClock>,
    pub thread_stats_probe: Option<Arc<dyn ThreadStatsProbe>>,
    pub gc_probe: Option<Arc<dyn GcActivityProbe>>,
}

impl TracingRuntime {
    pub fn new(config_service: Arc<dyn ConfigService>) -> Self {
        Self {
            config_service,
            registry: Arc::new(TransactionRegistry::new()),
            collector: Arc::new(NopTransactionCollector),
            user_profile_scheduler: Arc::new(NopUserProfileScheduler),
            timer_names: Arc::new(TimerNameCache::new()),
            ticker: Ticker::system(),
            wall_clock: Arc::new(SystemWallClock),
            thread_stats_probe: Some(Arc::new(SystemThreadStatsProbe)),
            gc_probe: None,
        }
    }

    pub fn with_collector(mut self, collector: Arc<dyn TransactionCollector>) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_user_profile_scheduler(
        mut self,
        scheduler: Arc<dyn UserProfileScheduler>,
    ) -> Self {
        self.user_profile_scheduler = scheduler;
        self
    }

    pub fn with_registry(mut self, registry: Arc<TransactionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_ticker(mut self, ticker: Ticker) -> Self {
        self.ticker = ticker;
        self
    }

    pub fn with_wall_clock(mut self, wall_clock: Arc<dyn WallClock>) -> Self {
        self.wall_clock = wall_clock;
        self
    }

    pub fn with_thread_stats_probe(mut self, probe: Option<Arc<dyn ThreadStatsProbe>>) -> Self {
        self.thread_stats_probe = probe;
        self
    }

    pub fn with_gc_probe(mut self, probe: Option<Arc<dyn GcActivityProbe>>) -> Self {
        self.gc_probe = probe;
        self
    }
}

struct ServicesInner {
    config_service: Arc<dyn ConfigService>,
    registry: Arc<TransactionRegistry>,
    collector: Arc<dyn TransactionCollector>,
    user_profile_scheduler: Arc<dyn UserProfileScheduler>,
    timer_names: Arc<TimerNameCache>,
    ticker: Ticker,
    wall_clock: Arc<dyn WallClock>,
    thread_stats_probe: Option<Arc<dyn ThreadStatsProbe>>,
    gc_probe: Option<Arc<dyn GcActivityProbe>>,
    plugin_id: Option<String>,

    // cached config, refreshed by the change listener
    enabled: AtomicBool,
    capture_thread_info: AtomicBool,
    capture_gc_info: AtomicBool,
    max_trace_entries: AtomicUsize,
    plugin_config: ArcSwapOption<PluginConfig>,
}

/// The facade handed to instrumentation. Cheap to clone; clones share one
/// config cache and one registry.
#[derive(Clone)]
pub struct PluginServices {
    inner: Arc<ServicesInner>,
}

impl PluginServices {
    /// Build a facade bound to `plugin_id`, or unbound when `None`. An
    /// unknown plugin id downgrades to unbound: operations still work but
    /// plugin properties return empty/false/`None`.
    pub fn create(runtime: &TracingRuntime, plugin_id: Option<&str>) -> PluginServices {
        let plugin_id = match plugin_id {
            Some(id) if runtime.config_service.plugin_config(id).is_some() => Some(id.to_string()),
            Some(id) => {
                warn!(plugin_id = id, "unknown plugin id, running without plugin config");
                None
            }
            None => None,
        };
        let services = PluginServices {
            inner: Arc::new(ServicesInner {
                config_service: runtime.config_service.clone(),
                registry: runtime.registry.clone(),
                collector: runtime.collector.clone(),
                user_profile_scheduler: runtime.user_profile_scheduler.clone(),
                timer_names: runtime.timer_names.clone(),
                ticker: runtime.ticker.clone(),
                wall_clock: runtime.wall_clock.clone(),
                thread_stats_probe: runtime.thread_stats_probe.clone(),
                gc_probe: runtime.gc_probe.clone(),
                plugin_id,
                enabled: AtomicBool::new(false),
                capture_thread_info: AtomicBool::new(false),
                capture_gc_info: AtomicBool::new(false),
                max_trace_entries: AtomicUsize::new(0),
                plugin_config: ArcSwapOption::empty(),
            }),
        };
        services.refresh_config();
        let listener: Arc<dyn ConfigListener> = Arc::new(services.clone());
        runtime.config_service.add_config_listener(listener.clone());
        if let Some(plugin_id) = &services.inner.plugin_id {
            runtime
                .config_service
                .add_plugin_config_listener(plugin_id, listener);
        }
        services
    }

    fn refresh_config(&self) {
        let inner = &self.inner;
        let general = inner.config_service.general_config();
        let advanced = inner.config_service.advanced_config();
        let plugin = inner
            .plugin_id
            .as_deref()
            .and_then(|id| inner.config_service.plugin_config(id));
        let enabled = general.enabled && plugin.as_ref().map(|p| p.enabled).unwrap_or(true);
        inner.enabled.store(enabled, Ordering::Release);
        inner
            .capture_thread_info
            .store(advanced.capture_thread_info, Ordering::Release);
        inner
            .capture_gc_info
            .store(advanced.capture_gc_info, Ordering::Release);
        inner
            .max_trace_entries
            .store(advanced.max_trace_entries_per_transaction, Ordering::Release);
        inner.plugin_config.store(plugin);
    }

    // ---- config reads ----

    /// Cached enablement; cheap enough for hot paths.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn get_string_property(&self, name: &str) -> String {
        if name.is_empty() {
            error!("get_string_property(): argument 'name' must be non-empty");
            return String::new();
        }
        self.inner
            .plugin_config
            .load_full()
            .map(|plugin| plugin.string_property(name))
            .unwrap_or_default()
    }

    pub fn get_boolean_property(&self, name: &str) -> bool {
        if name.is_empty() {
            error!("get_boolean_property(): argument 'name' must be non-empty");
            return false;
        }
        self.inner
            .plugin_config
            .load_full()
            .map(|plugin| plugin.boolean_property(name))
            .unwrap_or(false)
    }

    pub fn get_double_property(&self, name: &str) -> Option<f64> {
        if name.is_empty() {
            error!("get_double_property(): argument 'name' must be non-empty");
            return None;
        }
        self.inner
            .plugin_config
            .load_full()
            .and_then(|plugin| plugin.double_property(name))
    }

    /// Route plugin-config changes to `listener`; no-op when no plugin is
    /// bound.
    pub fn register_config_listener(&self, listener: Arc<dyn ConfigListener>) {
        if let Some(plugin_id) = &self.inner.plugin_id {
            self.inner
                .config_service
                .add_plugin_config_listener(plugin_id, listener);
        }
    }

    pub fn get_timer_name(&self, advice_key: &'static str) -> TimerName {
        if advice_key.is_empty() {
            error!("get_timer_name(): argument 'advice_key' must be non-empty");
        }
        self.inner.timer_names.timer_name(advice_key)
    }

    // ---- transaction lifecycle ----

    /// Start a transaction rooted on this thread, or, when already inside
    /// one, behave as [`start_trace_entry`](Self::start_trace_entry) —
    /// transactions do not nest.
    pub fn start_transaction(
        &self,
        transaction_type: &str,
        transaction_name: &str,
        message: Arc<dyn MessageSupplier>,
        timer_name: TimerName,
    ) -> TraceEntry {
        if transaction_type.is_empty() {
            error!("start_transaction(): argument 'transaction_type' must be non-empty");
            return TraceEntry::no_op();
        }
        if transaction_name.is_empty() {
            error!("start_transaction(): argument 'transaction_name' must be non-empty");
            return TraceEntry::no_op();
        }
        if !self.is_enabled() {
            return TraceEntry::no_op();
        }
        let inner = &self.inner;
        if inner.registry.current_transaction().is_some() {
            return self.start_trace_entry(message, timer_name);
        }
        let start_tick = inner.ticker.read_nanos();
        let thread_info = if inner.capture_thread_info.load(Ordering::Acquire) {
            inner
                .thread_stats_probe
                .as_deref()
                .and_then(ThreadInfoComponent::bind)
        } else {
            None
        };
        let gc_info = if inner.capture_gc_info.load(Ordering::Acquire) {
            inner.gc_probe.clone().map(GcInfoComponent::start)
        } else {
            None
        };
        let transaction = Transaction::new(
            transaction_type.to_string(),
            transaction_name.to_string(),
            message,
            timer_name,
            inner.wall_clock.current_time_millis(),
            start_tick,
            thread_info,
            gc_info,
        );
        inner.registry.add(transaction.clone());
        TraceEntry::live(self.clone(), transaction, 0)
    }

    /// Start a nested entry with its own timer. Past the per-transaction
    /// cap this degrades to a dummy handle that only times the operation.
    pub fn start_trace_entry(
        &self,
        message: Arc<dyn MessageSupplier>,
        timer_name: TimerName,
    ) -> TraceEntry {
        let inner = &self.inner;
        let Some(transaction) = inner.registry.current_transaction() else {
            return TraceEntry::no_op();
        };
        let start_tick = inner.ticker.read_nanos();
        let max_entries = inner.max_trace_entries.load(Ordering::Acquire) as u64;
        if transaction.entry_count() < max_entries {
            let timer = transaction.start_nested_timer(timer_name, start_tick);
            let entry = transaction.push_entry(start_tick, message, timer);
            TraceEntry::live(self.clone(), transaction, entry)
        } else {
            transaction.increment_entry_count();
            transaction.add_limit_exceeded_marker(start_tick);
            let timer = transaction.start_nested_timer(timer_name, start_tick);
            TraceEntry::dummy(self.clone(), transaction, timer, start_tick, message)
        }
    }

    /// Start a nested timer without an entry.
    pub fn start_timer(&self, timer_name: TimerName) -> Timer {
        let inner = &self.inner;
        let Some(transaction) = inner.registry.current_transaction() else {
            return Timer::no_op();
        };
        let tick = inner.ticker.read_nanos();
        match transaction.start_nested_timer(timer_name, tick) {
            Some(timer) => Timer::live(inner.ticker.clone(), transaction, timer),
            None => Timer::no_op(),
        }
    }

    /// Append a zero-duration error entry to the current transaction. When
    /// the error carries no source error, a stack trace is captured in its
    /// place (engine frames stripped).
    pub fn add_trace_entry(&self, error: ErrorMessage) {
        if error.message.is_empty() {
            error!("add_trace_entry(): error message must be non-empty");
            return;
        }
        let inner = &self.inner;
        let Some(transaction) = inner.registry.current_transaction() else {
            return;
        };
        let max_entries = inner.max_trace_entries.load(Ordering::Acquire) as u64;
        if transaction.entry_count() >= 2 * max_entries {
            return;
        }
        let tick = inner.ticker.read_nanos();
        let stack_trace = if error.has_exception() {
            None
        } else {
            Some(stack::capture_stripped())
        };
        transaction.add_entry(tick, tick, None, Some(error), stack_trace);
    }

    // ---- current-transaction mutation ----

    pub fn set_transaction_type(&self, transaction_type: &str) {
        if transaction_type.is_empty() {
            error!("set_transaction_type(): argument must be non-empty");
            return;
        }
        if let Some(transaction) = self.inner.registry.current_transaction() {
            transaction.set_transaction_type(transaction_type);
        }
    }

    pub fn set_transaction_name(&self, transaction_name: &str) {
        if transaction_name.is_empty() {
            error!("set_transaction_name(): argument must be non-empty");
            return;
        }
        if let Some(transaction) = self.inner.registry.current_transaction() {
            transaction.set_transaction_name(transaction_name);
        }
    }

    pub fn set_transaction_error(&self, error_text: &str) {
        if error_text.is_empty() {
            error!("set_transaction_error(): argument must be non-empty");
            return;
        }
        if let Some(transaction) = self.inner.registry.current_transaction() {
            transaction.set_error(error_text);
        }
    }

    /// Assign the transaction user; the first assignment may kick off user
    /// profiling.
    pub fn set_transaction_user(&self, user: &str) {
        if user.is_empty() {
            error!("set_transaction_user(): argument must be non-empty");
            return;
        }
        if let Some(transaction) = self.inner.registry.current_transaction() {
            let first_assignment = transaction.set_user(user);
            if first_assignment {
                self.inner
                    .user_profile_scheduler
                    .maybe_schedule_user_profiling(&transaction, user);
            }
        }
    }

    pub fn set_transaction_attribute(&self, name: &str, value: &str) {
        if name.is_empty() {
            error!("set_transaction_attribute(): argument 'name' must be non-empty");
            return;
        }
        if let Some(transaction) = self.inner.registry.current_transaction() {
            transaction.add_attribute(name, value);
        }
    }

    /// Per-transaction override of the trace-store threshold, saturating
    /// to whole milliseconds.
    pub fn set_trace_store_threshold(&self, threshold: Duration) {
        if let Some(transaction) = self.inner.registry.current_transaction() {
            let millis = threshold.as_millis().min(i64::MAX as u128) as i64;
            transaction.set_store_threshold_override_millis(millis);
        }
    }

    pub fn is_in_transaction(&self) -> bool {
        self.inner.registry.current_transaction().is_some()
    }

    // ---- end operations (invoked by handles) ----

    pub(crate) fn end_entry(
        &self,
        transaction: &Arc<Transaction>,
        entry: usize,
        error: Option<ErrorMessage>,
        stack_trace: Option<Vec<crate::stack::StackFrame>>,
    ) {
        let end_tick = self.inner.ticker.read_nanos();
        let is_root = transaction.pop_entry(entry, end_tick, error, stack_trace);
        if is_root {
            self.complete_transaction(transaction, end_tick);
        }
    }

    pub(crate) fn end_entry_with_stack_trace(
        &self,
        transaction: &Arc<Transaction>,
        entry: usize,
        threshold: Duration,
    ) {
        let end_tick = self.inner.ticker.read_nanos();
        let start_tick = transaction.entry_start_tick(entry).unwrap_or(end_tick);
        let stack_trace = if end_tick.saturating_sub(start_tick) >= threshold.as_nanos() as u64 {
            Some(stack::capture_stripped())
        } else {
            None
        };
        let is_root = transaction.pop_entry(entry, end_tick, None, stack_trace);
        if is_root {
            self.complete_transaction(transaction, end_tick);
        }
    }

    pub(crate) fn end_dummy(&self, transaction: &Arc<Transaction>, timer: Option<usize>) {
        let end_tick = self.inner.ticker.read_nanos();
        if let Some(timer) = timer {
            transaction.stop_timer(timer, end_tick);
        }
    }

    pub(crate) fn end_dummy_with_stack_trace(
        &self,
        transaction: &Arc<Transaction>,
        timer: Option<usize>,
        start_tick: u64,
        message: Arc<dyn MessageSupplier>,
        threshold: Duration,
    ) {
        let end_tick = self.inner.ticker.read_nanos();
        if let Some(timer) = timer {
            transaction.stop_timer(timer, end_tick);
        }
        let max_entries = self.inner.max_trace_entries.load(Ordering::Acquire) as u64;
        if end_tick.saturating_sub(start_tick) >= threshold.as_nanos() as u64
            && transaction.entry_count() < 2 * max_entries
        {
            let stack_trace = stack::capture_stripped();
            transaction.add_entry(start_tick, end_tick, Some(message), None, Some(stack_trace));
        }
    }

    pub(crate) fn end_dummy_with_error(
        &self,
        transaction: &Arc<Transaction>,
        timer: Option<usize>,
        start_tick: u64,
        message: Arc<dyn MessageSupplier>,
        error: ErrorMessage,
    ) {
        let end_tick = self.inner.ticker.read_nanos();
        if let Some(timer) = timer {
            transaction.stop_timer(timer, end_tick);
        }
        let max_entries = self.inner.max_trace_entries.load(Ordering::Acquire) as u64;
        if transaction.entry_count() < 2 * max_entries {
            transaction.add_entry(start_tick, end_tick, Some(message), Some(error), None);
        }
    }

    /// Completion cascade on the root entry pop. The collector is handed
    /// the transaction before it leaves the registry so a consumer
    /// enumerating the registry plus the collector's pending set never
    /// misses a completed trace.
    fn complete_transaction(&self, transaction: &Arc<Transaction>, end_tick: u64) {
        let inner = &self.inner;
        transaction.complete(end_tick, inner.wall_clock.current_time_millis());
        transaction.cancel_scheduled_tasks();
        inner.collector.on_completed_transaction(transaction);
        inner.registry.remove(transaction);
    }
}

impl ConfigListener for PluginServices {
    fn on_change(&self) {
        self.refresh_config();
    }
}
