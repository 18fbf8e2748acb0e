//! End-to-end scenarios against the full engine wiring: mock time,
//! recording collector, in-memory config.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracelight::aggregate::histogram::LazyHistogram;
use tracelight::aggregate::{AggregateBuilder, AggregateTimer};
use tracelight::{
    message_supplier, snapshot, AdvancedConfig, ErrorMessage, GeneralConfig, InMemoryConfigService,
    PluginConfig, PluginServices, PropertyValue, ScheduledTask, Ticker, TracingRuntime,
    Transaction, TransactionCollector, TransactionRegistry, UserProfileScheduler, WallClock,
};

struct RecordingCollector {
    registry: Arc<TransactionRegistry>,
    /// Completed transactions plus whether each was still in the live
    /// registry at callback time.
    completed: Mutex<Vec<(Arc<Transaction>, bool)>>,
}

impl TransactionCollector for RecordingCollector {
    fn on_completed_transaction(&self, transaction: &Arc<Transaction>) {
        let still_registered = self
            .registry
            .transactions()
            .iter()
            .any(|t| t.id() == transaction.id());
        self.completed
            .lock()
            .push((transaction.clone(), still_registered));
    }
}

struct FixedWallClock(AtomicI64);

impl WallClock for FixedWallClock {
    fn current_time_millis(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

struct Harness {
    services: PluginServices,
    config: Arc<InMemoryConfigService>,
    collector: Arc<RecordingCollector>,
    registry: Arc<TransactionRegistry>,
    mock: Arc<quanta::Mock>,
}

impl Harness {
    fn completed(&self) -> Vec<(Arc<Transaction>, bool)> {
        self.collector.completed.lock().clone()
    }

    fn advance(&self, duration: Duration) {
        self.mock.increment(duration);
    }
}

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn harness(max_entries: usize) -> Harness {
    init_logs();
    let config = Arc::new(InMemoryConfigService::new());
    config.update_advanced_config(AdvancedConfig {
        max_trace_entries_per_transaction: max_entries,
        capture_thread_info: false,
        capture_gc_info: false,
    });
    let registry = Arc::new(TransactionRegistry::new());
    let collector = Arc::new(RecordingCollector {
        registry: registry.clone(),
        completed: Mutex::new(Vec::new()),
    });
    let (ticker, mock) = Ticker::mock();
    let runtime = TracingRuntime::new(config.clone())
        .with_registry(registry.clone())
        .with_collector(collector.clone())
        .with_ticker(ticker)
        .with_wall_clock(Arc::new(FixedWallClock(AtomicI64::new(1_700_000_000_000))))
        .with_thread_stats_probe(None);
    let services = PluginServices::create(&runtime, None);
    Harness {
        services,
        config,
        collector,
        registry,
        mock,
    }
}

#[test]
fn test_single_entry_under_cap() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    assert!(!root.is_no_op());
    assert_eq!(h.registry.len(), 1);
    assert!(h.services.is_in_transaction());
    h.advance(Duration::from_micros(500));
    root.end();

    let completed = h.completed();
    assert_eq!(completed.len(), 1);
    let (tx, still_registered) = &completed[0];
    // collector runs before the transaction leaves the registry
    assert!(still_registered);
    assert!(tx.is_completed());
    assert_eq!(tx.entry_count(), 1);
    assert_eq!(tx.duration_nanos(), Some(500_000));
    let timers = tx.timer_snapshot(tx.end_tick().unwrap());
    assert_eq!(timers.name, "http request");
    assert_eq!(timers.total_nanos, 500_000);
    assert_eq!(timers.count, 1);
    assert!(h.registry.is_empty());
    assert!(!h.services.is_in_transaction());
}

#[test]
fn test_nested_entries_and_timers() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "GET /orders",
        message_supplier("GET /orders"),
        h.services.get_timer_name("http request"),
    );
    h.advance(Duration::from_micros(100));
    let child = h.services.start_trace_entry(
        message_supplier("select * from orders"),
        h.services.get_timer_name("jdbc query"),
    );
    h.advance(Duration::from_micros(50));
    let timer = h.services.start_timer(h.services.get_timer_name("row mapping"));
    h.advance(Duration::from_micros(25));
    timer.stop();
    h.advance(Duration::from_micros(25));
    child.end();
    h.advance(Duration::from_micros(100));
    root.end();

    let completed = h.completed();
    let (tx, _) = &completed[0];
    assert_eq!(tx.entry_count(), 2);
    let entries = snapshot::capture_entries(tx);
    assert_eq!(entries.children.len(), 1);
    assert!(entries.children[0].children.is_empty());
    assert_eq!(entries.children[0].duration_nanos, Some(100_000));

    let timers = tx.timer_snapshot(tx.end_tick().unwrap());
    assert_eq!(timers.total_nanos, 300_000);
    assert_eq!(timers.count, 1);
    assert_eq!(timers.children.len(), 1);
    let jdbc = &timers.children[0];
    assert_eq!(jdbc.name, "jdbc query");
    assert_eq!(jdbc.total_nanos, 100_000);
    assert_eq!(jdbc.count, 1);
    assert_eq!(jdbc.children.len(), 1);
    let mapping = &jdbc.children[0];
    assert_eq!(mapping.name, "row mapping");
    assert_eq!(mapping.total_nanos, 25_000);
    assert_eq!(mapping.count, 1);
}

#[test]
fn test_entry_cap_exceeded_degrades_to_dummies() {
    let h = harness(2);
    let root = h.services.start_transaction(
        "Web",
        "GET /search",
        message_supplier("GET /search"),
        h.services.get_timer_name("http request"),
    );
    for _ in 0..5 {
        let entry = h.services.start_trace_entry(
            message_supplier("select 1"),
            h.services.get_timer_name("jdbc query"),
        );
        h.advance(Duration::from_micros(10));
        entry.end();
    }
    root.end();

    let completed = h.completed();
    let (tx, _) = &completed[0];
    assert_eq!(tx.entry_count(), 6);
    let entries = snapshot::capture_entries(tx);
    let markers = entries
        .children
        .iter()
        .filter(|child| child.limit_exceeded_marker)
        .count();
    let stored = entries
        .children
        .iter()
        .filter(|child| !child.limit_exceeded_marker)
        .count();
    assert_eq!(markers, 1);
    // root + first child stay under the cap of 2
    assert_eq!(stored, 1);
    // dummy handles still stopped their timers
    let timers = tx.timer_snapshot(tx.end_tick().unwrap());
    assert_eq!(timers.children[0].count, 5);
    assert_eq!(timers.children[0].total_nanos, 50_000);
}

#[test]
fn test_error_entry_without_exception_captures_stack() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "POST /orders",
        message_supplier("POST /orders"),
        h.services.get_timer_name("http request"),
    );
    h.services
        .add_trace_entry(ErrorMessage::text("inventory check failed"));

    let tx = h.registry.transactions().pop().unwrap();
    let entries = snapshot::capture_entries(&tx);
    let error_entry = &entries.children[0];
    assert_eq!(
        error_entry.error.as_ref().map(|e| e.message.as_str()),
        Some("inventory check failed")
    );
    assert_eq!(error_entry.duration_nanos, Some(0));
    let stack = error_entry.stack_trace.as_ref().expect("stack captured");
    assert!(!stack.is_empty());
    // top frame is the caller of the facade, not the engine
    assert!(!stack[0].function.starts_with("tracelight::"));
    root.end();
}

#[test]
fn test_error_entry_with_exception_skips_stack() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "POST /orders",
        message_supplier("POST /orders"),
        h.services.get_timer_name("http request"),
    );
    let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
    h.services.add_trace_entry(ErrorMessage::from_error(&source));

    let tx = h.registry.transactions().pop().unwrap();
    let entries = snapshot::capture_entries(&tx);
    assert!(entries.children[0].stack_trace.is_none());
    root.end();
}

#[test]
fn test_error_entries_capped_at_twice_max() {
    let h = harness(2);
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    for i in 0..10 {
        h.services
            .add_trace_entry(ErrorMessage::text(format!("error {i}")));
    }
    // cap 2, doubled = 4; root consumed 1, so 3 error entries fit
    let tx = h.registry.transactions().pop().unwrap();
    assert_eq!(tx.entry_count(), 4);
    root.end();
}

#[test]
fn test_transactions_do_not_nest() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    let inner = h.services.start_transaction(
        "Web",
        "GET /inner",
        message_supplier("GET /inner"),
        h.services.get_timer_name("http request"),
    );
    assert_eq!(h.registry.len(), 1);
    inner.end();
    root.end();

    let completed = h.completed();
    assert_eq!(completed.len(), 1);
    let (tx, _) = &completed[0];
    // the inner call degraded to a nested entry
    assert_eq!(tx.transaction_name(), "GET /");
    assert_eq!(tx.entry_count(), 2);
    assert!(h.registry.is_empty());
}

#[test]
fn test_aggregate_fold() {
    let h = harness(100);
    let durations = [100u64, 200, 500];
    for (i, duration) in durations.iter().enumerate() {
        let root = h.services.start_transaction(
            "Web",
            "GET /",
            message_supplier("GET /"),
            h.services.get_timer_name("http request"),
        );
        if i == 0 {
            h.services.set_transaction_error("upstream timeout");
        }
        h.advance(Duration::from_micros(*duration));
        root.end();
    }

    let mut builder = AggregateBuilder::new();
    for (i, (tx, _)) in h.completed().iter().enumerate() {
        builder.add(tx, i < 2);
        builder.add_timers(&tx.timer_snapshot(tx.end_tick().unwrap()));
    }
    let aggregate = builder.build(1_700_000_060_000);
    assert_eq!(aggregate.transaction_count, 3);
    assert_eq!(aggregate.total_micros, 800);
    assert_eq!(aggregate.error_count, 1);
    assert_eq!(aggregate.trace_count, 2);

    let histogram = LazyHistogram::decode(&aggregate.histogram).unwrap();
    assert_eq!(histogram.count(), 3);
    assert_eq!(histogram.value_at_percentile(100.0), 500);

    let root: AggregateTimer = serde_json::from_str(&aggregate.timers_json).unwrap();
    assert_eq!(root.count, 3);
    assert_eq!(root.total_micros, 800);
}

#[test]
fn test_aggregate_merge_with_empty_is_identity() {
    let h = harness(100);
    for _ in 0..3 {
        let root = h.services.start_transaction(
            "Web",
            "GET /",
            message_supplier("GET /"),
            h.services.get_timer_name("http request"),
        );
        h.advance(Duration::from_micros(150));
        root.end();
    }
    let mut builder = AggregateBuilder::new();
    for (tx, _) in h.completed().iter() {
        builder.add(tx, false);
        builder.add_timers(&tx.timer_snapshot(tx.end_tick().unwrap()));
    }
    let before = builder.build(7);
    builder.merge(&AggregateBuilder::new());
    assert_eq!(builder.build(7), before);
}

#[test]
fn test_disabled_engine_returns_no_op() {
    let h = harness(100);
    h.config.update_general_config(GeneralConfig {
        enabled: false,
        ..Default::default()
    });
    assert!(!h.services.is_enabled());
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    assert!(root.is_no_op());
    assert!(h.registry.is_empty());
    root.end();
    assert!(h.completed().is_empty());
}

#[test]
fn test_invalid_arguments_return_no_op_without_mutation() {
    let h = harness(100);
    let bad = h.services.start_transaction(
        "",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    assert!(bad.is_no_op());
    assert!(h.registry.is_empty());

    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    h.services.set_transaction_name("");
    h.services.set_transaction_user("");
    h.services.set_transaction_attribute("", "value");
    let tx = h.registry.transactions().pop().unwrap();
    assert_eq!(tx.transaction_name(), "GET /");
    assert_eq!(tx.user(), None);
    assert!(tx.attributes().is_empty());
    root.end();
}

#[test]
fn test_out_of_order_end_is_fixed_up() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    let outer = h.services.start_trace_entry(
        message_supplier("outer"),
        h.services.get_timer_name("outer work"),
    );
    let inner = h.services.start_trace_entry(
        message_supplier("inner"),
        h.services.get_timer_name("inner work"),
    );
    h.advance(Duration::from_micros(10));
    // wrong order: the engine closes the inner entry at the same tick
    outer.end();
    inner.end();
    root.end();

    let completed = h.completed();
    assert_eq!(completed.len(), 1);
    let entries = snapshot::capture_entries(&completed[0].0);
    let outer_snapshot = &entries.children[0];
    let inner_snapshot = &outer_snapshot.children[0];
    assert_eq!(outer_snapshot.end_tick, inner_snapshot.end_tick);
    assert!(h.registry.is_empty());
}

#[test]
fn test_slow_entry_gets_stack_trace() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    let fast = h.services.start_trace_entry(
        message_supplier("fast"),
        h.services.get_timer_name("cache lookup"),
    );
    h.advance(Duration::from_millis(1));
    fast.end_with_stack_trace(Duration::from_millis(5));
    let slow = h.services.start_trace_entry(
        message_supplier("slow"),
        h.services.get_timer_name("jdbc query"),
    );
    h.advance(Duration::from_millis(20));
    slow.end_with_stack_trace(Duration::from_millis(5));
    root.end();

    let entries = snapshot::capture_entries(&h.completed()[0].0);
    assert!(entries.children[0].stack_trace.is_none());
    let stack = entries.children[1].stack_trace.as_ref().expect("slow entry stack");
    assert!(!stack[0].function.starts_with("tracelight::"));
}

#[test]
fn test_dummy_end_with_stack_trace_appends_flat_entry() {
    let h = harness(2);
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    let first = h.services.start_trace_entry(
        message_supplier("first"),
        h.services.get_timer_name("jdbc query"),
    );
    first.end();
    let dummy = h.services.start_trace_entry(
        message_supplier("over-cap but slow"),
        h.services.get_timer_name("jdbc query"),
    );
    h.advance(Duration::from_millis(20));
    dummy.end_with_stack_trace(Duration::from_millis(5));
    root.end();

    let completed = h.completed();
    let (tx, _) = &completed[0];
    let entries = snapshot::capture_entries(tx);
    let flat = entries
        .children
        .iter()
        .find(|child| {
            child
                .message
                .as_ref()
                .is_some_and(|m| m.text == "over-cap but slow")
        })
        .expect("flat entry appended");
    assert!(flat.stack_trace.is_some());
    assert_eq!(flat.duration_nanos, Some(20_000_000));
}

#[test]
fn test_dummy_end_with_error_appends_flat_error_entry() {
    let h = harness(2);
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    let first = h.services.start_trace_entry(
        message_supplier("first"),
        h.services.get_timer_name("jdbc query"),
    );
    first.end();
    let dummy = h.services.start_trace_entry(
        message_supplier("failing"),
        h.services.get_timer_name("jdbc query"),
    );
    dummy.end_with_error(ErrorMessage::text("deadlock"));
    root.end();

    let entries = snapshot::capture_entries(&h.completed()[0].0);
    let flat = entries
        .children
        .iter()
        .find(|child| child.error.is_some())
        .expect("flat error entry appended");
    assert_eq!(flat.error.as_ref().unwrap().message, "deadlock");
}

#[test]
fn test_partial_snapshot_of_live_transaction() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Background",
        "nightly report",
        message_supplier("nightly report"),
        h.services.get_timer_name("report job"),
    );
    h.advance(Duration::from_millis(1));
    let tx = h.registry.transactions().pop().unwrap();
    let capture_tick = tx.start_tick() + 1_000_000;
    let partial = snapshot::capture_partial(&tx, capture_tick, 1_700_000_000_001);
    assert!(partial.active);
    assert!(partial.partial);
    assert_eq!(partial.duration_nanos, 1_000_000);
    assert!(partial.timers.active);
    let active = snapshot::capture_active(&tx, capture_tick, 1_700_000_000_001);
    assert!(active.active);
    assert!(!active.partial);
    root.end();
}

struct RecordingScheduler {
    scheduled_users: Mutex<Vec<String>>,
    cancellations: Arc<AtomicUsize>,
}

struct CountingTask(Arc<AtomicUsize>);

impl ScheduledTask for CountingTask {
    fn cancel(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

impl UserProfileScheduler for RecordingScheduler {
    fn maybe_schedule_user_profiling(&self, transaction: &Arc<Transaction>, user: &str) {
        self.scheduled_users.lock().push(user.to_string());
        transaction.set_user_profile_task(Arc::new(CountingTask(self.cancellations.clone())));
    }
}

#[test]
fn test_user_profiling_scheduled_once_and_cancelled_on_completion() {
    init_logs();
    let config = Arc::new(InMemoryConfigService::new());
    let registry = Arc::new(TransactionRegistry::new());
    let cancellations = Arc::new(AtomicUsize::new(0));
    let scheduler = Arc::new(RecordingScheduler {
        scheduled_users: Mutex::new(Vec::new()),
        cancellations: cancellations.clone(),
    });
    let (ticker, _mock) = Ticker::mock();
    let runtime = TracingRuntime::new(config)
        .with_registry(registry.clone())
        .with_user_profile_scheduler(scheduler.clone())
        .with_ticker(ticker)
        .with_thread_stats_probe(None);
    let services = PluginServices::create(&runtime, None);

    let root = services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        services.get_timer_name("http request"),
    );
    services.set_transaction_user("alice");
    services.set_transaction_user("bob");
    assert_eq!(*scheduler.scheduled_users.lock(), vec!["alice".to_string()]);
    root.end();
    // completion cascade cancelled the installed task
    assert_eq!(cancellations.load(Ordering::Relaxed), 1);
    assert!(registry.is_empty());
}

#[test]
fn test_profile_samples_feed_snapshot_and_aggregate() {
    use tracelight::stack::StackFrame;
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    let frame = |name: &str| StackFrame {
        function: name.to_string(),
        file: None,
        line: None,
    };
    let tx = h.registry.transactions().pop().unwrap();
    tx.add_profile_sample(&[frame("handler"), frame("main")]);
    tx.add_profile_sample(&[frame("handler"), frame("main")]);
    root.end();

    let completed = h.completed();
    let (tx, _) = &completed[0];
    assert_eq!(tx.profile_sample_count(), 2);
    let snapshot = snapshot::capture_completed(tx);
    assert_eq!(snapshot.profile_sample_count, 2);

    let mut builder = AggregateBuilder::new();
    builder.add(tx, false);
    builder.add_profile(&tx.profile_snapshot().unwrap());
    let aggregate = builder.build(0);
    assert_eq!(aggregate.profile_sample_count, 2);
    assert!(aggregate.profile_json.is_some());
}

#[test]
fn test_plugin_bound_facade() {
    init_logs();
    let config = Arc::new(InMemoryConfigService::with_plugins([PluginConfig::new(
        "jdbc",
    )
    .with_property("prefix", PropertyValue::String("db:".to_string()))
    .with_property("capture_binds", PropertyValue::Bool(true))
    .with_property("slow_millis", PropertyValue::Double(100.0))]));
    let (ticker, _mock) = Ticker::mock();
    let runtime = TracingRuntime::new(config.clone())
        .with_ticker(ticker)
        .with_thread_stats_probe(None);
    let services = PluginServices::create(&runtime, Some("jdbc"));
    assert!(services.is_enabled());
    assert_eq!(services.get_string_property("prefix"), "db:");
    assert!(services.get_boolean_property("capture_binds"));
    assert_eq!(services.get_double_property("slow_millis"), Some(100.0));
    assert_eq!(services.get_string_property("missing"), "");

    // disabling the plugin disables the facade
    let mut disabled = PluginConfig::new("jdbc");
    disabled.enabled = false;
    config.update_plugin_config(disabled);
    assert!(!services.is_enabled());

    // unknown plugin id downgrades to unbound
    let unbound = PluginServices::create(&runtime, Some("no-such-plugin"));
    assert!(unbound.is_enabled());
    assert_eq!(unbound.get_string_property("prefix"), "");
    assert!(!unbound.get_boolean_property("capture_binds"));
    assert_eq!(unbound.get_double_property("slow_millis"), None);
}

#[test]
fn test_store_threshold_override() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "GET /",
        message_supplier("GET /"),
        h.services.get_timer_name("http request"),
    );
    h.services
        .set_trace_store_threshold(Duration::from_millis(250));
    root.end();
    let completed = h.completed();
    let (tx, _) = &completed[0];
    assert_eq!(tx.store_threshold_override_millis(), Some(250));
}

#[test]
fn test_completed_snapshot_round_trips_through_json() {
    let h = harness(100);
    let root = h.services.start_transaction(
        "Web",
        "GET /users",
        message_supplier("GET /users"),
        h.services.get_timer_name("http request"),
    );
    h.services.set_transaction_user("alice");
    h.services.set_transaction_attribute("region", "eu");
    h.advance(Duration::from_micros(750));
    root.end();

    let completed = h.completed();
    let (tx, _) = &completed[0];
    let snapshot = snapshot::capture_completed(tx);
    let json = serde_json::to_string(&snapshot).unwrap();
    let back: snapshot::TraceSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(back, snapshot);
    assert_eq!(back.duration_nanos, 750_000);
    assert_eq!(back.user.as_deref(), Some("alice"));
}
