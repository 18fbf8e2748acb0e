//! tracelight — in-process transaction tracing engine.
//!
//! Records a tree of timed operations (trace entries) per transaction with
//! a parallel, finer-grained timer tree, produces immutable snapshots of
//! live or completed transactions, and folds completed transactions into
//! per-(type, name) aggregates with a latency histogram and merged timer
//! tree. Instrumentation talks to the engine exclusively through
//! [`PluginServices`]; storage, scheduling, and config parsing stay behind
//! the traits in [`collector`] and [`config`].

pub mod aggregate;
pub mod clock;
pub mod collector;
pub mod config;
pub mod facade;
pub mod message;
pub mod profile;
pub mod registry;
pub mod snapshot;
pub mod stack;
pub mod transaction;

// Re-export the embedding surface at the crate root.
pub use clock::{SystemWallClock, Ticker, WallClock};
pub use collector::{
    NopTransactionCollector, NopUserProfileScheduler, ScheduledTask, TransactionCollector,
    UserProfileScheduler,
};
pub use config::{
    AdvancedConfig, ConfigListener, ConfigService, GeneralConfig, InMemoryConfigService,
    PluginConfig, PropertyValue,
};
pub use facade::{PluginServices, Timer, TraceEntry, TracingRuntime};
pub use message::{message_supplier, ErrorMessage, Message, MessageSupplier};
pub use registry::TransactionRegistry;
pub use transaction::timer::{TimerName, TimerNameCache};
pub use transaction::Transaction;
