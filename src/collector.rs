//! Downstream collaborator interfaces: completed-transaction collection,
//! user profiling, and cancellable scheduled work.
//!
//! The engine only depends on these traits; storage, the scheduled
//! executor, and the sampling machinery live outside.

use crate::transaction::Transaction;
use std::sync::Arc;

/// Handle to background work installed on a transaction. Cancellation is
/// advisory: an already-running callback completes.
pub trait ScheduledTask: Send + Sync {
    fn cancel(&self);
}

/// Receives every completed transaction exactly once, before the
/// transaction leaves the live registry.
pub trait TransactionCollector: Send + Sync {
    fn on_completed_transaction(&self, transaction: &Arc<Transaction>);

    /// Completed transactions accepted but not yet durably stored. Bridges
    /// the window for consumers enumerating the live registry, which would
    /// otherwise miss a completed-but-unstored trace.
    fn pending_complete_transactions(&self) -> Vec<Arc<Transaction>> {
        Vec::new()
    }
}

/// May install a periodic stack-sampling task on a transaction once a user
/// is assigned. Idempotent per transaction.
pub trait UserProfileScheduler: Send + Sync {
    fn maybe_schedule_user_profiling(&self, transaction: &Arc<Transaction>, user: &str);
}

/// Collector that drops everything; for wiring the engine without a
/// storage tier.
#[derive(Debug, Default)]
pub struct NopTransactionCollector;

impl TransactionCollector for NopTransactionCollector {
    fn on_completed_transaction(&self, _transaction: &Arc<Transaction>) {}
}

#[derive(Debug, Default)]
pub struct NopUserProfileScheduler;

impl UserProfileScheduler for NopUserProfileScheduler {
    fn maybe_schedule_user_profiling(&self, _transaction: &Arc<Transaction>, _user: &str) {}
}
