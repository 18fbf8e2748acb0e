//! Operation handles returned by the facade's start operations.
//!
//! Both handle types come in three flavors behind one surface: live
//! (recording entry + timer), dummy (cap exceeded: timer only, entry
//! possibly appended at end), and no-op (disabled or invalid call). End
//! operations consume the handle, so a handle can only be ended once.

use crate::clock::Ticker;
use crate::facade::PluginServices;
use crate::message::{ErrorMessage, MessageSupplier};
use crate::transaction::Transaction;
use std::sync::Arc;
use std::time::Duration;

/// Handle for one started trace entry (or the transaction root entry).
pub struct TraceEntry {
    inner: EntryInner,
}

pub(crate) enum EntryInner {
    Live {
        services: PluginServices,
        transaction: Arc<Transaction>,
        entry: usize,
    },
    /// Cap exceeded: only the timer runs. A flat entry may still be
    /// appended on end when warranted and still under the extended cap.
    Dummy {
        services: PluginServices,
        transaction: Arc<Transaction>,
        timer: Option<usize>,
        start_tick: u64,
        message: Arc<dyn MessageSupplier>,
    },
    NoOp,
}

impl TraceEntry {
    pub(crate) fn live(services: PluginServices, transaction: Arc<Transaction>, entry: usize) -> Self {
        Self {
            inner: EntryInner::Live {
                services,
                transaction,
                entry,
            },
        }
    }

    pub(crate) fn dummy(
        services: PluginServices,
        transaction: Arc<Transaction>,
        timer: Option<usize>,
        start_tick: u64,
        message: Arc<dyn MessageSupplier>,
    ) -> Self {
        Self {
            inner: EntryInner::Dummy {
                services,
                transaction,
                timer,
                start_tick,
                message,
            },
        }
    }

    pub(crate) fn no_op() -> Self {
        Self {
            inner: EntryInner::NoOp,
        }
    }

    /// Whether this handle records anything at all.
    pub fn is_no_op(&self) -> bool {
        matches!(self.inner, EntryInner::NoOp)
    }

    pub fn message_supplier(&self) -> Option<Arc<dyn MessageSupplier>> {
        match &self.inner {
            EntryInner::Live {
                transaction, entry, ..
            } => transaction.entry_message(*entry),
            EntryInner::Dummy { message, .. } => Some(message.clone()),
            EntryInner::NoOp => None,
        }
    }

    /// End at the current tick with no error.
    pub fn end(self) {
        match self.inner {
            EntryInner::Live {
                services,
                transaction,
                entry,
            } => services.end_entry(&transaction, entry, None, None),
            EntryInner::Dummy {
                services,
                transaction,
                timer,
                ..
            } => services.end_dummy(&transaction, timer),
            EntryInner::NoOp => {}
        }
    }

    /// End at the current tick; when the entry ran at least `threshold`,
    /// attach a stack trace (engine frames stripped).
    pub fn end_with_stack_trace(self, threshold: Duration) {
        match self.inner {
            EntryInner::Live {
                services,
                transaction,
                entry,
            } => services.end_entry_with_stack_trace(&transaction, entry, threshold),
            EntryInner::Dummy {
                services,
                transaction,
                timer,
                start_tick,
                message,
            } => services.end_dummy_with_stack_trace(
                &transaction,
                timer,
                start_tick,
                message,
                threshold,
            ),
            EntryInner::NoOp => {}
        }
    }

    /// End at the current tick with an error attached.
    pub fn end_with_error(self, error: ErrorMessage) {
        match self.inner {
            EntryInner::Live {
                services,
                transaction,
                entry,
            } => services.end_entry(&transaction, entry, Some(error), None),
            EntryInner::Dummy {
                services,
                transaction,
                timer,
                start_tick,
                message,
            } => services.end_dummy_with_error(&transaction, timer, start_tick, message, error),
            EntryInner::NoOp => {}
        }
    }
}

/// Handle for one running nested timer.
pub struct Timer {
    inner: TimerInner,
}

pub(crate) enum TimerInner {
    Live {
        ticker: Ticker,
        transaction: Arc<Transaction>,
        timer: usize,
    },
    NoOp,
}

impl Timer {
    pub(crate) fn live(ticker: Ticker, transaction: Arc<Transaction>, timer: usize) -> Self {
        Self {
            inner: TimerInner::Live {
                ticker,
                transaction,
                timer,
            },
        }
    }

    pub(crate) fn no_op() -> Self {
        Self {
            inner: TimerInner::NoOp,
        }
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self.inner, TimerInner::NoOp)
    }

    /// Stop the running slice at the current tick.
    pub fn stop(self) {
        if let TimerInner::Live {
            ticker,
            transaction,
            timer,
        } = self.inner
        {
            transaction.stop_timer(timer, ticker.read_nanos());
        }
    }
}
