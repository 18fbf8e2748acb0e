//! Thread-local current transaction plus the process-wide live set.
//!
//! Each thread is inside at most one transaction at a time; the slot is
//! tagged with the owning registry's id so independent registries (one per
//! engine instance, several in tests) never observe each other's
//! transactions.

use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<(u64, Arc<Transaction>)>> = const { RefCell::new(None) };
}

pub struct TransactionRegistry {
    registry_id: u64,
    transactions: RwLock<HashMap<Uuid, Arc<Transaction>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            registry_id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            transactions: RwLock::new(HashMap::new()),
        }
    }

    /// The transaction this thread is currently inside, if any.
    pub fn current_transaction(&self) -> Option<Arc<Transaction>> {
        CURRENT.with(|slot| {
            slot.borrow().as_ref().and_then(|(registry_id, transaction)| {
                (*registry_id == self.registry_id).then(|| transaction.clone())
            })
        })
    }

    pub(crate) fn add(&self, transaction: Arc<Transaction>) {
        CURRENT.with(|slot| {
            *slot.borrow_mut() = Some((self.registry_id, transaction.clone()));
        });
        self.transactions
            .write()
            .insert(transaction.id(), transaction);
    }

    pub(crate) fn remove(&self, transaction: &Arc<Transaction>) {
        self.transactions.write().remove(&transaction.id());
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            let clear = matches!(
                &*slot,
                Some((registry_id, current))
                    if *registry_id == self.registry_id && current.id() == transaction.id()
            );
            if clear {
                *slot = None;
            }
        });
    }

    /// All live transactions, for snapshotting and partial-trace capture.
    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        self.transactions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.read().is_empty()
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
