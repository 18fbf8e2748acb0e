//! Trace entries: one recorded operation with timing and optional error.
//!
//! Live entries are arena nodes owned by the transaction; the serializable
//! tree is produced on demand with messages evaluated at that point.

use crate::message::{ErrorMessage, Message, MessageSupplier};
use crate::stack::StackFrame;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Live node in a transaction's entry tree.
pub(crate) struct EntryNode {
    pub start_tick: u64,
    pub end_tick: Option<u64>,
    pub message: Option<Arc<dyn MessageSupplier>>,
    pub error: Option<ErrorMessage>,
    pub stack_trace: Option<Vec<StackFrame>>,
    /// Owning timer node, stopped when this entry ends.
    pub timer: Option<usize>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub limit_exceeded_marker: bool,
}

/// Whether a snapshot section was captured for a transaction. `Expired`
/// is reserved for storage layers that age sections out; the engine never
/// emits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Existence {
    Yes,
    No,
    Expired,
}

/// Immutable view of one entry and its children, messages evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorMessage>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stack_trace: Option<Vec<StackFrame>>,
    pub start_tick: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_tick: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_nanos: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub limit_exceeded_marker: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<EntrySnapshot>,
}

/// Build the serializable subtree rooted at `idx`.
pub(crate) fn snapshot_tree(nodes: &[EntryNode], idx: usize) -> EntrySnapshot {
    let node = &nodes[idx];
    EntrySnapshot {
        message: node.message.as_ref().map(|supplier| supplier.get()),
        error: node.error.clone(),
        stack_trace: node.stack_trace.clone(),
        start_tick: node.start_tick,
        end_tick: node.end_tick,
        duration_nanos: node
            .end_tick
            .map(|end| end.saturating_sub(node.start_tick)),
        limit_exceeded_marker: node.limit_exceeded_marker,
        children: node
            .children
            .iter()
            .map(|&child| snapshot_tree(nodes, child))
            .collect(),
    }
}
