//! Timer names and the per-transaction timer tree.
//!
//! Timers form a tree parallel to the entry tree but finer-grained: a
//! single entry may own several nested timers. Nodes live in an arena owned
//! by the transaction; handles are plain indices, which removes per-node
//! allocation and parent/child reference cycles.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::warn;

/// Interned handle identifying one named measurement site.
///
/// Equality is by advice identity (the interned allocation), not by string
/// comparison, so hot-path child lookups are pointer compares.
#[derive(Debug, Clone)]
pub struct TimerName(Arc<TimerNameInner>);

#[derive(Debug)]
struct TimerNameInner {
    name: Box<str>,
    /// Reserved flag bit; downstream rollups may mark extended timers, the
    /// engine itself never sets it.
    extended: bool,
}

impl TimerName {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_extended(&self) -> bool {
        self.0.extended
    }
}

impl PartialEq for TimerName {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TimerName {}

impl Hash for TimerName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Dedups [`TimerName`]s by instrumentation advice identity: one
/// allocation per advice key for the process lifetime.
#[derive(Default)]
pub struct TimerNameCache {
    names: RwLock<HashMap<&'static str, TimerName>>,
}

impl TimerNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timer_name(&self, advice_key: &'static str) -> TimerName {
        if let Some(existing) = self.names.read().get(advice_key) {
            return existing.clone();
        }
        self.names
            .write()
            .entry(advice_key)
            .or_insert_with(|| {
                TimerName(Arc::new(TimerNameInner {
                    name: advice_key.into(),
                    extended: false,
                }))
            })
            .clone()
    }
}

/// Live node in a transaction's timer tree.
#[derive(Debug)]
pub(crate) struct TimerNode {
    pub name: TimerName,
    pub total_nanos: u64,
    pub count: u64,
    /// Start tick of the currently running slice; meaningless when idle.
    pub start_tick: u64,
    /// Self-nesting depth; 0 = not running. Only the outermost start/stop
    /// of a recursively re-entered timer accumulates.
    pub nesting: u32,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Arena holding one transaction's timer tree. Index 0 is the root timer.
#[derive(Debug, Default)]
pub(crate) struct TimerArena {
    nodes: Vec<TimerNode>,
}

impl TimerArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the root timer, already running from `tick`.
    pub fn root(&mut self, name: TimerName, tick: u64) -> usize {
        self.nodes.push(TimerNode {
            name,
            total_nanos: 0,
            count: 0,
            start_tick: tick,
            nesting: 1,
            parent: None,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    /// Start a timer named `name` under `current`.
    ///
    /// Re-entering the current timer bumps its self-nesting level; starting
    /// a name that already exists as a child reuses that node rather than
    /// creating a duplicate sibling. Returns the running node's index.
    pub fn start_nested(&mut self, current: usize, name: TimerName, tick: u64) -> usize {
        if self.nodes[current].name == name {
            self.nodes[current].nesting += 1;
            return current;
        }
        let existing = self.nodes[current]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child].name == name);
        match existing {
            Some(child) => {
                let node = &mut self.nodes[child];
                if node.nesting == 0 {
                    node.start_tick = tick;
                }
                node.nesting += 1;
                child
            }
            None => {
                let child = self.nodes.len();
                self.nodes.push(TimerNode {
                    name,
                    total_nanos: 0,
                    count: 0,
                    start_tick: tick,
                    nesting: 1,
                    parent: Some(current),
                    children: Vec::new(),
                });
                self.nodes[current].children.push(child);
                child
            }
        }
    }

    /// Stop a running slice of `idx`; returns the new innermost running
    /// timer (the node itself while still self-nested, else its parent).
    pub fn stop(&mut self, idx: usize, tick: u64) -> Option<usize> {
        let node = &mut self.nodes[idx];
        if node.nesting == 0 {
            warn!(timer = node.name.name(), "stop on a timer that is not running");
            return node.parent;
        }
        node.nesting -= 1;
        if node.nesting > 0 {
            return Some(idx);
        }
        node.total_nanos += tick.saturating_sub(node.start_tick);
        node.count += 1;
        node.parent
    }

    /// Immutable view of the subtree at `idx`, with running slices extended
    /// to `capture_tick`.
    pub fn snapshot(&self, idx: usize, capture_tick: u64) -> TimerSnapshot {
        let node = &self.nodes[idx];
        let active = node.nesting > 0;
        let total_nanos = if active {
            node.total_nanos + capture_tick.saturating_sub(node.start_tick)
        } else {
            node.total_nanos
        };
        TimerSnapshot {
            name: node.name.name().to_string(),
            total_nanos,
            count: node.count,
            active,
            children: node
                .children
                .iter()
                .map(|&child| self.snapshot(child, capture_tick))
                .collect(),
        }
    }
}

/// Immutable view of one timer node normalized to a capture tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub name: String,
    pub total_nanos: u64,
    pub count: u64,
    pub active: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<TimerSnapshot>,
}
