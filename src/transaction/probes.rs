//! Per-transaction thread and GC probes.
//!
//! Both components record starting values on the transaction's thread and
//! report deltas: live deltas while the transaction runs, frozen deltas
//! after completion. A platform or embedder that cannot supply a value
//! leaves the corresponding field `None` and the snapshot omits it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Point-in-time stats for one thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadStats {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cpu_nanos: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub blocked_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub waited_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub allocated_bytes: Option<u64>,
}

/// Binds a sampler to the calling thread at transaction start.
pub trait ThreadStatsProbe: Send + Sync {
    /// Must be called on the thread to be sampled; `None` when the platform
    /// cannot sample threads at all.
    fn bind_current_thread(&self) -> Option<Box<dyn ThreadStatsSampler>>;
}

/// Samples the bound thread; safe to call from other threads while the
/// bound thread is alive.
pub trait ThreadStatsSampler: Send + Sync {
    fn sample(&self) -> ThreadStats;
}

/// CPU-time probe using the platform per-thread clock. Linux only; other
/// platforms report nothing.
#[derive(Debug, Default)]
pub struct SystemThreadStatsProbe;

impl ThreadStatsProbe for SystemThreadStatsProbe {
    #[cfg(target_os = "linux")]
    fn bind_current_thread(&self) -> Option<Box<dyn ThreadStatsSampler>> {
        let mut clock_id: libc::clockid_t = 0;
        let ret = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut clock_id) };
        if ret != 0 {
            return None;
        }
        Some(Box::new(ThreadCpuSampler { clock_id }))
    }

    #[cfg(not(target_os = "linux"))]
    fn bind_current_thread(&self) -> Option<Box<dyn ThreadStatsSampler>> {
        None
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
struct ThreadCpuSampler {
    clock_id: libc::clockid_t,
}

#[cfg(target_os = "linux")]
impl ThreadStatsSampler for ThreadCpuSampler {
    fn sample(&self) -> ThreadStats {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { libc::clock_gettime(self.clock_id, &mut ts) };
        let cpu_nanos = if ret == 0 {
            Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
        } else {
            None
        };
        ThreadStats {
            cpu_nanos,
            ..Default::default()
        }
    }
}

/// Captures thread stats at transaction start and reports deltas.
pub struct ThreadInfoComponent {
    sampler: Box<dyn ThreadStatsSampler>,
    start: ThreadStats,
    completed: RwLock<Option<ThreadStats>>,
}

impl ThreadInfoComponent {
    /// Must be constructed on the transaction's thread.
    pub fn bind(probe: &dyn ThreadStatsProbe) -> Option<Self> {
        let sampler = probe.bind_current_thread()?;
        let start = sampler.sample();
        Some(Self {
            sampler,
            start,
            completed: RwLock::new(None),
        })
    }

    pub(crate) fn complete(&self) {
        let delta = delta(&self.sampler.sample(), &self.start);
        *self.completed.write() = Some(delta);
    }

    /// Deltas since transaction start; live values until completion.
    pub fn stats(&self) -> ThreadStats {
        if let Some(completed) = *self.completed.read() {
            return completed;
        }
        delta(&self.sampler.sample(), &self.start)
    }
}

fn delta(now: &ThreadStats, start: &ThreadStats) -> ThreadStats {
    fn sub(now: Option<u64>, start: Option<u64>) -> Option<u64> {
        match (now, start) {
            (Some(now), Some(start)) => Some(now.saturating_sub(start)),
            _ => None,
        }
    }
    ThreadStats {
        cpu_nanos: sub(now.cpu_nanos, start.cpu_nanos),
        blocked_millis: sub(now.blocked_millis, start.blocked_millis),
        waited_millis: sub(now.waited_millis, start.waited_millis),
        allocated_bytes: sub(now.allocated_bytes, start.allocated_bytes),
    }
}

/// Per-collector activity counters supplied by an embedder probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcActivity {
    pub name: String,
    pub count: u64,
    pub total_millis: u64,
}

/// Source of collector counters; embedder-supplied (there is no default).
pub trait GcActivityProbe: Send + Sync {
    fn collect(&self) -> Vec<GcActivity>;
}

/// Records collector counters at transaction start and reports deltas.
pub struct GcInfoComponent {
    probe: Arc<dyn GcActivityProbe>,
    start: Vec<GcActivity>,
    completed: RwLock<Option<Vec<GcActivity>>>,
}

impl GcInfoComponent {
    pub fn start(probe: Arc<dyn GcActivityProbe>) -> Self {
        let start = probe.collect();
        Self {
            probe,
            start,
            completed: RwLock::new(None),
        }
    }

    pub(crate) fn complete(&self) {
        let deltas = self.deltas(self.probe.collect());
        *self.completed.write() = Some(deltas);
    }

    /// Activity deltas since transaction start; live values until
    /// completion. Collectors with no activity are omitted.
    pub fn activity(&self) -> Vec<GcActivity> {
        if let Some(completed) = self.completed.read().as_ref() {
            return completed.clone();
        }
        self.deltas(self.probe.collect())
    }

    fn deltas(&self, now: Vec<GcActivity>) -> Vec<GcActivity> {
        now.into_iter()
            .map(|activity| {
                let baseline = self.start.iter().find(|s| s.name == activity.name);
                GcActivity {
                    count: activity
                        .count
                        .saturating_sub(baseline.map(|s| s.count).unwrap_or(0)),
                    total_millis: activity
                        .total_millis
                        .saturating_sub(baseline.map(|s| s.total_millis).unwrap_or(0)),
                    name: activity.name,
                }
            })
            .filter(|activity| activity.count > 0 || activity.total_millis > 0)
            .collect()
    }
}
