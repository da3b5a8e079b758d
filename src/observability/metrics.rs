//! Multiplexer counters
//!
//! - Counters only, monotonic
//! - Active gauges are derived (`created - stopped`)
//! - Relaxed atomics; exact totals, no cross-counter consistency

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    multiplexers_created: AtomicU64,
    multiplexers_stopped: AtomicU64,
    handles_attached: AtomicU64,
    handles_detached: AtomicU64,
    events_processed: AtomicU64,
    task_failures: AtomicU64,
}

static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

impl MetricsRegistry {
    /// Registry with every counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used when none is injected
    pub fn global() -> Arc<MetricsRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MetricsRegistry::new())))
    }

    /// A multiplexer was built
    pub fn increment_multiplexers_created(&self) {
        self.multiplexers_created.fetch_add(1, Ordering::Relaxed);
    }

    /// A multiplexer tore down
    pub fn increment_multiplexers_stopped(&self) {
        self.multiplexers_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// A handle was registered
    pub fn increment_handles_attached(&self) {
        self.handles_attached.fetch_add(1, Ordering::Relaxed);
    }

    /// A handle was removed
    pub fn increment_handles_detached(&self) {
        self.handles_detached.fetch_add(1, Ordering::Relaxed);
    }

    /// An event was applied and broadcast
    pub fn increment_events_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued task failed
    pub fn increment_task_failures(&self) {
        self.task_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            multiplexers_created: self.multiplexers_created.load(Ordering::Relaxed),
            multiplexers_stopped: self.multiplexers_stopped.load(Ordering::Relaxed),
            handles_attached: self.handles_attached.load(Ordering::Relaxed),
            handles_detached: self.handles_detached.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            task_failures: self.task_failures.load(Ordering::Relaxed),
        }
    }

    /// Counters and derived gauges as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let s = self.snapshot();
        serde_json::json!({
            "multiplexers_created": s.multiplexers_created,
            "multiplexers_stopped": s.multiplexers_stopped,
            "multiplexers_active": s.multiplexers_active(),
            "handles_attached": s.handles_attached,
            "handles_detached": s.handles_detached,
            "handles_active": s.handles_active(),
            "events_processed": s.events_processed,
            "task_failures": s.task_failures,
        })
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub multiplexers_created: u64,
    pub multiplexers_stopped: u64,
    pub handles_attached: u64,
    pub handles_detached: u64,
    pub events_processed: u64,
    pub task_failures: u64,
}

impl MetricsSnapshot {
    /// Created minus stopped
    pub fn multiplexers_active(&self) -> u64 {
        self.multiplexers_created
            .saturating_sub(self.multiplexers_stopped)
    }

    /// Attached minus detached
    pub fn handles_active(&self) -> u64 {
        self.handles_attached.saturating_sub(self.handles_detached)
    }
}
