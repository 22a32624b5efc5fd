//! Trunk-wide counters for introspection.
//!
//! Plain atomics behind a `Default` struct, with a `Serialize` snapshot
//! method for introspection rather than a metrics-client dependency.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct TrunkMetrics {
    pub completed: AtomicU64,
    pub cancelled: AtomicU64,
    pub retries_fired: AtomicU64,
    pub zombie_transitions: AtomicU64,
    pub revive_attempts: AtomicU64,
}

impl TrunkMetrics {
    pub fn snapshot(&self) -> TrunkMetricsSnapshot {
        TrunkMetricsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retries_fired: self.retries_fired.load(Ordering::Relaxed),
            zombie_transitions: self.zombie_transitions.load(Ordering::Relaxed),
            revive_attempts: self.revive_attempts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrunkMetricsSnapshot {
    pub completed: u64,
    pub cancelled: u64,
    pub retries_fired: u64,
    pub zombie_transitions: u64,
    pub revive_attempts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn snapshot_reflects_counters() {
        let m = TrunkMetrics::default();
        m.completed.fetch_add(3, Ordering::Relaxed);
        m.cancelled.fetch_add(1, Ordering::Relaxed);
        let snap = m.snapshot();
        assert_eq!(snap.completed, 3);
        assert_eq!(snap.cancelled, 1);
    }
}
