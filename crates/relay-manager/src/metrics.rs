//! Relay manager counters.
//!
//! Relaxed atomics: the numbers are statistics, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Live counters shared by the manager's components.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub syncs_started: Counter,
    pub syncs_succeeded: Counter,
    pub syncs_failed: Counter,
    pub syncs_pending: Counter,
    pub syncs_coalesced: Counter,
    pub syncs_skipped_not_ready: Counter,
    pub messages_received: Counter,
    pub adoptions: Counter,
    pub adoption_failures: Counter,
    pub outbound_relay_pushes: Counter,
}

impl RelayMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            syncs_started: self.syncs_started.get(),
            syncs_succeeded: self.syncs_succeeded.get(),
            syncs_failed: self.syncs_failed.get(),
            syncs_pending: self.syncs_pending.get(),
            syncs_coalesced: self.syncs_coalesced.get(),
            syncs_skipped_not_ready: self.syncs_skipped_not_ready.get(),
            messages_received: self.messages_received.get(),
            adoptions: self.adoptions.get(),
            adoption_failures: self.adoption_failures.get(),
            outbound_relay_pushes: self.outbound_relay_pushes.get(),
        }
    }
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub syncs_started: u64,
    pub syncs_succeeded: u64,
    pub syncs_failed: u64,
    pub syncs_pending: u64,
    pub syncs_coalesced: u64,
    pub syncs_skipped_not_ready: u64,
    pub messages_received: u64,
    pub adoptions: u64,
    pub adoption_failures: u64,
    pub outbound_relay_pushes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshot() {
        let metrics = RelayMetrics::default();
        metrics.syncs_started.inc();
        metrics.syncs_started.inc();
        metrics.messages_received.inc_by(12);

        let snap = metrics.snapshot();
        assert_eq!(snap.syncs_started, 2);
        assert_eq!(snap.messages_received, 12);
        assert_eq!(snap.syncs_failed, 0);
    }

    #[test]
    fn snapshot_serializes_field_names() {
        let metrics = RelayMetrics::default();
        metrics.adoptions.inc();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["adoptions"], 1);
        assert_eq!(json["outbound_relay_pushes"], 0);
    }
}
