//! Channel-level call metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use flight_core::FlightError;
use serde::{Deserialize, Serialize};

/// Point-in-time copy of a channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Calls sent to the rendering context.
    pub started: u64,
    /// Calls that ended successfully.
    pub completed: u64,
    /// Calls that ended with an error frame or protocol failure.
    pub failed: u64,
    /// Calls retired by the watchdog.
    pub timed_out: u64,
    /// Calls cancelled by their caller.
    pub cancelled: u64,
    /// Chunk bytes routed to callers.
    pub bytes_streamed: u64,
}

impl MetricsSnapshot {
    /// Calls that have not reached a terminal state.
    pub fn in_flight(&self) -> u64 {
        self.started
            .saturating_sub(self.completed + self.failed + self.timed_out + self.cancelled)
    }
}

/// Lock-free counters shared by a channel and its router.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    bytes_streamed: AtomicU64,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call sent to the rendering context.
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record chunk bytes routed to a caller.
    pub fn record_bytes(&self, bytes: usize) {
        self.bytes_streamed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a call's terminal outcome.
    pub fn record_outcome(&self, outcome: &Result<(), FlightError>) {
        let counter = match outcome {
            Ok(()) => &self.completed,
            Err(FlightError::Timeout { .. }) => &self.timed_out,
            Err(FlightError::Cancelled(_)) => &self.cancelled,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_streamed: self.bytes_streamed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_outcomes_land_in_their_counters() {
        let metrics = ChannelMetrics::new();
        for _ in 0..5 {
            metrics.record_started();
        }
        metrics.record_outcome(&Ok(()));
        metrics.record_outcome(&Err(FlightError::ChannelClosed));
        metrics.record_outcome(&Err(FlightError::Timeout {
            id: 3,
            after: Duration::from_secs(1),
        }));
        metrics.record_outcome(&Err(FlightError::Cancelled(4)));
        metrics.record_bytes(42);

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                started: 5,
                completed: 1,
                failed: 1,
                timed_out: 1,
                cancelled: 1,
                bytes_streamed: 42,
            }
        );
        assert_eq!(snapshot.in_flight(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsSnapshot::default()).unwrap();
        assert_eq!(json["timed_out"], 0);
    }
}
