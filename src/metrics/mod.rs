//! Counters for the store pipeline and the gateway connection.
//!
//! Counters are atomics sampled into owned snapshot structs; each increment
//! is mirrored to the `metrics` recorder for external collection.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the store's dispatch pipeline.
#[derive(Debug, Default)]
pub struct StoreCounters {
    events_applied: AtomicU64,
    events_ignored: AtomicU64,
    events_dropped: AtomicU64,
    gaps_detected: AtomicU64,
    buffer_overflows: AtomicU64,
    snapshots_requested: AtomicU64,
}

impl StoreCounters {
    pub fn record_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dexsync_events_applied", 1);
    }

    pub fn record_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dexsync_events_ignored", 1);
    }

    pub fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dexsync_events_dropped", 1);
    }

    pub fn record_gap(&self) {
        self.gaps_detected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dexsync_gaps_detected", 1);
    }

    pub fn record_buffer_overflow(&self) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dexsync_buffer_overflows", 1);
    }

    pub fn record_snapshot_requested(&self) {
        self.snapshots_requested.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dexsync_snapshots_requested", 1);
    }

    pub fn snapshot(&self) -> StoreMetrics {
        StoreMetrics {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            snapshots_requested: self.snapshots_requested.load(Ordering::Relaxed),
        }
    }
}

/// Owned sample of the store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreMetrics {
    pub events_applied: u64,
    pub events_ignored: u64,
    pub events_dropped: u64,
    pub gaps_detected: u64,
    pub buffer_overflows: u64,
    pub snapshots_requested: u64,
}

/// Counters maintained by the gateway client.
#[derive(Debug, Default)]
pub struct TransportCounters {
    connects: AtomicU64,
    reconnects: AtomicU64,
    frames_received: AtomicU64,
    frames_malformed: AtomicU64,
}

impl TransportCounters {
    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dexsync_gateway_connects", 1);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dexsync_gateway_reconnects", 1);
    }

    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dexsync_gateway_frames_malformed", 1);
    }

    pub fn snapshot(&self) -> TransportMetrics {
        TransportMetrics {
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
        }
    }
}

/// Owned sample of the transport counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    pub connects: u64,
    pub reconnects: u64,
    pub frames_received: u64,
    pub frames_malformed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_sample_into_snapshots() {
        let counters = StoreCounters::default();
        counters.record_applied();
        counters.record_applied();
        counters.record_gap();

        let sample = counters.snapshot();
        assert_eq!(sample.events_applied, 2);
        assert_eq!(sample.gaps_detected, 1);
        assert_eq!(sample.events_ignored, 0);
    }
}
