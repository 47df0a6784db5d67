//! Server counters
//!
//! Lock-free counters updated from the accept loop, session tasks, the
//! broadcast engine and the liveness sweep. Exported as a sorted map for the
//! status API and the HTTP endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug)]
pub struct ServerMetrics {
    // Connections
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub logons_rejected: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub logon_timeouts: AtomicU64,
    pub protocol_violations: AtomicU64,

    // Inbound
    pub frames_received: AtomicU64,
    pub unknown_frames_skipped: AtomicU64,
    pub decode_errors: AtomicU64,

    // Outbound
    pub events_published: AtomicU64,
    pub messages_enqueued: AtomicU64,
    pub messages_dropped_backpressure: AtomicU64,
    pub heartbeats_sent: AtomicU64,

    pub publish_latency_ns: Mutex<LatencyTracker>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            logons_rejected: AtomicU64::new(0),
            heartbeat_timeouts: AtomicU64::new(0),
            logon_timeouts: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            unknown_frames_skipped: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            messages_enqueued: AtomicU64::new(0),
            messages_dropped_backpressure: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            publish_latency_ns: Mutex::new(LatencyTracker::new(1000)),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one published event and its fan-out.
    pub fn record_publish(&self, enqueued: u64, dropped: u64, latency_ns: u64) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.messages_enqueued.fetch_add(enqueued, Ordering::Relaxed);
        self.messages_dropped_backpressure
            .fetch_add(dropped, Ordering::Relaxed);
        self.publish_latency_ns.lock().record(latency_ns);
    }

    /// Record a single direct send (responses, snapshots, heartbeats).
    pub fn record_enqueue(&self, dropped: bool) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
        if dropped {
            self.messages_dropped_backpressure
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters = [
            ("connections_accepted", &self.connections_accepted),
            ("connections_rejected", &self.connections_rejected),
            ("logons_rejected", &self.logons_rejected),
            ("heartbeat_timeouts", &self.heartbeat_timeouts),
            ("logon_timeouts", &self.logon_timeouts),
            ("protocol_violations", &self.protocol_violations),
            ("frames_received", &self.frames_received),
            ("unknown_frames_skipped", &self.unknown_frames_skipped),
            ("decode_errors", &self.decode_errors),
            ("events_published", &self.events_published),
            ("messages_enqueued", &self.messages_enqueued),
            ("messages_dropped_backpressure", &self.messages_dropped_backpressure),
            ("heartbeats_sent", &self.heartbeats_sent),
        ];

        let mut m: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect();

        let tracker = self.publish_latency_ns.lock();
        if let Some(p99) = tracker.percentile(99) {
            m.insert("publish_latency_p99_ns".to_string(), p99);
        }
        m
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of latency samples for percentile calculation.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Percentile in 0..=100.
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
