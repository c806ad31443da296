//! Counters and latency tracking for broker and client peers.
//!
//! Counters are plain atomics so snapshot observers never block the hot
//! paths. The client additionally keeps a sliding window of recent request
//! latencies for a rolling mean.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

// ── Ring buffer ──────────────────────────────────────────────────────

/// A fixed-size ring buffer backed by `VecDeque`.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: std::collections::VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an item, evicting the oldest if at capacity.
    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    /// Number of items currently stored.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Iterate over items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }
}

// ── Broker counters ──────────────────────────────────────────────────

/// Counters maintained by the broker's event handlers.
#[derive(Debug, Default)]
pub struct BrokerStats {
    /// Client REQ envelopes accepted.
    pub requests: AtomicU64,
    /// Worker REPLY bodies forwarded to clients.
    pub responses: AtomicU64,
    /// Error responses the broker fabricated itself.
    pub synthesized_errors: AtomicU64,
    /// Worker heartbeats received.
    pub heartbeats: AtomicU64,
    /// Workers that completed registration (READY).
    pub workers_registered: AtomicU64,
    /// Workers removed by the liveness sweep.
    pub workers_evicted: AtomicU64,
    /// Frames dropped: malformed, unknown protocol, or full channels.
    pub dropped: AtomicU64,
}

/// Point-in-time copy of [`BrokerStats`].
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatsSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub synthesized_errors: u64,
    pub heartbeats: u64,
    pub workers_registered: u64,
    pub workers_evicted: u64,
    pub dropped: u64,
}

impl BrokerStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            synthesized_errors: self.synthesized_errors.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            workers_registered: self.workers_registered.load(Ordering::Relaxed),
            workers_evicted: self.workers_evicted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ── Client stats ─────────────────────────────────────────────────────

/// Counters and latency window maintained by the client peer.
#[derive(Debug)]
pub struct ClientStats {
    pub requests_sent: AtomicU64,
    pub responses_received: AtomicU64,
    pub timeouts: AtomicU64,
    pub failures: AtomicU64,
    latencies: Mutex<RingBuffer<f64>>,
}

/// Point-in-time copy of [`ClientStats`].
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatsSnapshot {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub failures: u64,
    /// Rolling mean over the latency window, in milliseconds.
    pub mean_latency_ms: f64,
}

impl ClientStats {
    /// Create stats with the given latency window size.
    pub fn new(latency_window: usize) -> Self {
        Self {
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            latencies: Mutex::new(RingBuffer::new(latency_window.max(1))),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one request round-trip latency.
    pub fn record_latency(&self, millis: f64) {
        let mut window = self.latencies.lock().expect("latency window poisoned");
        window.push(millis);
    }

    /// Rolling mean over the current window; zero when empty.
    pub fn mean_latency_ms(&self) -> f64 {
        let window = self.latencies.lock().expect("latency window poisoned");
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<f64>() / window.len() as f64
    }

    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            mean_latency_ms: self.mean_latency_ms(),
        }
    }
}
