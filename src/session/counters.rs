use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Weight of the newest sample in the latency average
const LATENCY_ALPHA: f64 = 0.1;

/// Process-wide running totals
#[derive(Debug)]
pub struct OperationalCounters {
    started_at: Instant,
    queries: AtomicU64,
    query_errors: AtomicU64,
    cache_hits: AtomicU64,
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    transactions_expired: AtomicU64,
    /// f64 bits of the latency moving average in milliseconds
    avg_latency_ms: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountersSnapshot {
    pub queries: u64,
    pub query_errors: u64,
    pub cache_hits: u64,
    pub transactions_started: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub transactions_expired: u64,
    pub avg_latency_ms: f64,
    pub uptime_ms: u64,
}

impl Default for OperationalCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationalCounters {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            queries: AtomicU64::new(0),
            query_errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            transactions_started: AtomicU64::new(0),
            transactions_committed: AtomicU64::new(0),
            transactions_rolled_back: AtomicU64::new(0),
            transactions_expired: AtomicU64::new(0),
            avg_latency_ms: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Count one executed statement and fold its latency into the average
    pub fn record_query(&self, elapsed: Duration, succeeded: bool) {
        let first = self.queries.fetch_add(1, Ordering::Relaxed) == 0;
        if !succeeded {
            self.query_errors.fetch_add(1, Ordering::Relaxed);
        }

        let sample = elapsed.as_secs_f64() * 1000.0;
        let _ = self
            .avg_latency_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = if first {
                    sample
                } else {
                    f64::from_bits(bits) * (1.0 - LATENCY_ALPHA) + sample * LATENCY_ALPHA
                };
                Some(next.to_bits())
            });
    }

    /// A failure that never reached the database, such as a rejected write
    pub fn record_error(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_started(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_committed(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_rolled_back(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_expired(&self) {
        self.transactions_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            transactions_started: self.transactions_started.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            transactions_expired: self.transactions_expired.load(Ordering::Relaxed),
            avg_latency_ms: f64::from_bits(self.avg_latency_ms.load(Ordering::Acquire)),
            uptime_ms: self.uptime().as_millis() as u64,
        }
    }
}
