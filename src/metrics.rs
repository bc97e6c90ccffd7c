//! Ingestion counters.
//!
//! One `IngestMetrics` value is shared (via `Arc`) between the collector loop and the
//! persistence worker; `snapshot()` gives a consistent-enough copy for status output.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IngestMetrics {
    received: AtomicU64,
    decode_failures: AtomicU64,
    decrypt_failures: AtomicU64,
    classification_misses: AtomicU64,
    node_count_samples: AtomicU64,
    ops_persisted: AtomicU64,
    store_write_failures: AtomicU64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_classification_miss(&self) {
        self.classification_misses.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_node_count_sample(&self) {
        self.node_count_samples.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_persisted(&self) {
        self.ops_persisted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_store_write_failure(&self) {
        self.store_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            received: self.received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            classification_misses: self.classification_misses.load(Ordering::Relaxed),
            node_count_samples: self.node_count_samples.load(Ordering::Relaxed),
            ops_persisted: self.ops_persisted.load(Ordering::Relaxed),
            store_write_failures: self.store_write_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub received: u64,
    pub decode_failures: u64,
    pub decrypt_failures: u64,
    pub classification_misses: u64,
    pub node_count_samples: u64,
    pub ops_persisted: u64,
    pub store_write_failures: u64,
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received={} decode_failures={} decrypt_failures={} unknown={} node_counts={} persisted={} write_failures={}",
            self.received,
            self.decode_failures,
            self.decrypt_failures,
            self.classification_misses,
            self.node_count_samples,
            self.ops_persisted,
            self.store_write_failures
        )
    }
}
