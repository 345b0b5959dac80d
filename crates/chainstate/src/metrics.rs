//! Block tree counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TreeMetrics {
    headers_inserted: AtomicU64,
    anchors_inserted: AtomicU64,
    ancestor_queries: AtomicU64,
    ancestor_hops: AtomicU64,
    max_ancestor_hops: AtomicU64,
    median_queries: AtomicU64,
    invalidations: AtomicU64,
    chain_tx_linked: AtomicU64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeMetricsSnapshot {
    pub headers_inserted: u64,
    pub anchors_inserted: u64,
    pub ancestor_queries: u64,
    pub ancestor_hops: u64,
    pub max_ancestor_hops: u64,
    pub median_queries: u64,
    pub invalidations: u64,
    pub chain_tx_linked: u64,
}

impl TreeMetricsSnapshot {
    pub fn mean_ancestor_hops(&self) -> f64 {
        if self.ancestor_queries == 0 {
            return 0.0;
        }
        self.ancestor_hops as f64 / self.ancestor_queries as f64
    }
}

impl TreeMetrics {
    pub fn record_header(&self) {
        self.headers_inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anchor(&self) {
        self.anchors_inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ancestor(&self, hops: u32) {
        let hops = u64::from(hops);
        self.ancestor_queries.fetch_add(1, Ordering::Relaxed);
        self.ancestor_hops.fetch_add(hops, Ordering::Relaxed);
        self.max_ancestor_hops.fetch_max(hops, Ordering::Relaxed);
    }

    pub fn record_median(&self) {
        self.median_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chain_tx_linked(&self, count: usize) {
        self.chain_tx_linked
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TreeMetricsSnapshot {
        TreeMetricsSnapshot {
            headers_inserted: self.headers_inserted.load(Ordering::Relaxed),
            anchors_inserted: self.anchors_inserted.load(Ordering::Relaxed),
            ancestor_queries: self.ancestor_queries.load(Ordering::Relaxed),
            ancestor_hops: self.ancestor_hops.load(Ordering::Relaxed),
            max_ancestor_hops: self.max_ancestor_hops.load(Ordering::Relaxed),
            median_queries: self.median_queries.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            chain_tx_linked: self.chain_tx_linked.load(Ordering::Relaxed),
        }
    }
}
