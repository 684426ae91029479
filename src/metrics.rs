use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Collects runtime statistics about nearest-neighbour index operations using
/// lock-free atomic counters.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    query_count: AtomicU64,
    total_codes_searched: AtomicU64,
    total_candidates_examined: AtomicU64,
    total_query_time_ns: AtomicU64,
    partial_results: AtomicU64,
    indexed_count: AtomicU64,
    removed_count: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self, codes: u64, candidates: u64, duration_ns: u64, partial: bool) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.total_codes_searched.fetch_add(codes, Ordering::Relaxed);
        self.total_candidates_examined
            .fetch_add(candidates, Ordering::Relaxed);
        self.total_query_time_ns
            .fetch_add(duration_ns, Ordering::Relaxed);
        if partial {
            self.partial_results.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_indexed(&self, count: u64) {
        self.indexed_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_removed(&self, count: u64) {
        self.removed_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let query_count = self.query_count.load(Ordering::Relaxed);
        let total_query_time_ns = self.total_query_time_ns.load(Ordering::Relaxed);
        let total_codes = self.total_codes_searched.load(Ordering::Relaxed);
        let total_candidates = self.total_candidates_examined.load(Ordering::Relaxed);

        let per_query = |total: u64| {
            if query_count > 0 {
                total as f64 / query_count as f64
            } else {
                0.0
            }
        };

        MetricsSnapshot {
            query_count,
            indexed_count: self.indexed_count.load(Ordering::Relaxed),
            removed_count: self.removed_count.load(Ordering::Relaxed),
            partial_results: self.partial_results.load(Ordering::Relaxed),
            avg_query_time_us: per_query(total_query_time_ns) / 1000.0,
            avg_codes_per_query: per_query(total_codes),
            avg_candidates_per_query: per_query(total_candidates),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.query_count.store(0, Ordering::Relaxed);
        self.total_codes_searched.store(0, Ordering::Relaxed);
        self.total_candidates_examined.store(0, Ordering::Relaxed);
        self.total_query_time_ns.store(0, Ordering::Relaxed);
        self.partial_results.store(0, Ordering::Relaxed);
        self.indexed_count.store(0, Ordering::Relaxed);
        self.removed_count.store(0, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of index metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub query_count: u64,
    /// Elements hashed into the index by build/update calls.
    pub indexed_count: u64,
    pub removed_count: u64,
    /// Queries that returned fewer neighbours than requested.
    pub partial_results: u64,
    pub avg_query_time_us: f64,
    /// Distinct hash codes whose members were gathered, per query.
    pub avg_codes_per_query: f64,
    /// Candidate vectors re-ranked exactly, per query.
    pub avg_candidates_per_query: f64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Queries: {} ({} partial), Indexed: {}, Removed: {}, Avg query: {:.2}us, \
             Avg codes: {:.1}, Avg candidates: {:.1}",
            self.query_count,
            self.partial_results,
            self.indexed_count,
            self.removed_count,
            self.avg_query_time_us,
            self.avg_codes_per_query,
            self.avg_candidates_per_query,
        )
    }
}

/// Measures one operation's wall time.
pub(crate) struct QueryTimer {
    start: Instant,
}

impl QueryTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_averages() {
        let m = MetricsCollector::new();
        m.record_query(4, 20, 2_000, false);
        m.record_query(2, 10, 4_000, true);
        m.record_indexed(7);
        m.record_removed(1);

        let s = m.snapshot();
        assert_eq!(s.query_count, 2);
        assert_eq!(s.partial_results, 1);
        assert_eq!(s.indexed_count, 7);
        assert!((s.avg_codes_per_query - 3.0).abs() < 1e-9);
        assert!((s.avg_candidates_per_query - 15.0).abs() < 1e-9);
        assert!((s.avg_query_time_us - 3.0).abs() < 1e-9);

        m.reset();
        assert_eq!(m.snapshot().query_count, 0);
        assert_eq!(m.snapshot().avg_query_time_us, 0.0);
    }
}
