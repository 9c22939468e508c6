//! Lock-free metrics primitives + the process-global metrics surface.
//!
//! Design goals:
//! - Hot-path recording: O(1), no allocations, no locks.
//! - Snapshotting: lock-free loads + approximate quantiles from log2 buckets.
//! - Exposition: Prometheus text format with a uniform `kb_` prefix.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    v: AtomicU64,
}

impl Counter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            v: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.v.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        self.v.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.v.load(Ordering::Relaxed)
    }
}

/// Number of power-of-two latency buckets. Bucket `i` covers values in
/// `[2^i, 2^(i+1))` microseconds; 40 buckets reach ~12.7 days.
const LOG2_BUCKETS: usize = 40;

const fn bucket_index(value: u64) -> usize {
    if value == 0 {
        return 0;
    }
    let idx = (u64::BITS - 1 - value.leading_zeros()) as usize;
    if idx >= LOG2_BUCKETS {
        LOG2_BUCKETS - 1
    } else {
        idx
    }
}

/// Fixed-memory histogram over log2 buckets.
#[derive(Debug)]
pub struct Log2Histogram {
    buckets: [AtomicU64; LOG2_BUCKETS],
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

/// Point-in-time view of a [`Log2Histogram`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

impl Default for Log2Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Log2Histogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record(&self, value: u64) {
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
        self.buckets[bucket_index(value)].fetch_add(1, Ordering::Relaxed);
        // count is written last with Release so an Acquire load in snapshot()
        // sees all prior writes.
        self.count.fetch_add(1, Ordering::Release);
    }

    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return HistogramSnapshot {
                count: 0,
                sum: 0,
                min: 0,
                max: 0,
                p50: 0,
                p95: 0,
                p99: 0,
            };
        }

        let buckets: [u64; LOG2_BUCKETS] =
            std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed));

        HistogramSnapshot {
            count,
            sum: self.sum.load(Ordering::Relaxed),
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            p50: quantile_upper_bound(&buckets, count, 0.50),
            p95: quantile_upper_bound(&buckets, count, 0.95),
            p99: quantile_upper_bound(&buckets, count, 0.99),
        }
    }
}

/// Approximate quantile: the upper bound of the bucket where the cumulative
/// count crosses `q * count`.
#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn quantile_upper_bound(buckets: &[u64; LOG2_BUCKETS], count: u64, q: f64) -> u64 {
    let target = ((count as f64) * q).ceil() as u64;
    let mut cumulative = 0u64;
    for (i, b) in buckets.iter().enumerate() {
        cumulative += b;
        if cumulative >= target {
            return 1u64 << (i + 1).min(63);
        }
    }
    1u64 << (LOG2_BUCKETS.min(63))
}

// ---------------------------------------------------------------------------
// Metric groups
// ---------------------------------------------------------------------------

/// Query-path metrics.
#[derive(Debug, Default)]
pub struct QueryMetrics {
    pub queries_total: Counter,
    pub query_errors_total: Counter,
    pub degraded_total: Counter,
    pub reranked_total: Counter,
    pub rerank_failures_total: Counter,
    pub latency_us: Log2Histogram,
}

/// Ingest-path metrics.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub documents_total: Counter,
    pub document_failures_total: Counter,
    pub chunks_total: Counter,
    pub rollbacks_total: Counter,
    pub latency_us: Log2Histogram,
}

/// Cache hit/miss/eviction metrics across the cache hierarchy.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub embedding_hits_total: Counter,
    pub embedding_misses_total: Counter,
    pub semantic_hits_total: Counter,
    pub semantic_misses_total: Counter,
    pub lru_evictions_total: Counter,
}

/// Vector backend reliability metrics.
#[derive(Debug, Default)]
pub struct BackendMetrics {
    pub calls_total: Counter,
    pub failures_total: Counter,
    pub retries_total: Counter,
    pub breaker_opens_total: Counter,
    pub breaker_rejections_total: Counter,
}

/// HTTP surface metrics.
#[derive(Debug, Default)]
pub struct HttpMetrics {
    pub requests_total: Counter,
    pub errors_total: Counter,
    pub unauthorized_total: Counter,
    pub rate_limited_total: Counter,
    pub latency_us: Log2Histogram,
}

/// The process-global metrics surface.
#[derive(Debug, Default)]
pub struct KbMetrics {
    pub query: QueryMetrics,
    pub ingest: IngestMetrics,
    pub cache: CacheMetrics,
    pub backend: BackendMetrics,
    pub http: HttpMetrics,
}

impl KbMetrics {
    /// Render the Prometheus text exposition.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        let counters: &[(&str, &Counter)] = &[
            ("kb_queries_total", &self.query.queries_total),
            ("kb_query_errors_total", &self.query.query_errors_total),
            ("kb_query_degraded_total", &self.query.degraded_total),
            ("kb_query_reranked_total", &self.query.reranked_total),
            (
                "kb_query_rerank_failures_total",
                &self.query.rerank_failures_total,
            ),
            ("kb_ingest_documents_total", &self.ingest.documents_total),
            (
                "kb_ingest_document_failures_total",
                &self.ingest.document_failures_total,
            ),
            ("kb_ingest_chunks_total", &self.ingest.chunks_total),
            ("kb_ingest_rollbacks_total", &self.ingest.rollbacks_total),
            (
                "kb_cache_embedding_hits_total",
                &self.cache.embedding_hits_total,
            ),
            (
                "kb_cache_embedding_misses_total",
                &self.cache.embedding_misses_total,
            ),
            (
                "kb_cache_semantic_hits_total",
                &self.cache.semantic_hits_total,
            ),
            (
                "kb_cache_semantic_misses_total",
                &self.cache.semantic_misses_total,
            ),
            ("kb_cache_lru_evictions_total", &self.cache.lru_evictions_total),
            ("kb_backend_calls_total", &self.backend.calls_total),
            ("kb_backend_failures_total", &self.backend.failures_total),
            ("kb_backend_retries_total", &self.backend.retries_total),
            ("kb_breaker_opens_total", &self.backend.breaker_opens_total),
            (
                "kb_breaker_rejections_total",
                &self.backend.breaker_rejections_total,
            ),
            ("kb_http_requests_total", &self.http.requests_total),
            ("kb_http_errors_total", &self.http.errors_total),
            ("kb_http_unauthorized_total", &self.http.unauthorized_total),
            ("kb_http_rate_limited_total", &self.http.rate_limited_total),
        ];
        for (name, c) in counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {}\n", c.load()));
        }

        let histograms: &[(&str, &Log2Histogram)] = &[
            ("kb_query_latency_us", &self.query.latency_us),
            ("kb_ingest_latency_us", &self.ingest.latency_us),
            ("kb_http_latency_us", &self.http.latency_us),
        ];
        for (name, h) in histograms {
            let s = h.snapshot();
            out.push_str(&format!("# TYPE {name} summary\n"));
            out.push_str(&format!("{name}_count {}\n", s.count));
            out.push_str(&format!("{name}_sum {}\n", s.sum));
            out.push_str(&format!("{name}{{quantile=\"0.5\"}} {}\n", s.p50));
            out.push_str(&format!("{name}{{quantile=\"0.95\"}} {}\n", s.p95));
            out.push_str(&format!("{name}{{quantile=\"0.99\"}} {}\n", s.p99));
        }

        out
    }
}

static GLOBAL_METRICS: LazyLock<KbMetrics> = LazyLock::new(KbMetrics::default);

/// The process-global metrics registry.
#[must_use]
pub fn global_metrics() -> &'static KbMetrics {
    &GLOBAL_METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let c = Counter::new();
        c.inc();
        c.add(4);
        assert_eq!(c.load(), 5);
    }

    #[test]
    fn histogram_snapshot_orders_quantiles() {
        let h = Log2Histogram::new();
        for v in [10u64, 20, 40, 80, 1_000, 10_000] {
            h.record(v);
        }
        let s = h.snapshot();
        assert_eq!(s.count, 6);
        assert_eq!(s.min, 10);
        assert_eq!(s.max, 10_000);
        assert!(s.p50 <= s.p95 && s.p95 <= s.p99);
    }

    #[test]
    fn empty_histogram_snapshot_is_zeroed() {
        let h = Log2Histogram::new();
        let s = h.snapshot();
        assert_eq!(s.count, 0);
        assert_eq!(s.p99, 0);
    }

    #[test]
    fn prometheus_exposition_includes_prefixed_families() {
        let m = KbMetrics::default();
        m.query.queries_total.inc();
        m.query.latency_us.record(1234);
        let text = m.render_prometheus();
        assert!(text.contains("# TYPE kb_queries_total counter"));
        assert!(text.contains("kb_queries_total 1"));
        assert!(text.contains("kb_query_latency_us_count 1"));
        assert!(text.contains("quantile=\"0.99\""));
    }

    #[test]
    fn bucket_index_is_monotone() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1), 0);
        assert_eq!(bucket_index(2), 1);
        assert!(bucket_index(u64::MAX) < LOG2_BUCKETS);
        let mut prev = 0;
        for v in [1u64, 3, 9, 100, 5_000, 1 << 30] {
            let idx = bucket_index(v);
            assert!(idx >= prev);
            prev = idx;
        }
    }
}
