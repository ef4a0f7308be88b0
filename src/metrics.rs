use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Global runtime metrics for the collector.
///
/// Purpose:
/// - Track outbound request volume and retries
/// - Track terminal fetch outcomes per variant
/// - Track what the collection cycles wrote (or skipped as duplicates)
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Requests
    pub requests_sent: AtomicUsize,
    pub retries: AtomicUsize,
    pub limiter_waits: AtomicUsize,

    // Terminal outcomes (success is requests_sent minus the rest)
    pub not_found: AtomicUsize,
    pub forbidden: AtomicUsize,
    pub rate_limited: AtomicUsize,
    pub transient_errors: AtomicUsize,
    pub permanent_errors: AtomicUsize,

    // Store
    pub records_appended: AtomicUsize,
    pub records_upserted: AtomicUsize,
    pub dedup_skips: AtomicUsize,
    pub store_errors: AtomicUsize,

    // Cycles
    pub cycles_completed: AtomicUsize,
    pub cycles_failed: AtomicUsize,
}

impl RuntimeMetrics {
    /// One low-noise line for the periodic reporter.
    pub fn summary_line(&self) -> String {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);

        format!(
            "[METRICS] req={} retry={} waits={} 404={} 403={} 429={} transient={} permanent={} appended={} upserted={} dedup={} store_err={} cycles={} cycles_failed={}",
            get(&self.requests_sent),
            get(&self.retries),
            get(&self.limiter_waits),
            get(&self.not_found),
            get(&self.forbidden),
            get(&self.rate_limited),
            get(&self.transient_errors),
            get(&self.permanent_errors),
            get(&self.records_appended),
            get(&self.records_upserted),
            get(&self.dedup_skips),
            get(&self.store_errors),
            get(&self.cycles_completed),
            get(&self.cycles_failed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
