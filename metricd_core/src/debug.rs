pub use std::sync::atomic::{AtomicUsize, Ordering};

pub static DEBUG: DebugMetrics = DebugMetrics::new();

pub struct DebugMetrics {
    datagram_count: AtomicUsize,
    record_count: AtomicUsize,
    record_errors: AtomicUsize,
    write_count: AtomicUsize,
    write_errors: AtomicUsize,
    series_count: AtomicUsize,
    query_count: AtomicUsize,
    query_errors: AtomicUsize,
    recovery_truncations: AtomicUsize,
    queue_depth: AtomicUsize,
    queue_peak: AtomicUsize,
}

impl DebugMetrics {
    pub const fn new() -> Self {
        DebugMetrics {
            datagram_count: AtomicUsize::new(0),
            record_count: AtomicUsize::new(0),
            record_errors: AtomicUsize::new(0),
            write_count: AtomicUsize::new(0),
            write_errors: AtomicUsize::new(0),
            series_count: AtomicUsize::new(0),
            query_count: AtomicUsize::new(0),
            query_errors: AtomicUsize::new(0),
            recovery_truncations: AtomicUsize::new(0),
            queue_depth: AtomicUsize::new(0),
            queue_peak: AtomicUsize::new(0),
        }
    }

    pub fn datagram_received(&self) {
        self.datagram_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records_accepted(&self, n: usize) {
        self.record_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn records_malformed(&self, n: usize) {
        self.record_errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn write_succeeded(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_failed(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn series_added(&self) {
        self.series_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_succeeded(&self) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_failed(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segment_truncated(&self) {
        self.recovery_truncations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_queued(&self) {
        let depth = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.queue_peak.fetch_max(depth, Ordering::SeqCst);
    }

    pub fn task_finished(&self) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn series_count(&self) -> usize {
        self.series_count.load(Ordering::Relaxed)
    }

    // Log the current metrics and reset the counters
    pub fn publish(&self) {
        let series_count = self.series_count.load(Ordering::Relaxed);
        let queue_depth = self.queue_depth.load(Ordering::Relaxed);
        let queue_peak = self.queue_peak.swap(queue_depth, Ordering::Relaxed);
        let recovery_truncations = self.recovery_truncations.load(Ordering::Relaxed);

        let datagram_count = self.datagram_count.swap(0, Ordering::Relaxed);
        let record_count = self.record_count.swap(0, Ordering::Relaxed);
        let record_errors = self.record_errors.swap(0, Ordering::Relaxed);
        let write_count = self.write_count.swap(0, Ordering::Relaxed);
        let write_errors = self.write_errors.swap(0, Ordering::Relaxed);
        let query_count = self.query_count.swap(0, Ordering::Relaxed);
        let query_errors = self.query_errors.swap(0, Ordering::Relaxed);
        tracing::info!(
            "Debug: datagrams {} | records {} (malformed {}) | writes {} (errors {}) | series {} (truncated on recovery {}) | queries {} (errors {}) | queue (curr {}, peak {})",
            datagram_count,
            record_count,
            record_errors,
            write_count,
            write_errors,
            series_count,
            recovery_truncations,
            query_count,
            query_errors,
            queue_depth,
            queue_peak,
        );
    }
}
