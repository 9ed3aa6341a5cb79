use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Lock-free monotonic counter.
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters maintained by the coordinator's endpoints and background tasks.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub requests_total: Counter,
    pub requests_failed: Counter,
    pub handler_panics: Counter,
    pub batches_issued: Counter,
    pub batches_reclaimed: Counter,
    pub validations_issued: Counter,
    pub validations_failed: Counter,
    pub hosts_ingested: Counter,
    pub features_ingested: Counter,
    pub ingest_failures: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_refreshes: Counter,
}

impl CoordinatorMetrics {
    pub fn log_summary(&self) {
        info!(
            requests = self.requests_total.get(),
            failed = self.requests_failed.get(),
            panics = self.handler_panics.get(),
            batches = self.batches_issued.get(),
            reclaimed = self.batches_reclaimed.get(),
            validations = self.validations_issued.get(),
            validation_failures = self.validations_failed.get(),
            hosts = self.hosts_ingested.get(),
            features = self.features_ingested.get(),
            ingest_failures = self.ingest_failures.get(),
            cache_hits = self.cache_hits.get(),
            cache_misses = self.cache_misses.get(),
            cache_refreshes = self.cache_refreshes.get(),
            "coordinator counters"
        );
    }
}

/// Counters maintained by one worker process.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub cycles_completed: Counter,
    pub cycles_failed: Counter,
    pub addresses_probed: Counter,
    pub hosts_found: Counter,
    pub features_elaborated: Counter,
    pub children_produced: Counter,
}

impl WorkerMetrics {
    pub fn log_summary(&self) {
        info!(
            cycles = self.cycles_completed.get(),
            failed = self.cycles_failed.get(),
            probed = self.addresses_probed.get(),
            hosts = self.hosts_found.get(),
            elaborated = self.features_elaborated.get(),
            children = self.children_produced.get(),
            "worker counters"
        );
    }
}

pub type SharedCoordinatorMetrics = Arc<CoordinatorMetrics>;
pub type SharedWorkerMetrics = Arc<WorkerMetrics>;
