// Global configuration constants - single source of truth

pub struct Config;

impl Config {
    // Address allocation
    pub const BATCH_STEP: u32 = 4096;
    pub const STALE_BATCH_SECS: u64 = 600;
    pub const VALIDATION_PROBABILITY: f64 = 0.02;

    // Worker loop
    pub const SEARCH_PROBABILITY: f64 = 0.95;
    pub const MAX_WORKER_ATTEMPTS: u32 = 5;
    pub const RETRY_BASE_MS: u64 = 1_000;
    pub const RETRY_MAX_MS: u64 = 30_000;
    pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 64;

    // HTTP/Network config
    pub const PROBE_TIMEOUT_SECS: u64 = 5;
    pub const VALIDATION_PROBE_TIMEOUT_SECS: u64 = 10;
    pub const TLS_CONNECT_TIMEOUT_SECS: u64 = 3;
    pub const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 3;
    pub const MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024; // 10MB
    pub const MAX_REDIRECTS: usize = 5;
    pub const LINK_TIMEOUT_SECS: u64 = 120;

    // Work queues
    pub const FEATURE_PAGE_SIZE: usize = 50;
    pub const FEATURE_QUEUE_TARGET: usize = 5_000;
    pub const FEATURE_QUEUE_LOW_WATER: usize = 1_000;
    pub const RANDOM_QUEUE_TARGET: usize = 20;
    pub const RANDOM_QUEUE_LOW_WATER: usize = 10;
    pub const RECENT_RING_CAPACITY: usize = 100;

    // Dashboard
    pub const SEARCH_RESULT_LIMIT: usize = 10;
    pub const ACTIVE_WORKER_WINDOW_SECS: u64 = 600;
    pub const DEFAULT_DISTRIBUTION_BUCKETS: usize = 128;
    pub const DEFAULT_HEADER_TOP_N: usize = 20;

    // Response cache
    pub const WARMER_INTERVAL_SECS: u64 = 5;
    pub const WARM_MIN_LEAD_SECS: u64 = 5;
    pub const PROGRESS_TTL_SECS: u64 = 60;
    pub const ACTIVE_WORKERS_TTL_SECS: u64 = 300;
    pub const DISTRIBUTION_TTL_SECS: u64 = 600;
    pub const HEADER_STATS_TTL_SECS: u64 = 600;

    // Coordinator housekeeping
    pub const PROGRESS_LOG_INTERVAL_SECS: u64 = 20;
}
