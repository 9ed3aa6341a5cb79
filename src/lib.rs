pub mod address;
pub mod allocator;
pub mod backoff;
pub mod certificate;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod elaborator;
pub mod epoch;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod network;
pub mod parser;
pub mod prober;
pub mod progress;
pub mod protocol;
pub mod response_cache;
pub mod server;
pub mod store;
pub mod work_queue;
pub mod worker;

// Re-export main types for library usage
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
pub use models::{AddressBatch, Feature, FeaturePayload, HostRecord};
pub use network::{FetchError, FetchResult, HttpClient};
pub use parser::extract_features;
pub use protocol::{Request, RequestType, Response};
pub use server::CoordinatorServer;
pub use store::{MemoryStore, RedbStore, Store, StoreError};
pub use worker::{CrawlWorker, HttpLink, InProcessLink, WorkerConfig};
