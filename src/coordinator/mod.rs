//! Coordinator composition root: owns the allocator, caches and ingestion
//! task, and routes request envelopes to endpoints.

mod batches;
mod dashboard;
mod features;
mod ingest;
mod sessions;

pub use ingest::{IngestHandle, IngestMessage};

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::allocator::{AllocationError, AllocatorConfig, BatchAllocator};
use crate::config::Config;
use crate::epoch::EpochLifecycle;
use crate::metrics::{CoordinatorMetrics, SharedCoordinatorMetrics};
use crate::progress::ProgressEstimator;
use crate::protocol::{FeatureWorkItem, HostRecordView, ImageView, Request, RequestType, Response};
use crate::response_cache::ResponseCache;
use crate::store::{Store, StoreError};
use crate::work_queue::{RandomPool, WorkQueueCache};

use features::{FeatureWorkSource, HostRecordSource, ImageSource};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("malformed JSON data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request data is required for {0}")]
    MissingPayload(&'static str),

    #[error("a worker id is required for {0}")]
    MissingWorkerId(&'static str),

    #[error("header name is required in request data")]
    EmptyHeaderName,

    #[error("no records found")]
    NoRecords,

    #[error("no images found")]
    NoImages,

    #[error("ingestion task is not running")]
    IngestClosed,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub allocator: AllocatorConfig,
    pub feature_page_size: usize,
    pub feature_queue_target: usize,
    pub feature_queue_low_water: usize,
    pub random_queue_target: usize,
    pub random_queue_low_water: usize,
    pub recent_capacity: usize,
    pub warmer_interval: Duration,
    pub progress_log_interval: Duration,
    /// Spawn the cache warmer and progress reporter.
    pub background_tasks: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            allocator: AllocatorConfig::default(),
            feature_page_size: Config::FEATURE_PAGE_SIZE,
            feature_queue_target: Config::FEATURE_QUEUE_TARGET,
            feature_queue_low_water: Config::FEATURE_QUEUE_LOW_WATER,
            random_queue_target: Config::RANDOM_QUEUE_TARGET,
            random_queue_low_water: Config::RANDOM_QUEUE_LOW_WATER,
            recent_capacity: Config::RECENT_RING_CAPACITY,
            warmer_interval: Duration::from_secs(Config::WARMER_INTERVAL_SECS),
            progress_log_interval: Duration::from_secs(Config::PROGRESS_LOG_INTERVAL_SECS),
            background_tasks: true,
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn Store>,
    progress: Arc<ProgressEstimator>,
    allocator: BatchAllocator,
    feature_queue: Arc<WorkQueueCache<FeatureWorkItem>>,
    random_records: Arc<RandomPool<HostRecordView>>,
    random_images: Arc<RandomPool<ImageView>>,
    responses: ResponseCache,
    ingest: IngestHandle,
    metrics: SharedCoordinatorMetrics,
}

impl Coordinator {
    /// Wire every service, recover the allocation cursor and spawn the
    /// background tasks. Must be called inside a tokio runtime.
    #[tracing::instrument(skip(config, store))]
    pub async fn start(config: CoordinatorConfig, store: Arc<dyn Store>) -> Result<Arc<Self>, CoordinatorError> {
        let metrics: SharedCoordinatorMetrics = Arc::new(CoordinatorMetrics::default());
        let epochs = Arc::new(EpochLifecycle::new(Arc::clone(&store)));
        let progress = Arc::new(ProgressEstimator::new());
        let allocator = BatchAllocator::new(
            config.allocator.clone(),
            Arc::clone(&store),
            Arc::clone(&epochs),
            Arc::clone(&progress),
        );
        let next_start = allocator.recover_cursor().await?;

        let feature_queue = Arc::new(WorkQueueCache::new(
            "feature-work",
            Arc::new(FeatureWorkSource::new(Arc::clone(&store))),
            config.feature_queue_target,
            config.feature_queue_low_water,
        ));
        let random_records = Arc::new(RandomPool::new(
            config.recent_capacity,
            WorkQueueCache::new(
                "random-records",
                Arc::new(HostRecordSource::new(Arc::clone(&store))),
                config.random_queue_target,
                config.random_queue_low_water,
            ),
        ));
        let random_images = Arc::new(RandomPool::new(
            config.recent_capacity,
            WorkQueueCache::new(
                "random-images",
                Arc::new(ImageSource::new(Arc::clone(&store))),
                config.random_queue_target,
                config.random_queue_low_water,
            ),
        ));

        let ingest = IngestHandle::spawn(
            Arc::clone(&store),
            Arc::clone(&random_records),
            Arc::clone(&random_images),
            Arc::clone(&metrics),
        );

        let coordinator = Arc::new(Self {
            config,
            store,
            progress,
            allocator,
            feature_queue,
            random_records,
            random_images,
            responses: ResponseCache::new(),
            ingest,
            metrics,
        });

        if coordinator.config.background_tasks {
            spawn_warmer(Arc::downgrade(&coordinator), coordinator.config.warmer_interval);
            spawn_reporter(Arc::downgrade(&coordinator), coordinator.config.progress_log_interval);
        }

        info!(next_start, "coordinator started");
        Ok(coordinator)
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    pub fn progress(&self) -> &ProgressEstimator {
        &self.progress
    }

    /// Wait until every submission accepted so far has been persisted.
    pub async fn flush(&self) {
        self.ingest.flush().await;
    }

    /// Persist everything queued and stop ingestion. Submissions that carry
    /// hosts are refused afterwards without touching batch state.
    pub async fn shutdown(&self) {
        self.ingest.close().await;
    }

    /// Route one envelope. Never fails: errors and panics become
    /// unsuccessful responses.
    pub async fn handle(&self, request: Request) -> Response {
        self.metrics.requests_total.inc();
        let request_type = request.request_type;

        let response = match AssertUnwindSafe(self.route(request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!(request = request_type.as_str(), error = %e, "request rejected");
                Response::failure(e.to_string())
            }
            Err(_) => {
                self.metrics.handler_panics.inc();
                error!(request = request_type.as_str(), "request handler panicked");
                Response::failure("internal error while handling request")
            }
        };

        if !response.success {
            self.metrics.requests_failed.inc();
        }
        response
    }

    async fn route(&self, request: Request) -> Result<Response, CoordinatorError> {
        if request.request_type.is_worker_facing()
            && request.request_type != RequestType::Connect
            && let Some(worker_id) = request.worker_id.as_deref()
        {
            self.touch_session(worker_id).await;
        }

        match request.request_type {
            RequestType::Connect => self.connect(&request).await,
            RequestType::NewAddressRange => self.new_address_range(&request).await,
            RequestType::SubmitAddressRange => self.submit_address_range(&request).await,
            RequestType::NewFeatureRange => self.new_feature_range().await,
            RequestType::SubmitFeatureRange => self.submit_feature_range(&request),
            RequestType::SearchFeatures => self.search_features(&request).await,
            RequestType::GetRandomRecord => self.random_record().await,
            RequestType::GetRandomImage => self.random_image().await,
            RequestType::ProgressStats
            | RequestType::RecentlyActiveWorkers
            | RequestType::AddressDistributionStats
            | RequestType::HeaderNameStats
            | RequestType::HeaderValueStats => self.cached_aggregate(&request).await,
        }
    }
}

fn spawn_warmer(coordinator: Weak<Coordinator>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(coordinator) = coordinator.upgrade() else {
                break;
            };
            coordinator.warm_caches().await;
        }
    });
}

fn spawn_reporter(coordinator: Weak<Coordinator>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(coordinator) = coordinator.upgrade() else {
                break;
            };
            let progress = coordinator.progress();
            info!(
                cursor = %crate::address::index_to_address(progress.current_index()),
                percent = format!("{:.4}", progress.percent_complete()),
                eta = %crate::progress::format_eta(progress.eta()),
                queued_features = coordinator.feature_queue.len(),
                "progress"
            );
            coordinator.metrics.log_summary();
            if coordinator.ingest.is_closed() {
                warn!("ingestion task has stopped; submissions are being rejected");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeaturePayload, RequestMethod};
    use crate::protocol::{
        ConnectResponse, DiscoveredHost, FeatureRange, NewAddressRange, SubmitAddressRange,
    };
    use crate::store::MemoryStore;

    pub(super) async fn coordinator() -> (Arc<Coordinator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = CoordinatorConfig {
            allocator: AllocatorConfig {
                validation_probability: 0.0,
                ..AllocatorConfig::default()
            },
            background_tasks: false,
            ..CoordinatorConfig::default()
        };
        let coordinator = Coordinator::start(config, store.clone()).await.unwrap();
        (coordinator, store)
    }

    pub(super) async fn connect(coordinator: &Coordinator, nickname: &str) -> String {
        let mut request = Request::new(RequestType::Connect);
        request.nickname = Some(nickname.to_string());
        let response = coordinator.handle(request).await;
        response.decode::<ConnectResponse>().unwrap().unwrap().worker_id
    }

    pub(super) fn host(index: u32, features: Vec<FeaturePayload>) -> DiscoveredHost {
        DiscoveredHost {
            address_index: index,
            address: crate::address::index_to_address(index),
            hostname: format!("host{}.example", index),
            method: RequestMethod::Https,
            headers: vec![crate::models::HeaderEntry {
                name: "Server".into(),
                value: "nginx".into(),
            }],
            features,
        }
    }

    /// Allocate a batch for `worker_id` and submit `hosts` against it.
    pub(super) async fn submit_hosts(coordinator: &Coordinator, worker_id: &str, hosts: Vec<DiscoveredHost>) -> Response {
        let mut request = Request::new(RequestType::NewAddressRange);
        request.worker_id = Some(worker_id.to_string());
        let range: NewAddressRange = coordinator.handle(request).await.decode().unwrap().unwrap();

        let mut submit = Request::new(RequestType::SubmitAddressRange)
            .with_data(&SubmitAddressRange {
                batch_id: range.batch_id,
                hosts,
            })
            .unwrap();
        submit.worker_id = Some(worker_id.to_string());
        coordinator.handle(submit).await
    }

    #[tokio::test]
    async fn test_malformed_payload_is_a_failure_response() {
        let (coordinator, _) = coordinator().await;
        let mut request = Request::new(RequestType::SubmitAddressRange);
        request.worker_id = Some("w".into());
        request.data = Some(serde_json::json!({ "batchId": 7 }));
        let response = coordinator.handle(request).await;
        assert!(!response.success);
        assert!(response.message.unwrap().contains("malformed"));
        assert_eq!(coordinator.metrics().requests_failed.get(), 1);
    }

    #[tokio::test]
    async fn test_feature_range_round_trip() {
        let (coordinator, _) = coordinator().await;
        let worker = connect(&coordinator, "elaborator").await;
        let features = vec![
            FeaturePayload::Title("t".into()),
            FeaturePayload::Image("https://203.0.113.1/a.png".into()),
        ];
        assert!(submit_hosts(&coordinator, &worker, vec![host(20, features)]).await.success);
        coordinator.flush().await;

        let response = coordinator.handle(Request::new(RequestType::NewFeatureRange)).await;
        let range: FeatureRange = response.decode().unwrap().unwrap();
        assert_eq!(range.items.len(), 1);
        assert_eq!(range.items[0].hostname, "host20.example");
        assert!(matches!(range.items[0].payload, FeaturePayload::Image(_)));
    }
}
