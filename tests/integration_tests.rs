use async_trait::async_trait;
use quadscan::allocator::AllocatorConfig;
use quadscan::elaborator::Elaborate;
use quadscan::models::{HeaderEntry, RequestMethod};
use quadscan::network::FetchError;
use quadscan::prober::Probe;
use quadscan::protocol::{
    ConnectResponse, DiscoveredHost, FeatureWorkItem, HeaderStats, HeaderNameStatsRequest, NewAddressRange,
    ProgressStats,
};
use quadscan::worker::{Action, CoordinatorLink};
use quadscan::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Every 512th address answers with a title and a link.
struct SparseProber;

#[async_trait]
impl Probe for SparseProber {
    async fn probe(&self, address_index: u32, address: &str, method: RequestMethod) -> Option<DiscoveredHost> {
        (address_index % 512 == 0).then(|| DiscoveredHost {
            address_index,
            address: address.to_string(),
            hostname: format!("h{}.test", address_index),
            method,
            headers: vec![
                HeaderEntry {
                    name: "Server".into(),
                    value: if address_index % 1024 == 0 { "nginx".into() } else { "caddy".into() },
                },
                HeaderEntry {
                    name: "X-Frame-Options".into(),
                    value: "DENY".into(),
                },
            ],
            features: vec![
                FeaturePayload::Title(format!("Device {}", address_index)),
                FeaturePayload::Link("/status".into()),
            ],
        })
    }

    fn set_timeout(&self, _timeout: Duration) -> Result<(), FetchError> {
        Ok(())
    }
}

struct StatusPageElaborator;

#[async_trait]
impl Elaborate for StatusPageElaborator {
    async fn elaborate(&self, item: &FeatureWorkItem) -> Option<Vec<FeaturePayload>> {
        Some(vec![FeaturePayload::Text(format!("status of {}", item.hostname))])
    }
}

fn coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        allocator: AllocatorConfig {
            validation_probability: 0.0,
            ..AllocatorConfig::default()
        },
        background_tasks: false,
        ..CoordinatorConfig::default()
    }
}

async fn serve(coordinator: Arc<Coordinator>) -> String {
    let server = CoordinatorServer::bind("127.0.0.1:0", coordinator).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    format!("http://{}/", addr)
}

fn connect_request(nickname: &str) -> Request {
    let mut request = Request::new(RequestType::Connect);
    request.nickname = Some(nickname.to_string());
    request
}

#[tokio::test]
async fn test_reconnect_with_same_nickname_keeps_worker_id() {
    let coordinator = Coordinator::start(coordinator_config(), Arc::new(MemoryStore::new())).await.unwrap();
    let link = HttpLink::new(&serve(coordinator).await).unwrap();

    let first: ConnectResponse = link.send(connect_request("rack-7")).await.unwrap().decode().unwrap().unwrap();
    let second: ConnectResponse = link.send(connect_request("rack-7")).await.unwrap().decode().unwrap().unwrap();
    let other: ConnectResponse = link.send(connect_request("rack-8")).await.unwrap().decode().unwrap().unwrap();

    assert_eq!(first.worker_id, second.worker_id);
    assert_ne!(first.worker_id, other.worker_id);
}

#[tokio::test]
async fn test_worker_over_http_end_to_end() {
    let coordinator = Coordinator::start(coordinator_config(), Arc::new(MemoryStore::new())).await.unwrap();
    let url = serve(Arc::clone(&coordinator)).await;

    let worker = CrawlWorker::new(
        WorkerConfig {
            nickname: Some("e2e".into()),
            max_concurrent: 32,
            ..WorkerConfig::default()
        },
        Arc::new(HttpLink::new(&url).unwrap()),
        Arc::new(SparseProber),
        Arc::new(StatusPageElaborator),
    );
    let session = worker.connect().await.unwrap();
    worker.run_once(&session, Action::Search).await.unwrap();
    coordinator.flush().await;
    worker.run_once(&session, Action::Elaborate).await.unwrap();
    coordinator.flush().await;

    assert_eq!(worker.metrics().hosts_found.get(), 8);
    assert_eq!(worker.metrics().children_produced.get(), 8);

    let link = HttpLink::new(&url).unwrap();
    let progress: ProgressStats = link
        .send(Request::new(RequestType::ProgressStats))
        .await
        .unwrap()
        .decode()
        .unwrap()
        .unwrap();
    assert_eq!(progress.found_hosts, 8);
    assert!(progress.percent_complete > 0.0);

    let headers: HeaderStats = link
        .send(
            Request::new(RequestType::HeaderNameStats)
                .with_data(&HeaderNameStatsRequest { top_n: 1 })
                .unwrap(),
        )
        .await
        .unwrap()
        .decode()
        .unwrap()
        .unwrap();
    assert_eq!(headers.top.len(), 1);
    assert_eq!(headers.top[0].count, 8);

    let search = link
        .send(
            Request::new(RequestType::SearchFeatures)
                .with_data(&serde_json::json!({ "query": "status of" }))
                .unwrap(),
        )
        .await
        .unwrap();
    let hits = search.data.unwrap()["hits"].as_array().unwrap().len();
    assert_eq!(hits, 8);
}

#[tokio::test]
async fn test_durable_store_resumes_cursor_after_restart() {
    let dir = TempDir::new().unwrap();

    let first_start = {
        let store = Arc::new(RedbStore::open(dir.path()).unwrap());
        let coordinator = Coordinator::start(coordinator_config(), store).await.unwrap();
        let link = InProcessLink::new(Arc::clone(&coordinator));
        let worker: ConnectResponse = link.send(connect_request("durable")).await.unwrap().decode().unwrap().unwrap();

        let mut request = Request::new(RequestType::NewAddressRange);
        request.worker_id = Some(worker.worker_id);
        let range: NewAddressRange = link.send(request).await.unwrap().decode().unwrap().unwrap();
        coordinator.flush().await;
        range.start
    };
    // The ingestion task drops its store handle once it sees the channel close.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let store = Arc::new(RedbStore::open(dir.path()).unwrap());
    let coordinator = Coordinator::start(coordinator_config(), store).await.unwrap();
    let link = InProcessLink::new(Arc::clone(&coordinator));
    let worker: ConnectResponse = link.send(connect_request("durable")).await.unwrap().decode().unwrap().unwrap();

    let mut request = Request::new(RequestType::NewAddressRange);
    request.worker_id = Some(worker.worker_id);
    let range: NewAddressRange = link.send(request).await.unwrap().decode().unwrap().unwrap();
    assert_eq!(range.start, first_start + quadscan::config::Config::BATCH_STEP);
}
