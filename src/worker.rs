//! Worker side: connect once, then loop search/elaborate cycles against the
//! coordinator with a bounded number of failed attempts.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::address::enumerate_range;
use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::elaborator::Elaborate;
use crate::metrics::{SharedWorkerMetrics, WorkerMetrics};
use crate::models::RequestMethod;
use crate::network::FetchError;
use crate::prober::Probe;
use crate::protocol::{
    ConnectResponse, ElaboratedFeature, FeatureRange, NewAddressRange, Request, RequestType, Response,
    SubmitAddressRange, SubmitFeatureRange,
};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("coordinator unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid coordinator endpoint '{0}'")]
    InvalidEndpoint(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("{request} rejected: {message}")]
    Rejected { request: &'static str, message: String },

    #[error("{0} response carried no data")]
    MissingData(&'static str),

    #[error("malformed response data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to configure HTTP client: {0}")]
    Fetch(#[from] FetchError),

    #[error("giving up after {0} failed attempts")]
    Exhausted(u32),
}

/// Carries one request envelope to the coordinator and its reply back.
#[async_trait]
pub trait CoordinatorLink: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, LinkError>;
}

/// JSON over `POST /`.
pub struct HttpLink {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpLink {
    pub fn new(endpoint: &str) -> Result<Self, LinkError> {
        let endpoint = url::Url::parse(endpoint).map_err(|_| LinkError::InvalidEndpoint(endpoint.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(Config::LINK_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl CoordinatorLink for HttpLink {
    async fn send(&self, request: Request) -> Result<Response, LinkError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Response>().await?)
    }
}

/// Calls a coordinator living in the same process.
pub struct InProcessLink {
    coordinator: Arc<Coordinator>,
}

impl InProcessLink {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl CoordinatorLink for InProcessLink {
    async fn send(&self, request: Request) -> Result<Response, LinkError> {
        Ok(self.coordinator.handle(request).await)
    }
}

/// Identity established by `Connect`, stamped on every later request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub worker_id: String,
    pub nickname: Option<String>,
    pub task_slot: Option<String>,
}

impl Session {
    fn request(&self, request_type: RequestType) -> Request {
        let mut request = Request::new(request_type);
        request.worker_id = Some(self.worker_id.clone());
        request.nickname = self.nickname.clone();
        request.task_slot = self.task_slot.clone();
        request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Search,
    Elaborate,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub nickname: Option<String>,
    pub task_slot: Option<String>,
    pub max_concurrent: usize,
    /// Also probe plain HTTP alongside HTTPS.
    pub probe_http: bool,
    pub search_probability: f64,
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
    /// Stop after this many successful cycles; `None` runs forever.
    pub max_cycles: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            nickname: None,
            task_slot: None,
            max_concurrent: Config::DEFAULT_MAX_CONCURRENT_FETCHES,
            probe_http: false,
            search_probability: Config::SEARCH_PROBABILITY,
            max_attempts: Config::MAX_WORKER_ATTEMPTS,
            backoff: ExponentialBackoff::new(Config::RETRY_BASE_MS, Config::RETRY_MAX_MS).with_jitter(20),
            max_cycles: None,
        }
    }
}

impl WorkerConfig {
    pub fn choose_action(&self, roll: f64) -> Action {
        if roll < self.search_probability {
            Action::Search
        } else {
            Action::Elaborate
        }
    }

    fn methods(&self) -> Vec<RequestMethod> {
        if self.probe_http {
            vec![RequestMethod::Https, RequestMethod::Http]
        } else {
            vec![RequestMethod::Https]
        }
    }
}

pub struct CrawlWorker {
    config: WorkerConfig,
    link: Arc<dyn CoordinatorLink>,
    prober: Arc<dyn Probe>,
    elaborator: Arc<dyn Elaborate>,
    metrics: SharedWorkerMetrics,
}

impl CrawlWorker {
    pub fn new(
        config: WorkerConfig,
        link: Arc<dyn CoordinatorLink>,
        prober: Arc<dyn Probe>,
        elaborator: Arc<dyn Elaborate>,
    ) -> Self {
        Self {
            config,
            link,
            prober,
            elaborator,
            metrics: Arc::new(WorkerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Run until `max_cycles` is reached or `max_attempts` failures have
    /// accumulated, sleeping with backoff after each failure.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let mut session: Option<Session> = None;
        let mut failures = 0u32;

        loop {
            let result = match session.take() {
                Some(current) => {
                    let result = self.run_cycles(&current).await;
                    session = Some(current);
                    result
                }
                None => match self.connect().await {
                    Ok(connected) => {
                        session = Some(connected);
                        continue;
                    }
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(()) => {
                    self.metrics.log_summary();
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.cycles_failed.inc();
                    error!(attempt = failures, max = self.config.max_attempts, error = %e, "worker cycle failed");
                    if failures >= self.config.max_attempts {
                        self.metrics.log_summary();
                        return Err(WorkerError::Exhausted(failures));
                    }
                    tokio::time::sleep(self.config.backoff.delay(failures - 1)).await;
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<Session, WorkerError> {
        let mut request = Request::new(RequestType::Connect);
        request.nickname = self.config.nickname.clone();
        request.task_slot = self.config.task_slot.clone();

        let connected: ConnectResponse = self.call("Connect", request).await?;
        info!(worker = %connected.worker_id, "connected to coordinator");
        Ok(Session {
            worker_id: connected.worker_id,
            nickname: self.config.nickname.clone(),
            task_slot: self.config.task_slot.clone(),
        })
    }

    async fn run_cycles(&self, session: &Session) -> Result<(), WorkerError> {
        loop {
            if let Some(max) = self.config.max_cycles
                && self.metrics.cycles_completed.get() >= max
            {
                return Ok(());
            }
            let action = self.config.choose_action(rand::random::<f64>());
            self.run_once(session, action).await?;
            self.metrics.cycles_completed.inc();
        }
    }

    pub async fn run_once(&self, session: &Session, action: Action) -> Result<(), WorkerError> {
        match action {
            Action::Search => self.search(session).await,
            Action::Elaborate => self.elaborate(session).await,
        }
    }

    /// Probe every address of a fresh batch and report what answered.
    async fn search(&self, session: &Session) -> Result<(), WorkerError> {
        let range: NewAddressRange = self
            .call("NewAddressRange", session.request(RequestType::NewAddressRange))
            .await?;

        let timeout = if range.is_validation {
            Config::VALIDATION_PROBE_TIMEOUT_SECS
        } else {
            Config::PROBE_TIMEOUT_SECS
        };
        self.prober.set_timeout(Duration::from_secs(timeout))?;

        let methods = self.config.methods();
        let targets = enumerate_range(range.start, range.count)
            .flat_map(|(index, address)| methods.iter().map(move |method| (index, address.clone(), *method)));

        let prober = Arc::clone(&self.prober);
        let hosts = fan_out(targets, self.config.max_concurrent, |(index, address, method)| {
            let prober = Arc::clone(&prober);
            async move { prober.probe(index, &address, method).await }
        })
        .await;

        let submission = SubmitAddressRange {
            batch_id: range.batch_id,
            hosts,
        };
        let found = submission.found_count();
        self.metrics.addresses_probed.add(range.count as u64);
        self.metrics.hosts_found.add(found as u64);
        info!(
            batch = %submission.batch_id,
            validation = range.is_validation,
            found,
            responses = submission.hosts.len(),
            "address range searched"
        );

        let submit = session.request(RequestType::SubmitAddressRange).with_data(&submission)?;
        let response = self.link.send(submit).await?;
        if !response.success {
            warn!(message = ?response.message, "address range submission rejected");
        }
        Ok(())
    }

    /// Deepen a page of features and report the children produced.
    async fn elaborate(&self, session: &Session) -> Result<(), WorkerError> {
        let response = self.link.send(session.request(RequestType::NewFeatureRange)).await?;
        if !response.success {
            warn!(message = ?response.message, "feature range unavailable");
            return Ok(());
        }
        let range: FeatureRange = response.decode()?.unwrap_or_default();
        if range.items.is_empty() {
            return Ok(());
        }

        let item_count = range.items.len();
        let elaborator = Arc::clone(&self.elaborator);
        let children: Vec<ElaboratedFeature> = fan_out(range.items, self.config.max_concurrent, |item| {
            let elaborator = Arc::clone(&elaborator);
            async move {
                let payloads = elaborator.elaborate(&item).await?;
                Some(
                    payloads
                        .into_iter()
                        .map(|payload| ElaboratedFeature {
                            parent_id: item.feature_id.clone(),
                            payload,
                        })
                        .collect::<Vec<_>>(),
                )
            }
        })
        .await
        .into_iter()
        .flatten()
        .collect();

        self.metrics.features_elaborated.add(item_count as u64);
        self.metrics.children_produced.add(children.len() as u64);
        info!(items = item_count, children = children.len(), "feature range elaborated");
        if children.is_empty() {
            return Ok(());
        }

        let submit = session
            .request(RequestType::SubmitFeatureRange)
            .with_data(&SubmitFeatureRange { features: children })?;
        let response = self.link.send(submit).await?;
        if !response.success {
            warn!(message = ?response.message, "feature submission rejected");
        }
        Ok(())
    }

    /// Send `request` and decode its data; an unsuccessful reply is an error.
    async fn call<T: DeserializeOwned>(&self, name: &'static str, request: Request) -> Result<T, WorkerError> {
        let response = self.link.send(request).await?;
        if !response.success {
            return Err(WorkerError::Rejected {
                request: name,
                message: response.message.unwrap_or_default(),
            });
        }
        response.decode()?.ok_or(WorkerError::MissingData(name))
    }
}

/// Run `task` over `items` with at most `limit` in flight, keeping the
/// `Some` results in completion order.
async fn fan_out<I, T, F, Fut>(items: I, limit: usize, task: F) -> Vec<T>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Option<T>> + Send + 'static,
    T: Send + 'static,
{
    let limit = limit.max(1);
    let mut items = items.into_iter();
    let mut in_flight = JoinSet::new();
    let mut results = Vec::new();

    loop {
        while in_flight.len() < limit {
            match items.next() {
                Some(item) => {
                    in_flight.spawn(task(item));
                }
                None => break,
            }
        }

        match in_flight.join_next().await {
            Some(Ok(Some(result))) => results.push(result),
            Some(Ok(None)) => {}
            Some(Err(e)) => warn!(error = %e, "fan-out task failed"),
            None => break,
        }
    }
    results
}
