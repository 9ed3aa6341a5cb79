//! Asynchronous persistence of worker submissions.
//!
//! One task drains the channel in order. A record that fails to persist is
//! logged and skipped; it never stalls the rest of the submission.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::CoordinatorError;
use crate::metrics::SharedCoordinatorMetrics;
use crate::models::{Feature, FeatureKind, FeaturePayload, HostRecord, now_secs, random_id};
use crate::protocol::{DiscoveredHost, ElaboratedFeature, HostRecordView, ImageView};
use crate::store::{Store, StoreError, is_unelaborated_work};
use crate::work_queue::RandomPool;

pub enum IngestMessage {
    Hosts {
        worker_id: String,
        epoch: u32,
        hosts: Vec<DiscoveredHost>,
    },
    Elaborations(Vec<ElaboratedFeature>),
    /// Answered once every earlier message has been processed.
    Flush(oneshot::Sender<()>),
    /// Stop accepting messages, drain what is queued, then answer.
    Close(oneshot::Sender<()>),
}

/// Sending half of the ingestion task.
pub struct IngestHandle {
    tx: mpsc::UnboundedSender<IngestMessage>,
}

impl IngestHandle {
    pub fn spawn(
        store: Arc<dyn Store>,
        recent_records: Arc<RandomPool<HostRecordView>>,
        recent_images: Arc<RandomPool<ImageView>>,
        metrics: SharedCoordinatorMetrics,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = IngestWriter {
            store,
            recent_records,
            recent_images,
            metrics,
        };
        tokio::spawn(writer.run(rx));
        Self { tx }
    }

    pub fn submit(&self, message: IngestMessage) -> Result<(), CoordinatorError> {
        self.tx.send(message).map_err(|_| CoordinatorError::IngestClosed)
    }

    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(IngestMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drain the queue and stop the task; later submissions fail with `IngestClosed`.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(IngestMessage::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct IngestWriter {
    store: Arc<dyn Store>,
    recent_records: Arc<RandomPool<HostRecordView>>,
    recent_images: Arc<RandomPool<ImageView>>,
    metrics: SharedCoordinatorMetrics,
}

impl IngestWriter {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<IngestMessage>) {
        let mut closed_by = None;
        while let Some(message) = rx.recv().await {
            match message {
                IngestMessage::Hosts { worker_id, epoch, hosts } => {
                    for host in hosts {
                        if let Err(e) = self.save_host(&worker_id, epoch, host).await {
                            self.metrics.ingest_failures.inc();
                            warn!(worker = %worker_id, error = %e, "failed to persist host record");
                        }
                    }
                }
                IngestMessage::Elaborations(features) => self.save_elaborations(features).await,
                IngestMessage::Flush(done) => {
                    let _ = done.send(());
                }
                IngestMessage::Close(done) => {
                    rx.close();
                    closed_by = Some(done);
                }
            }
        }
        debug!("ingestion channel closed");
        if let Some(done) = closed_by {
            let _ = done.send(());
        }
    }

    async fn save_host(&self, worker_id: &str, epoch: u32, host: DiscoveredHost) -> Result<(), StoreError> {
        let id = random_id(24);
        let features: Vec<Feature> = host
            .features
            .into_iter()
            .map(|payload| Feature::root(&id, payload))
            .collect();

        let record = HostRecord {
            id,
            address_index: host.address_index,
            epoch,
            address: host.address,
            hostname: host.hostname,
            found_by: worker_id.to_string(),
            found_at: now_secs(),
            method: host.method,
            headers: host.headers,
            feature_ids: features.iter().map(|f| f.id.clone()).collect(),
            features_elaborated: !features.iter().any(is_unelaborated_work),
        };

        self.store.save_host_record(&record).await?;
        if !features.is_empty() {
            self.store.save_features(&features).await?;
        }

        self.metrics.hosts_ingested.inc();
        self.metrics.features_ingested.add(features.len() as u64);
        self.recent_records.push_recent(HostRecordView { record, features });
        Ok(())
    }

    async fn save_elaborations(&self, features: Vec<ElaboratedFeature>) {
        let mut by_parent: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for feature in features {
            by_parent.entry(feature.parent_id).or_default().push(feature.payload);
        }

        for (parent_id, payloads) in by_parent {
            if let Err(e) = self.save_children(&parent_id, payloads).await {
                self.metrics.ingest_failures.inc();
                warn!(parent = %parent_id, error = %e, "failed to persist elaborated features");
            }
        }
    }

    async fn save_children(&self, parent_id: &str, payloads: Vec<FeaturePayload>) -> Result<(), StoreError> {
        let Some(mut parent) = self.store.get_feature(parent_id).await? else {
            debug!(parent = %parent_id, "elaboration for unknown feature dropped");
            return Ok(());
        };

        let children: Vec<Feature> = payloads.into_iter().map(|p| Feature::child(&parent, p)).collect();
        parent.elaborated = true;

        let mut batch = children.clone();
        batch.push(parent.clone());
        self.store.save_features(&batch).await?;
        self.metrics.features_ingested.add(children.len() as u64);

        let Some(mut record) = self.store.get_host_record(&parent.host_record_id).await? else {
            return Ok(());
        };
        let family = self.store.features_for_host(&record.id).await?;
        record.feature_ids.extend(children.iter().map(|c| c.id.clone()));
        record.features_elaborated = !family.iter().any(is_unelaborated_work);
        self.store.save_host_record(&record).await?;

        for child in children {
            if child.payload.kind() == FeatureKind::Base64 {
                self.recent_images.push_recent(ImageView {
                    feature: child,
                    host: record.clone(),
                });
            }
        }
        Ok(())
    }
}
