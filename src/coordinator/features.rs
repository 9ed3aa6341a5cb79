use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{Coordinator, CoordinatorError, IngestMessage};
use crate::models::HostRecord;
use crate::protocol::{FeatureRange, FeatureWorkItem, HostRecordView, ImageView, Request, Response, SubmitFeatureRange};
use crate::store::{Store, StoreError};
use crate::work_queue::QueueSource;

impl Coordinator {
    pub(super) async fn new_feature_range(&self) -> Result<Response, CoordinatorError> {
        let items = self.feature_queue.take(self.config.feature_page_size).await?;
        info!(items = items.len(), "feature range assigned");
        Ok(Response::ok(&FeatureRange { items })?.with_message("fetched feature range records"))
    }

    /// Acknowledged before anything is written.
    pub(super) fn submit_feature_range(&self, request: &Request) -> Result<Response, CoordinatorError> {
        let submission: SubmitFeatureRange = request.payload_or_default()?;
        let count = submission.features.len();
        if count > 0 {
            self.ingest.submit(IngestMessage::Elaborations(submission.features))?;
        }
        Ok(Response::success(serde_json::Value::Null)
            .with_message(format!("{} elaborated features accepted for processing", count)))
    }
}

/// Memoizes host lookups across one refill.
struct HostLookup<'a> {
    store: &'a dyn Store,
    hosts: HashMap<String, Option<HostRecord>>,
}

impl<'a> HostLookup<'a> {
    fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            hosts: HashMap::new(),
        }
    }

    async fn get(&mut self, id: &str) -> Result<Option<HostRecord>, StoreError> {
        if let Some(cached) = self.hosts.get(id) {
            return Ok(cached.clone());
        }
        let host = self.store.get_host_record(id).await?;
        self.hosts.insert(id.to_string(), host.clone());
        Ok(host)
    }
}

/// Unelaborated link/image features joined with their host context.
pub(super) struct FeatureWorkSource {
    store: Arc<dyn Store>,
}

impl FeatureWorkSource {
    pub(super) fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueueSource<FeatureWorkItem> for FeatureWorkSource {
    async fn fetch(&self, limit: usize) -> Result<Vec<FeatureWorkItem>, StoreError> {
        let features = self.store.sample_unelaborated(limit).await?;
        let mut hosts = HostLookup::new(self.store.as_ref());
        let mut items = Vec::with_capacity(features.len());
        for feature in features {
            let Some(host) = hosts.get(&feature.host_record_id).await? else {
                continue;
            };
            items.push(FeatureWorkItem {
                feature_id: feature.id,
                host_record_id: host.id,
                payload: feature.payload,
                hostname: host.hostname,
                address: host.address,
                method: host.method,
            });
        }
        Ok(items)
    }
}

pub(super) struct HostRecordSource {
    store: Arc<dyn Store>,
}

impl HostRecordSource {
    pub(super) fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueueSource<HostRecordView> for HostRecordSource {
    async fn fetch(&self, limit: usize) -> Result<Vec<HostRecordView>, StoreError> {
        let records = self.store.sample_host_records(limit).await?;
        let mut views = Vec::with_capacity(records.len());
        for record in records {
            let features = self.store.features_for_host(&record.id).await?;
            views.push(HostRecordView { record, features });
        }
        Ok(views)
    }
}

pub(super) struct ImageSource {
    store: Arc<dyn Store>,
}

impl ImageSource {
    pub(super) fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueueSource<ImageView> for ImageSource {
    async fn fetch(&self, limit: usize) -> Result<Vec<ImageView>, StoreError> {
        let features = self.store.sample_base64_features(limit).await?;
        let mut hosts = HostLookup::new(self.store.as_ref());
        let mut views = Vec::with_capacity(features.len());
        for feature in features {
            if let Some(host) = hosts.get(&feature.host_record_id).await? {
                views.push(ImageView { feature, host });
            }
        }
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{connect, coordinator, host, submit_hosts};
    use super::*;
    use crate::models::{Feature, FeatureKind, FeaturePayload};
    use crate::protocol::{ElaboratedFeature, RequestType};

    #[tokio::test]
    async fn test_work_source_skips_orphans() {
        let (_, store) = coordinator().await;
        let orphan = Feature::root("missing-host", FeaturePayload::Link("https://x.example/".into()));
        store.save_features(&[orphan]).await.unwrap();

        let source = FeatureWorkSource::new(store);
        assert!(source.fetch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submitted_children_are_attached_and_parent_marked() {
        let (coordinator, store) = coordinator().await;
        let worker = connect(&coordinator, "elaborator").await;
        let image = FeaturePayload::Image("https://203.0.113.1/a.png".into());
        assert!(submit_hosts(&coordinator, &worker, vec![host(30, vec![image])]).await.success);
        coordinator.flush().await;

        let item = FeatureWorkSource::new(store.clone()).fetch(5).await.unwrap().remove(0);
        let request = Request::new(RequestType::SubmitFeatureRange)
            .with_data(&SubmitFeatureRange {
                features: vec![ElaboratedFeature {
                    parent_id: item.feature_id.clone(),
                    payload: FeaturePayload::Base64(vec![1, 2, 3]),
                }],
            })
            .unwrap();
        let response = coordinator.handle(request).await;
        assert!(response.success);
        coordinator.flush().await;

        let parent = store.get_feature(&item.feature_id).await.unwrap().unwrap();
        assert!(parent.elaborated);
        let family = store.features_for_host(&item.host_record_id).await.unwrap();
        let child = family.iter().find(|f| f.payload.kind() == FeatureKind::Base64).unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(item.feature_id.as_str()));

        let record = store.get_host_record(&item.host_record_id).await.unwrap().unwrap();
        assert!(record.features_elaborated);
        assert!(store.sample_unelaborated(10).await.unwrap().is_empty());
    }
}
