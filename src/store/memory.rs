use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::{IteratorRandom, SliceRandom};
use std::collections::{BTreeMap, BTreeSet};

use super::{Store, StoreError, feature_matches, is_unelaborated_work};
use crate::models::{AddressBatch, Epoch, Feature, FeatureKind, HeaderEntry, HostRecord, WorkerSession};

/// Process-local store used by tests and `serve --in-memory`.
#[derive(Default)]
pub struct MemoryStore {
    epochs: RwLock<BTreeMap<u32, Epoch>>,
    batches: RwLock<BTreeMap<String, AddressBatch>>,
    sessions: RwLock<BTreeMap<String, WorkerSession>>,
    hosts: RwLock<BTreeMap<String, HostRecord>>,
    features: RwLock<BTreeMap<String, Feature>>,
    /// Feature ids per host record.
    host_features: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn validation_candidates(&self, epoch: u32, worker_id: &str, cutoff: u64) -> Vec<AddressBatch> {
        self.batches
            .read()
            .values()
            .filter(|b| b.is_validation_candidate(epoch, worker_id, cutoff))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn latest_epoch(&self) -> Result<Option<Epoch>, StoreError> {
        Ok(self.epochs.read().values().next_back().cloned())
    }

    async fn save_epoch(&self, epoch: &Epoch) -> Result<(), StoreError> {
        self.epochs.write().insert(epoch.ordinal, epoch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<AddressBatch>, StoreError> {
        Ok(self.batches.read().get(id).cloned())
    }

    async fn save_batch(&self, batch: &AddressBatch) -> Result<(), StoreError> {
        self.batches.write().insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn latest_batch_in_epoch(&self, epoch: u32) -> Result<Option<AddressBatch>, StoreError> {
        Ok(self
            .batches
            .read()
            .values()
            .filter(|b| b.epoch == epoch)
            .max_by_key(|b| b.start)
            .cloned())
    }

    async fn oldest_stale_batch(&self, epoch: u32, cutoff: u64) -> Result<Option<AddressBatch>, StoreError> {
        Ok(self
            .batches
            .read()
            .values()
            .filter(|b| b.is_stale(epoch, cutoff))
            .min_by_key(|b| b.issued_at)
            .cloned())
    }

    async fn count_validation_candidates(
        &self,
        epoch: u32,
        worker_id: &str,
        cutoff: u64,
    ) -> Result<usize, StoreError> {
        Ok(self.validation_candidates(epoch, worker_id, cutoff).len())
    }

    async fn nth_validation_candidate(
        &self,
        epoch: u32,
        worker_id: &str,
        cutoff: u64,
        skip: usize,
    ) -> Result<Option<AddressBatch>, StoreError> {
        Ok(self
            .validation_candidates(epoch, worker_id, cutoff)
            .into_iter()
            .nth(skip))
    }

    async fn all_batches(&self) -> Result<Vec<AddressBatch>, StoreError> {
        Ok(self.batches.read().values().cloned().collect())
    }

    async fn get_session(&self, id: &str) -> Result<Option<WorkerSession>, StoreError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn find_session_by_slot(&self, nickname: &str, task_slot: &str) -> Result<Option<WorkerSession>, StoreError> {
        Ok(self
            .sessions
            .read()
            .values()
            .find(|s| s.nickname.as_deref() == Some(nickname) && s.task_slot.as_deref() == Some(task_slot))
            .cloned())
    }

    async fn find_session_by_nickname(&self, nickname: &str) -> Result<Option<WorkerSession>, StoreError> {
        Ok(self
            .sessions
            .read()
            .values()
            .find(|s| s.nickname.as_deref() == Some(nickname))
            .cloned())
    }

    async fn save_session(&self, session: &WorkerSession) -> Result<(), StoreError> {
        self.sessions.write().insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn sessions_active_since(&self, since: u64) -> Result<Vec<WorkerSession>, StoreError> {
        let mut active: Vec<_> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.last_active_at >= since)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(active)
    }

    async fn save_host_record(&self, record: &HostRecord) -> Result<(), StoreError> {
        self.hosts.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_host_record(&self, id: &str) -> Result<Option<HostRecord>, StoreError> {
        Ok(self.hosts.read().get(id).cloned())
    }

    async fn sample_host_records(&self, limit: usize) -> Result<Vec<HostRecord>, StoreError> {
        let hosts = self.hosts.read();
        Ok(hosts
            .values()
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), limit))
    }

    async fn count_host_records(&self) -> Result<u64, StoreError> {
        Ok(self.hosts.read().len() as u64)
    }

    async fn all_headers(&self) -> Result<Vec<HeaderEntry>, StoreError> {
        Ok(self
            .hosts
            .read()
            .values()
            .flat_map(|h| h.headers.iter().cloned())
            .collect())
    }

    async fn save_features(&self, features: &[Feature]) -> Result<(), StoreError> {
        let mut table = self.features.write();
        let mut by_host = self.host_features.write();
        for feature in features {
            table.insert(feature.id.clone(), feature.clone());
            by_host
                .entry(feature.host_record_id.clone())
                .or_default()
                .insert(feature.id.clone());
        }
        Ok(())
    }

    async fn get_feature(&self, id: &str) -> Result<Option<Feature>, StoreError> {
        Ok(self.features.read().get(id).cloned())
    }

    async fn features_for_host(&self, host_record_id: &str) -> Result<Vec<Feature>, StoreError> {
        let table = self.features.read();
        let by_host = self.host_features.read();
        Ok(by_host
            .get(host_record_id)
            .into_iter()
            .flatten()
            .filter_map(|id| table.get(id).cloned())
            .collect())
    }

    async fn sample_unelaborated(&self, limit: usize) -> Result<Vec<Feature>, StoreError> {
        let mut work: Vec<_> = self
            .features
            .read()
            .values()
            .filter(|f| is_unelaborated_work(f))
            .cloned()
            .collect();
        work.shuffle(&mut rand::thread_rng());
        work.truncate(limit);
        Ok(work)
    }

    async fn sample_base64_features(&self, limit: usize) -> Result<Vec<Feature>, StoreError> {
        let features = self.features.read();
        Ok(features
            .values()
            .filter(|f| f.payload.kind() == FeatureKind::Base64)
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), limit))
    }

    async fn search_features(&self, query: &str, limit: usize) -> Result<Vec<Feature>, StoreError> {
        let needle = query.to_lowercase();
        Ok(self
            .features
            .read()
            .values()
            .filter(|f| feature_matches(f, &needle))
            .take(limit)
            .cloned()
            .collect())
    }
}
