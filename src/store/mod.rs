//! Persistence seam for the coordinator.
//!
//! Every call is fallible and may suspend; callers never assume a store
//! round-trip is cheap.

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{AddressBatch, Epoch, Feature, HeaderEntry, HostRecord, WorkerSession};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("Database creation error: {0}")]
    RedbCreate(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // Epochs
    async fn latest_epoch(&self) -> Result<Option<Epoch>, StoreError>;
    async fn save_epoch(&self, epoch: &Epoch) -> Result<(), StoreError>;

    // Address batches
    async fn get_batch(&self, id: &str) -> Result<Option<AddressBatch>, StoreError>;
    async fn save_batch(&self, batch: &AddressBatch) -> Result<(), StoreError>;
    /// Batch with the highest start in `epoch`.
    async fn latest_batch_in_epoch(&self, epoch: u32) -> Result<Option<AddressBatch>, StoreError>;
    /// Oldest incomplete batch of `epoch` issued before `cutoff`.
    async fn oldest_stale_batch(&self, epoch: u32, cutoff: u64) -> Result<Option<AddressBatch>, StoreError>;
    async fn count_validation_candidates(
        &self,
        epoch: u32,
        worker_id: &str,
        cutoff: u64,
    ) -> Result<usize, StoreError>;
    async fn nth_validation_candidate(
        &self,
        epoch: u32,
        worker_id: &str,
        cutoff: u64,
        skip: usize,
    ) -> Result<Option<AddressBatch>, StoreError>;
    /// All batches ordered by `(epoch, start)`.
    async fn all_batches(&self) -> Result<Vec<AddressBatch>, StoreError>;

    // Worker sessions
    async fn get_session(&self, id: &str) -> Result<Option<WorkerSession>, StoreError>;
    async fn find_session_by_slot(&self, nickname: &str, task_slot: &str) -> Result<Option<WorkerSession>, StoreError>;
    async fn find_session_by_nickname(&self, nickname: &str) -> Result<Option<WorkerSession>, StoreError>;
    async fn save_session(&self, session: &WorkerSession) -> Result<(), StoreError>;
    /// Sessions active at or after `since`, most recent first.
    async fn sessions_active_since(&self, since: u64) -> Result<Vec<WorkerSession>, StoreError>;

    // Host records
    async fn save_host_record(&self, record: &HostRecord) -> Result<(), StoreError>;
    async fn get_host_record(&self, id: &str) -> Result<Option<HostRecord>, StoreError>;
    async fn sample_host_records(&self, limit: usize) -> Result<Vec<HostRecord>, StoreError>;
    async fn count_host_records(&self) -> Result<u64, StoreError>;
    /// Flattened header entries across every host record.
    async fn all_headers(&self) -> Result<Vec<HeaderEntry>, StoreError>;

    // Features
    async fn save_features(&self, features: &[Feature]) -> Result<(), StoreError>;
    async fn get_feature(&self, id: &str) -> Result<Option<Feature>, StoreError>;
    async fn features_for_host(&self, host_record_id: &str) -> Result<Vec<Feature>, StoreError>;
    /// Random sample of link/image features not yet elaborated.
    async fn sample_unelaborated(&self, limit: usize) -> Result<Vec<Feature>, StoreError>;
    async fn sample_base64_features(&self, limit: usize) -> Result<Vec<Feature>, StoreError>;
    /// Case-insensitive substring match over textual payloads.
    async fn search_features(&self, query: &str, limit: usize) -> Result<Vec<Feature>, StoreError>;
}

/// Shared predicate so both backends agree on what a search hit is.
pub(crate) fn feature_matches(feature: &Feature, needle_lower: &str) -> bool {
    feature
        .payload
        .text()
        .map(|text| text.to_lowercase().contains(needle_lower))
        .unwrap_or(false)
}

pub(crate) fn is_unelaborated_work(feature: &Feature) -> bool {
    !feature.elaborated && feature.payload.is_elaboratable()
}
