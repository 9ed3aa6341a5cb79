//! Address batch allocation: validation sampling, stale reclaim, fresh
//! issuance, epoch rollover, and result reconciliation.

use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::address::{FIRST_ADDRESS_INDEX, LAST_ADDRESS_INDEX};
use crate::config::Config;
use crate::epoch::EpochLifecycle;
use crate::models::{AddressBatch, Epoch, ValidationStatus, now_secs};
use crate::progress::ProgressEstimator;
use crate::store::{Store, StoreError};

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("invalid or completed address batch id: {0}")]
    UnknownBatch(String),

    #[error("address batch {0} was already completed and validated")]
    AlreadyFinalized(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Validation,
    Reclaimed,
    Fresh,
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub batch: AddressBatch,
    pub kind: AllocationKind,
}

impl Allocation {
    pub fn is_validation(&self) -> bool {
        self.kind == AllocationKind::Validation
    }

    pub fn message(&self) -> &'static str {
        match self.kind {
            AllocationKind::Validation => "validation address range assigned",
            AllocationKind::Reclaimed => "stale address range assigned",
            AllocationKind::Fresh => "new address range assigned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Completed,
    Validated,
    ValidationFailed,
}

impl SubmitOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            SubmitOutcome::Completed => "address range completed",
            SubmitOutcome::Validated => "address range validated",
            SubmitOutcome::ValidationFailed => "address range failed validation",
        }
    }
}

/// Outcome of a submission plus the batch as persisted.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub outcome: SubmitOutcome,
    pub batch: AddressBatch,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    epoch: u32,
    next_start: u32,
}

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub step: u32,
    pub stale_after_secs: u64,
    pub validation_probability: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            step: Config::BATCH_STEP,
            stale_after_secs: Config::STALE_BATCH_SECS,
            validation_probability: Config::VALIDATION_PROBABILITY,
        }
    }
}

pub struct BatchAllocator {
    config: AllocatorConfig,
    store: Arc<dyn Store>,
    epochs: Arc<EpochLifecycle>,
    progress: Arc<ProgressEstimator>,
    cursor: Mutex<Option<Cursor>>,
    /// Held across every read-modify-write of an existing batch so a reclaim
    /// or validation issue never overwrites a concurrent completion.
    batch_writes: Mutex<()>,
}

impl BatchAllocator {
    pub fn new(
        config: AllocatorConfig,
        store: Arc<dyn Store>,
        epochs: Arc<EpochLifecycle>,
        progress: Arc<ProgressEstimator>,
    ) -> Self {
        Self {
            config,
            store,
            epochs,
            progress,
            cursor: Mutex::new(None),
            batch_writes: Mutex::new(()),
        }
    }

    /// Load the cursor for the current epoch and rebase the progress estimate on it.
    pub async fn recover_cursor(&self) -> Result<u32, StoreError> {
        let epoch = self.epochs.current().await?;
        let mut cursor = self.cursor.lock().await;
        let next_start = self.load_cursor(epoch.ordinal).await?;
        *cursor = Some(Cursor {
            epoch: epoch.ordinal,
            next_start,
        });
        self.progress.init(next_start);
        Ok(next_start)
    }

    /// Hand `worker_id` a batch: validation sample, then stale reclaim, then fresh range.
    #[tracing::instrument(skip(self))]
    pub async fn allocate(&self, worker_id: &str) -> Result<Allocation, StoreError> {
        let epoch = self.epochs.current().await?;
        let cutoff = now_secs().saturating_sub(self.config.stale_after_secs);

        let roll: f64 = rand::thread_rng().r#gen();
        if roll < self.config.validation_probability
            && let Some(batch) = self.sample_for_validation(&epoch, worker_id, cutoff).await?
        {
            return Ok(Allocation {
                batch,
                kind: AllocationKind::Validation,
            });
        }

        if let Some(batch) = self.reclaim_stale(&epoch, worker_id, cutoff).await? {
            return Ok(Allocation {
                batch,
                kind: AllocationKind::Reclaimed,
            });
        }

        let batch = self.allocate_fresh(worker_id).await?;
        Ok(Allocation {
            batch,
            kind: AllocationKind::Fresh,
        })
    }

    async fn reclaim_stale(
        &self,
        epoch: &Epoch,
        worker_id: &str,
        cutoff: u64,
    ) -> Result<Option<AddressBatch>, StoreError> {
        let _writes = self.batch_writes.lock().await;
        let Some(mut batch) = self.store.oldest_stale_batch(epoch.ordinal, cutoff).await? else {
            return Ok(None);
        };

        debug!(batch = %batch.id, previous = %batch.issued_to, "reclaiming stale batch");
        batch.issued_to = worker_id.to_string();
        batch.issued_at = now_secs();
        self.store.save_batch(&batch).await?;
        Ok(Some(batch))
    }

    async fn sample_for_validation(
        &self,
        epoch: &Epoch,
        worker_id: &str,
        cutoff: u64,
    ) -> Result<Option<AddressBatch>, StoreError> {
        let _writes = self.batch_writes.lock().await;
        let candidates = self
            .store
            .count_validation_candidates(epoch.ordinal, worker_id, cutoff)
            .await?;
        if candidates == 0 {
            return Ok(None);
        }

        let skip = rand::thread_rng().gen_range(0..candidates);
        let Some(mut batch) = self
            .store
            .nth_validation_candidate(epoch.ordinal, worker_id, cutoff, skip)
            .await?
        else {
            return Ok(None);
        };

        batch.validation.status = ValidationStatus::Validating;
        batch.validation.issued_to = Some(worker_id.to_string());
        batch.validation.issued_at = Some(now_secs());
        self.store.save_batch(&batch).await?;
        debug!(batch = %batch.id, validator = %worker_id, "issued batch for validation");
        Ok(Some(batch))
    }

    /// Carve the next `[cursor, cursor + step)` slice.
    ///
    /// The cursor lock is held across the single batch write so two
    /// callers can never observe the same `next_start`.
    async fn allocate_fresh(&self, worker_id: &str) -> Result<AddressBatch, StoreError> {
        let mut cursor = self.cursor.lock().await;
        let epoch = self.epochs.current().await?;

        let next_start = match *cursor {
            Some(c) if c.epoch == epoch.ordinal => c.next_start,
            _ => self.load_cursor(epoch.ordinal).await?,
        };

        let room = (u32::MAX - next_start).max(1);
        let count = self.config.step.min(room);
        let batch = AddressBatch::new(epoch.ordinal, next_start, count, worker_id);
        self.store.save_batch(&batch).await?;

        let upper = batch.end_exclusive();
        if upper >= LAST_ADDRESS_INDEX as u64 {
            let next = self.epochs.roll_over(&epoch).await?;
            *cursor = Some(Cursor {
                epoch: next.ordinal,
                next_start: FIRST_ADDRESS_INDEX,
            });
            self.progress.reset();
        } else {
            *cursor = Some(Cursor {
                epoch: epoch.ordinal,
                next_start: upper as u32,
            });
            self.progress.update(upper as u32);
        }

        Ok(batch)
    }

    async fn load_cursor(&self, epoch: u32) -> Result<u32, StoreError> {
        let next = match self.store.latest_batch_in_epoch(epoch).await? {
            Some(latest) => latest.end_exclusive().min(LAST_ADDRESS_INDEX as u64) as u32,
            None => FIRST_ADDRESS_INDEX,
        };
        Ok(next)
    }

    /// Apply a worker's result for `batch_id`.
    ///
    /// The batch write completes before this returns so the next
    /// allocation decision sees it.
    pub async fn reconcile(&self, batch_id: &str, found_count: u32) -> Result<Reconciled, AllocationError> {
        let _writes = self.batch_writes.lock().await;
        let Some(mut batch) = self.store.get_batch(batch_id).await? else {
            return Err(AllocationError::UnknownBatch(batch_id.to_string()));
        };

        let now = now_secs();
        let outcome = if batch.completed && batch.validation.status == ValidationStatus::Validating {
            let original = batch.found_count.unwrap_or(0);
            let status = if original == found_count {
                ValidationStatus::Validated
            } else {
                warn!(batch = %batch.id, original, found_count, "validation mismatch");
                ValidationStatus::Failed
            };
            batch.validation.status = status;
            batch.validation.completed_at = Some(now);
            batch.validation.found_count = Some(found_count);
            if status == ValidationStatus::Validated {
                SubmitOutcome::Validated
            } else {
                SubmitOutcome::ValidationFailed
            }
        } else if !batch.completed {
            batch.completed = true;
            batch.completed_at = Some(now);
            batch.found_count = Some(found_count);
            SubmitOutcome::Completed
        } else {
            return Err(AllocationError::AlreadyFinalized(batch_id.to_string()));
        };

        self.store.save_batch(&batch).await?;
        info!(batch = %batch.id, found_count, outcome = ?outcome, "batch reconciled");
        Ok(Reconciled { outcome, batch })
    }
}
