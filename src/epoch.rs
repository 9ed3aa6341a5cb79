use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::models::{Epoch, now_secs};
use crate::store::{Store, StoreError};

/// Owns the notion of the "current" sweep over the address space.
///
/// The current epoch is cached after the first lookup; only rollover
/// touches the store again.
pub struct EpochLifecycle {
    store: Arc<dyn Store>,
    cached: Mutex<Option<Epoch>>,
}

impl EpochLifecycle {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// The epoch with no completion time, creating `last + 1` when the
    /// latest one is finished or none exists.
    pub async fn current(&self) -> Result<Epoch, StoreError> {
        let mut cached = self.cached.lock().await;
        if let Some(epoch) = cached.as_ref()
            && epoch.is_current()
        {
            return Ok(epoch.clone());
        }

        let epoch = match self.store.latest_epoch().await? {
            Some(latest) if latest.is_current() => latest,
            latest => {
                let next = Epoch::new(latest.map(|e| e.ordinal + 1).unwrap_or(1));
                self.store.save_epoch(&next).await?;
                info!(ordinal = next.ordinal, "started new epoch");
                next
            }
        };
        *cached = Some(epoch.clone());
        Ok(epoch)
    }

    /// Mark `finished` complete and open its successor.
    ///
    /// A stale `finished` (already superseded) returns the current epoch
    /// untouched so concurrent rollovers cannot skip an ordinal.
    pub async fn roll_over(&self, finished: &Epoch) -> Result<Epoch, StoreError> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref()
            && current.ordinal > finished.ordinal
        {
            return Ok(current.clone());
        }

        let mut done = finished.clone();
        done.completed_at = Some(now_secs());
        self.store.save_epoch(&done).await?;

        let next = Epoch::new(finished.ordinal + 1);
        self.store.save_epoch(&next).await?;
        info!(
            completed = done.ordinal,
            started = next.ordinal,
            "address space exhausted, rolled over to next epoch"
        );

        *cached = Some(next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_creates_first_epoch() {
        let store = Arc::new(MemoryStore::new());
        let epochs = EpochLifecycle::new(store.clone());
        let epoch = epochs.current().await.unwrap();
        assert_eq!(epoch.ordinal, 1);
        assert_eq!(store.latest_epoch().await.unwrap(), Some(epoch.clone()));
        assert_eq!(epochs.current().await.unwrap(), epoch);
    }

    #[tokio::test]
    async fn test_completed_latest_epoch_starts_successor() {
        let store = Arc::new(MemoryStore::new());
        let mut old = Epoch::new(4);
        old.completed_at = Some(10);
        store.save_epoch(&old).await.unwrap();

        let epochs = EpochLifecycle::new(store);
        assert_eq!(epochs.current().await.unwrap().ordinal, 5);
    }

    #[tokio::test]
    async fn test_roll_over_is_idempotent_for_stale_callers() {
        let store = Arc::new(MemoryStore::new());
        let epochs = EpochLifecycle::new(store.clone());
        let first = epochs.current().await.unwrap();

        let second = epochs.roll_over(&first).await.unwrap();
        assert_eq!(second.ordinal, 2);
        let again = epochs.roll_over(&first).await.unwrap();
        assert_eq!(again.ordinal, 2);
        assert_eq!(epochs.current().await.unwrap().ordinal, 2);
        assert_eq!(store.latest_epoch().await.unwrap().unwrap().ordinal, 2);
    }
}
