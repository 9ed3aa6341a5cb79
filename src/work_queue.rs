//! Watermark-prefetched queues in front of expensive store sampling.
//!
//! Readers drain an in-memory FIFO; dropping below the low-water mark kicks
//! off at most one background refill per queue. A reader that finds the
//! queue short fetches the remainder directly so it is never starved.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use crate::metrics::Counter;
use crate::store::StoreError;

#[async_trait]
pub trait QueueSource<T>: Send + Sync {
    /// Up to `limit` fresh items; fewer (or none) is not an error.
    async fn fetch(&self, limit: usize) -> Result<Vec<T>, StoreError>;
}

pub struct WorkQueueCache<T> {
    name: &'static str,
    queue: Mutex<VecDeque<T>>,
    refilling: Mutex<bool>,
    source: Arc<dyn QueueSource<T>>,
    target: usize,
    low_water: usize,
    pub refills: Counter,
}

impl<T: Send + 'static> WorkQueueCache<T> {
    pub fn new(name: &'static str, source: Arc<dyn QueueSource<T>>, target: usize, low_water: usize) -> Self {
        Self {
            name,
            queue: Mutex::new(VecDeque::with_capacity(target)),
            refilling: Mutex::new(false),
            source,
            target,
            low_water: low_water.min(target),
            refills: Counter::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_refilling(&self) -> bool {
        *self.refilling.lock()
    }

    /// Serve up to `n` items, queue first, then a direct fetch for the rest.
    pub async fn take(self: &Arc<Self>, n: usize) -> Result<Vec<T>, StoreError> {
        let (mut items, remaining) = {
            let mut queue = self.queue.lock();
            let count = n.min(queue.len());
            let items: Vec<T> = queue.drain(..count).collect();
            (items, queue.len())
        };

        if remaining < self.low_water {
            self.trigger_refill();
        }

        if items.len() < n {
            let direct = self.source.fetch(n - items.len()).await?;
            items.extend(direct);
        }
        Ok(items)
    }

    /// Start a background refill unless one is already running. Returns
    /// whether this call started it.
    pub fn trigger_refill(self: &Arc<Self>) -> bool {
        {
            let mut refilling = self.refilling.lock();
            if *refilling {
                return false;
            }
            *refilling = true;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = RefillGuard { flag: &this.refilling };
            this.refill().await;
        });
        true
    }

    async fn refill(&self) {
        let need = self.target.saturating_sub(self.len());
        if need == 0 {
            return;
        }
        self.refills.inc();
        match self.source.fetch(need).await {
            Ok(items) => {
                debug!(queue = self.name, fetched = items.len(), "refilled work queue");
                let mut queue = self.queue.lock();
                let room = self.target.saturating_sub(queue.len());
                queue.extend(items.into_iter().take(room));
            }
            Err(e) => warn!(queue = self.name, error = %e, "work queue refill failed"),
        }
    }
}

/// Clears the in-flight flag even if the refill future is dropped mid-way.
struct RefillGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl Drop for RefillGuard<'_> {
    fn drop(&mut self) {
        *self.flag.lock() = false;
    }
}

/// Fixed-capacity ring of recently ingested items, oldest overwritten
/// first. Each slot locks independently.
pub struct RecentRing<T> {
    slots: Vec<Mutex<Option<T>>>,
    head: AtomicUsize,
}

impl<T> RecentRing<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            head: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&self, item: T) {
        let index = self.head.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        *self.slots[index].lock() = Some(item);
    }

    /// Remove one item, scanning from a random slot.
    pub fn take(&self) -> Option<T> {
        let len = self.slots.len();
        let start = rand::thread_rng().gen_range(0..len);
        (0..len).find_map(|offset| self.slots[(start + offset) % len].lock().take())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// "Random" reads biased toward fresh ingests: recent ring, then the
/// prefetched queue, then the store.
pub struct RandomPool<T> {
    pub recent: RecentRing<T>,
    pub queue: Arc<WorkQueueCache<T>>,
}

impl<T: Send + 'static> RandomPool<T> {
    pub fn new(recent_capacity: usize, queue: WorkQueueCache<T>) -> Self {
        Self {
            recent: RecentRing::new(recent_capacity),
            queue: Arc::new(queue),
        }
    }

    pub fn push_recent(&self, item: T) {
        self.recent.push(item);
    }

    pub async fn next(&self) -> Result<Option<T>, StoreError> {
        if let Some(item) = self.recent.take() {
            return Ok(Some(item));
        }
        Ok(self.queue.take(1).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::Notify;

    /// Numbers counting up; optionally blocks every fetch until released.
    struct CountingSource {
        calls: AtomicU64,
        next: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl CountingSource {
        fn new(gate: Option<Arc<Notify>>) -> Self {
            Self {
                calls: AtomicU64::new(0),
                next: AtomicUsize::new(0),
                gate,
            }
        }
    }

    #[async_trait]
    impl QueueSource<usize> for CountingSource {
        async fn fetch(&self, limit: usize) -> Result<Vec<usize>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let first = self.next.fetch_add(limit, Ordering::SeqCst);
            Ok((first..first + limit).collect())
        }
    }

    async fn wait_until_idle(cache: &WorkQueueCache<usize>) {
        for _ in 0..200 {
            if !cache.is_refilling() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("refill never finished");
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_one_refill() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(CountingSource::new(Some(Arc::clone(&gate))));
        let cache = Arc::new(WorkQueueCache::new("test", source.clone(), 10, 5));

        assert!(cache.trigger_refill());
        let started: Vec<bool> = (0..32).map(|_| cache.trigger_refill()).collect();
        assert!(started.iter().all(|s| !s));

        // Let the spawned refill reach the gate, then release it.
        while source.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        gate.notify_one();
        wait_until_idle(&cache).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refills.get(), 1);
        assert_eq!(cache.len(), 10);
        assert!(cache.trigger_refill());
    }

    #[tokio::test]
    async fn test_empty_queue_falls_back_to_direct_fetch() {
        let source = Arc::new(CountingSource::new(None));
        let cache = Arc::new(WorkQueueCache::new("test", source.clone(), 10, 5));

        let items = cache.take(3).await.unwrap();
        assert_eq!(items.len(), 3);
        wait_until_idle(&cache).await;
        // One background refill plus one direct fetch.
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 10);
    }

    #[tokio::test]
    async fn test_drain_above_low_water_does_not_refill() {
        let source = Arc::new(CountingSource::new(None));
        let cache = Arc::new(WorkQueueCache::new("test", source.clone(), 10, 5));
        cache.trigger_refill();
        wait_until_idle(&cache).await;
        assert_eq!(cache.len(), 10);

        let items = cache.take(4).await.unwrap();
        assert_eq!(items, vec![0, 1, 2, 3]);
        assert!(!cache.is_refilling());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = RecentRing::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        let mut drained: Vec<i32> = std::iter::from_fn(|| ring.take()).collect();
        drained.sort();
        assert_eq!(drained, vec![2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[tokio::test]
    async fn test_random_pool_prefers_recent() {
        let source = Arc::new(CountingSource::new(None));
        let pool = RandomPool::new(4, WorkQueueCache::new("random", source.clone(), 2, 1));
        pool.push_recent(1000);

        assert_eq!(pool.next().await.unwrap(), Some(1000));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);

        let fallback = pool.next().await.unwrap();
        assert!(fallback.is_some_and(|v| v < 1000));
    }
}
