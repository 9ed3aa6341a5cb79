use async_trait::async_trait;
use rand::seq::{IteratorRandom, SliceRandom};
use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{Store, StoreError, feature_matches, is_unelaborated_work};
use crate::models::{
    AddressBatch, Epoch, Feature, FeatureKind, HeaderEntry, HostRecord, ValidationState, WorkerSession,
};

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;
/// Secondary index: composite key to the primary key of the indexed row.
type IndexTable = TableDefinition<'static, &'static str, &'static str>;
type MetaTable = TableDefinition<'static, &'static str, u64>;

/// Bumped whenever the secondary index layout changes; older files are reindexed on open.
const INDEX_VERSION: u64 = 1;
const INDEX_VERSION_KEY: &str = "index_version";

/// What the validation index keeps per batch, enough to filter without
/// decoding the batch itself.
#[derive(Serialize, Deserialize)]
struct CandidateEntry {
    issued_to: String,
    validation: ValidationState,
}

impl CandidateEntry {
    fn is_open_to(&self, worker_id: &str, cutoff: u64) -> bool {
        self.issued_to != worker_id && self.validation.is_open_at(cutoff)
    }
}

/// Durable store backed by redb with JSON-encoded values.
///
/// Every operation runs on the blocking pool so a slow disk never stalls
/// the request path's executor threads.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    // Table definitions so every transaction targets the same logical buckets.
    const EPOCHS: JsonTable = TableDefinition::new("epochs");
    const BATCHES: JsonTable = TableDefinition::new("batches");
    const SESSIONS: JsonTable = TableDefinition::new("sessions");
    const HOSTS: JsonTable = TableDefinition::new("hosts");
    const FEATURES: JsonTable = TableDefinition::new("features");
    // Incomplete batches keyed "{epoch:05}-{issued_at:020}-{id}".
    const OPEN_BATCHES: IndexTable = TableDefinition::new("open_batches");
    // Batches awaiting validation keyed by batch id, which carries the epoch prefix.
    const VALIDATION_CANDIDATES: JsonTable = TableDefinition::new("validation_candidates");
    // "{host_record_id}/{feature_id}" for every feature.
    const HOST_FEATURES: IndexTable = TableDefinition::new("host_features");
    const META: MetaTable = TableDefinition::new("meta");

    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let data_path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_path)?;

        let db = Database::create(data_path.join("quadscan.redb"))?;

        // Create every table up front so read transactions never miss one.
        let write_txn = db.begin_write()?;
        {
            let _epochs = write_txn.open_table(Self::EPOCHS)?;
            let _batches = write_txn.open_table(Self::BATCHES)?;
            let _sessions = write_txn.open_table(Self::SESSIONS)?;
            let _hosts = write_txn.open_table(Self::HOSTS)?;
            let _features = write_txn.open_table(Self::FEATURES)?;
            let _open = write_txn.open_table(Self::OPEN_BATCHES)?;
            let _candidates = write_txn.open_table(Self::VALIDATION_CANDIDATES)?;
            let _host_features = write_txn.open_table(Self::HOST_FEATURES)?;
        }

        let indexed_version = {
            let meta = write_txn.open_table(Self::META)?;
            let version = meta.get(INDEX_VERSION_KEY)?.map(|v| v.value());
            version
        };
        if indexed_version != Some(INDEX_VERSION) {
            Self::rebuild_indexes(&write_txn)?;
            let mut meta = write_txn.open_table(Self::META)?;
            meta.insert(INDEX_VERSION_KEY, INDEX_VERSION)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Regenerate every secondary index from the primary tables.
    fn rebuild_indexes(write_txn: &redb::WriteTransaction) -> Result<(), StoreError> {
        let batches = write_txn.open_table(Self::BATCHES)?;
        let features = write_txn.open_table(Self::FEATURES)?;
        let mut open = write_txn.open_table(Self::OPEN_BATCHES)?;
        let mut candidates = write_txn.open_table(Self::VALIDATION_CANDIDATES)?;
        let mut host_features = write_txn.open_table(Self::HOST_FEATURES)?;

        open.retain(|_, _| false)?;
        candidates.retain(|_, _| false)?;
        host_features.retain(|_, _| false)?;

        let mut reindexed = 0usize;
        for entry in batches.iter()? {
            let (_, value) = entry?;
            let batch: AddressBatch = serde_json::from_slice(value.value())?;
            index_batch(&mut open, &mut candidates, &batch)?;
            reindexed += 1;
        }
        for entry in features.iter()? {
            let (_, value) = entry?;
            let feature: Feature = serde_json::from_slice(value.value())?;
            host_features.insert(host_feature_key(&feature).as_str(), feature.id.as_str())?;
            reindexed += 1;
        }
        if reindexed > 0 {
            info!(rows = reindexed, "rebuilt store indexes");
        }
        Ok(())
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db)).await?
    }

    fn epoch_key(ordinal: u32) -> String {
        format!("{:05}", ordinal)
    }
}

fn open_batch_key(batch: &AddressBatch) -> String {
    format!("{:05}-{:020}-{}", batch.epoch, batch.issued_at, batch.id)
}

fn host_feature_key(feature: &Feature) -> String {
    format!("{}/{}", feature.host_record_id, feature.id)
}

/// Key range holding every row of `epoch` in an epoch-prefixed table.
fn epoch_range(epoch: u32) -> (String, String) {
    (format!("{:05}-", epoch), format!("{:05}.", epoch))
}

fn index_batch(
    open: &mut Table<'_, &'static str, &'static str>,
    candidates: &mut Table<'_, &'static str, &'static [u8]>,
    batch: &AddressBatch,
) -> Result<(), StoreError> {
    if !batch.completed {
        open.insert(open_batch_key(batch).as_str(), batch.id.as_str())?;
    }
    if batch.awaits_validation() {
        let entry = serde_json::to_vec(&CandidateEntry {
            issued_to: batch.issued_to.clone(),
            validation: batch.validation.clone(),
        })?;
        candidates.insert(batch.id.as_str(), entry.as_slice())?;
    }
    Ok(())
}

fn unindex_batch(
    open: &mut Table<'_, &'static str, &'static str>,
    candidates: &mut Table<'_, &'static str, &'static [u8]>,
    batch: &AddressBatch,
) -> Result<(), StoreError> {
    open.remove(open_batch_key(batch).as_str())?;
    candidates.remove(batch.id.as_str())?;
    Ok(())
}

/// Replace a batch and move its index entries in the same transaction.
fn write_batch(db: &Database, batch: &AddressBatch) -> Result<(), StoreError> {
    let write_txn = db.begin_write()?;
    {
        let mut batches = write_txn.open_table(RedbStore::BATCHES)?;
        let mut open = write_txn.open_table(RedbStore::OPEN_BATCHES)?;
        let mut candidates = write_txn.open_table(RedbStore::VALIDATION_CANDIDATES)?;

        let previous: Option<AddressBatch> = match batches.get(batch.id.as_str())? {
            Some(guard) => Some(serde_json::from_slice(guard.value())?),
            None => None,
        };
        if let Some(previous) = previous {
            unindex_batch(&mut open, &mut candidates, &previous)?;
        }

        let bytes = serde_json::to_vec(batch)?;
        batches.insert(batch.id.as_str(), bytes.as_slice())?;
        index_batch(&mut open, &mut candidates, batch)?;
    }
    write_txn.commit()?;
    Ok(())
}

/// Visit ids of `epoch`'s validation candidates open to `worker_id`, in
/// batch order, until `visit` returns false.
fn open_candidates(
    db: &Database,
    epoch: u32,
    worker_id: &str,
    cutoff: u64,
    mut visit: impl FnMut(&str) -> bool,
) -> Result<(), StoreError> {
    let (lo, hi) = epoch_range(epoch);
    let read_txn = db.begin_read()?;
    let candidates = read_txn.open_table(RedbStore::VALIDATION_CANDIDATES)?;
    for entry in candidates.range::<&str>(lo.as_str()..hi.as_str())? {
        let (id, value) = entry?;
        let candidate: CandidateEntry = serde_json::from_slice(value.value())?;
        if candidate.is_open_to(worker_id, cutoff) && !visit(id.value()) {
            break;
        }
    }
    Ok(())
}

fn put<T: Serialize>(db: &Database, table: JsonTable, key: &str, value: &T) -> Result<(), StoreError> {
    let write_txn = db.begin_write()?;
    {
        let mut t = write_txn.open_table(table)?;
        let bytes = serde_json::to_vec(value)?;
        t.insert(key, bytes.as_slice())?;
    }
    write_txn.commit()?;
    Ok(())
}

fn get<T: DeserializeOwned>(db: &Database, table: JsonTable, key: &str) -> Result<Option<T>, StoreError> {
    let read_txn = db.begin_read()?;
    let t = read_txn.open_table(table)?;
    match t.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

/// Full scan in key order, keeping rows that pass `keep`.
fn scan<T, F>(db: &Database, table: JsonTable, mut keep: F) -> Result<Vec<T>, StoreError>
where
    T: DeserializeOwned,
    F: FnMut(&T) -> bool,
{
    let read_txn = db.begin_read()?;
    let t = read_txn.open_table(table)?;
    let mut rows = Vec::new();
    for entry in t.iter()? {
        let (_, value) = entry?;
        let row: T = serde_json::from_slice(value.value())?;
        if keep(&row) {
            rows.push(row);
        }
    }
    Ok(rows)
}

#[async_trait]
impl Store for RedbStore {
    async fn latest_epoch(&self) -> Result<Option<Epoch>, StoreError> {
        self.run(|db| {
            let read_txn = db.begin_read()?;
            let t = read_txn.open_table(Self::EPOCHS)?;
            match t.last()? {
                Some((_, value)) => Ok(Some(serde_json::from_slice(value.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_epoch(&self, epoch: &Epoch) -> Result<(), StoreError> {
        let epoch = epoch.clone();
        self.run(move |db| put(db, Self::EPOCHS, &Self::epoch_key(epoch.ordinal), &epoch))
            .await
    }

    async fn get_batch(&self, id: &str) -> Result<Option<AddressBatch>, StoreError> {
        let id = id.to_string();
        self.run(move |db| get(db, Self::BATCHES, &id)).await
    }

    async fn save_batch(&self, batch: &AddressBatch) -> Result<(), StoreError> {
        let batch = batch.clone();
        self.run(move |db| write_batch(db, &batch)).await
    }

    async fn latest_batch_in_epoch(&self, epoch: u32) -> Result<Option<AddressBatch>, StoreError> {
        self.run(move |db| {
            // Batch ids are "{epoch:05}-{start:010}", so the epoch is a key prefix.
            let (lo, hi) = epoch_range(epoch);
            let read_txn = db.begin_read()?;
            let t = read_txn.open_table(Self::BATCHES)?;
            let mut range = t.range::<&str>(lo.as_str()..hi.as_str())?;
            match range.next_back() {
                Some(entry) => {
                    let (_, value) = entry?;
                    Ok(Some(serde_json::from_slice(value.value())?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn oldest_stale_batch(&self, epoch: u32, cutoff: u64) -> Result<Option<AddressBatch>, StoreError> {
        self.run(move |db| {
            // Open keys sort by issue time within an epoch; everything below
            // "{epoch}-{cutoff}" was issued before the cutoff.
            let lo = format!("{:05}-", epoch);
            let hi = format!("{:05}-{:020}", epoch, cutoff);
            let read_txn = db.begin_read()?;
            let open = read_txn.open_table(Self::OPEN_BATCHES)?;
            let batches = read_txn.open_table(Self::BATCHES)?;
            for entry in open.range::<&str>(lo.as_str()..hi.as_str())? {
                let (_, id) = entry?;
                let Some(value) = batches.get(id.value())? else {
                    continue;
                };
                let batch: AddressBatch = serde_json::from_slice(value.value())?;
                if batch.is_stale(epoch, cutoff) {
                    return Ok(Some(batch));
                }
            }
            Ok(None)
        })
        .await
    }

    async fn count_validation_candidates(
        &self,
        epoch: u32,
        worker_id: &str,
        cutoff: u64,
    ) -> Result<usize, StoreError> {
        let worker_id = worker_id.to_string();
        self.run(move |db| {
            let mut count = 0;
            open_candidates(db, epoch, &worker_id, cutoff, |_| {
                count += 1;
                true
            })?;
            Ok(count)
        })
        .await
    }

    async fn nth_validation_candidate(
        &self,
        epoch: u32,
        worker_id: &str,
        cutoff: u64,
        skip: usize,
    ) -> Result<Option<AddressBatch>, StoreError> {
        let worker_id = worker_id.to_string();
        self.run(move |db| {
            let mut remaining = skip;
            let mut chosen = None;
            open_candidates(db, epoch, &worker_id, cutoff, |id| {
                if remaining == 0 {
                    chosen = Some(id.to_string());
                    return false;
                }
                remaining -= 1;
                true
            })?;
            match chosen {
                Some(id) => Ok(get::<AddressBatch>(db, Self::BATCHES, &id)?
                    .filter(|b| b.is_validation_candidate(epoch, &worker_id, cutoff))),
                None => Ok(None),
            }
        })
        .await
    }

    async fn all_batches(&self) -> Result<Vec<AddressBatch>, StoreError> {
        self.run(|db| scan(db, Self::BATCHES, |_: &AddressBatch| true)).await
    }

    async fn get_session(&self, id: &str) -> Result<Option<WorkerSession>, StoreError> {
        let id = id.to_string();
        self.run(move |db| get(db, Self::SESSIONS, &id)).await
    }

    async fn find_session_by_slot(&self, nickname: &str, task_slot: &str) -> Result<Option<WorkerSession>, StoreError> {
        let nickname = nickname.to_string();
        let task_slot = task_slot.to_string();
        self.run(move |db| {
            let rows: Vec<WorkerSession> = scan(db, Self::SESSIONS, |s: &WorkerSession| {
                s.nickname.as_deref() == Some(nickname.as_str()) && s.task_slot.as_deref() == Some(task_slot.as_str())
            })?;
            Ok(rows.into_iter().next())
        })
        .await
    }

    async fn find_session_by_nickname(&self, nickname: &str) -> Result<Option<WorkerSession>, StoreError> {
        let nickname = nickname.to_string();
        self.run(move |db| {
            let rows: Vec<WorkerSession> = scan(db, Self::SESSIONS, |s: &WorkerSession| {
                s.nickname.as_deref() == Some(nickname.as_str())
            })?;
            Ok(rows.into_iter().next())
        })
        .await
    }

    async fn save_session(&self, session: &WorkerSession) -> Result<(), StoreError> {
        let session = session.clone();
        self.run(move |db| put(db, Self::SESSIONS, &session.id, &session)).await
    }

    async fn sessions_active_since(&self, since: u64) -> Result<Vec<WorkerSession>, StoreError> {
        self.run(move |db| {
            let mut rows: Vec<WorkerSession> =
                scan(db, Self::SESSIONS, |s: &WorkerSession| s.last_active_at >= since)?;
            rows.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
            Ok(rows)
        })
        .await
    }

    async fn save_host_record(&self, record: &HostRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.run(move |db| put(db, Self::HOSTS, &record.id, &record)).await
    }

    async fn get_host_record(&self, id: &str) -> Result<Option<HostRecord>, StoreError> {
        let id = id.to_string();
        self.run(move |db| get(db, Self::HOSTS, &id)).await
    }

    async fn sample_host_records(&self, limit: usize) -> Result<Vec<HostRecord>, StoreError> {
        self.run(move |db| {
            let rows: Vec<HostRecord> = scan(db, Self::HOSTS, |_: &HostRecord| true)?;
            Ok(rows.into_iter().choose_multiple(&mut rand::thread_rng(), limit))
        })
        .await
    }

    async fn count_host_records(&self) -> Result<u64, StoreError> {
        self.run(|db| {
            let read_txn = db.begin_read()?;
            let t = read_txn.open_table(Self::HOSTS)?;
            Ok(t.len()?)
        })
        .await
    }

    async fn all_headers(&self) -> Result<Vec<HeaderEntry>, StoreError> {
        self.run(|db| {
            let rows: Vec<HostRecord> = scan(db, Self::HOSTS, |_: &HostRecord| true)?;
            Ok(rows.into_iter().flat_map(|h| h.headers).collect())
        })
        .await
    }

    async fn save_features(&self, features: &[Feature]) -> Result<(), StoreError> {
        let features = features.to_vec();
        self.run(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(Self::FEATURES)?;
                let mut by_host = write_txn.open_table(Self::HOST_FEATURES)?;
                for feature in &features {
                    let bytes = serde_json::to_vec(feature)?;
                    table.insert(feature.id.as_str(), bytes.as_slice())?;
                    by_host.insert(host_feature_key(feature).as_str(), feature.id.as_str())?;
                }
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_feature(&self, id: &str) -> Result<Option<Feature>, StoreError> {
        let id = id.to_string();
        self.run(move |db| get(db, Self::FEATURES, &id)).await
    }

    async fn features_for_host(&self, host_record_id: &str) -> Result<Vec<Feature>, StoreError> {
        let host_record_id = host_record_id.to_string();
        self.run(move |db| {
            // '0' is the byte after '/', so this spans exactly "{host}/...".
            let lo = format!("{}/", host_record_id);
            let hi = format!("{}0", host_record_id);
            let read_txn = db.begin_read()?;
            let by_host = read_txn.open_table(Self::HOST_FEATURES)?;
            let table = read_txn.open_table(Self::FEATURES)?;
            let mut rows = Vec::new();
            for entry in by_host.range::<&str>(lo.as_str()..hi.as_str())? {
                let (_, id) = entry?;
                if let Some(value) = table.get(id.value())? {
                    rows.push(serde_json::from_slice(value.value())?);
                }
            }
            Ok(rows)
        })
        .await
    }

    async fn sample_unelaborated(&self, limit: usize) -> Result<Vec<Feature>, StoreError> {
        self.run(move |db| {
            let mut rows: Vec<Feature> = scan(db, Self::FEATURES, is_unelaborated_work)?;
            rows.shuffle(&mut rand::thread_rng());
            rows.truncate(limit);
            Ok(rows)
        })
        .await
    }

    async fn sample_base64_features(&self, limit: usize) -> Result<Vec<Feature>, StoreError> {
        self.run(move |db| {
            let rows: Vec<Feature> =
                scan(db, Self::FEATURES, |f: &Feature| f.payload.kind() == FeatureKind::Base64)?;
            Ok(rows.into_iter().choose_multiple(&mut rand::thread_rng(), limit))
        })
        .await
    }

    async fn search_features(&self, query: &str, limit: usize) -> Result<Vec<Feature>, StoreError> {
        let needle = query.to_lowercase();
        self.run(move |db| {
            let mut rows: Vec<Feature> = scan(db, Self::FEATURES, |f: &Feature| feature_matches(f, &needle))?;
            rows.truncate(limit);
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use crate::models::{FeaturePayload, ValidationStatus};
    use tempfile::TempDir;

    /// Row counts of (open batches, validation candidates, host features).
    fn index_sizes(store: &RedbStore) -> (u64, u64, u64) {
        let read_txn = store.db.begin_read().unwrap();
        (
            read_txn.open_table(RedbStore::OPEN_BATCHES).unwrap().len().unwrap(),
            read_txn.open_table(RedbStore::VALIDATION_CANDIDATES).unwrap().len().unwrap(),
            read_txn.open_table(RedbStore::HOST_FEATURES).unwrap().len().unwrap(),
        )
    }

    fn batch(epoch: u32, start: u32, issued_at: u64) -> AddressBatch {
        let mut batch = AddressBatch::new(epoch, start, 16, "alice");
        batch.issued_at = issued_at;
        batch
    }

    #[tokio::test]
    async fn test_batch_indexes_follow_state_changes() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path()).unwrap();

        // A backlog of older, unfinished work in a previous epoch.
        for i in 0..200 {
            store.save_batch(&batch(1, i * 16, 1)).await.unwrap();
        }
        let mut a = batch(2, 0, 50);
        let mut b = batch(2, 16, 80);
        store.save_batch(&a).await.unwrap();
        store.save_batch(&b).await.unwrap();
        assert_eq!(index_sizes(&store), (202, 0, 0));

        assert_eq!(store.oldest_stale_batch(2, 100).await.unwrap().unwrap().id, a.id);
        assert!(store.oldest_stale_batch(2, 50).await.unwrap().is_none());

        // Reissue moves the entry rather than leaving the old one behind.
        a.issued_to = "bob".into();
        a.issued_at = 500;
        store.save_batch(&a).await.unwrap();
        assert_eq!(index_sizes(&store).0, 202);
        assert_eq!(store.oldest_stale_batch(2, 100).await.unwrap().unwrap().id, b.id);

        b.completed = true;
        b.found_count = Some(2);
        store.save_batch(&b).await.unwrap();
        assert_eq!(index_sizes(&store), (201, 1, 0));
        assert!(store.oldest_stale_batch(2, 100).await.unwrap().is_none());
        assert_eq!(store.count_validation_candidates(2, "carol", 100).await.unwrap(), 1);
        assert_eq!(store.count_validation_candidates(2, "alice", 100).await.unwrap(), 0);
        assert_eq!(store.count_validation_candidates(1, "carol", 100).await.unwrap(), 0);

        b.validation.status = ValidationStatus::Validating;
        b.validation.issued_at = Some(90);
        store.save_batch(&b).await.unwrap();
        assert_eq!(store.count_validation_candidates(2, "carol", 60).await.unwrap(), 0);
        let reopened = store.nth_validation_candidate(2, "carol", 100, 0).await.unwrap().unwrap();
        assert_eq!(reopened.id, b.id);

        b.validation.status = ValidationStatus::Validated;
        store.save_batch(&b).await.unwrap();
        assert_eq!(index_sizes(&store), (201, 0, 0));
        assert!(store.nth_validation_candidate(2, "carol", 100, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_features_for_host_reads_only_that_host() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path()).unwrap();

        let mut link = Feature::root("h1", FeaturePayload::Link("/a".into()));
        let title = Feature::root("h1", FeaturePayload::Title("one".into()));
        let neighbour = Feature::root("h10", FeaturePayload::Title("ten".into()));
        store
            .save_features(&[link.clone(), title.clone(), neighbour.clone()])
            .await
            .unwrap();

        link.elaborated = true;
        let child = Feature::child(&link, FeaturePayload::Text("inner".into()));
        store.save_features(&[child.clone(), link.clone()]).await.unwrap();
        assert_eq!(index_sizes(&store).2, 4);

        let mut ids: Vec<_> = store
            .features_for_host("h1")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        ids.sort();
        let mut expected = vec![link.id.clone(), title.id.clone(), child.id.clone()];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(store.features_for_host("h1").await.unwrap().iter().any(|f| f.elaborated));
        assert_eq!(store.features_for_host("h10").await.unwrap()[0].id, neighbour.id);
        assert!(store.features_for_host("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_indexes_are_rebuilt_for_files_without_them() {
        let dir = TempDir::new().unwrap();
        let open = batch(4, 0, 10);
        let feature = Feature::root("h1", FeaturePayload::Title("kept".into()));
        {
            let store = RedbStore::open(dir.path()).unwrap();
            store.save_batch(&open).await.unwrap();
            store.save_features(std::slice::from_ref(&feature)).await.unwrap();

            let write_txn = store.db.begin_write().unwrap();
            {
                write_txn.open_table(RedbStore::OPEN_BATCHES).unwrap().retain(|_, _| false).unwrap();
                write_txn.open_table(RedbStore::HOST_FEATURES).unwrap().retain(|_, _| false).unwrap();
                write_txn.open_table(RedbStore::META).unwrap().remove(INDEX_VERSION_KEY).unwrap();
            }
            write_txn.commit().unwrap();
            assert!(store.oldest_stale_batch(4, 100).await.unwrap().is_none());
        }

        let store = RedbStore::open(dir.path()).unwrap();
        assert_eq!(store.oldest_stale_batch(4, 100).await.unwrap().unwrap().id, open.id);
        assert_eq!(store.features_for_host("h1").await.unwrap(), vec![feature]);
    }

    #[tokio::test]
    async fn test_batch_queries() {
        let dir = TempDir::new().unwrap();
        contract::exercise_batches(&RedbStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn test_session_queries() {
        let dir = TempDir::new().unwrap();
        contract::exercise_sessions(&RedbStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn test_feature_queries() {
        let dir = TempDir::new().unwrap();
        contract::exercise_features(&RedbStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RedbStore::open(dir.path()).unwrap();
            store.save_epoch(&Epoch::new(3)).await.unwrap();
            store.save_batch(&AddressBatch::new(3, 4096, 4096, "w")).await.unwrap();
        }
        let store = RedbStore::open(dir.path()).unwrap();
        assert_eq!(store.latest_epoch().await.unwrap().unwrap().ordinal, 3);
        assert_eq!(store.latest_batch_in_epoch(3).await.unwrap().unwrap().start, 4096);
    }
}
