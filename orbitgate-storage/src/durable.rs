//! Durable record store

use async_trait::async_trait;
use orbitgate_core::{
    AssetRecord, EmotionRecord, Error, MetricRecord, ObjectId, ObjectRecord, ObjectRow,
    Observation, RecordKind, Result, Timestamp,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// A batch of records of one kind, written atomically
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBatch {
    Objects(Vec<ObjectRecord>),
    Observations(Vec<Observation>),
    Metrics(Vec<MetricRecord>),
    Assets(Vec<AssetRecord>),
    Emotions(Vec<EmotionRecord>),
}

impl RecordBatch {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBatch::Objects(_) => RecordKind::Object,
            RecordBatch::Observations(_) => RecordKind::Observation,
            RecordBatch::Metrics(_) => RecordKind::Metric,
            RecordBatch::Assets(_) => RecordKind::Asset,
            RecordBatch::Emotions(_) => RecordKind::Emotion,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Objects(r) => r.len(),
            RecordBatch::Observations(r) => r.len(),
            RecordBatch::Metrics(r) => r.len(),
            RecordBatch::Assets(r) => r.len(),
            RecordBatch::Emotions(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// System of record. Objects are upserted by id; every other kind is
/// append-only. Time-series reads return newest first.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn ping(&self) -> Result<()>;
    /// Write the whole batch or nothing
    async fn write_batch(&self, batch: &RecordBatch) -> Result<usize>;
    async fn get_object(&self, id: &str) -> Result<Option<ObjectRow>>;
    async fn get_object_metrics(&self, id: &str, limit: usize) -> Result<Vec<MetricRecord>>;
    async fn get_object_observations(&self, id: &str, limit: usize) -> Result<Vec<Observation>>;
    async fn get_object_assets(&self, id: &str) -> Result<Vec<AssetRecord>>;
    async fn get_object_emotions(&self, id: &str, limit: usize) -> Result<Vec<EmotionRecord>>;
    /// Make written batches durable on disk
    async fn flush(&self) -> Result<()>;
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(format!("bincode: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(format!("bincode: {}", e)))
}

// 0xFF never occurs in UTF-8, so one id is never a prefix of another's scan range.
const KEY_SEPARATOR: u8 = 0xFF;

fn record_prefix(obj_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(obj_id.len() + 1);
    key.extend_from_slice(obj_id.as_bytes());
    key.push(KEY_SEPARATOR);
    key
}

/// `obj_id / big-endian micros / big-endian seq`, ordered by time within an object
fn record_key(obj_id: &str, ts: Timestamp, seq: u64) -> Vec<u8> {
    let micros = if ts.is_finite() && ts > 0.0 {
        (ts * 1_000_000.0) as u64
    } else {
        0
    };
    let mut key = record_prefix(obj_id);
    key.extend_from_slice(&micros.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

type UpsertResult = std::result::Result<(), ConflictableTransactionError<Error>>;

/// Sled-backed store with one tree per table
pub struct SledStore {
    db: sled::Db,
    objects: sled::Tree,
    observations: sled::Tree,
    metrics: sled::Tree,
    assets: sled::Tree,
    emotions: sled::Tree,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| Error::Durable(format!("Sled error: {}", e)))?;
        Self::from_db(db)
    }

    /// Throwaway database, removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| Error::Durable(format!("Sled error: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let tree = |kind: RecordKind| {
            db.open_tree(kind.table_name())
                .map_err(|e| Error::Durable(format!("Sled open_tree {}: {}", kind.table_name(), e)))
        };
        if db.was_recovered() {
            info!("Opened existing durable store");
        }
        Ok(Self {
            objects: tree(RecordKind::Object)?,
            observations: tree(RecordKind::Observation)?,
            metrics: tree(RecordKind::Metric)?,
            assets: tree(RecordKind::Asset)?,
            emotions: tree(RecordKind::Emotion)?,
            db,
        })
    }

    fn tree(&self, kind: RecordKind) -> &sled::Tree {
        match kind {
            RecordKind::Object => &self.objects,
            RecordKind::Observation => &self.observations,
            RecordKind::Metric => &self.metrics,
            RecordKind::Asset => &self.assets,
            RecordKind::Emotion => &self.emotions,
        }
    }

    fn upsert_objects(&self, records: &[ObjectRecord]) -> Result<()> {
        let result = self.objects.transaction(|tx| -> UpsertResult {
            for record in records {
                let existing = match tx.get(record.id.as_bytes())? {
                    Some(bytes) => Some(
                        decode::<ObjectRow>(&bytes).map_err(ConflictableTransactionError::Abort)?,
                    ),
                    None => None,
                };
                let row = ObjectRow::upsert(existing.as_ref(), record);
                let bytes = encode(&row).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(record.id.as_bytes(), bytes)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => {
                Err(Error::Durable(format!("Sled transaction error: {}", e)))
            }
        }
    }

    fn append<T: Serialize>(
        &self,
        kind: RecordKind,
        records: &[T],
        key_of: impl Fn(&T) -> (&str, Timestamp),
    ) -> Result<()> {
        let mut batch = sled::Batch::default();
        for record in records {
            let seq = self
                .db
                .generate_id()
                .map_err(|e| Error::Durable(format!("Sled generate_id: {}", e)))?;
            let (obj_id, ts) = key_of(record);
            batch.insert(record_key(obj_id, ts, seq), encode(record)?);
        }
        self.tree(kind)
            .apply_batch(batch)
            .map_err(|e| Error::Durable(format!("Sled batch error on {}: {}", kind.table_name(), e)))
    }

    /// Newest-first scan of one object's records
    fn scan_newest<T: DeserializeOwned>(
        &self,
        kind: RecordKind,
        obj_id: &str,
        limit: usize,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.tree(kind).scan_prefix(record_prefix(obj_id)).rev() {
            if out.len() >= limit {
                break;
            }
            let (_, value) =
                item.map_err(|e| Error::Durable(format!("Sled scan error: {}", e)))?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl DurableStore for SledStore {
    async fn ping(&self) -> Result<()> {
        self.db
            .size_on_disk()
            .map(|_| ())
            .map_err(|e| Error::Durable(format!("Sled unavailable: {}", e)))
    }

    async fn write_batch(&self, batch: &RecordBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        match batch {
            RecordBatch::Objects(records) => self.upsert_objects(records)?,
            RecordBatch::Observations(records) => {
                self.append(RecordKind::Observation, records, |r| (r.obj_id.as_str(), r.timestamp))?
            }
            RecordBatch::Metrics(records) => {
                self.append(RecordKind::Metric, records, |r| (r.obj_id.as_str(), r.timestamp))?
            }
            RecordBatch::Assets(records) => {
                self.append(RecordKind::Asset, records, |r| (r.obj_id.as_str(), r.timestamp))?
            }
            RecordBatch::Emotions(records) => {
                self.append(RecordKind::Emotion, records, |r| (r.obj_id.as_str(), r.timestamp))?
            }
        }
        Ok(batch.len())
    }

    async fn get_object(&self, id: &str) -> Result<Option<ObjectRow>> {
        match self.objects.get(id.as_bytes()) {
            Ok(Some(bytes)) => decode(&bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Durable(format!("Sled get error: {}", e))),
        }
    }

    async fn get_object_metrics(&self, id: &str, limit: usize) -> Result<Vec<MetricRecord>> {
        self.scan_newest(RecordKind::Metric, id, limit)
    }

    async fn get_object_observations(&self, id: &str, limit: usize) -> Result<Vec<Observation>> {
        self.scan_newest(RecordKind::Observation, id, limit)
    }

    async fn get_object_assets(&self, id: &str) -> Result<Vec<AssetRecord>> {
        self.scan_newest(RecordKind::Asset, id, usize::MAX)
    }

    async fn get_object_emotions(&self, id: &str, limit: usize) -> Result<Vec<EmotionRecord>> {
        self.scan_newest(RecordKind::Emotion, id, limit)
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|e| Error::Durable(format!("Sled flush error: {}", e)))
    }
}

#[derive(Default)]
struct MemoryTables {
    objects: HashMap<ObjectId, ObjectRow>,
    observations: Vec<Observation>,
    metrics: Vec<MetricRecord>,
    assets: Vec<AssetRecord>,
    emotions: Vec<EmotionRecord>,
}

fn newest_first<T: Clone>(rows: &[T], limit: usize, matches: impl Fn(&T) -> bool) -> Vec<T> {
    rows.iter().rev().filter(|r| matches(r)).take(limit).cloned().collect()
}

/// In-memory store with failure injection
#[derive(Default)]
pub struct MemoryDurableStore {
    tables: RwLock<MemoryTables>,
    fail_next: AtomicUsize,
    committed_batches: AtomicUsize,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch writes fail
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Batches successfully written so far
    pub fn committed_batches(&self) -> usize {
        self.committed_batches.load(Ordering::SeqCst)
    }

    pub fn record_count(&self, kind: RecordKind) -> usize {
        let tables = self.tables.read();
        match kind {
            RecordKind::Object => tables.objects.len(),
            RecordKind::Observation => tables.observations.len(),
            RecordKind::Metric => tables.metrics.len(),
            RecordKind::Asset => tables.assets.len(),
            RecordKind::Emotion => tables.emotions.len(),
        }
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&self, batch: &RecordBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        if self.take_failure() {
            return Err(Error::Durable(format!(
                "injected write failure on {}",
                batch.kind().table_name()
            )));
        }
        let mut tables = self.tables.write();
        match batch {
            RecordBatch::Objects(records) => {
                for record in records {
                    let row = ObjectRow::upsert(tables.objects.get(&record.id), record);
                    tables.objects.insert(record.id.clone(), row);
                }
            }
            RecordBatch::Observations(records) => tables.observations.extend_from_slice(records),
            RecordBatch::Metrics(records) => tables.metrics.extend_from_slice(records),
            RecordBatch::Assets(records) => tables.assets.extend_from_slice(records),
            RecordBatch::Emotions(records) => tables.emotions.extend_from_slice(records),
        }
        self.committed_batches.fetch_add(1, Ordering::SeqCst);
        Ok(batch.len())
    }

    async fn get_object(&self, id: &str) -> Result<Option<ObjectRow>> {
        Ok(self.tables.read().objects.get(id).cloned())
    }

    async fn get_object_metrics(&self, id: &str, limit: usize) -> Result<Vec<MetricRecord>> {
        Ok(newest_first(&self.tables.read().metrics, limit, |r| r.obj_id == id))
    }

    async fn get_object_observations(&self, id: &str, limit: usize) -> Result<Vec<Observation>> {
        Ok(newest_first(&self.tables.read().observations, limit, |r| r.obj_id == id))
    }

    async fn get_object_assets(&self, id: &str) -> Result<Vec<AssetRecord>> {
        Ok(newest_first(&self.tables.read().assets, usize::MAX, |r| r.obj_id == id))
    }

    async fn get_object_emotions(&self, id: &str, limit: usize) -> Result<Vec<EmotionRecord>> {
        Ok(newest_first(&self.tables.read().emotions, limit, |r| r.obj_id == id))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
