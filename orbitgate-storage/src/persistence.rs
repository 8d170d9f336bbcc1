//! Buffered durable persistence
//!
//! `sync_*` calls append to per-kind in-memory buffers and never touch the
//! durable store (except `sync_object` with `force`). A background flush loop
//! drains the buffers on a timer, or early when a buffer reaches
//! `buffer_size`. A failed flush puts its records back at the head of the
//! buffer so the next tick retries them (at-least-once). Accepted records
//! are never dropped: once a buffer holds `max_buffered_records`, further
//! syncs of that kind fail with a durable error until a flush succeeds.

use crate::durable::{DurableStore, RecordBatch};
use orbitgate_core::{
    AssetRecord, EmotionRecord, Error, MetricRecord, ObjectRecord, ObjectRow, Observation,
    PersistenceConfig, RecordKind, Result,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Append `record` unless the buffer already holds `cap` records
fn push_capped<T>(buffer: &mut Vec<T>, record: T, cap: usize) -> Option<usize> {
    if buffer.len() >= cap {
        return None;
    }
    buffer.push(record);
    Some(buffer.len())
}

/// Put `older` back in front of whatever arrived during the failed flush
fn restore<T>(buffer: &mut Vec<T>, mut older: Vec<T>) {
    older.append(buffer);
    *buffer = older;
}

/// Per-kind pending records
#[derive(Debug, Default)]
struct Buffers {
    objects: Vec<ObjectRecord>,
    observations: Vec<Observation>,
    metrics: Vec<MetricRecord>,
    assets: Vec<AssetRecord>,
    emotions: Vec<EmotionRecord>,
}

impl Buffers {
    fn len(&self, kind: RecordKind) -> usize {
        match kind {
            RecordKind::Object => self.objects.len(),
            RecordKind::Observation => self.observations.len(),
            RecordKind::Metric => self.metrics.len(),
            RecordKind::Asset => self.assets.len(),
            RecordKind::Emotion => self.emotions.len(),
        }
    }

    fn take(&mut self, kind: RecordKind) -> RecordBatch {
        match kind {
            RecordKind::Object => RecordBatch::Objects(std::mem::take(&mut self.objects)),
            RecordKind::Observation => {
                RecordBatch::Observations(std::mem::take(&mut self.observations))
            }
            RecordKind::Metric => RecordBatch::Metrics(std::mem::take(&mut self.metrics)),
            RecordKind::Asset => RecordBatch::Assets(std::mem::take(&mut self.assets)),
            RecordKind::Emotion => RecordBatch::Emotions(std::mem::take(&mut self.emotions)),
        }
    }

    fn restore(&mut self, batch: RecordBatch) {
        match batch {
            RecordBatch::Objects(r) => restore(&mut self.objects, r),
            RecordBatch::Observations(r) => restore(&mut self.observations, r),
            RecordBatch::Metrics(r) => restore(&mut self.metrics, r),
            RecordBatch::Assets(r) => restore(&mut self.assets, r),
            RecordBatch::Emotions(r) => restore(&mut self.emotions, r),
        }
    }
}

/// Records written per table by one flush
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub written: HashMap<RecordKind, usize>,
}

impl FlushReport {
    pub fn total(&self) -> usize {
        self.written.values().sum()
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.written.get(&kind).copied().unwrap_or(0)
    }
}

/// Durable persistence service
pub struct ObjectPersistence {
    store: Arc<dyn DurableStore>,
    buffers: Mutex<Buffers>,
    buffer_size: usize,
    max_buffered: usize,
    flush_interval: Duration,
    /// Syncs refused per kind because the buffer was full
    rejected: Mutex<HashMap<RecordKind, usize>>,
    /// Serializes flushes, forced writes and shutdown
    flush_lock: tokio::sync::Mutex<()>,
    flush_requested: Notify,
    flush_task: RwLock<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
    connected: AtomicBool,
}

impl ObjectPersistence {
    pub fn new(store: Arc<dyn DurableStore>, config: &PersistenceConfig) -> Self {
        Self {
            store,
            buffers: Mutex::new(Buffers::default()),
            buffer_size: config.buffer_size.max(1),
            max_buffered: config.max_buffered_records.max(config.buffer_size).max(1),
            rejected: Mutex::new(HashMap::new()),
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_requested: Notify::new(),
            flush_task: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Check the durable store is reachable
    pub async fn connect(&self) -> Result<()> {
        self.store.ping().await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("Durable persistence connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop the flush loop, flush the store and mark disconnected.
    /// Call `shutdown` first to drain buffers.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_flush_loop().await?;
        self.store.flush().await?;
        self.connected.store(false, Ordering::SeqCst);
        info!("Durable persistence disconnected");
        Ok(())
    }

    /// Spawn the periodic flush task. No-op if already running.
    pub fn start_flush_loop(self: &Arc<Self>) {
        let mut slot = self.flush_task.write();
        if slot.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                    _ = this.flush_requested.notified() => {
                        debug!("Size-triggered flush");
                    }
                }
                if let Err(e) = this.flush_all().await {
                    error!("Periodic flush failed, records retained for retry: {}", e);
                }
            }
            debug!("Flush loop exited");
        });
        *slot = Some((stop_tx, handle));
        info!(
            "Started persistence flush loop (every {:?}, buffer size {})",
            self.flush_interval, self.buffer_size
        );
    }

    /// Stop the flush task, waiting for an in-flight flush to finish
    pub async fn stop_flush_loop(&self) -> Result<()> {
        let task = self.flush_task.write().take();
        if let Some((stop_tx, handle)) = task {
            let _ = stop_tx.send(());
            handle
                .await
                .map_err(|e| Error::Concurrency(format!("flush loop join failed: {}", e)))?;
            info!("Stopped persistence flush loop");
        }
        Ok(())
    }

    pub fn is_flush_loop_running(&self) -> bool {
        self.flush_task.read().is_some()
    }

    /// Stop the loop, then flush everything still buffered
    pub async fn shutdown(&self) -> Result<FlushReport> {
        self.stop_flush_loop().await?;
        let report = self.flush_all().await?;
        info!("Persistence shutdown flushed {} records", report.total());
        Ok(report)
    }

    fn note_len(&self, kind: RecordKind, len: usize) {
        if len >= self.buffer_size {
            debug!("{} buffer reached {} records", kind.table_name(), len);
            self.flush_requested.notify_one();
        }
    }

    /// Outcome of a capped push: a full buffer counts a rejection and fails
    fn accepted(&self, kind: RecordKind, pushed: Option<usize>) -> Result<()> {
        match pushed {
            Some(len) => {
                self.note_len(kind, len);
                Ok(())
            }
            None => {
                let total = {
                    let mut rejected = self.rejected.lock();
                    let count = rejected.entry(kind).or_insert(0);
                    *count += 1;
                    *count
                };
                error!(
                    "{} buffer full ({} records), rejected record ({} rejected so far)",
                    kind.table_name(),
                    self.max_buffered,
                    total
                );
                self.flush_requested.notify_one();
                Err(Error::Durable(format!(
                    "{} buffer full with {} unflushed records",
                    kind.table_name(),
                    self.max_buffered
                )))
            }
        }
    }

    /// Queue an object upsert. With `force` the object buffer (this record
    /// included) is written before returning.
    pub async fn sync_object(&self, record: ObjectRecord, force: bool) -> Result<()> {
        if !force {
            let pushed = push_capped(&mut self.buffers.lock().objects, record, self.max_buffered);
            return self.accepted(RecordKind::Object, pushed);
        }
        let _guard = self.flush_lock.lock().await;
        let pushed = push_capped(&mut self.buffers.lock().objects, record, self.max_buffered);
        self.accepted(RecordKind::Object, pushed)?;
        self.flush_kind_locked(RecordKind::Object).await.map(|_| ())
    }

    pub fn sync_observation(&self, observation: Observation) -> Result<()> {
        let pushed = push_capped(
            &mut self.buffers.lock().observations,
            observation,
            self.max_buffered,
        );
        self.accepted(RecordKind::Observation, pushed)
    }

    pub fn sync_metrics(&self, record: MetricRecord) -> Result<()> {
        let pushed = push_capped(&mut self.buffers.lock().metrics, record, self.max_buffered);
        self.accepted(RecordKind::Metric, pushed)
    }

    pub fn sync_asset(&self, record: AssetRecord) -> Result<()> {
        let pushed = push_capped(&mut self.buffers.lock().assets, record, self.max_buffered);
        self.accepted(RecordKind::Asset, pushed)
    }

    pub fn sync_emotion(&self, record: EmotionRecord) -> Result<()> {
        let pushed = push_capped(&mut self.buffers.lock().emotions, record, self.max_buffered);
        self.accepted(RecordKind::Emotion, pushed)
    }

    /// Syncs of `kind` refused because its buffer was full
    pub fn rejected_count(&self, kind: RecordKind) -> usize {
        self.rejected.lock().get(&kind).copied().unwrap_or(0)
    }

    pub fn buffered_len(&self, kind: RecordKind) -> usize {
        self.buffers.lock().len(kind)
    }

    /// Flush one buffer
    pub async fn flush_kind(&self, kind: RecordKind) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;
        self.flush_kind_locked(kind).await
    }

    /// Flush every buffer. All buffers are attempted; the first failure is
    /// returned after the rest have been written.
    pub async fn flush_all(&self) -> Result<FlushReport> {
        let _guard = self.flush_lock.lock().await;
        let mut report = FlushReport::default();
        let mut first_error = None;
        for kind in RecordKind::ALL {
            match self.flush_kind_locked(kind).await {
                Ok(0) => {}
                Ok(n) => {
                    report.written.insert(kind, n);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Caller holds `flush_lock`
    async fn flush_kind_locked(&self, kind: RecordKind) -> Result<usize> {
        let batch = self.buffers.lock().take(kind);
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        match self.store.write_batch(&batch).await {
            Ok(_) => {
                info!("Flushed {} records to {}", count, kind.table_name());
                Ok(count)
            }
            Err(e) => {
                error!(
                    "Flush of {} failed, retaining {} records: {}",
                    kind.table_name(),
                    count,
                    e
                );
                self.buffers.lock().restore(batch);
                Err(e)
            }
        }
    }

    // Queries read the durable store directly; buffered records are not visible.

    pub async fn get_object(&self, id: &str) -> Result<Option<ObjectRow>> {
        self.store.get_object(id).await
    }

    pub async fn get_object_metrics(&self, id: &str, limit: usize) -> Result<Vec<MetricRecord>> {
        self.store.get_object_metrics(id, limit).await
    }

    pub async fn get_object_observations(
        &self,
        id: &str,
        limit: usize,
    ) -> Result<Vec<Observation>> {
        self.store.get_object_observations(id, limit).await
    }

    pub async fn get_object_assets(&self, id: &str) -> Result<Vec<AssetRecord>> {
        self.store.get_object_assets(id).await
    }

    pub async fn get_object_emotions(&self, id: &str, limit: usize) -> Result<Vec<EmotionRecord>> {
        self.store.get_object_emotions(id, limit).await
    }
}
