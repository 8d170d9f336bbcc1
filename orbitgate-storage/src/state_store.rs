//! Typed adapter over the ephemeral backend
//!
//! Owns key naming and the encoding of structured fields. Callers above this
//! layer only see typed objects, view histories, metric snapshots and queues.

use crate::backend::KeyValueBackend;
use orbitgate_core::{
    AuditEntry, Error, ObjectId, ObjectRecord, ObjectStatus, QualityMetrics, Result, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// View slot -> frame reference
pub type BestFrames = BTreeMap<String, String>;

const INDEX_KEY: &str = "objects:index";
const QUARANTINE_QUEUE: &str = "queue:quarantine";

fn object_key(id: &str) -> String {
    format!("obj:{}", id)
}

fn views_key(id: &str) -> String {
    format!("obj:{}:views", id)
}

fn metrics_key(id: &str) -> String {
    format!("obj:{}:metrics", id)
}

/// Hot per-object state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotObject {
    pub id: ObjectId,
    pub class: String,
    pub status: ObjectStatus,
    pub orbit_deg: f64,
    pub views: u64,
    pub best_frames: BestFrames,
    pub conf_class: f64,
    pub scale_conf: f64,
    pub last_seen_ts: Timestamp,
    pub created_at: Timestamp,
    /// Consecutive failed admission checks
    pub failed_checks: u32,
    /// A triage job is outstanding; cleared when the object is evaluated
    pub triage_queued: bool,
    pub notes: Vec<AuditEntry>,
}

impl HotObject {
    pub fn new(id: ObjectId, class: impl Into<String>, ts: Timestamp) -> Self {
        Self {
            id,
            class: class.into(),
            status: ObjectStatus::Pending,
            orbit_deg: 0.0,
            views: 0,
            best_frames: BestFrames::new(),
            conf_class: 0.0,
            scale_conf: 0.0,
            last_seen_ts: ts,
            created_at: ts,
            failed_checks: 0,
            triage_queued: false,
            notes: Vec::new(),
        }
    }

    /// Durable snapshot of this object
    pub fn to_record(&self, updated_at: Timestamp) -> ObjectRecord {
        ObjectRecord {
            id: self.id.clone(),
            class: self.class.clone(),
            status: self.status,
            notes: self.notes.clone(),
            updated_at,
        }
    }

    fn to_fields(&self) -> Result<Vec<(String, String)>> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("views".to_string(), self.views.to_string()),
        ];
        for field in [
            HotField::Class(self.class.clone()),
            HotField::Status(self.status),
            HotField::OrbitDeg(self.orbit_deg),
            HotField::BestFrames(self.best_frames.clone()),
            HotField::ConfClass(self.conf_class),
            HotField::ScaleConf(self.scale_conf),
            HotField::LastSeen(self.last_seen_ts),
            HotField::FailedChecks(self.failed_checks),
            HotField::TriageQueued(self.triage_queued),
            HotField::Notes(self.notes.clone()),
        ] {
            let (name, value) = field.encode()?;
            fields.push((name.to_string(), value));
        }
        Ok(fields)
    }

    fn from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let float = |name: &str| -> f64 {
            fields
                .get(name)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let status = match fields.get("status") {
            Some(raw) if !raw.is_empty() => raw
                .parse::<ObjectStatus>()
                .map_err(|e| Error::Serialization(format!("object {}: {}", id, e)))?,
            _ => ObjectStatus::Pending,
        };
        let best_frames = match fields.get("best_frames") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => BestFrames::new(),
        };
        let notes = match fields.get("notes") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Vec::new(),
        };
        Ok(Self {
            id: id.to_string(),
            class: fields.get("class").cloned().unwrap_or_default(),
            status,
            orbit_deg: float("orbit_deg").clamp(0.0, 360.0),
            views: fields
                .get("views")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
            best_frames,
            conf_class: float("conf_class"),
            scale_conf: float("scale_conf"),
            last_seen_ts: float("last_seen_ts"),
            created_at: float("created_at"),
            failed_checks: fields
                .get("failed_checks")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0),
            triage_queued: fields.get("triage_queued").map(|v| v == "true").unwrap_or(false),
            notes,
        })
    }
}

/// One updatable hot field
#[derive(Debug, Clone, PartialEq)]
pub enum HotField {
    Class(String),
    Status(ObjectStatus),
    OrbitDeg(f64),
    BestFrames(BestFrames),
    ConfClass(f64),
    ScaleConf(f64),
    LastSeen(Timestamp),
    FailedChecks(u32),
    TriageQueued(bool),
    Notes(Vec<AuditEntry>),
}

impl HotField {
    pub fn name(&self) -> &'static str {
        match self {
            HotField::Class(_) => "class",
            HotField::Status(_) => "status",
            HotField::OrbitDeg(_) => "orbit_deg",
            HotField::BestFrames(_) => "best_frames",
            HotField::ConfClass(_) => "conf_class",
            HotField::ScaleConf(_) => "scale_conf",
            HotField::LastSeen(_) => "last_seen_ts",
            HotField::FailedChecks(_) => "failed_checks",
            HotField::TriageQueued(_) => "triage_queued",
            HotField::Notes(_) => "notes",
        }
    }

    fn encode(&self) -> Result<(&'static str, String)> {
        let value = match self {
            HotField::Class(v) => v.clone(),
            HotField::Status(v) => v.as_str().to_string(),
            HotField::OrbitDeg(v) => v.clamp(0.0, 360.0).to_string(),
            HotField::BestFrames(v) => serde_json::to_string(v)?,
            HotField::ConfClass(v) | HotField::ScaleConf(v) | HotField::LastSeen(v) => {
                v.to_string()
            }
            HotField::FailedChecks(v) => v.to_string(),
            HotField::TriageQueued(v) => v.to_string(),
            HotField::Notes(v) => serde_json::to_string(v)?,
        };
        Ok((self.name(), value))
    }
}

/// Hand-off queues to downstream workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkQueue {
    Triage,
    Recon,
    Quarantine,
}

impl WorkQueue {
    pub const ALL: [WorkQueue; 3] = [WorkQueue::Triage, WorkQueue::Recon, WorkQueue::Quarantine];

    pub fn key(&self) -> &'static str {
        match self {
            WorkQueue::Triage => "queue:triage",
            WorkQueue::Recon => "queue:recon",
            WorkQueue::Quarantine => QUARANTINE_QUEUE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkQueue::Triage => "triage",
            WorkQueue::Recon => "recon",
            WorkQueue::Quarantine => "quarantine",
        }
    }
}

impl fmt::Display for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Quarantine queue payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub obj_id: ObjectId,
    #[serde(default)]
    pub reason: String,
}

fn metrics_to_fields(m: &QualityMetrics) -> Vec<(String, String)> {
    [
        ("orbit_deg", m.orbit_deg),
        ("mvs_consistency", m.mvs_consistency),
        ("silhouette_iou", m.silhouette_iou),
        ("photometric_err", m.photometric_err),
        ("depth_var", m.depth_var),
        ("pose_spread_deg", m.pose_spread_deg),
        ("texture_cov", m.texture_cov),
        ("scale_conf", m.scale_conf),
        ("quality_score", m.quality_score),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Missing or unparsable fields fall back to the conservative value
fn metrics_from_fields(fields: &HashMap<String, String>) -> QualityMetrics {
    let base = QualityMetrics::conservative();
    let get = |name: &str, default: f64| -> f64 {
        fields
            .get(name)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(default)
    };
    QualityMetrics {
        orbit_deg: get("orbit_deg", base.orbit_deg),
        mvs_consistency: get("mvs_consistency", base.mvs_consistency),
        silhouette_iou: get("silhouette_iou", base.silhouette_iou),
        photometric_err: get("photometric_err", base.photometric_err),
        depth_var: get("depth_var", base.depth_var),
        pose_spread_deg: get("pose_spread_deg", base.pose_spread_deg),
        texture_cov: get("texture_cov", base.texture_cov),
        scale_conf: get("scale_conf", base.scale_conf),
        quality_score: get("quality_score", base.quality_score),
    }
}

/// Ephemeral state store
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    // Object hash

    pub async fn get_object(&self, id: &str) -> Result<Option<HotObject>> {
        let fields = self.backend.hgetall(&object_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        HotObject::from_fields(id, &fields).map(Some)
    }

    /// Write every hot field and register the object in the index
    pub async fn set_object(&self, object: &HotObject, ttl: Option<Duration>) -> Result<()> {
        let key = object_key(&object.id);
        self.backend.hset_many(&key, &object.to_fields()?).await?;
        self.backend.sadd(INDEX_KEY, &object.id).await?;
        if let Some(ttl) = ttl {
            self.backend.expire(&key, ttl).await?;
        }
        Ok(())
    }

    pub async fn update_object_field(&self, id: &str, field: HotField) -> Result<()> {
        let (name, value) = field.encode()?;
        self.backend.hset(&object_key(id), name, &value).await
    }

    pub async fn update_object_fields(&self, id: &str, fields: Vec<HotField>) -> Result<()> {
        let mut encoded = Vec::with_capacity(fields.len());
        for field in &fields {
            let (name, value) = field.encode()?;
            encoded.push((name.to_string(), value));
        }
        self.backend.hset_many(&object_key(id), &encoded).await
    }

    /// Atomic view counter increment
    pub async fn incr_views(&self, id: &str, delta: u64) -> Result<u64> {
        let delta = i64::try_from(delta)
            .map_err(|_| Error::Store(format!("view delta {} out of range", delta)))?;
        let views = self
            .backend
            .hincr_by(&object_key(id), "views", delta)
            .await?;
        Ok(views.max(0) as u64)
    }

    /// Remove the object hash, view history and metrics
    pub async fn delete_object(&self, id: &str) -> Result<()> {
        self.backend.del(&object_key(id)).await?;
        self.backend.del(&views_key(id)).await?;
        self.backend.del(&metrics_key(id)).await?;
        self.backend.srem(INDEX_KEY, id).await?;
        Ok(())
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        self.backend.exists(&object_key(id)).await
    }

    /// Expire the object hash, view history and metrics together
    pub async fn set_ttl(&self, id: &str, ttl: Duration) -> Result<()> {
        self.backend.expire(&object_key(id), ttl).await?;
        self.backend.expire(&views_key(id), ttl).await?;
        self.backend.expire(&metrics_key(id), ttl).await?;
        Ok(())
    }

    /// Ids of live objects. Index entries whose hash has expired are pruned.
    pub async fn list_object_ids(&self) -> Result<Vec<ObjectId>> {
        let mut live = Vec::new();
        for id in self.backend.smembers(INDEX_KEY).await? {
            if self.backend.exists(&object_key(&id)).await? {
                live.push(id);
            } else {
                debug!("Pruning expired object {} from index", id);
                self.backend.srem(INDEX_KEY, &id).await?;
            }
        }
        Ok(live)
    }

    // View history

    pub async fn add_view(&self, id: &str, frame_ref: &str, ts: Timestamp) -> Result<()> {
        self.backend.zadd(&views_key(id), ts, frame_ref).await
    }

    /// `(frame_ref, timestamp)` in time order
    pub async fn get_views(&self, id: &str) -> Result<Vec<(String, Timestamp)>> {
        self.backend.zrange(&views_key(id)).await
    }

    pub async fn get_view_count(&self, id: &str) -> Result<usize> {
        self.backend.zcard(&views_key(id)).await
    }

    pub async fn remove_view(&self, id: &str, frame_ref: &str) -> Result<bool> {
        self.backend.zrem(&views_key(id), frame_ref).await
    }

    // Metrics hash

    pub async fn set_metrics(&self, id: &str, metrics: &QualityMetrics) -> Result<()> {
        self.backend
            .hset_many(&metrics_key(id), &metrics_to_fields(metrics))
            .await
    }

    /// Latest snapshot, `None` when no metrics were ever recorded
    pub async fn get_metrics(&self, id: &str) -> Result<Option<QualityMetrics>> {
        let fields = self.backend.hgetall(&metrics_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(metrics_from_fields(&fields)))
    }

    // Queues

    pub async fn push(&self, queue: WorkQueue, id: &str) -> Result<()> {
        if queue == WorkQueue::Quarantine {
            return self.push_quarantine(id, "").await;
        }
        self.backend.lpush(queue.key(), id).await?;
        Ok(())
    }

    /// Pop the oldest id; waits up to `timeout` when one is given
    pub async fn pop(&self, queue: WorkQueue, timeout: Option<Duration>) -> Result<Option<ObjectId>> {
        if queue == WorkQueue::Quarantine {
            return Ok(self.pop_quarantine(timeout).await?.map(|e| e.obj_id));
        }
        self.pop_raw(queue.key(), timeout).await
    }

    pub async fn push_quarantine(&self, id: &str, reason: &str) -> Result<()> {
        let entry = QuarantineEntry {
            obj_id: id.to_string(),
            reason: reason.to_string(),
        };
        let payload = serde_json::to_string(&entry)?;
        self.backend.lpush(QUARANTINE_QUEUE, &payload).await?;
        Ok(())
    }

    pub async fn pop_quarantine(&self, timeout: Option<Duration>) -> Result<Option<QuarantineEntry>> {
        let raw = match self.pop_raw(QUARANTINE_QUEUE, timeout).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        // Bare ids pushed by other producers carry no reason
        Ok(Some(serde_json::from_str(&raw).unwrap_or(QuarantineEntry {
            obj_id: raw,
            reason: String::new(),
        })))
    }

    pub async fn queue_len(&self, queue: WorkQueue) -> Result<usize> {
        self.backend.llen(queue.key()).await
    }

    async fn pop_raw(&self, key: &str, timeout: Option<Duration>) -> Result<Option<String>> {
        match timeout {
            Some(t) => self.backend.brpop(key, t).await,
            None => self.backend.rpop(key).await,
        }
    }

    pub async fn ping(&self) -> bool {
        self.backend.ping().await.is_ok()
    }
}
