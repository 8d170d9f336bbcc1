//! Object brain: status machine, admission policy and work queues
//!
//! The brain owns object `status` and the three work queues. Every
//! read-modify-write of one object runs under that object's async lock, so
//! concurrent frames touching different objects proceed in parallel while
//! frames touching the same object are serialized.

use crate::detector::{Detection, Detector, Frame};
use crate::processing::tracker::{ObjectTracker, TrackUpdate};
use crate::quality::{MultiViewEvidence, QualityCalculator};
use chrono::Utc;
use dashmap::DashMap;
use orbitgate_core::{
    now_ts, AdmissionDecision, AuditEntry, BrainConfig, CameraPose, Error, MetricRecord,
    ObjectId, ObjectStatus, Observation, QualityMetrics, QualityThresholds, Result,
    ThresholdUpdate, Timestamp, TransitionCause,
};
use orbitgate_storage::{HotField, HotObject, ObjectPersistence, StateStore, WorkQueue};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-object lock entries kept before idle ones are pruned
const MAX_OBJECT_LOCKS: usize = 10_000;

/// Result of a status transition request
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied { from: ObjectStatus, to: ObjectStatus },
    /// Already in the requested status; nothing recorded
    Unchanged,
    Rejected { reason: String },
    NotFound,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Result of a manual override
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideOutcome {
    pub success: bool,
    pub message: String,
}

impl OverrideOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Per-threshold breakdown of an admission check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdReport {
    pub meets_thresholds: bool,
    pub checks: BTreeMap<String, bool>,
    pub values: BTreeMap<String, f64>,
    pub thresholds: QualityThresholds,
}

impl ThresholdReport {
    /// All five thresholds must pass
    pub fn evaluate(
        thresholds: &QualityThresholds,
        orbit_deg: f64,
        mvs_consistency: f64,
        silhouette_iou: f64,
        texture_cov: f64,
        scale_conf: f64,
    ) -> Self {
        let rows = [
            ("orbit_deg", orbit_deg, orbit_deg >= thresholds.orbit_deg_min),
            (
                "mvs_consistency",
                mvs_consistency,
                mvs_consistency <= thresholds.mvs_consistency_max,
            ),
            (
                "silhouette_iou",
                silhouette_iou,
                silhouette_iou >= thresholds.silhouette_iou_min,
            ),
            ("texture_cov", texture_cov, texture_cov >= thresholds.texture_cov_min),
            ("scale_conf", scale_conf, scale_conf >= thresholds.scale_conf_min),
        ];

        let mut checks = BTreeMap::new();
        let mut values = BTreeMap::new();
        for (name, value, passed) in rows {
            checks.insert(name.to_string(), passed);
            values.insert(name.to_string(), value);
        }
        Self {
            meets_thresholds: checks.values().all(|passed| *passed),
            checks,
            values,
            thresholds: thresholds.clone(),
        }
    }

    pub fn failed_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, passed)| !**passed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Object state as reported to operators
#[derive(Debug, Clone, Serialize)]
pub struct ObjectStatusView {
    #[serde(flatten)]
    pub object: HotObject,
    pub metrics: Option<QualityMetrics>,
    pub view_count: usize,
}

/// Orchestrates detector, tracker, store and persistence
pub struct ObjectBrain {
    store: StateStore,
    tracker: Arc<ObjectTracker>,
    detector: RwLock<Arc<dyn Detector>>,
    persistence: Option<Arc<ObjectPersistence>>,
    calculator: QualityCalculator,
    config: RwLock<BrainConfig>,
    locks: DashMap<ObjectId, Arc<Mutex<()>>>,
}

impl ObjectBrain {
    pub fn new(
        store: StateStore,
        tracker: Arc<ObjectTracker>,
        detector: Arc<dyn Detector>,
        config: BrainConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            tracker,
            detector: RwLock::new(detector),
            persistence: None,
            calculator: QualityCalculator::new(config.weights.clone()),
            config: RwLock::new(config),
            locks: DashMap::new(),
        })
    }

    /// Mirror objects, observations and metrics into `persistence`
    pub fn with_persistence(mut self, persistence: Arc<ObjectPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<ObjectTracker> {
        &self.tracker
    }

    pub fn persistence(&self) -> Option<&Arc<ObjectPersistence>> {
        self.persistence.as_ref()
    }

    pub fn detector(&self) -> Arc<dyn Detector> {
        self.detector.read().clone()
    }

    pub fn set_detector(&self, detector: Arc<dyn Detector>) {
        info!("Detector switched to {}", detector.backend());
        *self.detector.write() = detector;
    }

    fn object_lock(&self, obj_id: &str) -> Arc<Mutex<()>> {
        // SECURITY: prune idle locks so the table cannot grow without bound
        if self.locks.len() > MAX_OBJECT_LOCKS {
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        self.locks
            .entry(obj_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Frame path

    /// Detect, track, mirror and apply transition rules for one frame
    pub async fn process_frame(&self, frame: &Frame) -> Result<Vec<ObjectId>> {
        let detector = self.detector();
        let detections = detector.detect(frame).await.map_err(Error::from)?;
        debug!(
            "Frame {}: {} detections from {}",
            frame.frame_id,
            detections.len(),
            detector.backend()
        );
        self.ingest(
            frame.frame_ref(),
            frame.camera_id.as_deref(),
            frame.pose.as_ref(),
            &detections,
            frame.timestamp,
        )
        .await
    }

    /// Frame path for detections produced elsewhere
    pub async fn process_detections(
        &self,
        frame_id: &str,
        detections: &[Detection],
        timestamp: Option<Timestamp>,
    ) -> Result<Vec<ObjectId>> {
        self.ingest(frame_id, None, None, detections, timestamp).await
    }

    async fn ingest(
        &self,
        frame_ref: &str,
        camera_id: Option<&str>,
        pose: Option<&CameraPose>,
        detections: &[Detection],
        timestamp: Option<Timestamp>,
    ) -> Result<Vec<ObjectId>> {
        let updates = self
            .tracker
            .update_detailed(frame_ref, detections, timestamp)
            .await?;

        let mut ids = Vec::with_capacity(updates.len());
        for update in updates {
            let lock = self.object_lock(&update.obj_id);
            let _guard = lock.lock().await;
            self.mirror_update(&update, camera_id, pose).await?;
            let age = update
                .previous_seen_ts
                .map(|prev| update.timestamp - prev)
                .unwrap_or(0.0);
            self.apply_rules(&update.obj_id, age).await?;
            ids.push(update.obj_id);
        }
        Ok(ids)
    }

    async fn mirror_update(
        &self,
        update: &TrackUpdate,
        camera_id: Option<&str>,
        pose: Option<&CameraPose>,
    ) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        if update.created {
            if let Some(object) = self.store.get_object(&update.obj_id).await? {
                persistence
                    .sync_object(object.to_record(update.timestamp), false)
                    .await?;
            }
        }
        persistence.sync_observation(Observation {
            obj_id: update.obj_id.clone(),
            timestamp: update.timestamp,
            camera_id: camera_id.map(str::to_string),
            frame_ref: update.frame_id.clone(),
            bbox: update.detection.bbox,
            mask_ref: None,
            pose: pose.cloned(),
            feature_ref: None,
        })?;
        Ok(())
    }

    /// Transition rules for pending and observing objects. Caller holds the object lock.
    async fn apply_rules(&self, obj_id: &str, age_since_last_seen: f64) -> Result<Option<ObjectStatus>> {
        let Some(mut object) = self.store.get_object(obj_id).await? else {
            return Ok(None);
        };
        let (pending_min, min_views, window) = {
            let config = self.config.read();
            (
                config.pending_min_views,
                config.observation_min_views,
                config.observation_window_sec,
            )
        };

        match object.status {
            ObjectStatus::Pending if object.views >= pending_min => {
                let reason = format!("{} views observed", object.views);
                let outcome = self
                    .transition_locked(&mut object, ObjectStatus::Observing, TransitionCause::Automatic, &reason)
                    .await?;
                if outcome.is_applied() {
                    self.queue_triage(obj_id).await?;
                }
            }
            // One outstanding triage job per object
            ObjectStatus::Observing
                if !object.triage_queued
                    && (object.views >= min_views || age_since_last_seen >= window) =>
            {
                debug!(
                    "Re-queueing {} for triage (views {}, age {:.1}s)",
                    obj_id, object.views, age_since_last_seen
                );
                self.queue_triage(obj_id).await?;
            }
            _ => {}
        }
        Ok(Some(object.status))
    }

    async fn queue_triage(&self, obj_id: &str) -> Result<()> {
        self.store.push(WorkQueue::Triage, obj_id).await?;
        self.store
            .update_object_field(obj_id, HotField::TriageQueued(true))
            .await
    }

    /// Re-evaluate transition rules for an object not seen in the current frame
    pub async fn check_object(&self, obj_id: &str, now: Option<Timestamp>) -> Result<Option<ObjectStatus>> {
        let lock = self.object_lock(obj_id);
        let _guard = lock.lock().await;
        let Some(object) = self.store.get_object(obj_id).await? else {
            return Ok(None);
        };
        let age = now.unwrap_or_else(now_ts) - object.last_seen_ts;
        self.apply_rules(obj_id, age.max(0.0)).await
    }

    // Admission

    /// Compare the latest metrics against the thresholds for the object's class
    pub async fn check_quality_thresholds(&self, obj_id: &str) -> Result<Option<ThresholdReport>> {
        let Some(object) = self.store.get_object(obj_id).await? else {
            return Ok(None);
        };
        let metrics = self
            .store
            .get_metrics(obj_id)
            .await?
            .unwrap_or_else(QualityMetrics::conservative);
        let thresholds = self.config.read().thresholds_for(&object.class);
        Ok(Some(ThresholdReport::evaluate(
            &thresholds,
            object.orbit_deg,
            metrics.mvs_consistency,
            metrics.silhouette_iou,
            metrics.texture_cov,
            object.scale_conf,
        )))
    }

    /// Store the latest metric snapshot; returns false for unknown objects
    pub async fn record_metrics(
        &self,
        obj_id: &str,
        metrics: &QualityMetrics,
        timestamp: Option<Timestamp>,
    ) -> Result<bool> {
        let lock = self.object_lock(obj_id);
        let _guard = lock.lock().await;
        if !self.store.exists(obj_id).await? {
            return Ok(false);
        }
        self.store.set_metrics(obj_id, metrics).await?;
        self.store
            .update_object_field(obj_id, HotField::ScaleConf(metrics.scale_conf))
            .await?;
        if let Some(persistence) = &self.persistence {
            persistence.sync_metrics(MetricRecord {
                obj_id: obj_id.to_string(),
                timestamp: timestamp.unwrap_or_else(now_ts),
                metrics: *metrics,
                decision: None,
            })?;
        }
        Ok(true)
    }

    /// Automatic admission policy.
    ///
    /// While observing, a passing check promotes to `ready` and queues for
    /// reconstruction. A failing check increments the consecutive-failure
    /// counter; reaching `quarantine_failed_attempts` quarantines the object.
    pub async fn evaluate_admission(&self, obj_id: &str) -> Result<Option<AdmissionDecision>> {
        let lock = self.object_lock(obj_id);
        let _guard = lock.lock().await;

        let Some(report) = self.check_quality_thresholds(obj_id).await? else {
            return Ok(None);
        };
        let Some(mut object) = self.store.get_object(obj_id).await? else {
            return Ok(None);
        };
        let limit = self.config.read().quarantine_failed_attempts;
        if object.triage_queued {
            self.store
                .update_object_field(obj_id, HotField::TriageQueued(false))
                .await?;
        }

        let decision = match object.status {
            ObjectStatus::Observing if report.meets_thresholds => {
                let outcome = self
                    .transition_locked(
                        &mut object,
                        ObjectStatus::Ready,
                        TransitionCause::Automatic,
                        "quality thresholds met",
                    )
                    .await?;
                if outcome.is_applied() {
                    self.store.push(WorkQueue::Recon, obj_id).await?;
                }
                self.store
                    .update_object_field(obj_id, HotField::FailedChecks(0))
                    .await?;
                AdmissionDecision::Admit
            }
            ObjectStatus::Observing => {
                let failed = object.failed_checks.saturating_add(1);
                self.store
                    .update_object_field(obj_id, HotField::FailedChecks(failed))
                    .await?;
                debug!(
                    "Object {} failed quality check {}/{}: {:?}",
                    obj_id,
                    failed,
                    limit,
                    report.failed_checks()
                );
                if failed >= limit {
                    let reason = format!("failed {} consecutive quality checks", failed);
                    let outcome = self
                        .transition_locked(
                            &mut object,
                            ObjectStatus::Quarantine,
                            TransitionCause::Automatic,
                            &reason,
                        )
                        .await?;
                    if outcome.is_applied() {
                        self.store.push_quarantine(obj_id, &reason).await?;
                    }
                    AdmissionDecision::Quarantine
                } else {
                    AdmissionDecision::Observe
                }
            }
            ObjectStatus::Ready => AdmissionDecision::Admit,
            ObjectStatus::Quarantine => AdmissionDecision::Quarantine,
            ObjectStatus::Pending => AdmissionDecision::Observe,
        };

        if let Some(persistence) = &self.persistence {
            let metrics = self
                .store
                .get_metrics(obj_id)
                .await?
                .unwrap_or_else(QualityMetrics::conservative);
            persistence.sync_metrics(MetricRecord {
                obj_id: obj_id.to_string(),
                timestamp: now_ts(),
                metrics,
                decision: Some(decision),
            })?;
        }
        Ok(Some(decision))
    }

    /// Compute metrics from evidence, record them and run the admission policy
    pub async fn assess(
        &self,
        obj_id: &str,
        evidence: &MultiViewEvidence,
    ) -> Result<Option<AdmissionDecision>> {
        let Some(object) = self.store.get_object(obj_id).await? else {
            return Ok(None);
        };
        let weights = self.config.read().weights.clone();
        let metrics = self
            .calculator
            .evaluate(evidence, object.orbit_deg, Some(&weights));
        if !self.record_metrics(obj_id, &metrics, None).await? {
            return Ok(None);
        }
        self.evaluate_admission(obj_id).await
    }

    // Transitions

    /// Apply `to` along an automatic edge
    pub async fn transition(&self, obj_id: &str, to: ObjectStatus, reason: &str) -> Result<TransitionOutcome> {
        self.transition_with_cause(obj_id, to, TransitionCause::Automatic, reason)
            .await
    }

    /// String-facing transition; unknown statuses are rejected without a state change
    pub async fn transition_status(&self, obj_id: &str, status: &str, reason: &str) -> Result<TransitionOutcome> {
        match status.parse::<ObjectStatus>() {
            Ok(to) => self.transition(obj_id, to, reason).await,
            Err(e) => {
                warn!("Rejected transition of {}: {}", obj_id, e);
                Ok(TransitionOutcome::Rejected { reason: e })
            }
        }
    }

    async fn transition_with_cause(
        &self,
        obj_id: &str,
        to: ObjectStatus,
        cause: TransitionCause,
        reason: &str,
    ) -> Result<TransitionOutcome> {
        let lock = self.object_lock(obj_id);
        let _guard = lock.lock().await;
        let Some(mut object) = self.store.get_object(obj_id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        self.transition_locked(&mut object, to, cause, reason).await
    }

    /// Caller holds the object lock
    async fn transition_locked(
        &self,
        object: &mut HotObject,
        to: ObjectStatus,
        cause: TransitionCause,
        reason: &str,
    ) -> Result<TransitionOutcome> {
        let from = object.status;
        if from == to {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !from.allows(to, cause) {
            let message = format!("transition {} -> {} is not allowed", from, to);
            warn!("Rejected transition of {}: {}", object.id, message);
            return Ok(TransitionOutcome::Rejected { reason: message });
        }

        object.status = to;
        object.notes.push(AuditEntry {
            from,
            to,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.store
            .update_object_fields(
                &object.id,
                vec![HotField::Status(to), HotField::Notes(object.notes.clone())],
            )
            .await?;
        info!(obj_id = %object.id, %from, %to, reason, "Status transition");

        if let Some(persistence) = &self.persistence {
            persistence.sync_object(object.to_record(now_ts()), false).await?;
        }
        Ok(TransitionOutcome::Applied { from, to })
    }

    // Manual overrides

    /// Re-admit into `observing` and queue straight for reconstruction
    pub async fn force_admit(&self, obj_id: &str, reason: &str) -> Result<OverrideOutcome> {
        let lock = self.object_lock(obj_id);
        let _guard = lock.lock().await;
        let Some(mut object) = self.store.get_object(obj_id).await? else {
            return Ok(OverrideOutcome::failed(format!("object {} not found", obj_id)));
        };
        let reason = format!("manual admit: {}", reason);
        match self
            .transition_locked(&mut object, ObjectStatus::Observing, TransitionCause::Manual, &reason)
            .await?
        {
            TransitionOutcome::Rejected { reason } => Ok(OverrideOutcome::failed(reason)),
            TransitionOutcome::NotFound => {
                Ok(OverrideOutcome::failed(format!("object {} not found", obj_id)))
            }
            _ => {
                self.store
                    .update_object_field(obj_id, HotField::FailedChecks(0))
                    .await?;
                self.store.push(WorkQueue::Recon, obj_id).await?;
                info!("Force-admitted {} ({})", obj_id, reason);
                Ok(OverrideOutcome::ok(format!("object {} admitted to recon", obj_id)))
            }
        }
    }

    /// Quarantine with `reason`; repeated calls leave a single transition
    pub async fn force_quarantine(&self, obj_id: &str, reason: &str) -> Result<OverrideOutcome> {
        let lock = self.object_lock(obj_id);
        let _guard = lock.lock().await;
        let Some(mut object) = self.store.get_object(obj_id).await? else {
            return Ok(OverrideOutcome::failed(format!("object {} not found", obj_id)));
        };
        match self
            .transition_locked(&mut object, ObjectStatus::Quarantine, TransitionCause::Manual, reason)
            .await?
        {
            TransitionOutcome::Applied { .. } => {
                self.store.push_quarantine(obj_id, reason).await?;
                Ok(OverrideOutcome::ok(format!("object {} quarantined", obj_id)))
            }
            TransitionOutcome::Unchanged => {
                Ok(OverrideOutcome::ok(format!("object {} already quarantined", obj_id)))
            }
            TransitionOutcome::Rejected { reason } => Ok(OverrideOutcome::failed(reason)),
            TransitionOutcome::NotFound => {
                Ok(OverrideOutcome::failed(format!("object {} not found", obj_id)))
            }
        }
    }

    // Queries

    pub async fn get_object_status(&self, obj_id: &str) -> Result<Option<ObjectStatusView>> {
        let Some(object) = self.store.get_object(obj_id).await? else {
            return Ok(None);
        };
        Ok(Some(ObjectStatusView {
            metrics: self.store.get_metrics(obj_id).await?,
            view_count: self.store.get_view_count(obj_id).await?,
            object,
        }))
    }

    /// Live objects, oldest first, optionally filtered by status
    pub async fn list_objects(&self, status: Option<ObjectStatus>) -> Result<Vec<HotObject>> {
        let mut objects = Vec::new();
        for id in self.store.list_object_ids().await? {
            if let Some(object) = self.store.get_object(&id).await? {
                if status.map_or(true, |s| s == object.status) {
                    objects.push(object);
                }
            }
        }
        objects.sort_by(|a, b| {
            a.created_at
                .total_cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(objects)
    }

    /// Durable metric history, newest first. Empty without persistence.
    pub async fn get_object_history(&self, obj_id: &str, limit: usize) -> Result<Vec<MetricRecord>> {
        match &self.persistence {
            Some(persistence) => persistence.get_object_metrics(obj_id, limit).await,
            None => Ok(Vec::new()),
        }
    }

    // Configuration

    pub fn config(&self) -> BrainConfig {
        self.config.read().clone()
    }

    pub fn thresholds(&self) -> QualityThresholds {
        self.config.read().thresholds.clone()
    }

    /// Partial threshold update, effective on the next evaluation
    pub fn update_thresholds(&self, update: &ThresholdUpdate) -> Result<QualityThresholds> {
        let mut config = self.config.write();
        let merged = config.thresholds.merged(update);
        merged.validate()?;
        config.thresholds = merged.clone();
        info!("Quality thresholds updated: {:?}", merged);
        Ok(merged)
    }

    pub fn set_class_thresholds(&self, class: &str, thresholds: QualityThresholds) -> Result<()> {
        thresholds.validate()?;
        info!("Thresholds for class {} set: {:?}", class, thresholds);
        self.config
            .write()
            .per_class_thresholds
            .insert(class.to_string(), thresholds);
        Ok(())
    }

    /// Replace the whole brain configuration
    pub fn update_config(&self, config: BrainConfig) -> Result<()> {
        config.validate()?;
        info!("Brain configuration replaced");
        *self.config.write() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{NullDetector, StaticDetector};
    use image::DynamicImage;
    use orbitgate_core::{BBox, PersistenceConfig, RecordKind, TrackerConfig};
    use orbitgate_storage::{MemoryBackend, MemoryDurableStore};

    fn create_detection(bbox: (f32, f32, f32, f32)) -> Detection {
        Detection::new(BBox::new(bbox.0, bbox.1, bbox.2, bbox.3), 0, "cup", 0.9)
    }

    fn brain_with(detector: Arc<dyn Detector>) -> ObjectBrain {
        let store = StateStore::new(Arc::new(MemoryBackend::new()));
        let tracker = Arc::new(ObjectTracker::new(store.clone(), TrackerConfig::default(), None));
        ObjectBrain::new(store, tracker, detector, BrainConfig::default()).unwrap()
    }

    fn brain() -> ObjectBrain {
        brain_with(Arc::new(NullDetector))
    }

    fn passing_metrics() -> QualityMetrics {
        QualityMetrics {
            orbit_deg: 250.0,
            mvs_consistency: 0.05,
            silhouette_iou: 0.8,
            texture_cov: 0.7,
            scale_conf: 0.9,
            ..QualityMetrics::conservative()
        }
    }

    /// Track one object for `frames` frames and return its id
    async fn observed_object(brain: &ObjectBrain, frames: usize) -> ObjectId {
        let mut id = None;
        for i in 0..frames {
            let ids = brain
                .process_detections(&format!("f{}", i), &[create_detection((0.0, 0.0, 10.0, 10.0))], Some(i as f64))
                .await
                .unwrap();
            id = Some(ids[0].clone());
        }
        id.unwrap()
    }

    async fn set_orbit(brain: &ObjectBrain, id: &str, orbit: f64) {
        brain
            .store()
            .update_object_field(id, HotField::OrbitDeg(orbit))
            .await
            .unwrap();
    }

    #[test]
    fn test_threshold_report_gating() {
        let t = QualityThresholds::default();
        let pass = ThresholdReport::evaluate(&t, 250.0, 0.05, 0.8, 0.7, 0.9);
        assert!(pass.meets_thresholds);
        assert!(pass.checks.values().all(|c| *c));

        let fail = ThresholdReport::evaluate(&t, 250.0, 0.05, 0.5, 0.7, 0.9);
        assert!(!fail.meets_thresholds);
        assert_eq!(fail.checks["silhouette_iou"], false);
        for name in ["orbit_deg", "mvs_consistency", "texture_cov", "scale_conf"] {
            assert!(fail.checks[name], "{} should pass", name);
        }
        assert_eq!(fail.values["silhouette_iou"], 0.5);
        assert_eq!(fail.failed_checks(), vec!["silhouette_iou"]);
    }

    #[tokio::test]
    async fn test_pending_to_observing_after_three_views() {
        let brain = brain();
        let id = observed_object(&brain, 2).await;
        assert_eq!(brain.store().get_object(&id).await.unwrap().unwrap().status, ObjectStatus::Pending);
        assert_eq!(brain.store().queue_len(WorkQueue::Triage).await.unwrap(), 0);

        brain
            .process_detections("f2", &[create_detection((0.0, 0.0, 10.0, 10.0))], Some(2.0))
            .await
            .unwrap();
        let object = brain.store().get_object(&id).await.unwrap().unwrap();
        assert_eq!(object.status, ObjectStatus::Observing);
        assert_eq!(object.notes.len(), 1);
        assert_eq!(object.notes[0].from, ObjectStatus::Pending);
        assert_eq!(brain.store().pop(WorkQueue::Triage, None).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_observing_requeued_after_window() {
        let brain = brain();
        let id = observed_object(&brain, 3).await;
        assert_eq!(brain.store().pop(WorkQueue::Triage, None).await.unwrap(), Some(id.clone()));
        assert!(brain.store().get_object(&id).await.unwrap().unwrap().triage_queued);
        // A triage worker evaluates the object
        brain.evaluate_admission(&id).await.unwrap();
        assert!(!brain.store().get_object(&id).await.unwrap().unwrap().triage_queued);

        // Seen again within the window: no re-queue
        brain
            .process_detections("f3", &[create_detection((0.0, 0.0, 10.0, 10.0))], Some(4.0))
            .await
            .unwrap();
        assert_eq!(brain.store().queue_len(WorkQueue::Triage).await.unwrap(), 0);

        let status = brain.check_object(&id, Some(40.0)).await.unwrap();
        assert_eq!(status, Some(ObjectStatus::Observing));
        assert_eq!(brain.store().queue_len(WorkQueue::Triage).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_triage_queue_bounded_while_job_outstanding() {
        let brain = brain();
        // Reaches observing at 3 views, then keeps exceeding min_views
        let id = observed_object(&brain, 15).await;
        assert_eq!(brain.store().queue_len(WorkQueue::Triage).await.unwrap(), 1);
        for ts in [50.0, 100.0, 150.0] {
            brain.check_object(&id, Some(ts)).await.unwrap();
        }
        assert_eq!(brain.store().queue_len(WorkQueue::Triage).await.unwrap(), 1);

        // Once evaluated, the next rule pass queues it again
        brain.store().pop(WorkQueue::Triage, None).await.unwrap();
        brain.evaluate_admission(&id).await.unwrap();
        brain.check_object(&id, Some(200.0)).await.unwrap();
        assert_eq!(brain.store().queue_len(WorkQueue::Triage).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_check_quality_thresholds_end_to_end() {
        let brain = brain();
        let id = observed_object(&brain, 1).await;
        set_orbit(&brain, &id, 250.0).await;
        brain.record_metrics(&id, &passing_metrics(), Some(1.0)).await.unwrap();

        let report = brain.check_quality_thresholds(&id).await.unwrap().unwrap();
        assert!(report.meets_thresholds);

        let worse = QualityMetrics {
            silhouette_iou: 0.5,
            ..passing_metrics()
        };
        brain.record_metrics(&id, &worse, Some(2.0)).await.unwrap();
        let report = brain.check_quality_thresholds(&id).await.unwrap().unwrap();
        assert!(!report.meets_thresholds);
        assert_eq!(report.failed_checks(), vec!["silhouette_iou"]);

        assert!(brain.check_quality_thresholds("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_metrics_fail_conservatively() {
        let brain = brain();
        let id = observed_object(&brain, 1).await;
        set_orbit(&brain, &id, 359.0).await;
        let report = brain.check_quality_thresholds(&id).await.unwrap().unwrap();
        assert!(!report.meets_thresholds);
        assert!(report.checks["orbit_deg"]);
        assert!(!report.checks["mvs_consistency"]);
    }

    #[tokio::test]
    async fn test_threshold_update_takes_effect() {
        let brain = brain();
        let id = observed_object(&brain, 1).await;
        set_orbit(&brain, &id, 200.0).await;
        brain.record_metrics(&id, &passing_metrics(), None).await.unwrap();
        assert!(!brain.check_quality_thresholds(&id).await.unwrap().unwrap().meets_thresholds);

        brain
            .update_thresholds(&ThresholdUpdate {
                orbit_deg_min: Some(180.0),
                ..Default::default()
            })
            .unwrap();
        assert!(brain.check_quality_thresholds(&id).await.unwrap().unwrap().meets_thresholds);

        let invalid = ThresholdUpdate {
            silhouette_iou_min: Some(1.5),
            ..Default::default()
        };
        assert!(brain.update_thresholds(&invalid).is_err());
        assert_eq!(brain.thresholds().orbit_deg_min, 180.0);
    }

    #[tokio::test]
    async fn test_per_class_thresholds() {
        let brain = brain();
        let id = observed_object(&brain, 1).await;
        set_orbit(&brain, &id, 250.0).await;
        brain.record_metrics(&id, &passing_metrics(), None).await.unwrap();

        let strict = QualityThresholds {
            orbit_deg_min: 300.0,
            ..QualityThresholds::default()
        };
        brain.set_class_thresholds("cup", strict).unwrap();
        let report = brain.check_quality_thresholds(&id).await.unwrap().unwrap();
        assert!(!report.checks["orbit_deg"]);
    }

    #[tokio::test]
    async fn test_admission_promotes_to_ready() {
        let brain = brain();
        let id = observed_object(&brain, 3).await;
        set_orbit(&brain, &id, 250.0).await;
        brain.record_metrics(&id, &passing_metrics(), None).await.unwrap();

        let decision = brain.evaluate_admission(&id).await.unwrap();
        assert_eq!(decision, Some(AdmissionDecision::Admit));
        let object = brain.store().get_object(&id).await.unwrap().unwrap();
        assert_eq!(object.status, ObjectStatus::Ready);
        assert_eq!(brain.store().pop(WorkQueue::Recon, None).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_failed_checks_quarantine() {
        let brain = brain();
        let id = observed_object(&brain, 3).await;

        for expected in [AdmissionDecision::Observe, AdmissionDecision::Observe] {
            assert_eq!(brain.evaluate_admission(&id).await.unwrap(), Some(expected));
        }
        assert_eq!(
            brain.evaluate_admission(&id).await.unwrap(),
            Some(AdmissionDecision::Quarantine)
        );
        let object = brain.store().get_object(&id).await.unwrap().unwrap();
        assert_eq!(object.status, ObjectStatus::Quarantine);
        assert_eq!(object.failed_checks, 3);

        let entry = brain.store().pop_quarantine(None).await.unwrap().unwrap();
        assert_eq!(entry.obj_id, id);
        assert!(entry.reason.contains("3 consecutive"));
    }

    #[tokio::test]
    async fn test_pass_resets_failed_checks() {
        let brain = brain();
        let id = observed_object(&brain, 3).await;
        brain.evaluate_admission(&id).await.unwrap();
        brain.evaluate_admission(&id).await.unwrap();

        set_orbit(&brain, &id, 250.0).await;
        brain.record_metrics(&id, &passing_metrics(), None).await.unwrap();
        assert_eq!(brain.evaluate_admission(&id).await.unwrap(), Some(AdmissionDecision::Admit));
        assert_eq!(brain.store().get_object(&id).await.unwrap().unwrap().failed_checks, 0);
    }

    #[tokio::test]
    async fn test_force_quarantine_idempotent() {
        let brain = brain();
        let id = observed_object(&brain, 1).await;

        let first = brain.force_quarantine(&id, "operator").await.unwrap();
        assert!(first.success);
        let notes_after_first = brain.store().get_object(&id).await.unwrap().unwrap().notes.len();

        let second = brain.force_quarantine(&id, "operator").await.unwrap();
        assert!(second.success);
        let object = brain.store().get_object(&id).await.unwrap().unwrap();
        assert_eq!(object.status, ObjectStatus::Quarantine);
        assert_eq!(object.notes.len(), notes_after_first);
        assert_eq!(brain.store().queue_len(WorkQueue::Quarantine).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_force_admit_from_quarantine() {
        let brain = brain();
        let id = observed_object(&brain, 1).await;
        brain.force_quarantine(&id, "blurry").await.unwrap();

        let outcome = brain.force_admit(&id, "looks fine").await.unwrap();
        assert!(outcome.success);
        let object = brain.store().get_object(&id).await.unwrap().unwrap();
        assert_eq!(object.status, ObjectStatus::Observing);
        assert!(object.notes.last().unwrap().reason.contains("looks fine"));
        assert_eq!(brain.store().pop(WorkQueue::Recon, None).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_overrides_unknown_object() {
        let brain = brain();
        assert!(!brain.force_admit("ghost", "x").await.unwrap().success);
        assert!(!brain.force_quarantine("ghost", "x").await.unwrap().success);
        assert!(brain.get_object_status("ghost").await.unwrap().is_none());
        assert_eq!(
            brain.transition("ghost", ObjectStatus::Ready, "x").await.unwrap(),
            TransitionOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let brain = brain();
        let id = observed_object(&brain, 1).await;

        let outcome = brain.transition(&id, ObjectStatus::Ready, "skip").await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Rejected { .. }));
        let outcome = brain.transition_status(&id, "archived", "bogus").await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Rejected { .. }));

        let object = brain.store().get_object(&id).await.unwrap().unwrap();
        assert_eq!(object.status, ObjectStatus::Pending);
        assert!(object.notes.is_empty());

        brain.force_quarantine(&id, "bad").await.unwrap();
        let outcome = brain.transition_status(&id, "observing", "auto").await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_same_status_transition_is_noop() {
        let brain = brain();
        let id = observed_object(&brain, 1).await;
        assert_eq!(
            brain.transition_status(&id, "pending", "again").await.unwrap(),
            TransitionOutcome::Unchanged
        );
        assert!(brain.store().get_object(&id).await.unwrap().unwrap().notes.is_empty());
    }

    #[tokio::test]
    async fn test_list_objects_by_status() {
        let brain = brain();
        let a = observed_object(&brain, 3).await;
        let b = brain
            .process_detections("g0", &[create_detection((100.0, 100.0, 110.0, 110.0))], Some(10.0))
            .await
            .unwrap()
            .remove(0);

        let all = brain.list_objects(None).await.unwrap();
        assert_eq!(all.iter().map(|o| o.id.clone()).collect::<Vec<_>>(), vec![a.clone(), b.clone()]);
        let observing = brain.list_objects(Some(ObjectStatus::Observing)).await.unwrap();
        assert_eq!(observing.len(), 1);
        assert_eq!(observing[0].id, a);
        assert!(brain.list_objects(Some(ObjectStatus::Ready)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_object_status_view() {
        let brain = brain();
        let id = observed_object(&brain, 2).await;
        let view = brain.get_object_status(&id).await.unwrap().unwrap();
        assert_eq!(view.view_count, 2);
        assert!(view.metrics.is_none());

        brain.record_metrics(&id, &passing_metrics(), None).await.unwrap();
        let view = brain.get_object_status(&id).await.unwrap().unwrap();
        assert_eq!(view.metrics.map(|m| m.texture_cov), Some(0.7));
        assert_eq!(view.object.scale_conf, 0.9);
    }

    #[tokio::test]
    async fn test_process_frame_with_persistence() {
        let detector = Arc::new(StaticDetector::repeating(vec![create_detection((0.0, 0.0, 10.0, 10.0))]));
        let durable = Arc::new(MemoryDurableStore::default());
        let persistence = Arc::new(ObjectPersistence::new(durable, &PersistenceConfig::default()));
        let brain = brain_with(detector).with_persistence(persistence.clone());

        let mut id = None;
        for i in 0..3 {
            let frame = Frame::new(format!("frame-{}", i), DynamicImage::new_luma8(4, 4))
                .with_camera("cam-0")
                .with_timestamp(i as f64);
            let ids = brain.process_frame(&frame).await.unwrap();
            id = Some(ids[0].clone());
        }
        let id = id.unwrap();

        // Creation plus the pending -> observing transition
        assert_eq!(persistence.buffered_len(RecordKind::Object), 2);
        assert_eq!(persistence.buffered_len(RecordKind::Observation), 3);

        persistence.flush_all().await.unwrap();
        let row = persistence.get_object(&id).await.unwrap().unwrap();
        assert_eq!(row.status, ObjectStatus::Observing);
        let observations = persistence.get_object_observations(&id, 10).await.unwrap();
        assert_eq!(observations.len(), 3);
        assert_eq!(observations[0].camera_id.as_deref(), Some("cam-0"));
    }

    #[tokio::test]
    async fn test_admission_history_recorded() {
        let durable = Arc::new(MemoryDurableStore::default());
        let persistence = Arc::new(ObjectPersistence::new(durable, &PersistenceConfig::default()));
        let brain = brain().with_persistence(persistence.clone());
        let id = observed_object(&brain, 3).await;
        set_orbit(&brain, &id, 250.0).await;

        brain.record_metrics(&id, &passing_metrics(), Some(100.0)).await.unwrap();
        brain.evaluate_admission(&id).await.unwrap();
        persistence.flush_all().await.unwrap();

        let history = brain.get_object_history(&id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].decision, Some(AdmissionDecision::Admit));
        assert_eq!(history[1].decision, None);
    }

    #[tokio::test]
    async fn test_assess_computes_and_evaluates() {
        use crate::quality::ViewEvidence;

        let brain = brain();
        let id = observed_object(&brain, 3).await;
        let evidence = MultiViewEvidence::new(vec![
            ViewEvidence {
                bbox: Some(BBox::new(0.0, 0.0, 10.0, 10.0)),
                ..Default::default()
            },
            ViewEvidence {
                bbox: Some(BBox::new(0.0, 0.0, 10.0, 10.0)),
                ..Default::default()
            },
        ]);
        // Orbit 0 and no depth: fails, stays observing
        assert_eq!(brain.assess(&id, &evidence).await.unwrap(), Some(AdmissionDecision::Observe));
        let metrics = brain.store().get_metrics(&id).await.unwrap().unwrap();
        assert_eq!(metrics.scale_conf, 1.0);
        assert_eq!(brain.assess("ghost", &evidence).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_frames_distinct_objects() {
        let brain = Arc::new(brain());
        let mut handles = Vec::new();
        for cam in 0..4 {
            let brain = brain.clone();
            handles.push(tokio::spawn(async move {
                let x = cam as f32 * 100.0;
                for i in 0..5 {
                    brain
                        .process_detections(
                            &format!("cam{}-f{}", cam, i),
                            &[create_detection((x, 0.0, x + 10.0, 10.0))],
                            Some(i as f64),
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let objects = brain.list_objects(None).await.unwrap();
        assert_eq!(objects.len(), 4);
        for object in objects {
            assert_eq!(object.views, 5);
            assert_eq!(object.status, ObjectStatus::Observing);
        }
    }
}
