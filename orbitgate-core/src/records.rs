//! Records mirrored into durable storage

use crate::types::{AdmissionDecision, BBox, CameraPose, ObjectId, ObjectStatus, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One status transition in an object's audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub from: ObjectStatus,
    pub to: ObjectStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Object snapshot queued for upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub class: String,
    pub status: ObjectStatus,
    pub notes: Vec<AuditEntry>,
    pub updated_at: Timestamp,
}

/// Object row as stored durably
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRow {
    pub id: ObjectId,
    pub class: String,
    pub status: ObjectStatus,
    pub notes: Vec<AuditEntry>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ObjectRow {
    /// Apply `record` over an existing row (or create one), keeping `created_at`
    pub fn upsert(existing: Option<&ObjectRow>, record: &ObjectRecord) -> Self {
        Self {
            id: record.id.clone(),
            class: record.class.clone(),
            status: record.status,
            notes: record.notes.clone(),
            created_at: existing.map(|r| r.created_at).unwrap_or(record.updated_at),
            updated_at: record.updated_at,
        }
    }
}

/// One detection of one object in one frame. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub obj_id: ObjectId,
    pub timestamp: Timestamp,
    pub camera_id: Option<String>,
    pub frame_ref: String,
    pub bbox: BBox,
    pub mask_ref: Option<String>,
    pub pose: Option<CameraPose>,
    pub feature_ref: Option<String>,
}

/// Named quality scores for one object
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Degrees, higher is better
    pub orbit_deg: f64,
    /// Lower is better
    pub mvs_consistency: f64,
    /// Higher is better
    pub silhouette_iou: f64,
    /// Lower is better
    pub photometric_err: f64,
    /// Lower is better
    pub depth_var: f64,
    /// Degrees, higher is better
    pub pose_spread_deg: f64,
    /// Higher is better
    pub texture_cov: f64,
    /// Higher is better
    pub scale_conf: f64,
    /// Weighted aggregate in `[0, 1]`
    pub quality_score: f64,
}

impl QualityMetrics {
    /// Worst-case values, used when evidence is missing
    pub fn conservative() -> Self {
        Self {
            orbit_deg: 0.0,
            mvs_consistency: 1.0,
            silhouette_iou: 0.0,
            photometric_err: 1.0,
            depth_var: 1.0,
            pose_spread_deg: 0.0,
            texture_cov: 0.0,
            scale_conf: 0.0,
            quality_score: 0.0,
        }
    }
}

impl Default for QualityMetrics {
    fn default() -> Self {
        Self::conservative()
    }
}

/// Append-only metric snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub obj_id: ObjectId,
    pub timestamp: Timestamp,
    pub metrics: QualityMetrics,
    pub decision: Option<AdmissionDecision>,
}

/// Downstream artifact stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStage {
    Proxy,
    Mesh,
    #[serde(rename = "3dgs")]
    GaussianSplat,
    Nerf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub obj_id: ObjectId,
    pub stage: AssetStage,
    pub path: String,
    pub quality_score: Option<f64>,
    pub timestamp: Timestamp,
}

/// Affect annotation produced outside the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionRecord {
    pub obj_id: ObjectId,
    pub timestamp: Timestamp,
    pub tags: Vec<String>,
    /// -1 to 1
    pub valence: f64,
    /// -1 to 1
    pub arousal: f64,
    pub confidence: f64,
}

/// Durable record families, one buffer and one table each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Object,
    Observation,
    Metric,
    Asset,
    Emotion,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Object,
        RecordKind::Observation,
        RecordKind::Metric,
        RecordKind::Asset,
        RecordKind::Emotion,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            RecordKind::Object => "objects",
            RecordKind::Observation => "object_observations",
            RecordKind::Metric => "object_metrics",
            RecordKind::Asset => "object_assets",
            RecordKind::Emotion => "object_emotion",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(updated_at: Timestamp, status: ObjectStatus) -> ObjectRecord {
        ObjectRecord {
            id: "obj-1".to_string(),
            class: "cup".to_string(),
            status,
            notes: Vec::new(),
            updated_at,
        }
    }

    #[test]
    fn test_upsert_keeps_created_at() {
        let first = ObjectRow::upsert(None, &record(10.0, ObjectStatus::Pending));
        assert_eq!(first.created_at, 10.0);

        let second = ObjectRow::upsert(Some(&first), &record(25.0, ObjectStatus::Observing));
        assert_eq!(second.created_at, 10.0);
        assert_eq!(second.updated_at, 25.0);
        assert_eq!(second.status, ObjectStatus::Observing);
    }

    #[test]
    fn test_conservative_metrics() {
        let m = QualityMetrics::conservative();
        assert_eq!(m.mvs_consistency, 1.0);
        assert_eq!(m.silhouette_iou, 0.0);
        assert_eq!(m.quality_score, 0.0);
    }

    #[test]
    fn test_asset_stage_names() {
        assert_eq!(serde_json::to_string(&AssetStage::GaussianSplat).unwrap(), "\"3dgs\"");
        assert_eq!(serde_json::to_string(&AssetStage::Mesh).unwrap(), "\"mesh\"");
    }

    #[test]
    fn test_table_names() {
        assert_eq!(RecordKind::Object.table_name(), "objects");
        assert_eq!(RecordKind::Emotion.table_name(), "object_emotion");
    }
}
