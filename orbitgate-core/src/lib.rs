//! orbitgate-core: shared data model, errors and configuration for the
//! object admission pipeline.

pub mod types;
pub mod error;
pub mod records;
pub mod config;

pub use error::{Error, Result};
pub use types::{
    new_object_id, now_ts, AdmissionDecision, BBox, CameraPose, ObjectId, ObjectStatus,
    Timestamp, TransitionCause,
};
pub use records::{
    AssetRecord, AssetStage, AuditEntry, EmotionRecord, MetricRecord, ObjectRecord, ObjectRow,
    Observation, QualityMetrics, RecordKind,
};
pub use config::{
    BrainConfig, DetectorBackend, DetectorConfig, PersistenceConfig, PipelineConfig,
    QualityThresholds, QualityWeights, ServerConfig, StoreConfig, ThresholdUpdate, TrackerConfig,
};
