//! Configuration for the admission pipeline

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Admission thresholds. All five must pass for an object to be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub orbit_deg_min: f64,
    pub mvs_consistency_max: f64,
    pub silhouette_iou_min: f64,
    pub texture_cov_min: f64,
    pub scale_conf_min: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            orbit_deg_min: 240.0,
            mvs_consistency_max: 0.1,
            silhouette_iou_min: 0.7,
            texture_cov_min: 0.6,
            scale_conf_min: 0.8,
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(Error::Configuration(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

impl QualityThresholds {
    pub fn validate(&self) -> Result<()> {
        if !self.orbit_deg_min.is_finite() || !(0.0..=360.0).contains(&self.orbit_deg_min) {
            return Err(Error::Configuration(format!(
                "orbit_deg_min must be within [0, 360], got {}",
                self.orbit_deg_min
            )));
        }
        check_unit("mvs_consistency_max", self.mvs_consistency_max)?;
        check_unit("silhouette_iou_min", self.silhouette_iou_min)?;
        check_unit("texture_cov_min", self.texture_cov_min)?;
        check_unit("scale_conf_min", self.scale_conf_min)?;
        Ok(())
    }

    /// Apply a partial update, returning the merged thresholds
    pub fn merged(&self, update: &ThresholdUpdate) -> Self {
        Self {
            orbit_deg_min: update.orbit_deg_min.unwrap_or(self.orbit_deg_min),
            mvs_consistency_max: update.mvs_consistency_max.unwrap_or(self.mvs_consistency_max),
            silhouette_iou_min: update.silhouette_iou_min.unwrap_or(self.silhouette_iou_min),
            texture_cov_min: update.texture_cov_min.unwrap_or(self.texture_cov_min),
            scale_conf_min: update.scale_conf_min.unwrap_or(self.scale_conf_min),
        }
    }
}

/// Partial threshold update; absent fields keep their current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdUpdate {
    pub orbit_deg_min: Option<f64>,
    pub mvs_consistency_max: Option<f64>,
    pub silhouette_iou_min: Option<f64>,
    pub texture_cov_min: Option<f64>,
    pub scale_conf_min: Option<f64>,
}

/// Weights of the aggregate quality score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub orbit: f64,
    pub mvs: f64,
    pub silhouette: f64,
    pub texture: f64,
    pub scale: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            orbit: 0.30,
            mvs: 0.25,
            silhouette: 0.20,
            texture: 0.15,
            scale: 0.10,
        }
    }
}

impl QualityWeights {
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("orbit", self.orbit),
            ("mvs", self.mvs),
            ("silhouette", self.silhouette),
            ("texture", self.texture),
            ("scale", self.scale),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::Configuration(format!(
                    "weight {} must be finite and non-negative, got {}",
                    name, w
                )));
            }
        }
        Ok(())
    }
}

/// Tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue a track
    pub iou_threshold: f32,
    /// Seconds without a detection before a track is dropped
    pub max_age: f64,
    /// Upper bound on live tracks
    pub max_tracks: usize,
    /// Expiry applied to an evicted track's hot state
    pub stale_ttl_secs: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            max_age: 30.0,
            max_tracks: 1000,
            stale_ttl_secs: Some(300),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.iou_threshold.is_finite() || !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(Error::Configuration(format!(
                "iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            )));
        }
        if !self.max_age.is_finite() || self.max_age <= 0.0 {
            return Err(Error::Configuration(format!(
                "max_age must be positive, got {}",
                self.max_age
            )));
        }
        if self.max_tracks == 0 {
            return Err(Error::Configuration("max_tracks must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Object brain configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    pub thresholds: QualityThresholds,
    /// Class name -> thresholds used instead of the global ones
    pub per_class_thresholds: HashMap<String, QualityThresholds>,
    pub weights: QualityWeights,
    pub observation_window_sec: f64,
    pub observation_min_views: u64,
    pub quarantine_failed_attempts: u32,
    /// Views needed to leave `pending`
    pub pending_min_views: u64,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            thresholds: QualityThresholds::default(),
            per_class_thresholds: HashMap::new(),
            weights: QualityWeights::default(),
            observation_window_sec: 30.0,
            observation_min_views: 10,
            quarantine_failed_attempts: 3,
            pending_min_views: 3,
        }
    }
}

impl BrainConfig {
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        for (class, t) in &self.per_class_thresholds {
            t.validate().map_err(|e| {
                Error::Configuration(format!("thresholds for class {}: {}", class, e))
            })?;
        }
        self.weights.validate()?;
        if !self.observation_window_sec.is_finite() || self.observation_window_sec < 0.0 {
            return Err(Error::Configuration(format!(
                "observation_window_sec must be non-negative, got {}",
                self.observation_window_sec
            )));
        }
        if self.quarantine_failed_attempts == 0 {
            return Err(Error::Configuration(
                "quarantine_failed_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Thresholds that apply to objects of `class`
    pub fn thresholds_for(&self, class: &str) -> QualityThresholds {
        self.per_class_thresholds
            .get(class)
            .copied()
            .unwrap_or(self.thresholds)
    }
}

/// Durable persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Records per buffer before a flush is requested
    pub buffer_size: usize,
    pub flush_interval_secs: u64,
    /// Records one buffer may hold while the durable store is failing;
    /// further syncs of that kind are rejected until a flush succeeds
    pub max_buffered_records: usize,
    /// Sled database directory; in-memory store when unset
    pub path: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval_secs: 10,
            max_buffered_records: 100_000,
            path: None,
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Configuration("buffer_size must be non-zero".to_string()));
        }
        if self.flush_interval_secs == 0 {
            return Err(Error::Configuration(
                "flush_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.max_buffered_records < self.buffer_size {
            return Err(Error::Configuration(format!(
                "max_buffered_records ({}) must be at least buffer_size ({})",
                self.max_buffered_records, self.buffer_size
            )));
        }
        Ok(())
    }
}

/// Ephemeral store configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Expiry applied to newly created hot objects
    pub object_ttl_secs: Option<u64>,
}

/// Detector backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    #[default]
    Yolov8,
    Detectron2,
    #[serde(rename = "metaclip")]
    MetaClip,
    Custom,
    /// Detects nothing
    Null,
}

impl DetectorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorBackend::Yolov8 => "yolov8",
            DetectorBackend::Detectron2 => "detectron2",
            DetectorBackend::MetaClip => "metaclip",
            DetectorBackend::Custom => "custom",
            DetectorBackend::Null => "null",
        }
    }

    /// Backends served by an external inference endpoint
    pub fn is_neural(&self) -> bool {
        matches!(
            self,
            DetectorBackend::Yolov8 | DetectorBackend::Detectron2 | DetectorBackend::MetaClip
        )
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yolov8" => Ok(DetectorBackend::Yolov8),
            "detectron2" => Ok(DetectorBackend::Detectron2),
            "metaclip" => Ok(DetectorBackend::MetaClip),
            "custom" => Ok(DetectorBackend::Custom),
            "null" | "none" => Ok(DetectorBackend::Null),
            other => Err(Error::Configuration(format!(
                "Unknown detector backend: {}",
                other
            ))),
        }
    }
}

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub backend: DetectorBackend,
    /// Inference endpoint for neural backends
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub device: Option<String>,
    pub conf_threshold: f32,
    pub timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            backend: DetectorBackend::Yolov8,
            endpoint: None,
            model: None,
            device: None,
            conf_threshold: 0.25,
            timeout_ms: 5_000,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.conf_threshold.is_finite() || !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(Error::Configuration(format!(
                "conf_threshold must be within [0, 1], got {}",
                self.conf_threshold
            )));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Configuration("timeout_ms must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8088".to_string(),
        }
    }
}

/// Complete pipeline configuration, loadable from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tracker: TrackerConfig,
    pub brain: BrainConfig,
    pub persistence: PersistenceConfig,
    pub store: StoreConfig,
    pub detector: DetectorConfig,
    pub server: ServerConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;
        self.brain.validate()?;
        self.persistence.validate()?;
        self.detector.validate()?;
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
