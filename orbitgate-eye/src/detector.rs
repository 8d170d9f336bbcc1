//! Detector capability and backend factory

use crate::error::EyeError;
use async_trait::async_trait;
use image::DynamicImage;
use ndarray::Array2;
use orbitgate_core::{BBox, CameraPose, DetectorBackend, DetectorConfig, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One detected object in one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub mask: Option<Array2<bool>>,
    pub features: Option<Vec<f32>>,
}

impl Detection {
    pub fn new(bbox: BBox, class_id: u32, class_name: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            class_name: class_name.into(),
            confidence,
            mask: None,
            features: None,
        }
    }
}

/// One camera frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: String,
    pub camera_id: Option<String>,
    /// Where the frame is stored, if anywhere
    pub frame_path: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub pose: Option<CameraPose>,
    pub image: DynamicImage,
}

impl Frame {
    pub fn new(frame_id: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            frame_id: frame_id.into(),
            camera_id: None,
            frame_path: None,
            timestamp: None,
            pose: None,
            image,
        }
    }

    pub fn with_camera(mut self, camera_id: impl Into<String>) -> Self {
        self.camera_id = Some(camera_id.into());
        self
    }

    pub fn with_timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn with_pose(mut self, pose: CameraPose) -> Self {
        self.pose = Some(pose);
        self
    }

    /// Reference recorded with observations: the stored path, else the frame id
    pub fn frame_ref(&self) -> &str {
        self.frame_path.as_deref().unwrap_or(&self.frame_id)
    }
}

#[async_trait]
pub trait Detector: Send + Sync {
    fn backend(&self) -> DetectorBackend;
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, EyeError>;
}

/// Detects nothing
pub struct NullDetector;

#[async_trait]
impl Detector for NullDetector {
    fn backend(&self) -> DetectorBackend {
        DetectorBackend::Null
    }

    async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, EyeError> {
        Ok(Vec::new())
    }
}

/// Replays scripted detections, one list per call
pub struct StaticDetector {
    script: Mutex<VecDeque<Vec<Detection>>>,
    repeat: Vec<Detection>,
}

impl StaticDetector {
    /// Returns each list in turn, then nothing
    pub fn new(frames: Vec<Vec<Detection>>) -> Self {
        Self {
            script: Mutex::new(frames.into()),
            repeat: Vec::new(),
        }
    }

    /// Returns the same detections on every call
    pub fn repeating(detections: Vec<Detection>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: detections,
        }
    }
}

#[async_trait]
impl Detector for StaticDetector {
    fn backend(&self) -> DetectorBackend {
        DetectorBackend::Custom
    }

    async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, EyeError> {
        let next = self.script.lock().pop_front();
        Ok(next.unwrap_or_else(|| self.repeat.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct RemoteDetection {
    bbox: [f32; 4],
    #[serde(default)]
    class_id: u32,
    class_name: String,
    confidence: f32,
    #[serde(default)]
    mask: Option<Vec<Vec<bool>>>,
    #[serde(default)]
    features: Option<Vec<f32>>,
}

fn mask_from_rows(rows: Vec<Vec<bool>>) -> Option<Array2<bool>> {
    let height = rows.len();
    let width = rows.first().map(|r| r.len())?;
    if rows.iter().any(|r| r.len() != width) {
        return None;
    }
    Array2::from_shape_vec((height, width), rows.into_iter().flatten().collect()).ok()
}

impl From<RemoteDetection> for Detection {
    fn from(raw: RemoteDetection) -> Self {
        Self {
            bbox: BBox::from(raw.bbox),
            class_id: raw.class_id,
            class_name: raw.class_name,
            confidence: raw.confidence,
            mask: raw.mask.and_then(mask_from_rows),
            features: raw.features,
        }
    }
}

/// Neural backend served by an inference endpoint.
///
/// The frame is POSTed as PNG with `backend`, `model`, `device` and `conf`
/// query parameters; the response is a JSON list of detections with
/// `[x1, y1, x2, y2]` boxes.
pub struct RemoteDetector {
    client: reqwest::Client,
    endpoint: String,
    backend: DetectorBackend,
    model: Option<String>,
    device: Option<String>,
    conf_threshold: f32,
}

impl RemoteDetector {
    pub fn new(backend: DetectorBackend, endpoint: &str, config: &DetectorConfig) -> Result<Self, EyeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            backend,
            model: config.model.clone(),
            device: config.device.clone(),
            conf_threshold: config.conf_threshold,
        })
    }

    fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, EyeError> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageOutputFormat::Png)?;
        Ok(buf.into_inner())
    }
}

#[async_trait]
impl Detector for RemoteDetector {
    fn backend(&self) -> DetectorBackend {
        self.backend
    }

    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, EyeError> {
        let body = Self::encode_png(&frame.image)?;
        let mut query = vec![
            ("backend", self.backend.as_str().to_string()),
            ("conf", self.conf_threshold.to_string()),
        ];
        if let Some(model) = &self.model {
            query.push(("model", model.clone()));
        }
        if let Some(device) = &self.device {
            query.push(("device", device.clone()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        let raw: Vec<RemoteDetection> = response.json().await?;

        let detections: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.confidence >= self.conf_threshold)
            .map(Detection::from)
            .collect();
        debug!(
            "{} detected {} objects in frame {}",
            self.backend,
            detections.len(),
            frame.frame_id
        );
        Ok(detections)
    }
}

/// Builds detectors from configuration
#[derive(Default)]
pub struct DetectorFactory {
    custom: RwLock<Option<Arc<dyn Detector>>>,
}

impl DetectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector used for the `custom` backend
    pub fn register_custom(&self, detector: Arc<dyn Detector>) {
        *self.custom.write() = Some(detector);
    }

    /// Build the configured detector. Backends that cannot be served fall
    /// back to [`NullDetector`].
    pub fn create(&self, config: &DetectorConfig) -> Result<Arc<dyn Detector>, EyeError> {
        config
            .validate()
            .map_err(|e| EyeError::Config(e.to_string()))?;

        let detector: Arc<dyn Detector> = match config.backend {
            DetectorBackend::Null => Arc::new(NullDetector),
            DetectorBackend::Custom => match self.custom.read().clone() {
                Some(detector) => detector,
                None => {
                    warn!("No custom detector registered, falling back to null detector");
                    Arc::new(NullDetector)
                }
            },
            backend => match config.endpoint.as_deref() {
                Some(endpoint) if !endpoint.trim().is_empty() => {
                    Arc::new(RemoteDetector::new(backend, endpoint, config)?)
                }
                _ => {
                    warn!(
                        "{} detector has no inference endpoint configured, falling back to null detector",
                        backend
                    );
                    Arc::new(NullDetector)
                }
            },
        };
        info!("Detector created: {}", detector.backend());
        Ok(detector)
    }
}
