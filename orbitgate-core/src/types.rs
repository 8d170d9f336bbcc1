//! Core identifiers, geometry primitives and the object status machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque object identifier, generated at track creation
pub type ObjectId = String;

/// Seconds since the Unix epoch
pub type Timestamp = f64;

/// Current wall-clock time as a [`Timestamp`]
pub fn now_ts() -> Timestamp {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Generate a fresh object id
pub fn new_object_id() -> ObjectId {
    uuid::Uuid::new_v4().to_string()
}

/// Axis-aligned bounding box in `[x1, y1, x2, y2]` pixel corners
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area, zero for degenerate or non-finite boxes
    pub fn area(&self) -> f32 {
        if !self.is_valid() {
            return 0.0;
        }
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Finite corners with `x2 >= x1` and `y2 >= y1`
    pub fn is_valid(&self) -> bool {
        self.x1.is_finite()
            && self.y1.is_finite()
            && self.x2.is_finite()
            && self.y2.is_finite()
            && self.x2 >= self.x1
            && self.y2 >= self.y1
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

/// Camera pose for one observation. Either field may carry the camera position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraPose {
    pub translation: Option<[f64; 3]>,
    /// Row-major 4x4 extrinsic matrix; translation is the last column
    pub extrinsic: Option<[[f64; 4]; 4]>,
}

impl CameraPose {
    pub fn from_translation(t: [f64; 3]) -> Self {
        Self {
            translation: Some(t),
            extrinsic: None,
        }
    }

    /// Camera position, preferring the explicit translation
    pub fn position(&self) -> Option<[f64; 3]> {
        if let Some(t) = self.translation {
            return Some(t);
        }
        self.extrinsic.map(|m| [m[0][3], m[1][3], m[2][3]])
    }
}

/// Admission status of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    #[default]
    Pending,
    Observing,
    Ready,
    Quarantine,
}

/// Who asked for a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// Rule evaluation inside the pipeline
    Automatic,
    /// Operator override (`force_admit` / `force_quarantine`)
    Manual,
}

impl ObjectStatus {
    pub const ALL: [ObjectStatus; 4] = [
        ObjectStatus::Pending,
        ObjectStatus::Observing,
        ObjectStatus::Ready,
        ObjectStatus::Quarantine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Pending => "pending",
            ObjectStatus::Observing => "observing",
            ObjectStatus::Ready => "ready",
            ObjectStatus::Quarantine => "quarantine",
        }
    }

    /// Whether `self -> next` is an edge of the status machine for `cause`.
    ///
    /// Automatic edges: pending → observing → ready, and any → quarantine.
    /// Quarantine is terminal except for a manual re-admission into observing,
    /// which an operator may also apply from any other state.
    pub fn allows(&self, next: ObjectStatus, cause: TransitionCause) -> bool {
        use ObjectStatus::*;
        match (self, next) {
            (Pending, Observing) | (Observing, Ready) => true,
            (Pending, Quarantine) | (Observing, Quarantine) | (Ready, Quarantine) => true,
            (_, Observing) => cause == TransitionCause::Manual,
            _ => false,
        }
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ObjectStatus::Pending),
            "observing" => Ok(ObjectStatus::Observing),
            "ready" => Ok(ObjectStatus::Ready),
            "quarantine" => Ok(ObjectStatus::Quarantine),
            other => Err(format!("unknown object status: {}", other)),
        }
    }
}

/// Decision label recorded with a metric snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionDecision {
    Admit,
    Observe,
    Quarantine,
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDecision::Admit => "admit",
            AdmissionDecision::Observe => "observe",
            AdmissionDecision::Quarantine => "quarantine",
        }
    }
}
