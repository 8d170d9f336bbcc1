//! orbitgate-eye: perception and admission control
//!
//! Detector backends feed the multi-object tracker, whose tracks are scored
//! by the quality calculator and promoted or quarantined by the brain.

pub mod brain;
pub mod detector;
pub mod error;
pub mod processing;
pub mod quality;
pub mod utils;

pub use brain::{ObjectBrain, ObjectStatusView, OverrideOutcome, ThresholdReport, TransitionOutcome};
pub use detector::{Detection, Detector, DetectorFactory, Frame, NullDetector, RemoteDetector, StaticDetector};
pub use error::EyeError;
pub use processing::{ObjectTracker, Track, TrackUpdate};
pub use quality::{MultiViewEvidence, QualityCalculator, ViewEvidence};
pub use utils::{image_to_intensity, image_to_mask};
