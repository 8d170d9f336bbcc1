//! Tracking and geometry

pub mod geometry;
pub mod tracker;

pub use geometry::{bbox_iou, mask_iou, orbit_coverage, pose_spread};
pub use tracker::{ObjectTracker, Track, TrackObservation, TrackUpdate, BEST_SLOT};
