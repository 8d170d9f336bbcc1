//! Multi-object tracking

use crate::detector::Detection;
use crate::processing::geometry::{bbox_iou, orbit_coverage};
use orbitgate_core::{new_object_id, now_ts, BBox, ObjectId, Result, Timestamp, TrackerConfig};
use orbitgate_storage::{BestFrames, HotField, HotObject, StateStore};
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Best-frame slot written by the tracker
pub const BEST_SLOT: &str = "best";

/// One observation retained in a track's history
#[derive(Debug, Clone, PartialEq)]
pub struct TrackObservation {
    pub frame_id: String,
    pub timestamp: Timestamp,
    pub bbox: BBox,
    pub confidence: f32,
}

/// Tracked object keyed by object id
#[derive(Debug, Clone)]
pub struct Track {
    pub obj_id: ObjectId,
    pub class_name: String,
    pub observations: Vec<TrackObservation>,
    pub last_seen_ts: Timestamp,
    pub orbit_deg: f64,
    pub best_frames: BestFrames,
    best_score: f32,
}

impl Track {
    fn new(obj_id: ObjectId, frame_id: &str, detection: &Detection, ts: Timestamp) -> Self {
        let mut track = Self {
            obj_id,
            class_name: detection.class_name.clone(),
            observations: Vec::new(),
            last_seen_ts: ts,
            orbit_deg: 0.0,
            best_frames: BestFrames::new(),
            best_score: f32::NEG_INFINITY,
        };
        track.observe(frame_id, detection, ts);
        track
    }

    /// Most recent bounding box
    pub fn last_bbox(&self) -> Option<&BBox> {
        self.observations.last().map(|o| &o.bbox)
    }

    pub fn bboxes(&self) -> Vec<BBox> {
        self.observations.iter().map(|o| o.bbox).collect()
    }

    /// Append an observation; returns whether the best frame changed
    fn observe(&mut self, frame_id: &str, detection: &Detection, ts: Timestamp) -> bool {
        self.observations.push(TrackObservation {
            frame_id: frame_id.to_string(),
            timestamp: ts,
            bbox: detection.bbox,
            confidence: detection.confidence,
        });
        self.last_seen_ts = ts;
        self.orbit_deg = orbit_coverage(&self.bboxes());

        let score = best_frame_score(detection);
        if score > self.best_score {
            self.best_score = score;
            self.best_frames
                .insert(BEST_SLOT.to_string(), frame_id.to_string());
            return true;
        }
        false
    }
}

/// `confidence * sqrt(area)`
fn best_frame_score(detection: &Detection) -> f32 {
    let score = detection.confidence * detection.bbox.area().sqrt();
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Per-object result of one tracker update
#[derive(Debug, Clone)]
pub struct TrackUpdate {
    pub obj_id: ObjectId,
    pub created: bool,
    /// Last sighting before this update, `None` for new tracks
    pub previous_seen_ts: Option<Timestamp>,
    pub detection: Detection,
    pub frame_id: String,
    pub timestamp: Timestamp,
    pub orbit_deg: f64,
    pub views: u64,
}

/// Multi-object tracker writing hot state through the [`StateStore`]
pub struct ObjectTracker {
    store: StateStore,
    config: RwLock<TrackerConfig>,
    object_ttl: Option<Duration>,
    /// Live tracks in creation order, held for the whole update
    tracks: Mutex<Vec<Track>>,
}

impl ObjectTracker {
    pub fn new(store: StateStore, config: TrackerConfig, object_ttl: Option<Duration>) -> Self {
        Self {
            store,
            config: RwLock::new(config),
            object_ttl,
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.config.read().clone()
    }

    /// Replace the tracker configuration; takes effect on the next update
    pub fn update_config(&self, config: TrackerConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Update tracker with new detections, returning one object id per detection
    pub async fn update(
        &self,
        frame_id: &str,
        detections: &[Detection],
        timestamp: Option<Timestamp>,
    ) -> Result<Vec<ObjectId>> {
        Ok(self
            .update_detailed(frame_id, detections, timestamp)
            .await?
            .into_iter()
            .map(|u| u.obj_id)
            .collect())
    }

    /// Like [`update`](Self::update), with per-object detail in detection order
    pub async fn update_detailed(
        &self,
        frame_id: &str,
        detections: &[Detection],
        timestamp: Option<Timestamp>,
    ) -> Result<Vec<TrackUpdate>> {
        let config = self.config();
        let ts = timestamp.unwrap_or_else(now_ts);
        let mut tracks = self.tracks.lock().await;

        self.evict_stale(&mut tracks, ts, &config).await?;

        // Greedy association: tracks in creation order each take their best
        // unused detection at or above the IoU threshold
        let mut used = vec![false; detections.len()];
        let mut matches: Vec<(usize, usize)> = Vec::new();
        for (track_idx, track) in tracks.iter().enumerate() {
            let Some(last) = track.last_bbox() else {
                continue;
            };
            let mut best: Option<(usize, f32)> = None;
            for (det_idx, detection) in detections.iter().enumerate() {
                if used[det_idx] {
                    continue;
                }
                let iou = bbox_iou(last, &detection.bbox);
                if iou >= config.iou_threshold && best.map_or(true, |(_, b)| iou > b) {
                    best = Some((det_idx, iou));
                }
            }
            if let Some((det_idx, _)) = best {
                used[det_idx] = true;
                matches.push((det_idx, track_idx));
            }
        }

        let mut updates: Vec<(usize, TrackUpdate)> = Vec::with_capacity(detections.len());

        for (det_idx, track_idx) in matches {
            let detection = &detections[det_idx];
            let track = &mut tracks[track_idx];
            let previous_seen_ts = track.last_seen_ts;
            let best_changed = track.observe(frame_id, detection, ts);

            let views = self.store.incr_views(&track.obj_id, 1).await?;
            let mut fields = vec![
                HotField::LastSeen(ts),
                HotField::OrbitDeg(track.orbit_deg),
                HotField::ConfClass(detection.confidence as f64),
            ];
            if best_changed {
                fields.push(HotField::BestFrames(track.best_frames.clone()));
            }
            self.store.update_object_fields(&track.obj_id, fields).await?;
            self.store.add_view(&track.obj_id, frame_id, ts).await?;
            if let Some(ttl) = self.object_ttl {
                self.store.set_ttl(&track.obj_id, ttl).await?;
            }

            updates.push((
                det_idx,
                TrackUpdate {
                    obj_id: track.obj_id.clone(),
                    created: false,
                    previous_seen_ts: Some(previous_seen_ts),
                    detection: detection.clone(),
                    frame_id: frame_id.to_string(),
                    timestamp: ts,
                    orbit_deg: track.orbit_deg,
                    views,
                },
            ));
        }

        for (det_idx, detection) in detections.iter().enumerate() {
            if used[det_idx] {
                continue;
            }

            // SECURITY: bound the live track table
            while tracks.len() >= config.max_tracks.max(1) {
                self.evict_oldest(&mut tracks, &config).await?;
            }

            let track = Track::new(new_object_id(), frame_id, detection, ts);
            let mut object = HotObject::new(track.obj_id.clone(), &track.class_name, ts);
            object.views = 1;
            object.best_frames = track.best_frames.clone();
            object.conf_class = detection.confidence as f64;
            self.store.set_object(&object, self.object_ttl).await?;
            self.store.add_view(&track.obj_id, frame_id, ts).await?;
            if let Some(ttl) = self.object_ttl {
                self.store.set_ttl(&track.obj_id, ttl).await?;
            }

            debug!("Created track {} ({})", track.obj_id, track.class_name);
            updates.push((
                det_idx,
                TrackUpdate {
                    obj_id: track.obj_id.clone(),
                    created: true,
                    previous_seen_ts: None,
                    detection: detection.clone(),
                    frame_id: frame_id.to_string(),
                    timestamp: ts,
                    orbit_deg: 0.0,
                    views: 1,
                },
            ));
            tracks.push(track);
        }

        updates.sort_by_key(|(det_idx, _)| *det_idx);
        debug!("Tracking {} objects", tracks.len());
        Ok(updates.into_iter().map(|(_, u)| u).collect())
    }

    /// Drop tracks whose last sighting is more than `max_age` before `now`
    async fn evict_stale(
        &self,
        tracks: &mut Vec<Track>,
        now: Timestamp,
        config: &TrackerConfig,
    ) -> Result<()> {
        let (stale, live): (Vec<Track>, Vec<Track>) = tracks
            .drain(..)
            .partition(|t| now - t.last_seen_ts > config.max_age);
        *tracks = live;
        for track in stale {
            debug!(
                "Evicting stale track {} (last seen {:.3})",
                track.obj_id, track.last_seen_ts
            );
            self.expire_hot_state(&track.obj_id, config).await?;
        }
        Ok(())
    }

    async fn evict_oldest(&self, tracks: &mut Vec<Track>, config: &TrackerConfig) -> Result<()> {
        let oldest = tracks
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.last_seen_ts.total_cmp(&b.last_seen_ts))
            .map(|(idx, _)| idx);
        if let Some(idx) = oldest {
            let track = tracks.remove(idx);
            warn!(
                "Track table full ({}), evicting oldest track {}",
                config.max_tracks, track.obj_id
            );
            self.expire_hot_state(&track.obj_id, config).await?;
        }
        Ok(())
    }

    async fn expire_hot_state(&self, obj_id: &str, config: &TrackerConfig) -> Result<()> {
        if let Some(secs) = config.stale_ttl_secs {
            self.store.set_ttl(obj_id, Duration::from_secs(secs)).await?;
        }
        Ok(())
    }

    pub async fn get_track(&self, obj_id: &str) -> Option<Track> {
        self.tracks
            .lock()
            .await
            .iter()
            .find(|t| t.obj_id == obj_id)
            .cloned()
    }

    pub async fn track_count(&self) -> usize {
        self.tracks.lock().await.len()
    }

    /// Live track ids in creation order
    pub async fn active_ids(&self) -> Vec<ObjectId> {
        self.tracks
            .lock()
            .await
            .iter()
            .map(|t| t.obj_id.clone())
            .collect()
    }
}
