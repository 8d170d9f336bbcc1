//! Quality metrics calculator
//!
//! Pure functions from multi-view evidence to named scores. Missing or
//! insufficient evidence yields the conservative value for that score.

use crate::processing::geometry::{bbox_iou, mask_iou, pose_spread};
use ndarray::Array2;
use orbitgate_core::{BBox, CameraPose, QualityMetrics, QualityWeights};

/// Texture variance that maps to full coverage
const TEXTURE_VARIANCE_SCALE: f64 = 10_000.0;
/// Mean chi-squared histogram distance that maps to the worst photometric error
const PHOTOMETRIC_ERROR_SCALE: f64 = 100.0;
const HISTOGRAM_BINS: usize = 256;

/// Evidence from one view of an object
#[derive(Debug, Clone, Default)]
pub struct ViewEvidence {
    pub bbox: Option<BBox>,
    pub mask: Option<Array2<bool>>,
    /// Depth samples; non-positive values are invalid
    pub depth: Option<Array2<f32>>,
    /// Intensity in `[0, 255]`
    pub image: Option<Array2<f32>>,
    pub pose: Option<CameraPose>,
}

#[derive(Debug, Clone, Default)]
pub struct MultiViewEvidence {
    pub views: Vec<ViewEvidence>,
}

impl MultiViewEvidence {
    pub fn new(views: Vec<ViewEvidence>) -> Self {
        Self { views }
    }

    pub fn bboxes(&self) -> Vec<BBox> {
        self.views.iter().filter_map(|v| v.bbox).collect()
    }

    fn depths(&self) -> Vec<&Array2<f32>> {
        self.views.iter().filter_map(|v| v.depth.as_ref()).collect()
    }

    fn images(&self) -> Vec<&Array2<f32>> {
        self.views.iter().filter_map(|v| v.image.as_ref()).collect()
    }

    /// Masks, only when every view has one
    fn masks(&self) -> Option<Vec<&Array2<bool>>> {
        self.views.iter().map(|v| v.mask.as_ref()).collect()
    }

    fn positions(&self) -> Vec<[f64; 3]> {
        self.views
            .iter()
            .filter_map(|v| v.pose.as_ref().and_then(|p| p.position()))
            .collect()
    }
}

fn valid_depths(depth: &Array2<f32>) -> impl Iterator<Item = f64> + '_ {
    depth
        .iter()
        .filter(|d| d.is_finite() && **d > 0.0)
        .map(|d| *d as f64)
}

fn mean_and_variance(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var))
}

/// `variance / mean^2` clamped to `[0, 1]`; `None` when the mean is zero
fn normalized_variance(values: &[f64]) -> Option<f64> {
    let (mean, var) = mean_and_variance(values)?;
    if mean == 0.0 || !mean.is_finite() || !var.is_finite() {
        return None;
    }
    Some((var / (mean * mean)).clamp(0.0, 1.0))
}

fn pairwise_mean<T>(items: &[T], f: impl Fn(&T, &T) -> f64) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            sum += f(&items[i], &items[j]);
            count += 1;
        }
    }
    (count > 0).then(|| sum / count as f64)
}

fn histogram(image: &Array2<f32>) -> Option<Vec<f64>> {
    let mut bins = vec![0.0f64; HISTOGRAM_BINS];
    let mut total = 0.0;
    for v in image.iter().filter(|v| v.is_finite()) {
        let bin = (v.floor().max(0.0) as usize).min(HISTOGRAM_BINS - 1);
        bins[bin] += 1.0;
        total += 1.0;
    }
    if total == 0.0 {
        return None;
    }
    for b in &mut bins {
        *b /= total;
    }
    Some(bins)
}

fn chi_squared(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2) / (x + y + 1e-8))
        .sum()
}

/// Stateless quality calculator holding the default aggregate weights
#[derive(Debug, Clone, Default)]
pub struct QualityCalculator {
    weights: QualityWeights,
}

impl QualityCalculator {
    pub fn new(weights: QualityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    /// Normalized variance of every valid depth sample pooled across views.
    /// Lower is better; 1.0 with fewer than two depth maps or no valid samples.
    pub fn mvs_consistency(depth_maps: &[&Array2<f32>]) -> f64 {
        if depth_maps.len() < 2 {
            return 1.0;
        }
        let samples: Vec<f64> = depth_maps.iter().flat_map(|d| valid_depths(d)).collect();
        normalized_variance(&samples).unwrap_or(1.0)
    }

    /// Mean pairwise mask IoU when every view has a mask, else mean pairwise
    /// bbox IoU. 0.0 with fewer than two views.
    pub fn silhouette_iou(masks: Option<&[&Array2<bool>]>, bboxes: &[BBox]) -> f64 {
        if let Some(masks) = masks {
            if masks.len() >= 2 {
                if let Some(iou) = pairwise_mean(masks, |a, b| mask_iou(a, b)) {
                    return iou.clamp(0.0, 1.0);
                }
            }
        }
        pairwise_mean(bboxes, |a, b| bbox_iou(a, b) as f64)
            .map(|iou| iou.clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    /// Mean pairwise chi-squared distance of intensity histograms divided by
    /// 100 and clamped to `[0, 1]`. The distance of two normalized histograms
    /// is at most 2, so real values stay small. Lower is better; 1.0 with
    /// fewer than two images.
    pub fn photometric_error(images: &[&Array2<f32>]) -> f64 {
        let histograms: Vec<Vec<f64>> = images.iter().filter_map(|i| histogram(i)).collect();
        pairwise_mean(&histograms, |a, b| chi_squared(a, b))
            .map(|err| (err / PHOTOMETRIC_ERROR_SCALE).clamp(0.0, 1.0))
            .unwrap_or(1.0)
    }

    /// Normalized variance of every valid depth sample across views.
    /// Lower is better; 1.0 with insufficient data.
    pub fn depth_variance(depth_maps: &[&Array2<f32>]) -> f64 {
        if depth_maps.len() < 2 {
            return 1.0;
        }
        let samples: Vec<f64> = depth_maps.iter().flat_map(|d| valid_depths(d)).collect();
        normalized_variance(&samples).unwrap_or(1.0)
    }

    /// Angular coverage of camera positions in degrees
    pub fn pose_spread(positions: &[[f64; 3]]) -> f64 {
        pose_spread(positions)
    }

    /// Mean per-image intensity variance as a texture-richness proxy, `[0, 1]`
    pub fn texture_coverage(images: &[&Array2<f32>]) -> f64 {
        let coverages: Vec<f64> = images
            .iter()
            .filter_map(|img| {
                let values: Vec<f64> = img
                    .iter()
                    .filter(|v| v.is_finite())
                    .map(|v| *v as f64)
                    .collect();
                mean_and_variance(&values)
                    .map(|(_, var)| (var / TEXTURE_VARIANCE_SCALE).clamp(0.0, 1.0))
            })
            .collect();
        mean_and_variance(&coverages)
            .map(|(mean, _)| mean)
            .unwrap_or(0.0)
    }

    /// `1 - normalized_variance(bbox areas)`; 0.5 with one box, 0.0 with none
    pub fn scale_confidence(bboxes: &[BBox]) -> f64 {
        let areas: Vec<f64> = bboxes.iter().map(|b| b.area() as f64).collect();
        match areas.len() {
            0 => 0.0,
            1 => 0.5,
            _ => normalized_variance(&areas)
                .map(|nv| (1.0 - nv).clamp(0.0, 1.0))
                .unwrap_or(0.0),
        }
    }

    /// Weighted aggregate clamped to `[0, 1]`
    pub fn quality_score(
        orbit_deg: f64,
        mvs_consistency: f64,
        silhouette_iou: f64,
        texture_cov: f64,
        scale_conf: f64,
        weights: &QualityWeights,
    ) -> f64 {
        let orbit_norm = (orbit_deg / 360.0).clamp(0.0, 1.0);
        let score = weights.orbit * orbit_norm
            + weights.mvs * (1.0 - mvs_consistency)
            + weights.silhouette * silhouette_iou
            + weights.texture * texture_cov
            + weights.scale * scale_conf;
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Every score plus the aggregate. `weights` overrides the calculator's own.
    pub fn evaluate(
        &self,
        evidence: &MultiViewEvidence,
        orbit_deg: f64,
        weights: Option<&QualityWeights>,
    ) -> QualityMetrics {
        let bboxes = evidence.bboxes();
        let depths = evidence.depths();
        let images = evidence.images();
        let masks = evidence.masks();

        let mvs_consistency = Self::mvs_consistency(&depths);
        let silhouette_iou = Self::silhouette_iou(masks.as_deref(), &bboxes);
        let texture_cov = Self::texture_coverage(&images);
        let scale_conf = Self::scale_confidence(&bboxes);
        let orbit_deg = if orbit_deg.is_finite() {
            orbit_deg.clamp(0.0, 360.0)
        } else {
            0.0
        };

        QualityMetrics {
            orbit_deg,
            mvs_consistency,
            silhouette_iou,
            photometric_err: Self::photometric_error(&images),
            depth_var: Self::depth_variance(&depths),
            pose_spread_deg: Self::pose_spread(&evidence.positions()),
            texture_cov,
            scale_conf,
            quality_score: Self::quality_score(
                orbit_deg,
                mvs_consistency,
                silhouette_iou,
                texture_cov,
                scale_conf,
                weights.unwrap_or(&self.weights),
            ),
        }
    }
}
