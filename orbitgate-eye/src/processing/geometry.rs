//! Geometry helpers shared by the tracker and the quality calculator

use ndarray::Array2;
use orbitgate_core::BBox;

/// Intersection over Union of two corner-form boxes, in `[0, 1]`.
/// Invalid or degenerate boxes give 0.
pub fn bbox_iou(a: &BBox, b: &BBox) -> f32 {
    if !a.is_valid() || !b.is_valid() {
        return 0.0;
    }

    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    if ix2 <= ix1 || iy2 <= iy1 {
        return 0.0;
    }

    let inter = (ix2 - ix1) * (iy2 - iy1);
    let union = a.area() + b.area() - inter;
    if union <= 0.0 || !union.is_finite() {
        return 0.0;
    }

    let iou = inter / union;
    if iou.is_finite() {
        iou.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// IoU of two boolean masks. Masks of different shape, or two empty masks, give 0.
pub fn mask_iou(a: &Array2<bool>, b: &Array2<bool>) -> f64 {
    if a.dim() != b.dim() {
        return 0.0;
    }
    let mut inter = 0usize;
    let mut union = 0usize;
    for (&x, &y) in a.iter().zip(b.iter()) {
        if x && y {
            inter += 1;
        }
        if x || y {
            union += 1;
        }
    }
    if union == 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

/// Angular coverage in degrees of a set of angles: 360 minus the largest gap
/// between neighbours on the circle. Fewer than two angles give 0.
pub fn coverage_from_angles(angles: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = angles.iter().copied().filter(|a| a.is_finite()).collect();
    if sorted.len() < 2 {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let first = sorted[0];
    let last = sorted[sorted.len() - 1];
    // The wrap-around gap closes the circle
    let mut max_gap = 360.0 - (last - first);
    for pair in sorted.windows(2) {
        max_gap = max_gap.max(pair[1] - pair[0]);
    }
    (360.0 - max_gap).clamp(0.0, 360.0)
}

/// Angles (degrees, atan2) of each point around the centroid of all points
pub fn angles_around_centroid(points: &[(f64, f64)]) -> Vec<f64> {
    if points.is_empty() {
        return Vec::new();
    }
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    points
        .iter()
        .map(|(x, y)| (y - cy).atan2(x - cx).to_degrees())
        .collect()
}

/// Orbit coverage of a track from its bounding-box centers.
///
/// The centroid of the centers stands in for the camera orbit center, so this
/// is a coarse image-plane proxy rather than true camera geometry.
pub fn orbit_coverage(boxes: &[BBox]) -> f64 {
    let centers: Vec<(f64, f64)> = boxes
        .iter()
        .filter(|b| b.is_valid())
        .map(|b| {
            let (x, y) = b.center();
            (x as f64, y as f64)
        })
        .collect();
    if centers.len() < 2 {
        return 0.0;
    }
    coverage_from_angles(&angles_around_centroid(&centers))
}

/// Pose spread of camera positions. Angles are taken in the x-y plane around
/// the mean position; positions coinciding with the mean are skipped.
pub fn pose_spread(positions: &[[f64; 3]]) -> f64 {
    let positions: Vec<[f64; 3]> = positions
        .iter()
        .copied()
        .filter(|p| p.iter().all(|v| v.is_finite()))
        .collect();
    if positions.len() < 2 {
        return 0.0;
    }
    let n = positions.len() as f64;
    let mut center = [0.0f64; 3];
    for p in &positions {
        for i in 0..3 {
            center[i] += p[i] / n;
        }
    }
    let angles: Vec<f64> = positions
        .iter()
        .filter_map(|p| {
            let v = [p[0] - center[0], p[1] - center[1], p[2] - center[2]];
            let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            (norm > 0.0).then(|| v[1].atan2(v[0]).to_degrees())
        })
        .collect();
    coverage_from_angles(&angles)
}
