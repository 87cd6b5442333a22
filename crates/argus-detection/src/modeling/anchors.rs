//! Multi-level anchor grids and box geometry.
//!
//! Boxes are `[ymin, xmin, ymax, xmax]`, normalized to the parser output size.

use crate::configs::params::AnchorParams;

pub type BoxYxyx = [f32; 4];

/// Anchors for every level, ordered level, then grid row, then column, then
/// scale, then aspect ratio.
#[derive(Debug, Clone)]
pub struct Anchors {
    boxes: Vec<BoxYxyx>,
    per_location: usize,
}

impl Anchors {
    #[must_use]
    pub fn generate(params: &AnchorParams, output_size: [u32; 2]) -> Self {
        let [height, width] = output_size.map(f64::from);
        let num_scales = params.num_scales.max(1);
        let mut boxes = Vec::new();

        for level in params.min_level..=params.max_level {
            let stride = f64::from(1u32 << level.min(31));
            let rows = (height / stride).ceil().max(1.0) as usize;
            let cols = (width / stride).ceil().max(1.0) as usize;

            for row in 0..rows {
                let cy = (row as f64 + 0.5) * stride;
                for col in 0..cols {
                    let cx = (col as f64 + 0.5) * stride;
                    for scale in 0..num_scales {
                        let octave = 2f64.powf(f64::from(scale) / f64::from(num_scales));
                        let base = params.anchor_size * stride * octave;
                        for ratio in &params.aspect_ratios {
                            let half_h = base / ratio.sqrt() / 2.0;
                            let half_w = base * ratio.sqrt() / 2.0;
                            boxes.push([
                                ((cy - half_h) / height) as f32,
                                ((cx - half_w) / width) as f32,
                                ((cy + half_h) / height) as f32,
                                ((cx + half_w) / width) as f32,
                            ]);
                        }
                    }
                }
            }
        }

        Self { boxes, per_location: num_scales as usize * params.aspect_ratios.len() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    #[must_use]
    pub fn per_location(&self) -> usize {
        self.per_location
    }

    #[must_use]
    pub fn boxes(&self) -> &[BoxYxyx] {
        &self.boxes
    }
}

#[must_use]
pub fn area(b: &BoxYxyx) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

#[must_use]
pub fn iou(a: &BoxYxyx, b: &BoxYxyx) -> f32 {
    let ih = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iw = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ih * iw;
    let union = area(a) + area(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

fn center_size(b: &BoxYxyx) -> [f32; 4] {
    let h = (b[2] - b[0]).max(1e-6);
    let w = (b[3] - b[1]).max(1e-6);
    [b[0] + h / 2.0, b[1] + w / 2.0, h, w]
}

/// Regression target of `gt` relative to `anchor`: `[dy, dx, dh, dw]`.
#[must_use]
pub fn encode(gt: &BoxYxyx, anchor: &BoxYxyx) -> [f32; 4] {
    let [gy, gx, gh, gw] = center_size(gt);
    let [ay, ax, ah, aw] = center_size(anchor);
    [(gy - ay) / ah, (gx - ax) / aw, (gh / ah).ln(), (gw / aw).ln()]
}

/// Inverse of [`encode`], clipped to the unit square.
#[must_use]
pub fn decode(deltas: &[f32], anchor: &BoxYxyx) -> BoxYxyx {
    let [ay, ax, ah, aw] = center_size(anchor);
    // exp overflow guard
    let dh = deltas[2].min(4.0);
    let dw = deltas[3].min(4.0);
    let cy = deltas[0] * ah + ay;
    let cx = deltas[1] * aw + ax;
    let h = dh.exp() * ah;
    let w = dw.exp() * aw;
    [
        (cy - h / 2.0).clamp(0.0, 1.0),
        (cx - w / 2.0).clamp(0.0, 1.0),
        (cy + h / 2.0).clamp(0.0, 1.0),
        (cx + w / 2.0).clamp(0.0, 1.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnchorParams {
        AnchorParams {
            min_level: 5,
            max_level: 7,
            num_scales: 3,
            aspect_ratios: vec![1.0, 2.0, 0.5],
            anchor_size: 4.0,
        }
    }

    #[test]
    fn test_anchor_count_per_level() {
        let anchors = Anchors::generate(&params(), [256, 256]);
        // 8x8 + 4x4 + 2x2 locations, 9 anchors each.
        assert_eq!(anchors.len(), (64 + 16 + 4) * 9);
        assert_eq!(anchors.per_location(), 9);
    }

    #[test]
    fn test_first_anchor_geometry() {
        let mut p = params();
        p.num_scales = 1;
        p.aspect_ratios = vec![1.0];
        p.anchor_size = 1.0;
        p.max_level = 5;
        let anchors = Anchors::generate(&p, [64, 64]);
        assert_eq!(anchors.len(), 4);
        // Centre (16, 16), side 32 on a 64 image.
        assert_eq!(anchors.boxes()[0], [0.0, 0.0, 0.5, 0.5]);
        assert_eq!(anchors.boxes()[3], [0.5, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_iou_hand_checked() {
        let a = [0.0, 0.0, 0.5, 0.5];
        let b = [0.25, 0.25, 0.75, 0.75];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 1.0 / 7.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[0.6, 0.6, 0.9, 0.9]), 0.0);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let anchor = [0.1, 0.1, 0.5, 0.3];
        let gt = [0.15, 0.05, 0.45, 0.4];
        let decoded = decode(&encode(&gt, &anchor), &anchor);
        for (d, g) in decoded.iter().zip(gt.iter()) {
            assert!((d - g).abs() < 1e-5, "{decoded:?} vs {gt:?}");
        }
    }
}
