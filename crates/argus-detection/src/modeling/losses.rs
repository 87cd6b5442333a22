//! Anchor target assignment and the detection losses.

use super::anchors::{encode, iou, Anchors};
use super::model::{HeadGradients, HeadOutputs};
use crate::configs::DetectionConfig;
use crate::error::{DetectionError, DetectionResult};
use crate::input::{DetectionExample, GroundTruth};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorTarget {
    /// Matched to the ground truth at this index.
    Positive(usize),
    Negative,
    Ignore,
}

/// Label every anchor against the non-crowd ground truth of one image.
#[must_use]
pub fn assign_targets(
    anchors: &Anchors,
    objects: &[GroundTruth],
    match_threshold: f32,
    unmatched_threshold: f32,
) -> Vec<AnchorTarget> {
    let gts: Vec<(usize, &GroundTruth)> = objects.iter().enumerate().filter(|(_, g)| !g.is_crowd).collect();
    let mut best_anchor = vec![(0usize, 0f32); gts.len()];

    let mut targets: Vec<AnchorTarget> = anchors
        .boxes()
        .iter()
        .enumerate()
        .map(|(a, anchor)| {
            let mut best: Option<(usize, f32)> = None;
            for (slot, (gt_idx, gt)) in gts.iter().enumerate() {
                let overlap = iou(anchor, &gt.bbox);
                if overlap > best_anchor[slot].1 {
                    best_anchor[slot] = (a, overlap);
                }
                if best.is_none_or(|(_, b)| overlap > b) {
                    best = Some((*gt_idx, overlap));
                }
            }
            match best {
                Some((gt_idx, overlap)) if overlap >= match_threshold => AnchorTarget::Positive(gt_idx),
                Some((_, overlap)) if overlap >= unmatched_threshold => AnchorTarget::Ignore,
                _ => AnchorTarget::Negative,
            }
        })
        .collect();

    for (slot, (anchor, overlap)) in best_anchor.into_iter().enumerate() {
        if overlap > 0.0 {
            targets[anchor] = AnchorTarget::Positive(gts[slot].0);
        }
    }
    targets
}

#[derive(Debug, Clone, Serialize)]
pub struct LossOutput {
    pub total_loss: f64,
    pub cls_loss: f64,
    pub box_loss: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_loss: Option<f64>,
    pub num_positives: usize,
    #[serde(skip)]
    pub grads: Vec<HeadGradients>,
}

/// Focal classification, Huber box and optional mask-prior losses.
#[derive(Debug, Clone)]
pub struct DetectionLoss {
    anchors: Arc<Anchors>,
    num_classes: usize,
    match_threshold: f32,
    unmatched_threshold: f32,
    alpha: f64,
    gamma: f64,
    delta: f64,
    box_loss_weight: f64,
    mask: Option<MaskLoss>,
}

#[derive(Debug, Clone, Copy)]
struct MaskLoss {
    cells: usize,
    weight: f64,
}

impl DetectionLoss {
    #[must_use]
    pub fn new(params: &DetectionConfig, anchors: Arc<Anchors>) -> Self {
        let loss = &params.retinanet_loss;
        let mask = match (params.mask_size(), &params.shapemask_loss) {
            (Some(size), Some(cfg)) => Some(MaskLoss { cells: size * size, weight: cfg.mask_loss_weight }),
            _ => None,
        };
        Self {
            anchors,
            num_classes: params.architecture.num_classes as usize,
            match_threshold: params.parser.match_threshold as f32,
            unmatched_threshold: params.parser.unmatched_threshold as f32,
            alpha: loss.focal_loss_alpha,
            gamma: loss.focal_loss_gamma,
            delta: loss.huber_loss_delta,
            box_loss_weight: loss.box_loss_weight,
            mask,
        }
    }

    pub fn compute(&self, outputs: &[HeadOutputs], examples: &[DetectionExample]) -> DetectionResult<LossOutput> {
        if outputs.len() != examples.len() {
            return Err(DetectionError::Executor(format!(
                "{} head outputs for {} examples",
                outputs.len(),
                examples.len()
            )));
        }

        let num_anchors = self.anchors.len();
        let c = self.num_classes;
        let assignments: Vec<Vec<AnchorTarget>> = examples
            .iter()
            .map(|ex| assign_targets(&self.anchors, &ex.objects, self.match_threshold, self.unmatched_threshold))
            .collect();
        let num_positives = assignments
            .iter()
            .flatten()
            .filter(|t| matches!(t, AnchorTarget::Positive(_)))
            .count();
        let cls_norm = num_positives as f64 + 1.0;
        let box_norm = (num_positives as f64 * 4.0).max(1.0);
        let num_masks = match self.mask {
            Some(_) => examples
                .iter()
                .flat_map(|ex| &ex.objects)
                .filter(|g| !g.is_crowd && g.mask.is_some())
                .count(),
            None => 0,
        };

        let mut cls_loss = 0.0;
        let mut box_loss = 0.0;
        let mut mask_loss = 0.0;
        let mut grads = Vec::with_capacity(outputs.len());

        for ((out, ex), targets) in outputs.iter().zip(examples).zip(&assignments) {
            if out.class_logits.len() != num_anchors * c || out.box_deltas.len() != num_anchors * 4 {
                return Err(DetectionError::Executor("head output size does not match anchors".to_string()));
            }
            let mut g = HeadGradients {
                class_logits: vec![0.0; num_anchors * c],
                box_deltas: vec![0.0; num_anchors * 4],
                mask_logits: None,
            };

            for (a, target) in targets.iter().enumerate() {
                let positive_class = match target {
                    AnchorTarget::Ignore => continue,
                    AnchorTarget::Negative => None,
                    AnchorTarget::Positive(gt) => Some(ex.objects[*gt].class_id as usize),
                };
                for class in 0..c {
                    let idx = a * c + class;
                    let (loss, grad) = self.focal(out.class_logits[idx], positive_class == Some(class));
                    cls_loss += loss;
                    g.class_logits[idx] = (grad / cls_norm) as f32;
                }

                if let AnchorTarget::Positive(gt) = target {
                    let encoded = encode(&ex.objects[*gt].bbox, &self.anchors.boxes()[a]);
                    for k in 0..4 {
                        let diff = f64::from(out.box_deltas[a * 4 + k] - encoded[k]);
                        let (loss, grad) = huber(diff, self.delta);
                        box_loss += loss;
                        g.box_deltas[a * 4 + k] = (self.box_loss_weight * grad / box_norm) as f32;
                    }
                }
            }

            if let (Some(mask_cfg), Some(logits)) = (self.mask, &out.mask_logits) {
                let mut dm = vec![0f32; logits.len()];
                for gt in ex.objects.iter().filter(|g| !g.is_crowd) {
                    let Some(target) = &gt.mask else { continue };
                    let offset = gt.class_id as usize * mask_cfg.cells;
                    let scale = mask_cfg.cells as f64 * num_masks.max(1) as f64;
                    for (i, t) in target.iter().enumerate() {
                        let m = sigmoid(f64::from(logits[offset + i]));
                        let err = m - f64::from(*t);
                        mask_loss += err * err / scale;
                        dm[offset + i] += (mask_cfg.weight * 2.0 * err * m * (1.0 - m) / scale) as f32;
                    }
                }
                g.mask_logits = Some(dm);
            }

            grads.push(g);
        }

        let cls_loss = cls_loss / cls_norm;
        let box_loss = box_loss / box_norm;
        let mask_loss = self.mask.map(|m| (m.weight, mask_loss));
        let total_loss =
            cls_loss + self.box_loss_weight * box_loss + mask_loss.map_or(0.0, |(weight, loss)| weight * loss);

        Ok(LossOutput {
            total_loss,
            cls_loss,
            box_loss,
            mask_loss: mask_loss.map(|(_, loss)| loss),
            num_positives,
            grads,
        })
    }

    /// Sigmoid focal loss of one logit and its derivative.
    fn focal(&self, logit: f32, positive: bool) -> (f64, f64) {
        let x = f64::from(logit);
        let p = sigmoid(x);
        let log_p = -softplus(-x);
        let log_not_p = -softplus(x);
        let (alpha, gamma) = (self.alpha, self.gamma);
        if positive {
            let loss = -alpha * (1.0 - p).powf(gamma) * log_p;
            let grad = alpha * (1.0 - p).powf(gamma) * (gamma * p * log_p - (1.0 - p));
            (loss, grad)
        } else {
            let loss = -(1.0 - alpha) * p.powf(gamma) * log_not_p;
            let grad = (1.0 - alpha) * p.powf(gamma) * (p - gamma * (1.0 - p) * log_not_p);
            (loss, grad)
        }
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softplus(x: f64) -> f64 {
    if x > 30.0 { x } else { x.exp().ln_1p() }
}

fn huber(diff: f64, delta: f64) -> (f64, f64) {
    if diff.abs() <= delta {
        (0.5 * diff * diff, diff)
    } else {
        (delta * (diff.abs() - 0.5 * delta), delta * diff.signum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::params::AnchorParams;
    use crate::configs::retinanet::retinanet_config;

    fn unit_anchors() -> Arc<Anchors> {
        let params = AnchorParams {
            min_level: 5,
            max_level: 5,
            num_scales: 1,
            aspect_ratios: vec![1.0],
            anchor_size: 1.0,
        };
        // Four anchors, one per quadrant.
        Arc::new(Anchors::generate(&params, [64, 64]))
    }

    fn gt(bbox: [f32; 4], class_id: u32) -> GroundTruth {
        GroundTruth { bbox, class_id, is_crowd: false, mask: None }
    }

    #[test]
    fn test_assign_targets_thresholds_and_best_anchor() {
        let anchors = unit_anchors();
        let objects = vec![gt([0.0, 0.0, 0.5, 0.5], 1), gt([0.5, 0.5, 0.6, 0.6], 0)];
        let targets = assign_targets(&anchors, &objects, 0.5, 0.4);
        assert_eq!(targets[0], AnchorTarget::Positive(0));
        assert_eq!(targets[1], AnchorTarget::Negative);
        // IoU 0.04 is below threshold but it is the object's best anchor.
        assert_eq!(targets[3], AnchorTarget::Positive(1));
    }

    #[test]
    fn test_assign_targets_ignore_band_and_crowd() {
        let anchors = unit_anchors();
        let mut crowd = gt([0.0, 0.0, 0.5, 0.5], 1);
        crowd.is_crowd = true;
        let targets = assign_targets(&anchors, &[crowd], 0.5, 0.4);
        assert!(targets.iter().all(|t| *t == AnchorTarget::Negative));

        let objects = vec![gt([0.0, 0.0, 0.5, 0.3], 1), gt([0.0, 0.0, 0.5, 0.5], 0)];
        let targets = assign_targets(&anchors, &objects, 0.7, 0.5);
        assert_eq!(targets[0], AnchorTarget::Positive(1));
        let targets = assign_targets(&anchors, &objects[..1], 0.7, 0.5);
        // 0.6 IoU sits in the ignore band but is claimed as the best anchor.
        assert_eq!(targets[0], AnchorTarget::Positive(0));
        assert_eq!(targets[1], AnchorTarget::Negative);
    }

    #[test]
    fn test_focal_gradient_matches_finite_difference() {
        let mut config = retinanet_config();
        config.architecture.num_classes = 1;
        let loss = DetectionLoss::new(&config, unit_anchors());
        for positive in [true, false] {
            for x in [-2.0f32, -0.3, 0.0, 1.7] {
                let eps = 1e-3;
                let (_, grad) = loss.focal(x, positive);
                let (up, _) = loss.focal(x + eps, positive);
                let (down, _) = loss.focal(x - eps, positive);
                let numeric = (up - down) / f64::from(2.0 * eps);
                assert!((grad - numeric).abs() < 1e-3, "x={x} positive={positive}: {grad} vs {numeric}");
            }
        }
    }

    #[test]
    fn test_huber_piecewise() {
        assert_eq!(huber(0.05, 0.1), (0.5 * 0.05 * 0.05, 0.05));
        let (loss, grad) = huber(-0.3, 0.1);
        assert!((loss - 0.025).abs() < 1e-12);
        assert_eq!(grad, -0.1);
    }

    #[test]
    fn test_compute_counts_positives_and_normalizes() {
        let mut config = retinanet_config();
        config.architecture.num_classes = 2;
        let anchors = unit_anchors();
        let loss = DetectionLoss::new(&config, anchors.clone());
        let outputs = vec![HeadOutputs {
            class_logits: vec![0.0; anchors.len() * 2],
            box_deltas: vec![0.0; anchors.len() * 4],
            mask_logits: None,
        }];
        let examples =
            vec![DetectionExample { image_id: 1, features: vec![], objects: vec![gt([0.0, 0.0, 0.5, 0.5], 1)] }];
        let out = loss.compute(&outputs, &examples).unwrap();
        assert_eq!(out.num_positives, 1);
        // Exact anchor match: zero box loss.
        assert!(out.box_loss.abs() < 1e-9);
        assert!(out.cls_loss > 0.0);
        assert!((out.total_loss - out.cls_loss).abs() < 1e-9);
        // Positive class logit is pushed up, the rest down.
        assert!(out.grads[0].class_logits[1] < 0.0);
        assert!(out.grads[0].class_logits[0] > 0.0);

        assert!(loss.compute(&outputs, &[]).is_err());
    }
}
