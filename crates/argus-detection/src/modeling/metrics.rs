//! COCO-style box AP and mask IoU accumulated over an evaluation pass.

use super::anchors::iou;
use super::postprocess::Detection;
use crate::input::{DetectionExample, GroundTruth};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

pub type EvalMetrics = BTreeMap<String, f64>;

/// Stateful metric fed one batch at a time.
pub trait EvalMetric: Send {
    fn update(&mut self, examples: &[DetectionExample], detections: &[Vec<Detection>]);

    fn result(&self) -> EvalMetrics;

    fn reset(&mut self);
}

const RECALL_POINTS: usize = 101;
const MASK_MATCH_IOU: f32 = 0.5;

fn iou_thresholds() -> impl Iterator<Item = f32> {
    (0..10).map(|i| 0.5 + 0.05 * i as f32)
}

#[derive(Debug, Default)]
pub struct CocoBoxMetric {
    with_masks: bool,
    images: Vec<(Vec<GroundTruth>, Vec<Detection>)>,
}

impl CocoBoxMetric {
    #[must_use]
    pub fn boxes() -> Self {
        Self { with_masks: false, images: Vec::new() }
    }

    #[must_use]
    pub fn boxes_and_masks() -> Self {
        Self { with_masks: true, images: Vec::new() }
    }

    /// AP for one IoU threshold, averaged over classes with ground truth.
    fn average_precision(&self, threshold: f32) -> f64 {
        let classes: BTreeSet<u32> = self
            .images
            .iter()
            .flat_map(|(gts, _)| gts.iter().filter(|g| !g.is_crowd).map(|g| g.class_id))
            .collect();
        if classes.is_empty() {
            return 0.0;
        }
        let total: f64 = classes.iter().map(|c| self.class_ap(*c, threshold)).sum();
        total / classes.len() as f64
    }

    fn class_ap(&self, class_id: u32, threshold: f32) -> f64 {
        let mut num_gt = 0usize;
        // (score, is_true_positive) per non-ignored detection.
        let mut scored: Vec<(f32, bool)> = Vec::new();

        for (gts, dets) in &self.images {
            let gts: Vec<&GroundTruth> = gts.iter().filter(|g| g.class_id == class_id).collect();
            num_gt += gts.iter().filter(|g| !g.is_crowd).count();
            let mut dets: Vec<&Detection> = dets.iter().filter(|d| d.class_id == class_id).collect();
            dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

            let mut taken = vec![false; gts.len()];
            for det in dets {
                let best = best_match(&gts, &taken, det, threshold, false);
                if let Some(g) = best {
                    taken[g] = true;
                    scored.push((det.score, true));
                } else if best_match(&gts, &taken, det, threshold, true).is_none() {
                    scored.push((det.score, false));
                }
            }
        }

        if num_gt == 0 {
            return 0.0;
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut precisions = Vec::with_capacity(scored.len());
        let mut recalls = Vec::with_capacity(scored.len());
        let (mut tp, mut fp) = (0f64, 0f64);
        for (_, is_tp) in &scored {
            if *is_tp { tp += 1.0 } else { fp += 1.0 }
            precisions.push(tp / (tp + fp));
            recalls.push(tp / num_gt as f64);
        }
        // Precision envelope.
        for i in (0..precisions.len().saturating_sub(1)).rev() {
            precisions[i] = precisions[i].max(precisions[i + 1]);
        }

        let mut sum = 0.0;
        for r in 0..RECALL_POINTS {
            let level = r as f64 / (RECALL_POINTS - 1) as f64;
            let idx = recalls.partition_point(|rec| *rec < level);
            if let Some(p) = precisions.get(idx) {
                sum += p;
            }
        }
        sum / RECALL_POINTS as f64
    }

    fn mask_mean_iou(&self) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for (gts, dets) in &self.images {
            let candidates: Vec<&GroundTruth> = gts.iter().collect();
            let mut taken = vec![false; gts.len()];
            let mut dets: Vec<&Detection> = dets.iter().collect();
            dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
            for det in dets {
                let Some(g) = best_match(&candidates, &taken, det, MASK_MATCH_IOU, false) else { continue };
                taken[g] = true;
                if let (Some(pred), Some(truth)) = (&det.mask, &gts[g].mask) {
                    total += mask_iou(pred, truth);
                    count += 1;
                }
            }
        }
        if count == 0 { 0.0 } else { total / count as f64 }
    }
}

/// Highest-IoU untaken ground truth of the detection's class at or above `threshold`.
fn best_match(
    gts: &[&GroundTruth],
    taken: &[bool],
    det: &Detection,
    threshold: f32,
    crowd: bool,
) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, gt) in gts.iter().enumerate() {
        if gt.is_crowd != crowd || gt.class_id != det.class_id || (!crowd && taken[i]) {
            continue;
        }
        let overlap = iou(&gt.bbox, &det.bbox);
        if overlap >= threshold && best.is_none_or(|(_, b)| overlap > b) {
            best = Some((i, overlap));
        }
    }
    best.map(|(i, _)| i)
}

fn mask_iou(pred: &[f32], truth: &[f32]) -> f64 {
    let (mut inter, mut union) = (0usize, 0usize);
    for (p, t) in pred.iter().zip(truth) {
        let p = *p >= 0.5;
        let t = *t >= 0.5;
        inter += usize::from(p && t);
        union += usize::from(p || t);
    }
    if union == 0 { 1.0 } else { inter as f64 / union as f64 }
}

impl EvalMetric for CocoBoxMetric {
    fn update(&mut self, examples: &[DetectionExample], detections: &[Vec<Detection>]) {
        for (ex, dets) in examples.iter().zip(detections) {
            self.images.push((ex.objects.clone(), dets.clone()));
        }
    }

    fn result(&self) -> EvalMetrics {
        let per_threshold: Vec<(f32, f64)> = iou_thresholds().map(|t| (t, self.average_precision(t))).collect();
        let ap = per_threshold.iter().map(|(_, v)| v).sum::<f64>() / per_threshold.len() as f64;
        let at = |target: f32| {
            per_threshold
                .iter()
                .find(|(t, _)| (t - target).abs() < 1e-4)
                .map_or(0.0, |(_, v)| *v)
        };

        let mut metrics = EvalMetrics::new();
        metrics.insert("AP".to_string(), ap);
        metrics.insert("AP50".to_string(), at(0.5));
        metrics.insert("AP75".to_string(), at(0.75));
        metrics.insert("num_eval_examples".to_string(), self.images.len() as f64);
        if self.with_masks {
            metrics.insert("mask_mean_iou".to_string(), self.mask_mean_iou());
        }
        metrics
    }

    fn reset(&mut self) {
        self.images.clear();
    }
}
