use super::anchors::{decode, iou, Anchors, BoxYxyx};
use super::losses::sigmoid;
use super::model::HeadOutputs;
use crate::configs::DetectionConfig;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoxYxyx,
    pub class_id: u32,
    pub score: f32,
    /// Box-relative mask probabilities, shapemask only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<f32>>,
}

/// Turns raw head outputs into final detections.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    anchors: Arc<Anchors>,
    num_classes: usize,
    score_threshold: f32,
    pre_nms_num_boxes: usize,
    nms_iou_threshold: f32,
    max_total_size: usize,
    mask_cells: Option<usize>,
}

impl PostProcessor {
    #[must_use]
    pub fn new(params: &DetectionConfig, anchors: Arc<Anchors>) -> Self {
        let post = &params.postprocess;
        Self {
            anchors,
            num_classes: post.num_classes as usize,
            score_threshold: post.score_threshold as f32,
            pre_nms_num_boxes: post.pre_nms_num_boxes,
            nms_iou_threshold: post.nms_iou_threshold as f32,
            max_total_size: post.max_total_size,
            mask_cells: params.mask_size().map(|s| s * s),
        }
    }

    #[must_use]
    pub fn run(&self, outputs: &HeadOutputs) -> Vec<Detection> {
        let c = self.num_classes;
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (idx, logit) in outputs.class_logits.iter().enumerate() {
            let score = sigmoid(f64::from(*logit)) as f32;
            if score >= self.score_threshold {
                candidates.push((score, idx / c, idx % c));
            }
        }
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        candidates.truncate(self.pre_nms_num_boxes);

        let boxes = self.anchors.boxes();
        let mut per_class: Vec<Vec<Detection>> = vec![Vec::new(); c];
        for (score, anchor, class) in candidates {
            let Some(deltas) = outputs.box_deltas.get(anchor * 4..anchor * 4 + 4) else { continue };
            per_class[class].push(Detection {
                bbox: decode(deltas, &boxes[anchor]),
                class_id: class as u32,
                score,
                mask: None,
            });
        }

        let mut kept: Vec<Detection> =
            per_class.into_iter().flat_map(|dets| nms(dets, self.nms_iou_threshold)).collect();
        kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        kept.truncate(self.max_total_size);

        if let (Some(cells), Some(logits)) = (self.mask_cells, &outputs.mask_logits) {
            for det in &mut kept {
                let offset = det.class_id as usize * cells;
                det.mask = logits
                    .get(offset..offset + cells)
                    .map(|m| m.iter().map(|l| sigmoid(f64::from(*l)) as f32).collect());
            }
        }
        kept
    }
}

/// Greedy non-maximum suppression over detections already sorted by score.
#[must_use]
pub fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut kept: Vec<Detection> = Vec::new();
    for det in detections {
        if kept.iter().all(|k| iou(&k.bbox, &det.bbox) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::params::AnchorParams;
    use crate::configs::retinanet::retinanet_config;

    fn det(bbox: BoxYxyx, score: f32) -> Detection {
        Detection { bbox, class_id: 0, score, mask: None }
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let dets = vec![
            det([0.0, 0.0, 0.5, 0.5], 0.9),
            det([0.0, 0.0, 0.5, 0.45], 0.8),
            det([0.5, 0.5, 1.0, 1.0], 0.7),
        ];
        let kept = nms(dets, 0.5);
        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_run_filters_thresholds_and_caps() {
        let mut config = retinanet_config();
        config.postprocess.num_classes = 2;
        config.postprocess.max_total_size = 2;
        let anchors = Arc::new(Anchors::generate(
            &AnchorParams { min_level: 5, max_level: 5, num_scales: 1, aspect_ratios: vec![1.0], anchor_size: 1.0 },
            [64, 64],
        ));
        let post = PostProcessor::new(&config, anchors.clone());

        // Anchor 0 class 1 and anchor 3 class 0 and class 1 fire; the rest sit at p ~ 0.
        let mut logits = vec![-10.0; anchors.len() * 2];
        logits[1] = 3.0;
        logits[6] = 2.0;
        logits[7] = 1.0;
        let outputs = HeadOutputs { class_logits: logits, box_deltas: vec![0.0; anchors.len() * 4], mask_logits: None };
        let dets = post.run(&outputs);

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_id, 1);
        assert_eq!(dets[0].bbox, [0.0, 0.0, 0.5, 0.5]);
        assert_eq!(dets[1].class_id, 0);
        assert_eq!(dets[1].bbox, [0.5, 0.5, 1.0, 1.0]);
        assert!(dets.iter().all(|d| d.mask.is_none()));
    }
}
