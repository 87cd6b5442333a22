//! Typed view of the detection parameter dictionary.

use crate::error::{DetectionError, DetectionResult};
use crate::strategy::StrategyConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(rename = "type")]
    pub model_type: String,
    #[serde(default)]
    pub model_dir: Option<String>,
    pub strategy_type: String,
    #[serde(default)]
    pub strategy_config: StrategyConfig,
    pub train: TrainParams,
    pub eval: EvalParams,
    pub architecture: ArchitectureParams,
    pub anchor: AnchorParams,
    pub parser: ParserParams,
    pub retinanet_head: HeadParams,
    pub retinanet_loss: LossParams,
    pub postprocess: PostprocessParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shapemask_head: Option<ShapemaskHeadParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shapemask_loss: Option<ShapemaskLossParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    pub batch_size: u32,
    pub iterations_per_loop: u64,
    pub total_steps: u64,
    pub optimizer: OptimizerParams,
    pub learning_rate: LearningRateParams,
    pub checkpoint: CheckpointParams,
    /// Regex; variables whose names match from the start are frozen.
    pub frozen_variable_prefix: String,
    pub train_file_pattern: String,
    pub l2_weight_decay: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerParams {
    #[serde(rename = "type")]
    pub optimizer_type: String,
    pub momentum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRateParams {
    /// `step` or `cosine`.
    #[serde(rename = "type")]
    pub schedule: String,
    pub warmup_learning_rate: f64,
    pub warmup_steps: u64,
    pub init_learning_rate: f64,
    pub learning_rate_levels: Vec<f64>,
    pub learning_rate_steps: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointParams {
    pub path: String,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalParams {
    pub batch_size: u32,
    /// Seconds between evaluations.
    pub min_eval_interval: u64,
    /// Seconds to wait for a new checkpoint; `None` waits forever.
    #[serde(default)]
    pub eval_timeout: Option<u64>,
    /// Zero or negative means the whole eval set.
    pub eval_samples: i64,
    pub eval_file_pattern: String,
    #[serde(rename = "type")]
    pub eval_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureParams {
    pub num_classes: u32,
    /// Length of the per-image feature vector consumed by the head.
    pub feature_dim: usize,
    pub use_bfloat16: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorParams {
    pub min_level: u32,
    pub max_level: u32,
    pub num_scales: u32,
    pub aspect_ratios: Vec<f64>,
    pub anchor_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserParams {
    /// `[height, width]` the anchors are laid out on.
    pub output_size: [u32; 2],
    pub use_bfloat16: bool,
    pub match_threshold: f64,
    pub unmatched_threshold: f64,
    pub aug_rand_hflip: bool,
    pub skip_crowd_during_training: bool,
    pub max_num_instances: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadParams {
    pub min_level: u32,
    pub max_level: u32,
    pub num_classes: u32,
    pub anchors_per_location: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossParams {
    pub num_classes: u32,
    pub focal_loss_alpha: f64,
    pub focal_loss_gamma: f64,
    pub huber_loss_delta: f64,
    pub box_loss_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostprocessParams {
    pub min_level: u32,
    pub max_level: u32,
    pub num_classes: u32,
    pub max_total_size: usize,
    pub nms_iou_threshold: f64,
    pub score_threshold: f64,
    pub pre_nms_num_boxes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapemaskHeadParams {
    pub num_classes: u32,
    /// Side length of the box-relative mask grid.
    pub mask_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapemaskLossParams {
    pub mask_loss_weight: f64,
}

impl DetectionConfig {
    /// Semantic checks the restriction list cannot express.
    pub fn validate(&self) -> DetectionResult<()> {
        if self.model_dir.as_deref().is_none_or(|d| d.trim().is_empty()) {
            return Err(invalid("model_dir is required"));
        }
        if self.train.batch_size == 0 {
            return Err(invalid("train.batch_size must be >= 1"));
        }
        if self.eval.batch_size == 0 {
            return Err(invalid("eval.batch_size must be >= 1"));
        }
        if self.train.iterations_per_loop == 0 {
            return Err(invalid("train.iterations_per_loop must be >= 1"));
        }
        if self.architecture.num_classes == 0 {
            return Err(invalid("architecture.num_classes must be >= 1"));
        }
        if self.anchor.min_level > self.anchor.max_level {
            return Err(invalid("anchor.min_level must be <= anchor.max_level"));
        }
        if self.anchor.num_scales == 0 || self.anchor.aspect_ratios.is_empty() {
            return Err(invalid("anchor.num_scales and anchor.aspect_ratios must be non-empty"));
        }
        if self.anchor.aspect_ratios.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            return Err(invalid("anchor.aspect_ratios must be > 0"));
        }
        let per_location = self.anchor.num_scales * self.anchor.aspect_ratios.len() as u32;
        if self.retinanet_head.anchors_per_location != per_location {
            return Err(invalid(format!(
                "retinanet_head.anchors_per_location is {} but anchor settings give {}",
                self.retinanet_head.anchors_per_location, per_location
            )));
        }
        if self.parser.output_size.contains(&0) {
            return Err(invalid("parser.output_size must be positive"));
        }
        for (name, value) in [
            ("parser.match_threshold", self.parser.match_threshold),
            ("parser.unmatched_threshold", self.parser.unmatched_threshold),
            ("postprocess.nms_iou_threshold", self.postprocess.nms_iou_threshold),
            ("postprocess.score_threshold", self.postprocess.score_threshold),
            ("retinanet_loss.focal_loss_alpha", self.retinanet_loss.focal_loss_alpha),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{name} must be in [0, 1], got {value}")));
            }
        }
        let lr = &self.train.learning_rate;
        if lr.learning_rate_levels.len() != lr.learning_rate_steps.len() {
            return Err(invalid("learning_rate_levels and learning_rate_steps must have the same length"));
        }
        if lr.learning_rate_steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("learning_rate_steps must be strictly increasing"));
        }
        if self.model_type == "shapemask" {
            let head = self
                .shapemask_head
                .as_ref()
                .ok_or_else(|| invalid("shapemask models require a shapemask_head section"))?;
            if head.mask_size == 0 {
                return Err(invalid("shapemask_head.mask_size must be >= 1"));
            }
            if self.shapemask_loss.is_none() {
                return Err(invalid("shapemask models require a shapemask_loss section"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn model_dir(&self) -> &str {
        self.model_dir.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn mask_size(&self) -> Option<usize> {
        self.shapemask_head.as_ref().map(|h| h.mask_size)
    }
}

fn invalid(message: impl Into<String>) -> DetectionError {
    DetectionError::Validation(message.into())
}
