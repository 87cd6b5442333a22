use super::params::{
    AnchorParams, ArchitectureParams, CheckpointParams, DetectionConfig, EvalParams, HeadParams,
    LearningRateParams, LossParams, OptimizerParams, ParserParams, PostprocessParams, TrainParams,
};
use crate::strategy::StrategyConfig;

pub const RETINANET_RESTRICTIONS: &[&str] = &[
    "architecture.use_bfloat16 == parser.use_bfloat16",
    "architecture.num_classes == retinanet_head.num_classes",
    "anchor.min_level == retinanet_head.min_level",
    "anchor.max_level == retinanet_head.max_level",
    "anchor.min_level == postprocess.min_level",
    "anchor.max_level == postprocess.max_level",
    "retinanet_head.num_classes == retinanet_loss.num_classes",
    "retinanet_head.num_classes == postprocess.num_classes",
    "parser.unmatched_threshold <= parser.match_threshold",
];

pub(crate) const NUM_CLASSES: u32 = 91;
const MIN_LEVEL: u32 = 5;
const MAX_LEVEL: u32 = 7;

#[must_use]
pub fn retinanet_config() -> DetectionConfig {
    DetectionConfig {
        model_type: "retinanet".to_string(),
        model_dir: Some(String::new()),
        strategy_type: "one_device".to_string(),
        strategy_config: StrategyConfig::default(),
        train: TrainParams {
            batch_size: 64,
            iterations_per_loop: 500,
            total_steps: 22_500,
            optimizer: OptimizerParams { optimizer_type: "momentum".to_string(), momentum: 0.9 },
            learning_rate: LearningRateParams {
                schedule: "step".to_string(),
                warmup_learning_rate: 0.0067,
                warmup_steps: 500,
                init_learning_rate: 0.08,
                learning_rate_levels: vec![0.008, 0.0008],
                learning_rate_steps: vec![15_000, 20_000],
            },
            checkpoint: CheckpointParams { path: String::new(), prefix: String::new() },
            frozen_variable_prefix: String::new(),
            train_file_pattern: String::new(),
            l2_weight_decay: 0.0001,
            seed: 42,
        },
        eval: EvalParams {
            batch_size: 8,
            min_eval_interval: 180,
            eval_timeout: None,
            eval_samples: 5000,
            eval_file_pattern: String::new(),
            eval_type: "box".to_string(),
        },
        architecture: ArchitectureParams { num_classes: NUM_CLASSES, feature_dim: 8, use_bfloat16: false },
        anchor: AnchorParams {
            min_level: MIN_LEVEL,
            max_level: MAX_LEVEL,
            num_scales: 3,
            aspect_ratios: vec![1.0, 2.0, 0.5],
            anchor_size: 4.0,
        },
        parser: ParserParams {
            output_size: [256, 256],
            use_bfloat16: false,
            match_threshold: 0.5,
            unmatched_threshold: 0.5,
            aug_rand_hflip: true,
            skip_crowd_during_training: true,
            max_num_instances: 100,
        },
        retinanet_head: HeadParams {
            min_level: MIN_LEVEL,
            max_level: MAX_LEVEL,
            num_classes: NUM_CLASSES,
            anchors_per_location: 9,
        },
        retinanet_loss: LossParams {
            num_classes: NUM_CLASSES,
            focal_loss_alpha: 0.25,
            focal_loss_gamma: 1.5,
            huber_loss_delta: 0.1,
            box_loss_weight: 50.0,
        },
        postprocess: PostprocessParams {
            min_level: MIN_LEVEL,
            max_level: MAX_LEVEL,
            num_classes: NUM_CLASSES,
            max_total_size: 100,
            nms_iou_threshold: 0.5,
            score_threshold: 0.05,
            pre_nms_num_boxes: 5000,
        },
        shapemask_head: None,
        shapemask_loss: None,
    }
}
