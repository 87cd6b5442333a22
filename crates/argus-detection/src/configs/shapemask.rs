use super::params::{DetectionConfig, ShapemaskHeadParams, ShapemaskLossParams};
use super::retinanet::{retinanet_config, NUM_CLASSES, RETINANET_RESTRICTIONS};

const SHAPEMASK_EXTRA_RESTRICTIONS: &[&str] = &["shapemask_head.num_classes == retinanet_head.num_classes"];

#[must_use]
pub fn shapemask_restrictions() -> Vec<&'static str> {
    RETINANET_RESTRICTIONS.iter().chain(SHAPEMASK_EXTRA_RESTRICTIONS).copied().collect()
}

/// ShapeMask shares the RetinaNet box head and adds per-class shape priors.
#[must_use]
pub fn shapemask_config() -> DetectionConfig {
    let mut config = retinanet_config();
    config.model_type = "shapemask".to_string();
    config.eval.eval_type = "shapemask_box_and_mask".to_string();
    config.shapemask_head = Some(ShapemaskHeadParams { num_classes: NUM_CLASSES, mask_size: 16 });
    config.shapemask_loss = Some(ShapemaskLossParams { mask_loss_weight: 1.0 });
    config
}
