use super::metrics::CocoBoxMetric;
use super::retinanet::RetinanetBuilder;
use super::{EvalMetric, EvalMetricFn, LossFn, ModelBuilder, ModelFn, PostProcessFn, RestoreFn, VariableFilter};
use crate::configs::DetectionConfig;
use crate::error::DetectionResult;
use crate::mode::ModeKey;
use std::sync::Arc;

/// RetinaNet box head plus per-class shape priors.
///
/// The prior masks live in `shapemask/prior`; loss and post-processing pick
/// them up from the config, so only the metric differs from RetinaNet.
#[derive(Debug, Clone)]
pub struct ShapemaskBuilder {
    inner: RetinanetBuilder,
}

impl ShapemaskBuilder {
    #[must_use]
    pub fn new(params: &DetectionConfig) -> Self {
        Self { inner: RetinanetBuilder::new(params) }
    }
}

impl ModelBuilder for ShapemaskBuilder {
    fn name(&self) -> &'static str {
        "shapemask"
    }

    fn build_model(&self, params: &DetectionConfig, mode: ModeKey) -> ModelFn {
        self.inner.build_model(params, mode)
    }

    fn build_loss_fn(&self) -> LossFn {
        self.inner.build_loss_fn()
    }

    fn post_processing(&self) -> PostProcessFn {
        self.inner.post_processing()
    }

    fn eval_metrics(&self) -> EvalMetricFn {
        let with_masks = self.inner.params().eval.eval_type.contains("mask");
        Arc::new(move || {
            let metric = if with_masks { CocoBoxMetric::boxes_and_masks() } else { CocoBoxMetric::boxes() };
            Box::new(metric) as Box<dyn EvalMetric>
        })
    }

    fn make_filter_trainable_variables_fn(&self) -> DetectionResult<VariableFilter> {
        self.inner.make_filter_trainable_variables_fn()
    }

    fn make_restore_checkpoint_fn(&self) -> Option<RestoreFn> {
        self.inner.make_restore_checkpoint_fn()
    }
}
