use super::anchors::Anchors;
use super::losses::DetectionLoss;
use super::metrics::CocoBoxMetric;
use super::model::{DetectionModel, HeadOutputs};
use super::postprocess::PostProcessor;
use super::{
    checkpoint_restorer, trainable_filter, EvalMetric, EvalMetricFn, LossFn, ModelBuilder, ModelFn,
    PostProcessFn, RestoreFn, VariableFilter,
};
use crate::configs::DetectionConfig;
use crate::error::DetectionResult;
use crate::input::DetectionExample;
use crate::mode::ModeKey;
use std::sync::Arc;

/// Single-stage anchor detector with focal loss.
#[derive(Debug, Clone)]
pub struct RetinanetBuilder {
    params: Arc<DetectionConfig>,
    anchors: Arc<Anchors>,
}

impl RetinanetBuilder {
    #[must_use]
    pub fn new(params: &DetectionConfig) -> Self {
        let anchors = Arc::new(Anchors::generate(&params.anchor, params.parser.output_size));
        Self { params: Arc::new(params.clone()), anchors }
    }

    pub(crate) fn params(&self) -> &DetectionConfig {
        &self.params
    }
}

impl ModelBuilder for RetinanetBuilder {
    fn name(&self) -> &'static str {
        "retinanet"
    }

    fn build_model(&self, params: &DetectionConfig, mode: ModeKey) -> ModelFn {
        let params = params.clone();
        let anchors = self.anchors.clone();
        Arc::new(move || DetectionModel::new(&params, anchors.clone(), mode))
    }

    fn build_loss_fn(&self) -> LossFn {
        let loss = DetectionLoss::new(&self.params, self.anchors.clone());
        Arc::new(move |outputs: &[HeadOutputs], examples: &[DetectionExample]| loss.compute(outputs, examples))
    }

    fn post_processing(&self) -> PostProcessFn {
        let post = PostProcessor::new(&self.params, self.anchors.clone());
        Arc::new(move |outputs: &HeadOutputs| post.run(outputs))
    }

    fn eval_metrics(&self) -> EvalMetricFn {
        Arc::new(|| Box::new(CocoBoxMetric::boxes()) as Box<dyn EvalMetric>)
    }

    fn make_filter_trainable_variables_fn(&self) -> DetectionResult<VariableFilter> {
        trainable_filter(&self.params.train.frozen_variable_prefix)
    }

    fn make_restore_checkpoint_fn(&self) -> Option<RestoreFn> {
        let ckpt = &self.params.train.checkpoint;
        checkpoint_restorer(&ckpt.path, &ckpt.prefix)
    }
}
