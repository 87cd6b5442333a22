//! Model factory and the reference detection models.
//!
//! A [`ModelBuilder`] is selected once per run by [`model_generator`] and
//! hands out the functions the executor drives: model construction, loss,
//! post-processing, eval metrics, the trainable-variable filter and the
//! optional warm-start restore.

pub mod anchors;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod postprocess;
pub mod retinanet;
pub mod shapemask;

pub use losses::{DetectionLoss, LossOutput};
pub use metrics::{CocoBoxMetric, EvalMetric, EvalMetrics};
pub use model::{DetectionModel, Gradients, HeadOutputs, Variable, Variables};
pub use postprocess::{Detection, PostProcessor};

use crate::checkpoint::Checkpoint;
use crate::configs::DetectionConfig;
use crate::error::{DetectionError, DetectionResult};
use crate::input::DetectionExample;
use crate::mode::ModeKey;
use crate::registry::resolve_checkpoint;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;

pub type ModelFn = Arc<dyn Fn() -> DetectionModel + Send + Sync>;
pub type LossFn = Arc<dyn Fn(&[HeadOutputs], &[DetectionExample]) -> DetectionResult<LossOutput> + Send + Sync>;
pub type PostProcessFn = Arc<dyn Fn(&HeadOutputs) -> Vec<Detection> + Send + Sync>;
pub type EvalMetricFn = Arc<dyn Fn() -> Box<dyn EvalMetric> + Send + Sync>;
/// Returns `true` for variables the optimizer may update.
pub type VariableFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;
/// Warm-starts variables in place; returns how many were restored.
pub type RestoreFn = Arc<dyn Fn(&mut Variables) -> DetectionResult<usize> + Send + Sync>;

pub trait ModelBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn build_model(&self, params: &DetectionConfig, mode: ModeKey) -> ModelFn;

    fn build_loss_fn(&self) -> LossFn;

    fn post_processing(&self) -> PostProcessFn;

    fn eval_metrics(&self) -> EvalMetricFn;

    fn make_filter_trainable_variables_fn(&self) -> DetectionResult<VariableFilter>;

    fn make_restore_checkpoint_fn(&self) -> Option<RestoreFn>;
}

/// Pick the builder for `params.type`.
pub fn model_generator(params: &DetectionConfig) -> DetectionResult<Box<dyn ModelBuilder>> {
    match params.model_type.as_str() {
        "retinanet" => Ok(Box::new(retinanet::RetinanetBuilder::new(params))),
        "shapemask" => Ok(Box::new(shapemask::ShapemaskBuilder::new(params))),
        other => Err(DetectionError::Config(format!("model `{other}` is not supported"))),
    }
}

/// Variables whose names match `frozen_prefix` from the start are frozen.
pub(crate) fn trainable_filter(frozen_prefix: &str) -> DetectionResult<VariableFilter> {
    if frozen_prefix.is_empty() {
        return Ok(Arc::new(|_: &str| true));
    }
    let frozen = Regex::new(&format!("^(?:{frozen_prefix})"))
        .map_err(|e| DetectionError::Config(format!("invalid frozen_variable_prefix `{frozen_prefix}`: {e}")))?;
    Ok(Arc::new(move |name: &str| !frozen.is_match(name)))
}

/// Copy variables named `prefix*` from the checkpoint at `path` (file or model dir).
pub(crate) fn checkpoint_restorer(path: &str, prefix: &str) -> Option<RestoreFn> {
    if path.trim().is_empty() {
        return None;
    }
    let path = PathBuf::from(path);
    let prefix = prefix.to_string();
    Some(Arc::new(move |variables: &mut Variables| -> DetectionResult<usize> {
        let resolved = resolve_checkpoint(&path)?;
        let ckpt = Checkpoint::read(&resolved)?;
        let mut restored = 0;
        for (name, source) in ckpt.variables {
            if !name.starts_with(&prefix) {
                continue;
            }
            match variables.get_mut(&name) {
                Some(target) if target.shape == source.shape => {
                    *target = source;
                    restored += 1;
                }
                Some(target) => {
                    tracing::warn!(
                        variable = %name,
                        checkpoint_shape = ?source.shape,
                        model_shape = ?target.shape,
                        "skipping variable with mismatched shape"
                    );
                }
                None => tracing::debug!(variable = %name, "checkpoint variable not in model"),
            }
        }
        tracing::info!(checkpoint = %resolved.display(), restored, "warm-started from checkpoint");
        Ok(restored)
    }))
}
