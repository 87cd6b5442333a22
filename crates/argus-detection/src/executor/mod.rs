//! Distributed executor seam.
//!
//! [`ExecutorBuilder`] resolves the distribution strategy; an
//! [`ExecutorBackend`] turns the strategy plus [`ExecutorParts`] into a
//! [`DistributedExecutor`] that owns the training and evaluation loops.

pub mod local;
pub mod optimizer;

pub use local::{LocalExecutor, LocalExecutorBackend};

use crate::configs::LockedParams;
use crate::error::DetectionResult;
use crate::input::InputFn;
use crate::modeling::{EvalMetricFn, EvalMetrics, LossFn, ModelFn, PostProcessFn, RestoreFn, VariableFilter};
use crate::strategy::{DistributionStrategy, StrategyConfig, StrategyType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything an executor needs that does not change between calls.
#[derive(Clone)]
pub struct ExecutorParts {
    pub params: Arc<LockedParams>,
    pub is_multi_host: bool,
    pub model_fn: ModelFn,
    pub loss_fn: LossFn,
    pub predict_post_process_fn: PostProcessFn,
    pub trainable_variables_filter: VariableFilter,
}

pub struct TrainRequest {
    pub train_input_fn: InputFn,
    pub model_dir: PathBuf,
    pub iterations_per_loop: u64,
    pub total_steps: u64,
    pub init_checkpoint: Option<RestoreFn>,
    pub save_config: bool,
}

pub struct EvalRequest {
    pub model_dir: PathBuf,
    pub eval_input_fn: InputFn,
    pub eval_metric_fn: EvalMetricFn,
    /// `None` waits for new checkpoints forever.
    pub eval_timeout: Option<Duration>,
    pub min_eval_interval: Duration,
    pub total_steps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainOutcome {
    pub model_dir: PathBuf,
    pub start_step: u64,
    pub final_step: u64,
    pub total_loss: Option<f64>,
    pub checkpoints: Vec<PathBuf>,
    pub manifest_path: PathBuf,
}

#[async_trait]
pub trait DistributedExecutor: Send + Sync {
    fn id(&self) -> &'static str;

    fn strategy(&self) -> &DistributionStrategy;

    async fn train(&self, request: TrainRequest) -> DetectionResult<TrainOutcome>;

    /// Evaluate checkpoints as they appear in `model_dir` until `total_steps` is reached.
    async fn evaluate_from_model_dir(&self, request: EvalRequest) -> DetectionResult<EvalMetrics>;
}

/// Builds executors for a resolved strategy.
pub trait ExecutorBackend: Send + Sync {
    fn build(&self, strategy: DistributionStrategy, parts: ExecutorParts) -> DetectionResult<Box<dyn DistributedExecutor>>;
}

#[derive(Debug, Clone)]
pub struct ExecutorBuilder {
    strategy: DistributionStrategy,
}

impl ExecutorBuilder {
    pub fn new(strategy_type: &str, strategy_config: &StrategyConfig) -> DetectionResult<Self> {
        let kind: StrategyType = strategy_type.parse()?;
        let strategy = DistributionStrategy::resolve(kind, strategy_config)?;
        tracing::debug!(
            strategy = %strategy.kind,
            replicas = strategy.num_replicas_in_sync,
            input_pipelines = strategy.num_input_pipelines,
            "resolved distribution strategy"
        );
        Ok(Self { strategy })
    }

    #[must_use]
    pub fn strategy(&self) -> &DistributionStrategy {
        &self.strategy
    }

    pub fn build_executor(
        &self,
        backend: &dyn ExecutorBackend,
        parts: ExecutorParts,
    ) -> DetectionResult<Box<dyn DistributedExecutor>> {
        backend.build(self.strategy.clone(), parts)
    }
}
