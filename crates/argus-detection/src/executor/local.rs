//! In-process reference executor.
//!
//! Replicas are simulated by splitting each host batch into shards, computing
//! gradients per shard and averaging them before the optimizer step.

use super::optimizer::{LearningRateSchedule, MomentumOptimizer};
use super::{DistributedExecutor, EvalRequest, ExecutorBackend, ExecutorParts, TrainOutcome, TrainRequest};
use crate::artifacts::{make_artifact, ArtifactKind, TrainManifest, TrainSummary};
use crate::checkpoint::Checkpoint;
use crate::error::{DetectionError, DetectionResult};
use crate::input::{DetectionExample, InputContext};
use crate::layout::ModelDirLayout;
use crate::modeling::{DetectionModel, EvalMetrics, Gradients, LossOutput};
use crate::progress::{ProgressEvent, ProgressSink, TracingProgressSink};
use crate::registry::latest_checkpoint;
use crate::strategy::DistributionStrategy;
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct LocalExecutorBackend {
    progress: Arc<dyn ProgressSink>,
}

impl Default for LocalExecutorBackend {
    fn default() -> Self {
        Self { progress: Arc::new(TracingProgressSink) }
    }
}

impl LocalExecutorBackend {
    #[must_use]
    pub fn with_progress(progress: Arc<dyn ProgressSink>) -> Self {
        Self { progress }
    }
}

impl ExecutorBackend for LocalExecutorBackend {
    fn build(&self, strategy: DistributionStrategy, parts: ExecutorParts) -> DetectionResult<Box<dyn DistributedExecutor>> {
        Ok(Box::new(LocalExecutor { strategy, parts, progress: self.progress.clone() }))
    }
}

pub struct LocalExecutor {
    strategy: DistributionStrategy,
    parts: ExecutorParts,
    progress: Arc<dyn ProgressSink>,
}

#[derive(Debug, Default, Clone, Copy)]
struct StepLosses {
    total: f64,
    cls: f64,
    boxes: f64,
    mask: Option<f64>,
}

impl StepLosses {
    fn add(&mut self, loss: &LossOutput) {
        self.total += loss.total_loss;
        self.cls += loss.cls_loss;
        self.boxes += loss.box_loss;
        if let Some(mask) = loss.mask_loss {
            *self.mask.get_or_insert(0.0) += mask;
        }
    }

    fn merge(&mut self, other: StepLosses) {
        self.total += other.total;
        self.cls += other.cls;
        self.boxes += other.boxes;
        if let Some(mask) = other.mask {
            *self.mask.get_or_insert(0.0) += mask;
        }
    }

    fn scaled(self, factor: f64) -> Self {
        Self {
            total: self.total * factor,
            cls: self.cls * factor,
            boxes: self.boxes * factor,
            mask: self.mask.map(|m| m * factor),
        }
    }
}

#[derive(Serialize)]
struct TrainSummaryLine {
    step: u64,
    total_loss: f64,
    cls_loss: f64,
    box_loss: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    mask_loss: Option<f64>,
    learning_rate: f64,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct EvalSummaryLine<'a> {
    step: u64,
    checkpoint: &'a Path,
    metrics: &'a EvalMetrics,
    timestamp: chrono::DateTime<chrono::Utc>,
}

fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> DetectionResult<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(value)?;
    writeln!(file, "{line}")?;
    Ok(())
}

impl LocalExecutor {
    /// Replicas simulated on this host.
    fn local_replicas(&self) -> usize {
        let pipelines = self.strategy.num_input_pipelines.max(1);
        (self.strategy.num_replicas_in_sync / pipelines).max(1) as usize
    }

    /// One synchronous step: per-replica gradients, all-reduce mean.
    fn replica_step(&self, model: &DetectionModel, batch: &[DetectionExample]) -> DetectionResult<(Gradients, StepLosses)> {
        let shard_size = batch.len().div_ceil(self.local_replicas()).max(1);
        let mut reduced = Gradients::new();
        let mut losses = StepLosses::default();
        let mut shards = 0usize;

        for shard in batch.chunks(shard_size) {
            let outputs = shard.iter().map(|ex| model.forward(&ex.features)).collect::<DetectionResult<Vec<_>>>()?;
            let loss = (self.parts.loss_fn)(&outputs, shard)?;
            if !loss.total_loss.is_finite() {
                return Err(DetectionError::Executor(format!("loss diverged: {}", loss.total_loss)));
            }
            let mut grads = Gradients::new();
            for (ex, head) in shard.iter().zip(&loss.grads) {
                model.backward(&ex.features, head, &mut grads);
            }
            for (name, g) in grads {
                crate::modeling::model::add_into(reduced.entry(name).or_default(), &g);
            }
            losses.add(&loss);
            shards += 1;
        }

        let scale = 1.0 / shards.max(1) as f32;
        for g in reduced.values_mut() {
            for v in g.iter_mut() {
                *v *= scale;
            }
        }
        Ok((reduced, losses.scaled(f64::from(scale))))
    }

    fn restore(&self, model: &mut DetectionModel, optimizer: &mut MomentumOptimizer, request: &TrainRequest) -> DetectionResult<u64> {
        if let Some(entry) = latest_checkpoint(&request.model_dir)? {
            let ckpt = Checkpoint::read(&entry.path)?;
            model.load_variables(ckpt.variables)?;
            optimizer.restore_slots(ckpt.optimizer_slots);
            tracing::info!(checkpoint = %entry.path.display(), step = ckpt.step, "resuming from checkpoint");
            return Ok(ckpt.step);
        }
        if let Some(restore) = &request.init_checkpoint {
            restore(model.variables_mut())?;
        }
        Ok(0)
    }

    fn evaluate_checkpoint(&self, request: &EvalRequest, checkpoint: &Path) -> DetectionResult<(u64, EvalMetrics)> {
        let ckpt = Checkpoint::read(checkpoint)?;
        let config = self.parts.params.config();
        if ckpt.model != config.model_type {
            tracing::warn!(checkpoint_model = %ckpt.model, model = %config.model_type, "checkpoint was written by a different model");
        }
        let mut model = (self.parts.model_fn)();
        model.load_variables(ckpt.variables)?;

        let mut metric = (request.eval_metric_fn)();
        for batch in request.eval_input_fn.call(&InputContext::single())? {
            let mut detections = Vec::with_capacity(batch.len());
            for ex in &batch {
                let outputs = model.forward(&ex.features)?;
                detections.push((self.parts.predict_post_process_fn)(&outputs));
            }
            metric.update(&batch, &detections);
        }
        Ok((ckpt.step, metric.result()))
    }
}

#[async_trait]
impl DistributedExecutor for LocalExecutor {
    fn id(&self) -> &'static str {
        "local"
    }

    fn strategy(&self) -> &DistributionStrategy {
        &self.strategy
    }

    async fn train(&self, request: TrainRequest) -> DetectionResult<TrainOutcome> {
        let config = self.parts.params.config();
        let layout = ModelDirLayout::new(&request.model_dir);
        layout.ensure_dirs()?;

        if request.save_config {
            std::fs::write(layout.params_path(), self.parts.params.dict().to_yaml()?)?;
        }

        let mut model = (self.parts.model_fn)();
        if !model.mode().is_training() {
            return Err(DetectionError::Executor(format!("train called with a {} model", model.mode())));
        }
        let mut optimizer = MomentumOptimizer::from_params(&config.train.optimizer, config.train.l2_weight_decay)?;
        let schedule = LearningRateSchedule::from_params(&config.train.learning_rate, request.total_steps)?;
        let iterations_per_loop = request.iterations_per_loop.max(1);

        let start_step = self.restore(&mut model, &mut optimizer, &request)?;
        self.progress.on_event(ProgressEvent::TrainStarted {
            model: config.model_type.clone(),
            start_step,
            total_steps: request.total_steps,
        });
        tracing::debug!(
            replicas = self.strategy.num_replicas_in_sync,
            local_replicas = self.local_replicas(),
            is_multi_host = self.parts.is_multi_host,
            batch_size = request.train_input_fn.batch_size(),
            "starting training loop"
        );

        let mut step = start_step;
        let mut checkpoints: Vec<PathBuf> = Vec::new();
        let mut last_losses: Option<StepLosses> = None;

        if step < request.total_steps {
            let mut batches = request.train_input_fn.call(&InputContext::for_strategy(&self.strategy))?;

            while step < request.total_steps {
                let loop_end = (step + iterations_per_loop).min(request.total_steps);
                let mut loop_losses = StepLosses::default();
                let mut loop_steps = 0u64;
                let mut learning_rate = 0.0;

                while step < loop_end {
                    let batch = batches
                        .next()
                        .ok_or_else(|| DetectionError::Executor("training input ran out of batches".to_string()))?;
                    let (grads, losses) = self.replica_step(&model, &batch)?;
                    learning_rate = schedule.learning_rate(step);
                    optimizer.apply(model.variables_mut(), &grads, learning_rate, &self.parts.trainable_variables_filter);
                    loop_losses.merge(losses);
                    loop_steps += 1;
                    step += 1;
                }

                let losses = loop_losses.scaled(1.0 / loop_steps.max(1) as f64);
                let ckpt = Checkpoint {
                    step,
                    model: config.model_type.clone(),
                    created_at: chrono::Utc::now(),
                    variables: model.variables().clone(),
                    optimizer_slots: optimizer.slots().clone(),
                };
                checkpoints.push(ckpt.save(&layout)?);
                append_jsonl(
                    &layout.train_summary_path(),
                    &TrainSummaryLine {
                        step,
                        total_loss: losses.total,
                        cls_loss: losses.cls,
                        box_loss: losses.boxes,
                        mask_loss: losses.mask,
                        learning_rate,
                        timestamp: chrono::Utc::now(),
                    },
                )?;
                self.progress.on_event(ProgressEvent::Loop {
                    step,
                    total_steps: request.total_steps,
                    total_loss: losses.total,
                    learning_rate,
                });
                self.progress.on_event(ProgressEvent::CheckpointSaved { step });
                last_losses = Some(losses);

                tokio::task::yield_now().await;
            }
        } else {
            tracing::info!(step, total_steps = request.total_steps, "model_dir already reached total_steps");
        }

        let mut artifacts = Vec::new();
        for path in &checkpoints {
            artifacts.push(make_artifact(ArtifactKind::Checkpoint, path.clone())?);
        }
        if request.save_config {
            artifacts.push(make_artifact(ArtifactKind::Config, layout.params_path())?);
        }
        if layout.train_summary_path().exists() {
            artifacts.push(make_artifact(ArtifactKind::Summary, layout.train_summary_path())?);
        }

        let manifest = TrainManifest {
            run_id: uuid::Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            model: config.model_type.clone(),
            strategy: self.strategy.kind.to_string(),
            num_replicas_in_sync: self.strategy.num_replicas_in_sync,
            summary: TrainSummary {
                final_step: step,
                total_loss: last_losses.map(|l| l.total),
                cls_loss: last_losses.map(|l| l.cls),
                box_loss: last_losses.map(|l| l.boxes),
                mask_loss: last_losses.and_then(|l| l.mask),
            },
            artifacts,
        };
        let manifest_path = layout.manifest_path();
        crate::checkpoint::write_json(&manifest_path, &manifest)?;

        self.progress.on_event(ProgressEvent::Finished { step });
        Ok(TrainOutcome {
            model_dir: request.model_dir,
            start_step,
            final_step: step,
            total_loss: last_losses.map(|l| l.total),
            checkpoints,
            manifest_path,
        })
    }

    async fn evaluate_from_model_dir(&self, request: EvalRequest) -> DetectionResult<EvalMetrics> {
        let layout = ModelDirLayout::new(&request.model_dir);
        let poll = request.min_eval_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        let mut last_step: Option<u64> = None;
        let mut last_metrics: Option<EvalMetrics> = None;
        let mut last_eval_at: Option<Instant> = None;
        let mut waiting_since = Instant::now();
        let mut announced_wait = false;

        loop {
            let latest = latest_checkpoint(&request.model_dir)?;
            let fresh = latest.filter(|c| last_step != Some(c.step));

            if let Some(entry) = fresh {
                if let Some(at) = last_eval_at {
                    let ready = at + request.min_eval_interval;
                    if Instant::now() < ready {
                        tokio::time::sleep_until(ready).await;
                    }
                }

                let (step, metrics) = self.evaluate_checkpoint(&request, &entry.path)?;
                std::fs::create_dir_all(layout.summaries_dir())?;
                append_jsonl(
                    &layout.eval_summary_path(),
                    &EvalSummaryLine { step, checkpoint: &entry.path, metrics: &metrics, timestamp: chrono::Utc::now() },
                )?;
                self.progress.on_event(ProgressEvent::Evaluated {
                    step,
                    metrics: metrics.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                });

                last_step = Some(entry.step);
                last_eval_at = Some(Instant::now());
                waiting_since = Instant::now();
                announced_wait = false;
                last_metrics = Some(metrics);

                if step >= request.total_steps {
                    break;
                }
                continue;
            }

            if let Some(timeout) = request.eval_timeout
                && waiting_since.elapsed() >= timeout
            {
                tracing::info!(timeout_secs = timeout.as_secs_f64(), "no new checkpoint before eval timeout");
                break;
            }
            if !announced_wait {
                self.progress.on_event(ProgressEvent::Waiting { timeout_secs: request.eval_timeout.map(|t| t.as_secs()) });
                announced_wait = true;
            }
            tokio::time::sleep(poll).await;
        }

        last_metrics.ok_or(DetectionError::EvalTimeout)
    }
}
