//! Run orchestration: parameters, input functions, then one executor call.

use crate::configs::{config_generator, LockedParams};
use crate::error::{DetectionError, DetectionResult};
use crate::executor::{
    DistributedExecutor, EvalRequest, ExecutorBackend, ExecutorBuilder, ExecutorParts, LocalExecutorBackend,
    TrainOutcome, TrainRequest,
};
use crate::input::InputFn;
use crate::mode::ModeKey;
use crate::modeling::{model_generator, EvalMetrics};
use crate::strategy::StrategyConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Command-line level inputs of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFlags {
    pub mode: String,
    pub model: String,
    pub config_file: Option<String>,
    pub params_override: Option<String>,
    pub training_file_pattern: Option<String>,
    pub eval_file_pattern: Option<String>,
    pub model_dir: Option<String>,
    pub strategy_type: String,
    pub strategy_config: StrategyConfig,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            mode: "train".to_string(),
            model: "retinanet".to_string(),
            config_file: None,
            params_override: None,
            training_file_pattern: None,
            eval_file_pattern: None,
            model_dir: None,
            strategy_type: "one_device".to_string(),
            strategy_config: StrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", content = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Train(TrainOutcome),
    Eval(EvalMetrics),
}

#[derive(Debug, Clone, Default)]
pub struct InputFns {
    pub train: Option<InputFn>,
    pub eval: Option<InputFn>,
}

/// Default config, strict file and inline overrides, flag injection, validate and lock.
pub fn build_params(flags: &RunFlags) -> DetectionResult<LockedParams> {
    let mut params = config_generator(&flags.model)?;

    params
        .override_from_source(flags.config_file.as_deref(), true)
        .map_err(DetectionError::ConfigOverride)?;
    params
        .override_from_source(flags.params_override.as_deref(), true)
        .map_err(DetectionError::ConfigOverride)?;

    let mut injected = Map::new();
    injected.insert("strategy_type".to_string(), json!(flags.strategy_type));
    if let Some(model_dir) = flags.model_dir.as_deref().filter(|d| !d.is_empty()) {
        injected.insert("model_dir".to_string(), json!(model_dir));
    }
    injected.insert("strategy_config".to_string(), serde_json::to_value(&flags.strategy_config)?);
    params.override_params(&Value::Object(injected), false)?;

    let params = LockedParams::lock(params)?;
    tracing::info!("Model Parameters: {}", params.dict().pretty());
    Ok(params)
}

/// Input functions for whichever file patterns are set, by flag or by config.
pub fn build_input_fns(flags: &RunFlags, params: &LockedParams) -> DetectionResult<InputFns> {
    let config = params.config();
    let pick = |flag: &Option<String>, fallback: &str| {
        flag.as_deref()
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| (!fallback.is_empty()).then(|| fallback.to_string()))
    };
    let training_file_pattern = pick(&flags.training_file_pattern, &config.train.train_file_pattern);
    let eval_file_pattern = pick(&flags.eval_file_pattern, &config.eval.eval_file_pattern);

    if training_file_pattern.is_none() && eval_file_pattern.is_none() {
        return Err(DetectionError::MissingInput(
            "Must provide at least one of training_file_pattern and eval_file_pattern.".to_string(),
        ));
    }

    // Global batch size; rescaled per host once the strategy is known.
    let train = training_file_pattern
        .map(|p| InputFn::new(&p, config, ModeKey::Train, config.train.batch_size, None));
    let eval = eval_file_pattern.map(|p| {
        InputFn::new(&p, config, ModeKey::PredictWithGt, config.eval.batch_size, Some(config.eval.eval_samples))
    });
    Ok(InputFns { train, eval })
}

/// Drives one run against an executor backend.
#[derive(Clone)]
pub struct Runner {
    backend: Arc<dyn ExecutorBackend>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Arc::new(LocalExecutorBackend::default()))
    }
}

impl Runner {
    #[must_use]
    pub fn new(backend: Arc<dyn ExecutorBackend>) -> Self {
        Self { backend }
    }

    pub async fn run(&self, flags: &RunFlags) -> DetectionResult<RunOutcome> {
        let params = Arc::new(build_params(flags)?);
        let inputs = build_input_fns(flags, &params)?;
        self.run_executor(&flags.mode, params, inputs).await
    }

    pub async fn run_executor(
        &self,
        mode: &str,
        params: Arc<LockedParams>,
        inputs: InputFns,
    ) -> DetectionResult<RunOutcome> {
        let config = params.config();
        let model_builder = model_generator(config)?;

        match mode {
            "train" => {
                let train_input_fn = inputs
                    .train
                    .ok_or_else(|| DetectionError::MissingInput("mode train needs a training_file_pattern".to_string()))?;
                let model_fn = model_builder.build_model(config, ModeKey::Train);

                let builder = ExecutorBuilder::new(&config.strategy_type, &config.strategy_config)?;
                let strategy = builder.strategy();
                let is_multi_host = strategy.is_multi_host();
                let train_input_fn = if is_multi_host {
                    let per_host = config.train.batch_size / strategy.num_replicas_in_sync;
                    if per_host == 0 {
                        return Err(DetectionError::Validation(format!(
                            "train.batch_size {} is smaller than num_replicas_in_sync {}",
                            config.train.batch_size, strategy.num_replicas_in_sync
                        )));
                    }
                    tracing::info!(
                        global_batch_size = config.train.batch_size,
                        per_host_batch_size = per_host,
                        workers = strategy.num_workers(),
                        "multi-host run, rescaling batch size"
                    );
                    train_input_fn.with_batch_size(per_host)
                } else {
                    train_input_fn
                };

                let executor = builder.build_executor(
                    self.backend.as_ref(),
                    ExecutorParts {
                        params: params.clone(),
                        is_multi_host,
                        model_fn,
                        loss_fn: model_builder.build_loss_fn(),
                        predict_post_process_fn: model_builder.post_processing(),
                        trainable_variables_filter: model_builder.make_filter_trainable_variables_fn()?,
                    },
                )?;

                let outcome = executor
                    .train(TrainRequest {
                        train_input_fn,
                        model_dir: PathBuf::from(config.model_dir()),
                        iterations_per_loop: config.train.iterations_per_loop,
                        total_steps: config.train.total_steps,
                        init_checkpoint: model_builder.make_restore_checkpoint_fn(),
                        save_config: true,
                    })
                    .await?;
                Ok(RunOutcome::Train(outcome))
            }
            "eval" => {
                let eval_input_fn = inputs
                    .eval
                    .ok_or_else(|| DetectionError::MissingInput("mode eval needs an eval_file_pattern".to_string()))?;
                let model_fn = model_builder.build_model(config, ModeKey::PredictWithGt);

                let builder = ExecutorBuilder::new(&config.strategy_type, &config.strategy_config)?;
                let executor = builder.build_executor(
                    self.backend.as_ref(),
                    ExecutorParts {
                        params: params.clone(),
                        is_multi_host: false,
                        model_fn,
                        loss_fn: model_builder.build_loss_fn(),
                        predict_post_process_fn: model_builder.post_processing(),
                        trainable_variables_filter: model_builder.make_filter_trainable_variables_fn()?,
                    },
                )?;

                let results = executor
                    .evaluate_from_model_dir(EvalRequest {
                        model_dir: PathBuf::from(config.model_dir()),
                        eval_input_fn,
                        eval_metric_fn: model_builder.eval_metrics(),
                        eval_timeout: config.eval.eval_timeout.map(Duration::from_secs),
                        min_eval_interval: Duration::from_secs(config.eval.min_eval_interval),
                        total_steps: config.train.total_steps,
                    })
                    .await?;
                for (k, v) in &results {
                    tracing::info!("Final eval metric {k}: {v}");
                }
                Ok(RunOutcome::Eval(results))
            }
            other => Err(DetectionError::InvalidMode(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::DistributionStrategy;
    use argus_params::ParamsError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct TrainCall {
        replicas: u32,
        is_multi_host: bool,
        batch_size: usize,
        total_steps: u64,
        save_config: bool,
    }

    #[derive(Default)]
    struct StubBackend {
        train_calls: Arc<Mutex<Vec<TrainCall>>>,
    }

    struct StubExecutor {
        strategy: DistributionStrategy,
        is_multi_host: bool,
        train_calls: Arc<Mutex<Vec<TrainCall>>>,
    }

    impl ExecutorBackend for StubBackend {
        fn build(
            &self,
            strategy: DistributionStrategy,
            parts: ExecutorParts,
        ) -> DetectionResult<Box<dyn DistributedExecutor>> {
            Ok(Box::new(StubExecutor {
                strategy,
                is_multi_host: parts.is_multi_host,
                train_calls: self.train_calls.clone(),
            }))
        }
    }

    #[async_trait]
    impl DistributedExecutor for StubExecutor {
        fn id(&self) -> &'static str {
            "stub"
        }

        fn strategy(&self) -> &DistributionStrategy {
            &self.strategy
        }

        async fn train(&self, request: TrainRequest) -> DetectionResult<TrainOutcome> {
            self.train_calls.lock().unwrap().push(TrainCall {
                replicas: self.strategy.num_replicas_in_sync,
                is_multi_host: self.is_multi_host,
                batch_size: request.train_input_fn.batch_size(),
                total_steps: request.total_steps,
                save_config: request.save_config,
            });
            Ok(TrainOutcome {
                model_dir: request.model_dir.clone(),
                start_step: 0,
                final_step: request.total_steps,
                total_loss: Some(1.0),
                checkpoints: vec![],
                manifest_path: request.model_dir.join("train_manifest.json"),
            })
        }

        async fn evaluate_from_model_dir(&self, _request: EvalRequest) -> DetectionResult<EvalMetrics> {
            Ok(EvalMetrics::from([("AP".to_string(), 0.25), ("AP50".to_string(), 0.5)]))
        }
    }

    fn flags(mode: &str) -> RunFlags {
        RunFlags {
            mode: mode.to_string(),
            model_dir: Some("/tmp/argus-run".to_string()),
            training_file_pattern: Some("/data/train-*.jsonl".to_string()),
            eval_file_pattern: Some("/data/val-*.jsonl".to_string()),
            ..RunFlags::default()
        }
    }

    async fn run_stub(flags: &RunFlags) -> (DetectionResult<RunOutcome>, Vec<TrainCall>) {
        let backend = Arc::new(StubBackend::default());
        let calls = backend.train_calls.clone();
        let result = Runner::new(backend).run(flags).await;
        let calls = calls.lock().unwrap().clone();
        (result, calls)
    }

    #[tokio::test]
    async fn test_no_file_patterns_is_missing_input() {
        for mode in ["train", "eval", "bogus"] {
            let f = RunFlags { training_file_pattern: None, eval_file_pattern: None, ..flags(mode) };
            let (result, calls) = run_stub(&f).await;
            assert!(matches!(result, Err(DetectionError::MissingInput(_))), "mode {mode}");
            assert!(calls.is_empty());
        }
    }

    #[tokio::test]
    async fn test_bogus_mode_is_invalid_mode() {
        let (result, _) = run_stub(&flags("bogus")).await;
        match result {
            Err(DetectionError::InvalidMode(mode)) => assert_eq!(mode, "bogus"),
            other => panic!("expected InvalidMode, got {other:?}"),
        }
        let (result, _) = run_stub(&flags("train_and_eval")).await;
        assert!(matches!(result, Err(DetectionError::InvalidMode(_))));
    }

    #[tokio::test]
    async fn test_mode_without_its_pattern_is_missing_input() {
        let f = RunFlags { training_file_pattern: None, ..flags("train") };
        assert!(matches!(run_stub(&f).await.0, Err(DetectionError::MissingInput(_))));

        let f = RunFlags { eval_file_pattern: None, ..flags("eval") };
        assert!(matches!(run_stub(&f).await.0, Err(DetectionError::MissingInput(_))));
    }

    #[tokio::test]
    async fn test_multi_host_rescales_train_batch() {
        let mut f = flags("train");
        f.strategy_type = "tpu".to_string();
        f.strategy_config = StrategyConfig {
            tpu: Some("grpc://10.0.0.2:8470".to_string()),
            tpu_cores: 16,
            ..StrategyConfig::default()
        };
        let (result, calls) = run_stub(&f).await;
        assert!(matches!(result, Ok(RunOutcome::Train(_))));
        assert_eq!(
            calls,
            vec![TrainCall { replicas: 16, is_multi_host: true, batch_size: 4, total_steps: 22_500, save_config: true }]
        );
    }

    #[tokio::test]
    async fn test_single_host_keeps_global_batch() {
        let mut f = flags("train");
        f.strategy_type = "mirrored".to_string();
        f.strategy_config.num_gpus = 8;
        let (_, calls) = run_stub(&f).await;
        assert_eq!(calls[0].replicas, 8);
        assert!(!calls[0].is_multi_host);
        assert_eq!(calls[0].batch_size, 64);
    }

    #[tokio::test]
    async fn test_eval_returns_executor_metrics() {
        let (result, calls) = run_stub(&flags("eval")).await;
        let Ok(RunOutcome::Eval(metrics)) = result else { panic!("expected eval outcome") };
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["AP"], 0.25);
        assert_eq!(metrics["AP50"], 0.5);
        assert!(calls.is_empty());
    }

    #[test]
    fn test_unknown_override_key_fails_before_validation() {
        // No model_dir either, so validation would also fail if it ran.
        let f = RunFlags {
            model_dir: None,
            params_override: Some("train.not_a_key=3".to_string()),
            ..flags("train")
        };
        assert!(matches!(
            build_params(&f),
            Err(DetectionError::ConfigOverride(ParamsError::UnknownKey { .. }))
        ));

        let f = RunFlags { model_dir: None, ..flags("train") };
        assert!(matches!(build_params(&f), Err(DetectionError::Validation(_))));
    }

    #[test]
    fn test_flags_are_injected_and_params_locked() {
        let mut f = flags("train");
        f.params_override = Some("train.batch_size=32,eval.eval_samples=10".to_string());
        f.strategy_type = "mirrored".to_string();
        f.strategy_config.num_gpus = 2;
        let params = build_params(&f).unwrap();

        assert_eq!(params.config().train.batch_size, 32);
        assert_eq!(params.config().strategy_type, "mirrored");
        assert_eq!(params.config().strategy_config.num_gpus, 2);
        assert_eq!(params.config().model_dir(), "/tmp/argus-run");

        let mut dict = params.dict().clone();
        assert!(matches!(
            dict.override_params(&json!({"train": {"batch_size": 1}}), false),
            Err(ParamsError::Locked)
        ));
    }

    #[test]
    fn test_config_file_overrides_then_flags_win() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("run.yaml");
        std::fs::write(&path, "model_dir: /from/file\ntrain:\n  train_file_pattern: /file/train-*.jsonl\n").unwrap();

        let f = RunFlags {
            config_file: Some(path.to_str().unwrap().to_string()),
            model_dir: None,
            training_file_pattern: None,
            eval_file_pattern: None,
            ..flags("train")
        };
        let params = build_params(&f).unwrap();
        assert_eq!(params.config().model_dir(), "/from/file");
        let inputs = build_input_fns(&f, &params).unwrap();
        assert_eq!(inputs.train.unwrap().file_pattern(), "/file/train-*.jsonl");
        assert!(inputs.eval.is_none());

        let f = RunFlags { model_dir: Some("/from/flag".into()), ..f };
        assert_eq!(build_params(&f).unwrap().config().model_dir(), "/from/flag");
    }
}
