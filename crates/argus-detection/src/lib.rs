//! Argus Detection
//!
//! Train and evaluate object-detection models from a layered parameter set:
//! - Default parameters per model and the locked run config (`configs`)
//! - Distribution strategies and the executor seam (`DistributedExecutor`)
//! - JSONL input pipelines with sharding and batching (`InputFn`)
//! - Reference RetinaNet and ShapeMask heads, losses and COCO-style metrics
//! - Model directories, checkpoints, summaries and run manifests
//! - One-shot orchestration of a train or eval run (`Runner`)

pub mod artifacts;
pub mod checkpoint;
pub mod configs;
pub mod error;
pub mod executor;
pub mod input;
pub mod layout;
pub mod mode;
pub mod modeling;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod strategy;

pub use artifacts::{ArtifactKind, RunArtifact, TrainManifest, TrainSummary};
pub use checkpoint::Checkpoint;
pub use configs::{config_generator, DetectionConfig, LockedParams, SUPPORTED_MODELS};
pub use error::{DetectionError, DetectionResult};
pub use executor::{
    DistributedExecutor, EvalRequest, ExecutorBackend, ExecutorBuilder, ExecutorParts, LocalExecutorBackend,
    TrainOutcome, TrainRequest,
};
pub use input::{DetectionExample, DetectionRecord, InputContext, InputFn};
pub use layout::ModelDirLayout;
pub use mode::ModeKey;
pub use modeling::{model_generator, EvalMetrics, ModelBuilder};
pub use progress::{ProgressEvent, ProgressSink, RecordingProgressSink, TracingProgressSink};
pub use registry::{latest_checkpoint, list_checkpoints, resolve_checkpoint, CheckpointEntry};
pub use runner::{build_input_fns, build_params, InputFns, RunFlags, RunOutcome, Runner};
pub use strategy::{DistributionStrategy, StrategyConfig, StrategyType};
