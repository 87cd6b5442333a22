//! Argus CLI - train or evaluate object-detection models
//!
//! Provides the `argus` command: builds the run parameters from defaults,
//! a config file and inline overrides, then trains into or evaluates from
//! a model directory.

use anyhow::Context;
use argus_detection::{RunFlags, RunOutcome, Runner, StrategyConfig};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Argus - object-detection training and evaluation
#[derive(Parser, Debug)]
#[command(name = "argus", author, version, about = "Train or evaluate object-detection models")]
struct Args {
    /// Run mode (train, eval)
    #[arg(long, default_value = "train")]
    mode: String,

    /// Model to run (retinanet, shapemask)
    #[arg(long, default_value = "retinanet")]
    model: String,

    /// Comma-separated glob(s) of JSONL training files
    #[arg(long)]
    training_file_pattern: Option<String>,

    /// Comma-separated glob(s) of JSONL evaluation files
    #[arg(long)]
    eval_file_pattern: Option<String>,

    /// Directory for checkpoints, summaries and the saved config
    #[arg(long, env = "ARGUS_MODEL_DIR")]
    model_dir: Option<String>,

    /// YAML/JSON/TOML file of parameter overrides (strict)
    #[arg(long)]
    config_file: Option<String>,

    /// Inline overrides: `a.b=1,c=x` or a YAML/JSON mapping (strict)
    #[arg(long)]
    params_override: Option<String>,

    /// Distribution strategy (one_device, mirrored, multi_worker_mirrored, tpu)
    #[arg(long, default_value = "one_device", env = "ARGUS_STRATEGY_TYPE")]
    strategy_type: String,

    /// GPUs per host for mirrored strategies
    #[arg(long, default_value_t = 0)]
    num_gpus: u32,

    /// All-reduce algorithm hint
    #[arg(long)]
    all_reduce_alg: Option<String>,

    /// Comma-separated worker `host:port` list
    #[arg(long)]
    worker_hosts: Option<String>,

    /// Index of this host in `--worker-hosts`
    #[arg(long, default_value_t = 0)]
    task_index: u32,

    /// TPU address
    #[arg(long)]
    tpu: Option<String>,

    /// TPU cores in the slice
    #[arg(long, default_value_t = 8)]
    tpu_cores: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn run_flags(&self) -> RunFlags {
        RunFlags {
            mode: self.mode.clone(),
            model: self.model.clone(),
            config_file: self.config_file.clone(),
            params_override: self.params_override.clone(),
            training_file_pattern: self.training_file_pattern.clone(),
            eval_file_pattern: self.eval_file_pattern.clone(),
            model_dir: self.model_dir.clone(),
            strategy_type: self.strategy_type.clone(),
            strategy_config: StrategyConfig {
                num_gpus: self.num_gpus,
                all_reduce_alg: self.all_reduce_alg.clone(),
                worker_hosts: self.worker_hosts.clone(),
                task_index: self.task_index,
                tpu: self.tpu.clone(),
                tpu_cores: self.tpu_cores,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    // Logs go to stderr; stdout carries the outcome.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let flags = args.run_flags();
    let outcome = Runner::default()
        .run(&flags)
        .await
        .with_context(|| format!("{} run with model {} failed", flags.mode, flags.model))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome {
        RunOutcome::Train(train) => {
            println!(
                "Trained {} from step {} to step {} in {}",
                flags.model,
                train.start_step,
                train.final_step,
                train.model_dir.display()
            );
            if let Some(loss) = train.total_loss {
                println!("total_loss: {loss:.6}");
            }
            println!("checkpoints written: {}", train.checkpoints.len());
            println!("manifest: {}", train.manifest_path.display());
        }
        RunOutcome::Eval(metrics) => {
            for (name, value) in &metrics {
                println!("{name}: {value:.6}");
            }
        }
    }
    Ok(())
}
