use argus_params::ParamsError;
use thiserror::Error;

pub type DetectionResult<T> = std::result::Result<T, DetectionError>;

#[derive(Debug, Error)]
pub enum DetectionError {
    /// A strict override could not be applied.
    #[error("config override error: {0}")]
    ConfigOverride(#[source] ParamsError),

    #[error("invalid parameters: {0}")]
    Validation(String),

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("Mode not found: {0}.")]
    InvalidMode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("input error: {0}")]
    Input(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("timed out waiting for a checkpoint to evaluate")]
    EvalTimeout,

    #[error(transparent)]
    Params(#[from] ParamsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
