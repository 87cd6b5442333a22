use thiserror::Error;

pub type ParamsResult<T> = std::result::Result<T, ParamsError>;

#[derive(Debug, Error)]
pub enum ParamsError {
    /// A strict override referenced a key the base dictionary does not have.
    #[error("unknown parameter `{key}` in strict override")]
    UnknownKey { key: String },

    #[error("parameters are locked and cannot be overridden")]
    Locked,

    #[error("parameter validation failed: {0}")]
    Validation(String),

    /// The override source (inline string or file) could not be interpreted.
    #[error("invalid override source: {0}")]
    Source(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
