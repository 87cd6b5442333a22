use serde::{Deserialize, Serialize};
use std::fmt;

/// What a model or input pipeline is being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKey {
    Train,
    /// Inference that still carries ground truth, used for evaluation.
    PredictWithGt,
}

impl ModeKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::PredictWithGt => "predict_with_gt",
        }
    }

    #[must_use]
    pub fn is_training(self) -> bool {
        self == Self::Train
    }
}

impl fmt::Display for ModeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
