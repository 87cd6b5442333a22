use crate::error::{DetectionError, DetectionResult};
use crate::layout::ModelDirLayout;
use crate::modeling::model::{Gradients, Variables};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Model variables and optimizer state at a global step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: u64,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub variables: Variables,
    /// Momentum accumulators keyed by variable name.
    #[serde(default)]
    pub optimizer_slots: Gradients,
}

/// Contents of `<model_dir>/checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub latest: String,
    pub step: u64,
}

impl Checkpoint {
    pub fn read(path: &Path) -> DetectionResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| DetectionError::Checkpoint(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DetectionError::Checkpoint(format!("failed to parse {}: {e}", path.display())))
    }

    /// Write `ckpt-<step>.json` and point the index at it.
    pub fn save(&self, layout: &ModelDirLayout) -> DetectionResult<PathBuf> {
        let path = layout.checkpoint_path(self.step);
        write_json(&path, self)?;
        let index = CheckpointIndex { latest: ModelDirLayout::checkpoint_file_name(self.step), step: self.step };
        write_json(layout.checkpoint_index_path(), &index)?;
        tracing::debug!(path = %path.display(), step = self.step, "saved checkpoint");
        Ok(path)
    }
}

pub(crate) fn write_json<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> DetectionResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}
