use crate::error::DetectionResult;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_PREFIX: &str = "ckpt-";
pub const CHECKPOINT_EXTENSION: &str = "json";

/// Filesystem layout of a model directory.
///
/// ```text
/// <model_dir>/params.yaml
/// <model_dir>/checkpoint
/// <model_dir>/ckpt-<step>.json
/// <model_dir>/summaries/{train,eval}.jsonl
/// <model_dir>/train_manifest.json
/// ```
#[derive(Debug, Clone)]
pub struct ModelDirLayout {
    root: PathBuf,
}

impl ModelDirLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn params_path(&self) -> PathBuf {
        self.root.join("params.yaml")
    }

    /// Index naming the most recent checkpoint.
    #[must_use]
    pub fn checkpoint_index_path(&self) -> PathBuf {
        self.root.join("checkpoint")
    }

    #[must_use]
    pub fn checkpoint_file_name(step: u64) -> String {
        format!("{CHECKPOINT_PREFIX}{step}.{CHECKPOINT_EXTENSION}")
    }

    #[must_use]
    pub fn checkpoint_path(&self, step: u64) -> PathBuf {
        self.root.join(Self::checkpoint_file_name(step))
    }

    #[must_use]
    pub fn summaries_dir(&self) -> PathBuf {
        self.root.join("summaries")
    }

    #[must_use]
    pub fn train_summary_path(&self) -> PathBuf {
        self.summaries_dir().join("train.jsonl")
    }

    #[must_use]
    pub fn eval_summary_path(&self) -> PathBuf {
        self.summaries_dir().join("eval.jsonl")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("train_manifest.json")
    }

    pub fn ensure_dirs(&self) -> DetectionResult<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.summaries_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = ModelDirLayout::new(temp.path());

        assert_eq!(layout.checkpoint_path(500), temp.path().join("ckpt-500.json"));
        assert!(layout.eval_summary_path().ends_with("summaries/eval.jsonl"));

        layout.ensure_dirs().unwrap();
        assert!(layout.summaries_dir().is_dir());
    }
}
