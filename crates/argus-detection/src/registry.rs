use crate::checkpoint::CheckpointIndex;
use crate::error::{DetectionError, DetectionResult};
use crate::layout::{ModelDirLayout, CHECKPOINT_EXTENSION, CHECKPOINT_PREFIX};
use std::path::{Path, PathBuf};

/// A checkpoint file discovered in a model directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub step: u64,
    pub path: PathBuf,
}

fn step_from_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// All `ckpt-<step>.json` files under `model_dir`, sorted by step.
pub fn list_checkpoints(model_dir: &Path) -> DetectionResult<Vec<CheckpointEntry>> {
    let mut out = Vec::new();

    let dir = match std::fs::read_dir(model_dir) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    for entry in dir {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(step) = path.file_name().and_then(|n| n.to_str()).and_then(step_from_file_name) else {
            continue;
        };
        out.push(CheckpointEntry { step, path });
    }

    out.sort_by_key(|c| c.step);
    Ok(out)
}

/// The checkpoint named by the index, falling back to the highest step on disk.
pub fn latest_checkpoint(model_dir: &Path) -> DetectionResult<Option<CheckpointEntry>> {
    let layout = ModelDirLayout::new(model_dir);
    let index_path = layout.checkpoint_index_path();

    if index_path.is_file() {
        let bytes = std::fs::read(&index_path)?;
        match serde_json::from_slice::<CheckpointIndex>(&bytes) {
            Ok(index) => {
                let path = model_dir.join(&index.latest);
                if path.is_file() {
                    return Ok(Some(CheckpointEntry { step: index.step, path }));
                }
                tracing::warn!(latest = %index.latest, "checkpoint index points at a missing file");
            }
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable checkpoint index"),
        }
    }

    Ok(list_checkpoints(model_dir)?.pop())
}

/// Resolve a checkpoint reference that is either a checkpoint file or a model directory.
pub fn resolve_checkpoint(path: &Path) -> DetectionResult<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        return latest_checkpoint(path)?
            .map(|c| c.path)
            .ok_or_else(|| DetectionError::Checkpoint(format!("no checkpoints in {}", path.display())));
    }
    Err(DetectionError::Checkpoint(format!("checkpoint not found: {}", path.display())))
}
