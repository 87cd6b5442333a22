use crate::error::{DetectionError, DetectionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Checkpoint,
    Config,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrainSummary {
    pub final_step: u64,
    pub total_loss: Option<f64>,
    pub cls_loss: Option<f64>,
    pub box_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_loss: Option<f64>,
}

/// Written to `<model_dir>/train_manifest.json` when a training run finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainManifest {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub strategy: String,
    pub num_replicas_in_sync: u32,
    #[serde(default)]
    pub summary: TrainSummary,
    pub artifacts: Vec<RunArtifact>,
}

impl TrainManifest {
    pub fn read(path: &Path) -> DetectionResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn sha256_file(path: &Path) -> DetectionResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> DetectionResult<RunArtifact> {
    if !path.exists() {
        return Err(DetectionError::Executor(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let hash = sha256_file(&path)?;
    Ok(RunArtifact { kind, path, sha256: hash })
}
