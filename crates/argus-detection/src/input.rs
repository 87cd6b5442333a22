//! Input pipelines over JSON-lines detection records.
//!
//! Each line of an input file is one [`DetectionRecord`]. An [`InputFn`]
//! expands its file pattern, shards and parses the records and yields
//! batches of [`DetectionExample`]s.

use crate::configs::params::ParserParams;
use crate::configs::DetectionConfig;
use crate::error::{DetectionError, DetectionResult};
use crate::mode::ModeKey;
use crate::strategy::DistributionStrategy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One annotated image as stored on disk. Boxes are `[ymin, xmin, ymax, xmax]` in pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub image_id: u64,
    pub height: u32,
    pub width: u32,
    #[serde(default)]
    pub features: Vec<f32>,
    #[serde(default)]
    pub objects: Vec<ObjectRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub bbox: [f32; 4],
    pub class_id: u32,
    #[serde(default)]
    pub is_crowd: bool,
    /// Row-major `mask_size x mask_size` binary grid relative to `bbox`.
    #[serde(default)]
    pub mask: Option<Vec<u8>>,
}

/// A parsed ground-truth object with its box normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
    pub bbox: [f32; 4],
    pub class_id: u32,
    pub is_crowd: bool,
    pub mask: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionExample {
    pub image_id: u64,
    pub features: Vec<f32>,
    pub objects: Vec<GroundTruth>,
}

pub type Batch = Vec<DetectionExample>;

/// Which shard of the input the current host reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputContext {
    pub num_input_pipelines: usize,
    pub input_pipeline_id: usize,
}

impl InputContext {
    #[must_use]
    pub fn single() -> Self {
        Self { num_input_pipelines: 1, input_pipeline_id: 0 }
    }

    #[must_use]
    pub fn for_strategy(strategy: &DistributionStrategy) -> Self {
        Self {
            num_input_pipelines: strategy.num_input_pipelines.max(1) as usize,
            input_pipeline_id: strategy.input_pipeline_id as usize,
        }
    }
}

/// A deferred input pipeline bound to a file pattern, mode and batch size.
#[derive(Debug, Clone)]
pub struct InputFn {
    file_pattern: String,
    mode: ModeKey,
    batch_size: usize,
    num_examples: Option<usize>,
    parser: ParserParams,
    feature_dim: usize,
    num_classes: u32,
    mask_size: Option<usize>,
    seed: u64,
}

impl InputFn {
    /// `num_examples` caps the number of examples read; zero or negative means no cap.
    #[must_use]
    pub fn new(
        file_pattern: &str,
        params: &DetectionConfig,
        mode: ModeKey,
        batch_size: u32,
        num_examples: Option<i64>,
    ) -> Self {
        Self {
            file_pattern: file_pattern.to_string(),
            mode,
            batch_size: batch_size.max(1) as usize,
            num_examples: num_examples.and_then(|n| usize::try_from(n).ok()).filter(|n| *n > 0),
            parser: params.parser.clone(),
            feature_dim: params.architecture.feature_dim,
            num_classes: params.architecture.num_classes,
            mask_size: params.mask_size(),
            seed: params.train.seed,
        }
    }

    /// A copy bound to a different batch size.
    #[must_use]
    pub fn with_batch_size(&self, batch_size: u32) -> Self {
        Self { batch_size: batch_size.max(1) as usize, ..self.clone() }
    }

    #[must_use]
    pub fn file_pattern(&self) -> &str {
        &self.file_pattern
    }

    #[must_use]
    pub fn mode(&self) -> ModeKey {
        self.mode
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn num_examples(&self) -> Option<usize> {
        self.num_examples
    }

    /// Expand the comma-separated glob pattern into a sorted, de-duplicated file list.
    pub fn matched_files(&self) -> DetectionResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for pattern in self.file_pattern.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let paths = glob::glob(pattern)
                .map_err(|e| DetectionError::Input(format!("invalid file pattern `{pattern}`: {e}")))?;
            for path in paths {
                let path = path.map_err(|e| DetectionError::Input(e.to_string()))?;
                if path.is_file() {
                    files.push(path);
                }
            }
        }
        files.sort();
        files.dedup();

        if files.is_empty() {
            return Err(DetectionError::Input(format!("no files match `{}`", self.file_pattern)));
        }
        Ok(files)
    }

    /// Materialize the pipeline for one input shard.
    pub fn call(&self, ctx: &InputContext) -> DetectionResult<InputBatches> {
        let files = self.matched_files()?;
        let mut examples = Vec::new();
        let mut index = 0usize;

        'files: for file in &files {
            for record in read_records(file)? {
                let shard = index % ctx.num_input_pipelines.max(1);
                index += 1;
                if shard != ctx.input_pipeline_id {
                    continue;
                }
                examples.push(self.parse(record)?);
                if self.num_examples.is_some_and(|n| examples.len() >= n) {
                    break 'files;
                }
            }
        }

        if examples.is_empty() {
            return Err(DetectionError::Input(format!(
                "`{}` has no examples for input pipeline {} of {}",
                self.file_pattern, ctx.input_pipeline_id, ctx.num_input_pipelines
            )));
        }

        tracing::debug!(
            pattern = %self.file_pattern,
            mode = %self.mode,
            files = files.len(),
            examples = examples.len(),
            batch_size = self.batch_size,
            "input pipeline ready"
        );

        let training = self.mode.is_training();
        let seed = self.seed.wrapping_add(ctx.input_pipeline_id as u64);
        Ok(InputBatches::new(examples, self.batch_size, training, training && self.parser.aug_rand_hflip, seed))
    }

    fn parse(&self, record: DetectionRecord) -> DetectionResult<DetectionExample> {
        if record.height == 0 || record.width == 0 {
            return Err(DetectionError::Input(format!(
                "image {} has zero height or width",
                record.image_id
            )));
        }
        let h = record.height as f32;
        let w = record.width as f32;

        let mut objects = Vec::with_capacity(record.objects.len());
        for obj in record.objects {
            if obj.is_crowd && self.mode.is_training() && self.parser.skip_crowd_during_training {
                continue;
            }
            if obj.class_id >= self.num_classes {
                return Err(DetectionError::Input(format!(
                    "image {}: class_id {} out of range for {} classes",
                    record.image_id, obj.class_id, self.num_classes
                )));
            }
            let [ymin, xmin, ymax, xmax] = obj.bbox;
            let bbox = [
                (ymin / h).clamp(0.0, 1.0),
                (xmin / w).clamp(0.0, 1.0),
                (ymax / h).clamp(0.0, 1.0),
                (xmax / w).clamp(0.0, 1.0),
            ];
            if bbox[2] <= bbox[0] || bbox[3] <= bbox[1] {
                continue;
            }
            let mask = match (obj.mask, self.mask_size) {
                (Some(mask), Some(size)) => {
                    if mask.len() != size * size {
                        return Err(DetectionError::Input(format!(
                            "image {}: mask has {} cells, expected {}",
                            record.image_id,
                            mask.len(),
                            size * size
                        )));
                    }
                    Some(mask.into_iter().map(|v| if v > 0 { 1.0 } else { 0.0 }).collect())
                }
                _ => None,
            };
            objects.push(GroundTruth { bbox, class_id: obj.class_id, is_crowd: obj.is_crowd, mask });
            if objects.len() >= self.parser.max_num_instances {
                break;
            }
        }

        let mut features = record.features;
        features.resize(self.feature_dim, 0.0);

        Ok(DetectionExample { image_id: record.image_id, features, objects })
    }
}

fn read_records(path: &Path) -> DetectionResult<Vec<DetectionRecord>> {
    let contents = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: DetectionRecord = serde_json::from_str(line).map_err(|e| {
            DetectionError::Input(format!("{}:{}: {}", path.display(), idx + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Batches yielded by an [`InputFn`].
///
/// Training pipelines reshuffle each epoch, repeat forever and always yield
/// full batches. Evaluation pipelines make one ordered pass and keep the final
/// partial batch.
#[derive(Debug)]
pub struct InputBatches {
    examples: Vec<DetectionExample>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    repeat: bool,
    hflip: bool,
    rng: StdRng,
}

impl InputBatches {
    fn new(examples: Vec<DetectionExample>, batch_size: usize, repeat: bool, hflip: bool, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..examples.len()).collect();
        if repeat {
            order.shuffle(&mut rng);
        }
        Self { examples, order, cursor: 0, batch_size, repeat, hflip, rng }
    }

    #[must_use]
    pub fn num_examples(&self) -> usize {
        self.examples.len()
    }
}

impl Iterator for InputBatches {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if !self.repeat && self.cursor >= self.order.len() {
            return None;
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            if self.cursor >= self.order.len() {
                if !self.repeat {
                    break;
                }
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            let mut example = self.examples[self.order[self.cursor]].clone();
            self.cursor += 1;
            if self.hflip && self.rng.gen_bool(0.5) {
                flip_horizontally(&mut example);
            }
            batch.push(example);
        }
        Some(batch)
    }
}

fn flip_horizontally(example: &mut DetectionExample) {
    for obj in &mut example.objects {
        let [ymin, xmin, ymax, xmax] = obj.bbox;
        obj.bbox = [ymin, 1.0 - xmax, ymax, 1.0 - xmin];
        if let Some(mask) = obj.mask.as_mut() {
            let side = (mask.len() as f64).sqrt() as usize;
            for row in mask.chunks_mut(side.max(1)) {
                row.reverse();
            }
        }
    }
}
