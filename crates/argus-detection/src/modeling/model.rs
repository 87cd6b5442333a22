//! Linear anchor head over per-image feature vectors.

use super::anchors::Anchors;
use crate::configs::DetectionConfig;
use crate::error::{DetectionError, DetectionResult};
use crate::mode::ModeKey;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CLASS_KERNEL: &str = "head/class/kernel";
pub const CLASS_BIAS: &str = "head/class/bias";
pub const BOX_KERNEL: &str = "head/box/kernel";
pub const BOX_BIAS: &str = "head/box/bias";
pub const MASK_PRIOR: &str = "shapemask/prior";

const PRIOR_PROBABILITY: f64 = 0.01;
const INIT_STDDEV: f32 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl Variable {
    #[must_use]
    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len: usize = shape.iter().product();
        Self { shape, values: vec![value; len] }
    }

    fn random(shape: Vec<usize>, rng: &mut StdRng) -> Self {
        let len: usize = shape.iter().product();
        let values = (0..len).map(|_| rng.gen_range(-INIT_STDDEV..INIT_STDDEV)).collect();
        Self { shape, values }
    }
}

pub type Variables = BTreeMap<String, Variable>;
pub type Gradients = BTreeMap<String, Vec<f32>>;

/// Raw head outputs for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOutputs {
    /// `[num_anchors * num_classes]`, anchor-major.
    pub class_logits: Vec<f32>,
    /// `[num_anchors * 4]`.
    pub box_deltas: Vec<f32>,
    /// `[num_classes * mask_size^2]` prior logits, shapemask only.
    pub mask_logits: Option<Vec<f32>>,
}

/// Gradients of the loss with respect to [`HeadOutputs`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeadGradients {
    pub class_logits: Vec<f32>,
    pub box_deltas: Vec<f32>,
    pub mask_logits: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct DetectionModel {
    mode: ModeKey,
    anchors: Arc<Anchors>,
    num_classes: usize,
    feature_dim: usize,
    mask_size: Option<usize>,
    variables: Variables,
}

impl DetectionModel {
    #[must_use]
    pub fn new(params: &DetectionConfig, anchors: Arc<Anchors>, mode: ModeKey) -> Self {
        let num_classes = params.architecture.num_classes as usize;
        let feature_dim = params.architecture.feature_dim;
        let mask_size = params.mask_size();
        let num_anchors = anchors.len();

        let mut rng = StdRng::seed_from_u64(params.train.seed);
        let bias_init = (-((1.0 - PRIOR_PROBABILITY) / PRIOR_PROBABILITY).ln()) as f32;

        let mut variables = Variables::new();
        variables.insert(CLASS_KERNEL.into(), Variable::random(vec![feature_dim, num_anchors * num_classes], &mut rng));
        variables.insert(CLASS_BIAS.into(), Variable::filled(vec![num_anchors * num_classes], bias_init));
        variables.insert(BOX_KERNEL.into(), Variable::random(vec![feature_dim, num_anchors * 4], &mut rng));
        variables.insert(BOX_BIAS.into(), Variable::filled(vec![num_anchors * 4], 0.0));
        if let Some(size) = mask_size {
            variables.insert(MASK_PRIOR.into(), Variable::filled(vec![num_classes, size * size], 0.0));
        }

        Self { mode, anchors, num_classes, feature_dim, mask_size, variables }
    }

    #[must_use]
    pub fn mode(&self) -> ModeKey {
        self.mode
    }

    #[must_use]
    pub fn anchors(&self) -> &Anchors {
        &self.anchors
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[must_use]
    pub fn mask_size(&self) -> Option<usize> {
        self.mask_size
    }

    #[must_use]
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    /// Replace every variable, requiring identical names and shapes.
    pub fn load_variables(&mut self, variables: Variables) -> DetectionResult<()> {
        for (name, current) in &self.variables {
            match variables.get(name) {
                Some(v) if v.shape == current.shape => {}
                Some(v) => {
                    return Err(DetectionError::Checkpoint(format!(
                        "variable `{name}` has shape {:?}, model expects {:?}",
                        v.shape, current.shape
                    )));
                }
                None => return Err(DetectionError::Checkpoint(format!("checkpoint is missing `{name}`"))),
            }
        }
        self.variables = variables;
        Ok(())
    }

    fn var(&self, name: &str) -> DetectionResult<&Variable> {
        self.variables
            .get(name)
            .ok_or_else(|| DetectionError::Executor(format!("model has no variable `{name}`")))
    }

    pub fn forward(&self, features: &[f32]) -> DetectionResult<HeadOutputs> {
        if features.len() != self.feature_dim {
            return Err(DetectionError::Executor(format!(
                "expected {} features, got {}",
                self.feature_dim,
                features.len()
            )));
        }
        let class_logits = linear(features, self.var(CLASS_KERNEL)?, self.var(CLASS_BIAS)?);
        let box_deltas = linear(features, self.var(BOX_KERNEL)?, self.var(BOX_BIAS)?);
        let mask_logits = match self.mask_size {
            Some(_) => Some(self.var(MASK_PRIOR)?.values.clone()),
            None => None,
        };
        Ok(HeadOutputs { class_logits, box_deltas, mask_logits })
    }

    /// Accumulate variable gradients for one image into `grads`.
    pub fn backward(&self, features: &[f32], head: &HeadGradients, grads: &mut Gradients) {
        accumulate_linear(features, &head.class_logits, CLASS_KERNEL, CLASS_BIAS, grads);
        accumulate_linear(features, &head.box_deltas, BOX_KERNEL, BOX_BIAS, grads);
        if let Some(mask) = &head.mask_logits {
            add_into(grads.entry(MASK_PRIOR.to_string()).or_default(), mask);
        }
    }
}

fn linear(x: &[f32], kernel: &Variable, bias: &Variable) -> Vec<f32> {
    let out = bias.values.len();
    let mut y = bias.values.clone();
    for (k, xk) in x.iter().enumerate() {
        if *xk == 0.0 {
            continue;
        }
        let row = &kernel.values[k * out..(k + 1) * out];
        for (yj, w) in y.iter_mut().zip(row) {
            *yj += xk * w;
        }
    }
    y
}

fn accumulate_linear(x: &[f32], dy: &[f32], kernel: &str, bias: &str, grads: &mut Gradients) {
    let out = dy.len();
    let dk = grads.entry(kernel.to_string()).or_default();
    if dk.is_empty() {
        dk.resize(x.len() * out, 0.0);
    }
    for (k, xk) in x.iter().enumerate() {
        if *xk == 0.0 {
            continue;
        }
        for (g, d) in dk[k * out..(k + 1) * out].iter_mut().zip(dy) {
            *g += xk * d;
        }
    }
    add_into(grads.entry(bias.to_string()).or_default(), dy);
}

pub(crate) fn add_into(acc: &mut Vec<f32>, values: &[f32]) {
    if acc.is_empty() {
        acc.extend_from_slice(values);
        return;
    }
    for (a, v) in acc.iter_mut().zip(values) {
        *a += v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::retinanet::retinanet_config;
    use crate::configs::shapemask::shapemask_config;

    fn small(mut config: DetectionConfig) -> DetectionConfig {
        config.architecture.num_classes = 2;
        config.architecture.feature_dim = 3;
        config.parser.output_size = [64, 64];
        config.anchor.max_level = 5;
        config
    }

    #[test]
    fn test_variable_names_and_shapes() {
        let config = small(retinanet_config());
        let anchors = Arc::new(Anchors::generate(&config.anchor, config.parser.output_size));
        let model = DetectionModel::new(&config, anchors.clone(), ModeKey::Train);
        let names: Vec<&str> = model.variables().keys().map(String::as_str).collect();
        assert_eq!(names, vec![BOX_BIAS, BOX_KERNEL, CLASS_BIAS, CLASS_KERNEL]);
        assert_eq!(model.variables()[CLASS_KERNEL].shape, vec![3, anchors.len() * 2]);

        let bias = model.variables()[CLASS_BIAS].values[0];
        assert!((bias - (-(99f32).ln())).abs() < 1e-4);

        let config = small(shapemask_config());
        let model = DetectionModel::new(&config, anchors, ModeKey::Train);
        assert_eq!(model.variables()[MASK_PRIOR].shape, vec![2, 256]);
    }

    #[test]
    fn test_forward_backward_linear() {
        let config = small(retinanet_config());
        let anchors = Arc::new(Anchors::generate(&config.anchor, config.parser.output_size));
        let model = DetectionModel::new(&config, anchors.clone(), ModeKey::Train);

        let zeros = model.forward(&[0.0, 0.0, 0.0]).unwrap();
        assert_eq!(zeros.class_logits, model.variables()[CLASS_BIAS].values);
        assert!(zeros.mask_logits.is_none());
        assert!(model.forward(&[1.0]).is_err());

        let head = HeadGradients {
            class_logits: vec![1.0; anchors.len() * 2],
            box_deltas: vec![0.5; anchors.len() * 4],
            mask_logits: None,
        };
        let mut grads = Gradients::new();
        model.backward(&[2.0, 0.0, 1.0], &head, &mut grads);
        let out = anchors.len() * 2;
        assert_eq!(grads[CLASS_KERNEL][0], 2.0);
        assert_eq!(grads[CLASS_KERNEL][out], 0.0);
        assert_eq!(grads[CLASS_KERNEL][2 * out], 1.0);
        assert_eq!(grads[BOX_BIAS][0], 0.5);
    }

    #[test]
    fn test_load_variables_checks_shapes() {
        let config = small(retinanet_config());
        let anchors = Arc::new(Anchors::generate(&config.anchor, config.parser.output_size));
        let mut model = DetectionModel::new(&config, anchors, ModeKey::Train);
        let mut vars = model.variables().clone();
        vars.insert(BOX_BIAS.into(), Variable::filled(vec![1], 0.0));
        assert!(model.load_variables(vars).is_err());
    }
}
