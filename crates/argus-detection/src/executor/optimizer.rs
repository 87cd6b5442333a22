use crate::configs::params::{LearningRateParams, OptimizerParams};
use crate::error::{DetectionError, DetectionResult};
use crate::modeling::{Gradients, VariableFilter, Variables};
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq)]
pub enum LearningRateSchedule {
    /// Linear warmup, then piecewise constant levels.
    Step {
        warmup_learning_rate: f64,
        warmup_steps: u64,
        init_learning_rate: f64,
        levels: Vec<(u64, f64)>,
    },
    /// Linear warmup, then cosine decay to zero at `total_steps`.
    Cosine { warmup_learning_rate: f64, warmup_steps: u64, init_learning_rate: f64, total_steps: u64 },
}

impl LearningRateSchedule {
    pub fn from_params(params: &LearningRateParams, total_steps: u64) -> DetectionResult<Self> {
        match params.schedule.as_str() {
            "step" => Ok(Self::Step {
                warmup_learning_rate: params.warmup_learning_rate,
                warmup_steps: params.warmup_steps,
                init_learning_rate: params.init_learning_rate,
                levels: params.learning_rate_steps.iter().copied().zip(params.learning_rate_levels.iter().copied()).collect(),
            }),
            "cosine" => Ok(Self::Cosine {
                warmup_learning_rate: params.warmup_learning_rate,
                warmup_steps: params.warmup_steps,
                init_learning_rate: params.init_learning_rate,
                total_steps,
            }),
            other => Err(DetectionError::Config(format!("unknown learning rate schedule `{other}`"))),
        }
    }

    #[must_use]
    pub fn learning_rate(&self, step: u64) -> f64 {
        let (warmup_lr, warmup_steps, init_lr) = match self {
            Self::Step { warmup_learning_rate, warmup_steps, init_learning_rate, .. }
            | Self::Cosine { warmup_learning_rate, warmup_steps, init_learning_rate, .. } => {
                (*warmup_learning_rate, *warmup_steps, *init_learning_rate)
            }
        };
        if step < warmup_steps {
            return warmup_lr + (init_lr - warmup_lr) * step as f64 / warmup_steps as f64;
        }
        match self {
            Self::Step { levels, .. } => levels
                .iter()
                .rev()
                .find(|(boundary, _)| step >= *boundary)
                .map_or(init_lr, |(_, lr)| *lr),
            Self::Cosine { total_steps, .. } => {
                let span = total_steps.saturating_sub(warmup_steps).max(1) as f64;
                let progress = ((step - warmup_steps) as f64 / span).min(1.0);
                init_lr * 0.5 * (1.0 + (PI * progress).cos())
            }
        }
    }
}

/// SGD with momentum and L2 decay on kernels.
#[derive(Debug, Clone)]
pub struct MomentumOptimizer {
    momentum: f64,
    l2_weight_decay: f64,
    slots: Gradients,
}

impl MomentumOptimizer {
    pub fn from_params(params: &OptimizerParams, l2_weight_decay: f64) -> DetectionResult<Self> {
        let momentum = match params.optimizer_type.as_str() {
            "momentum" => params.momentum,
            "sgd" => 0.0,
            other => return Err(DetectionError::Config(format!("unknown optimizer `{other}`"))),
        };
        Ok(Self { momentum, l2_weight_decay, slots: Gradients::new() })
    }

    #[must_use]
    pub fn slots(&self) -> &Gradients {
        &self.slots
    }

    pub fn restore_slots(&mut self, slots: Gradients) {
        self.slots = slots;
    }

    /// Apply one update; returns the number of variables changed.
    pub fn apply(
        &mut self,
        variables: &mut Variables,
        grads: &Gradients,
        learning_rate: f64,
        trainable: &VariableFilter,
    ) -> usize {
        let mut updated = 0;
        for (name, var) in variables.iter_mut() {
            if !trainable(name) {
                continue;
            }
            let Some(grad) = grads.get(name) else { continue };
            let decay = if name.ends_with("kernel") { self.l2_weight_decay } else { 0.0 };
            let slot = self.slots.entry(name.clone()).or_insert_with(|| vec![0.0; var.values.len()]);
            if slot.len() != var.values.len() {
                slot.clear();
                slot.resize(var.values.len(), 0.0);
            }
            for ((w, g), v) in var.values.iter_mut().zip(grad).zip(slot.iter_mut()) {
                let g = f64::from(*g) + decay * f64::from(*w);
                let next = self.momentum * f64::from(*v) + g;
                *v = next as f32;
                *w -= (learning_rate * next) as f32;
            }
            updated += 1;
        }
        updated
    }
}
