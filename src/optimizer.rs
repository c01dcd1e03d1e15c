//! Adam / AdamW Optimizer
//!
//! For each parameter θ with gradient g, at that parameter's step t:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # decoupled weight decay (weight matrices only)
//! m = β₁ * m + (1 - β₁) * g
//! v = β₂ * v + (1 - β₂) * g²
//! m_hat = m / (1 - β₁^t)
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! With `λ = 0` (the default) this is plain Adam.
//!
//! ## Topology
//!
//! Moments are allocated for every named parameter of the model at
//! construction, so the optimizer state is tied one-to-one to the parameter
//! set. A step only touches parameters that received a gradient; frozen
//! parameters keep both their values and their moments, and their step
//! counters do not advance. Restoring state recorded against a different
//! set of names or shapes fails instead of loading partially.
//!
//! ## Selective Weight Decay
//!
//! Decay applies to 2D weight matrices outside the embedding table. Biases
//! and layer norm scale/shift are never decayed.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::TrainerConfig;
use crate::error::{GptError, Result};
use crate::params::{Gradients, ParamGroup, Parameterized};
use crate::tensor::Tensor;

/// Update element count above which the update runs in parallel.
const PARALLEL_UPDATE_LEN: usize = 1000;

/// Adam hyper-parameters, stored alongside the moments in checkpoints.
///
/// | Field           | Default | Role                                   |
/// |-----------------|---------|----------------------------------------|
/// | `learning_rate` | 6e-4    | step size α                            |
/// | `beta1`         | 0.9     | decay of the first moment (momentum)   |
/// | `beta2`         | 0.999   | decay of the second moment (scale)     |
/// | `epsilon`       | 1e-8    | keeps the division finite when v ≈ 0   |
/// | `weight_decay`  | 0.0     | decoupled decay λ, 0 means plain Adam  |
///
/// Defaults come from [`TrainerConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamHyperParams {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
}

impl From<&TrainerConfig> for AdamHyperParams {
    fn from(config: &TrainerConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
            weight_decay: config.weight_decay,
        }
    }
}

/// First and second moment estimates of one parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct Moments {
    /// Running mean of the gradient
    pub m: Tensor,
    /// Running mean of the squared gradient
    pub v: Tensor,
    /// Updates applied to this parameter so far
    pub step: u64,
}

/// Serializable snapshot of the optimizer.
///
/// Written into checkpoints so that a resumed run continues with the same
/// momentum and bias-correction step counts instead of restarting them.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerState {
    pub hyper: AdamHyperParams,
    pub moments: BTreeMap<String, Moments>,
}

/// AdamW optimizer with one set of moments per named parameter.
///
/// # Example
///
/// ```rust,no_run
/// # use gpt_transfer::{AdamHyperParams, AdamW, GPTModel, ModelConfig, TrainerConfig};
/// # fn main() -> gpt_transfer::Result<()> {
/// let mut model = GPTModel::new(&ModelConfig::tiny(100))?;
/// let mut optimizer = AdamW::new(&model, AdamHyperParams::from(&TrainerConfig::default()));
/// # let grads = gpt_transfer::Gradients::new();
/// optimizer.step(&mut model, &grads)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct AdamW {
    pub hyper: AdamHyperParams,
    moments: BTreeMap<String, Moments>,
}

impl AdamW {
    /// Zero moments for every parameter of `model`.
    pub fn new<M: Parameterized + ?Sized>(model: &M, hyper: AdamHyperParams) -> Self {
        let moments = model
            .named_parameters()
            .into_iter()
            .map(|(name, p)| {
                (
                    name,
                    Moments {
                        m: Tensor::zeros(p.shape.clone()),
                        v: Tensor::zeros(p.shape.clone()),
                        step: 0,
                    },
                )
            })
            .collect();
        Self { hyper, moments }
    }

    /// Moments of the parameter called `name`, if the model has one.
    pub fn moments(&self, name: &str) -> Option<&Moments> {
        self.moments.get(name)
    }

    /// Apply one update to every parameter that has a gradient in `grads`.
    pub fn step<M: Parameterized + ?Sized>(&mut self, model: &mut M, grads: &Gradients) -> Result<()> {
        if let Some(unknown) = grads.names().find(|n| !self.moments.contains_key(*n)) {
            return Err(GptError::UnexpectedParameter(unknown.to_string()));
        }

        let hyper = self.hyper;
        for (name, param) in model.named_parameters_mut() {
            let Some(grad) = grads.get(&name) else {
                continue;
            };
            let state = self
                .moments
                .get_mut(&name)
                .ok_or_else(|| GptError::MissingParameter(name.clone()))?;
            if grad.shape != param.shape || state.m.shape != param.shape {
                return Err(GptError::ShapeMismatch {
                    name,
                    expected: param.shape.clone(),
                    found: grad.shape.clone(),
                });
            }

            let decay = param.shape.len() == 2 && ParamGroup::of(&name) != ParamGroup::Embedding;
            state.step += 1;
            adam_update_param(param, grad, state, &hyper, decay);
        }
        Ok(())
    }

    /// Snapshot of hyper-parameters and all moments, for checkpointing.
    ///
    /// Restore it with [`AdamW::load_state`] on an optimizer built for a
    /// model with the same parameter names and shapes.
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            hyper: self.hyper,
            moments: self.moments.clone(),
        }
    }

    /// Verify that a snapshot covers exactly the parameter names and
    /// shapes this optimizer was built for, without restoring it.
    ///
    /// Trainers call this before touching the model so a rejected
    /// checkpoint leaves both the model and the optimizer as they were.
    pub fn check_state(&self, state: &OptimizerState) -> Result<()> {
        for (name, current) in &self.moments {
            let incoming = state
                .moments
                .get(name)
                .ok_or_else(|| GptError::MissingParameter(format!("optimizer state for {name}")))?;
            for found in [&incoming.m, &incoming.v] {
                if found.shape != current.m.shape {
                    return Err(GptError::ShapeMismatch {
                        name: format!("optimizer state for {name}"),
                        expected: current.m.shape.clone(),
                        found: found.shape.clone(),
                    });
                }
            }
        }
        if let Some(extra) = state
            .moments
            .keys()
            .find(|k| !self.moments.contains_key(*k))
        {
            return Err(GptError::UnexpectedParameter(format!("optimizer state for {extra}")));
        }
        Ok(())
    }

    /// Restore a snapshot taken by [`state`](Self::state). Fails without
    /// changing anything when [`check_state`](Self::check_state) would.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        self.check_state(&state)?;
        self.hyper = state.hyper;
        self.moments = state.moments;
        Ok(())
    }
}

fn adam_update_param(
    param: &mut Tensor,
    grad: &Tensor,
    state: &mut Moments,
    hyper: &AdamHyperParams,
    apply_decay: bool,
) {
    let AdamHyperParams {
        learning_rate: lr,
        beta1,
        beta2,
        epsilon,
        weight_decay,
    } = *hyper;
    let t = state.step as i32;
    let bias_correction1 = 1.0 - beta1.powi(t);
    let bias_correction2 = 1.0 - beta2.powi(t);

    let update = |p: &mut f32, g: f32, m: &mut f32, v: &mut f32| {
        if apply_decay && weight_decay != 0.0 {
            *p *= 1.0 - lr * weight_decay;
        }
        *m = beta1 * *m + (1.0 - beta1) * g;
        *v = beta2 * *v + (1.0 - beta2) * g * g;
        let m_hat = *m / bias_correction1;
        let v_hat = *v / bias_correction2;
        *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
    };

    let Moments { m, v, .. } = state;
    if param.numel() > PARALLEL_UPDATE_LEN {
        param
            .data
            .par_iter_mut()
            .zip(grad.data.par_iter())
            .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
            .for_each(|((p, &g), (m, v))| update(p, g, m, v));
    } else {
        for (((p, &g), m), v) in param
            .data
            .iter_mut()
            .zip(&grad.data)
            .zip(m.data.iter_mut())
            .zip(v.data.iter_mut())
        {
            update(p, g, m, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn hyper() -> AdamHyperParams {
        AdamHyperParams::from(&TrainerConfig::default())
    }

    fn layer() -> Linear {
        Linear::new(2, 2, &mut StdRng::seed_from_u64(9))
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut model = layer();
        let before = model.weight.clone();
        let mut opt = AdamW::new(&model, hyper());

        let mut grads = Gradients::new();
        grads.record("weight".into(), Tensor::new(vec![1.0, -1.0, 0.5, 0.0], vec![2, 2]));
        opt.step(&mut model, &grads).unwrap();

        // bias-corrected first step is lr * sign(g)
        let lr = hyper().learning_rate;
        assert!((before.data[0] - model.weight.data[0] - lr).abs() < 1e-6);
        assert!((model.weight.data[1] - before.data[1] - lr).abs() < 1e-6);
        assert_eq!(model.weight.data[3], before.data[3]);
        assert_eq!(opt.moments("weight").unwrap().step, 1);
        assert_eq!(opt.moments("bias").unwrap().step, 0);
    }

    #[test]
    fn test_parameters_without_gradients_are_untouched() {
        let mut model = layer();
        let bias_before = model.bias.clone();
        let mut opt = AdamW::new(&model, hyper());
        let mut grads = Gradients::new();
        grads.record("weight".into(), Tensor::ones(vec![2, 2]));
        opt.step(&mut model, &grads).unwrap();
        assert_eq!(model.bias, bias_before);
    }

    #[test]
    fn test_state_restore_requires_same_topology() {
        let model = layer();
        let opt = AdamW::new(&model, hyper());
        let mut other = AdamW::new(&model, hyper());
        other.load_state(opt.state()).unwrap();

        let bigger = Linear::new(3, 2, &mut StdRng::seed_from_u64(1));
        let mut mismatched = AdamW::new(&bigger, hyper());
        assert!(matches!(
            mismatched.load_state(opt.state()),
            Err(GptError::ShapeMismatch { .. })
        ));

        let mut partial = opt.state();
        partial.moments.remove("bias");
        assert!(matches!(
            other.load_state(partial),
            Err(GptError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_unknown_gradient_is_an_error() {
        let mut model = layer();
        let mut opt = AdamW::new(&model, hyper());
        let mut grads = Gradients::new();
        grads.record("ghost".into(), Tensor::ones(vec![1]));
        assert!(opt.step(&mut model, &grads).is_err());
    }
}
