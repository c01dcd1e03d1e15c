//! Linear Layer (Fully Connected)
//!
//! Affine transformation `y = x @ W + b`.
//!
//! ```text
//! Input:  x [seq_len, in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]
//! Output: y [seq_len, out_features]
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```

use rand::Rng;
use rand_distr::StandardNormal;

use crate::params::{join, Gradients, Parameterized};
use crate::tensor::Tensor;

/// Standard deviation used for every weight matrix at initialization.
pub const INIT_STD: f32 = 0.02;

/// Draw `size` values from `N(0, std²)`.
pub fn normal_init<R: Rng>(size: usize, std: f32, rng: &mut R) -> Vec<f32> {
    (0..size)
        .map(|_| {
            let z: f32 = rng.sample(StandardNormal);
            z * std
        })
        .collect()
}

/// Fully connected layer with weight `[in, out]` and bias `[out]`.
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
}

impl Linear {
    /// Weights from `N(0, 0.02²)`, bias zero.
    pub fn new<R: Rng>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            weight: Tensor::new(
                normal_init(in_features * out_features, INIT_STD, rng),
                vec![in_features, out_features],
            ),
            bias: Tensor::zeros(vec![out_features]),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    /// Computes `y = x @ W + b` and caches `x` for the backward pass.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = x.matmul(&self.weight).add(&self.bias);
        (y, LinearCache { x: x.clone() })
    }

    /// Parameter and input gradients; see the module docs for the formulas.
    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        LinearGradients {
            weight: cache.x.transpose().matmul(grad_out),
            bias: grad_out.sum_rows(),
            x: grad_out.matmul(&self.weight.transpose()),
        }
    }
}

impl Parameterized for Linear {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((join(prefix, "weight"), &self.weight));
        out.push((join(prefix, "bias"), &self.bias));
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        out.push((join(prefix, "weight"), &mut self.weight));
        out.push((join(prefix, "bias"), &mut self.bias));
    }
}

/// Cache for linear layer backward pass
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients for linear layer
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Tensor,
    /// Gradient to pass to previous layer
    pub x: Tensor,
}

impl LinearGradients {
    /// Move the parameter gradients into `sink` and hand back the input gradient.
    pub fn record(self, sink: &mut Gradients, prefix: &str) -> Tensor {
        sink.record(join(prefix, "weight"), self.weight);
        sink.record(join(prefix, "bias"), self.bias);
        self.x
    }
}
