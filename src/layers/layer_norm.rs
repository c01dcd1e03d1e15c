//! Layer Normalization
//!
//! Normalizes each row to zero mean and unit variance, then applies a
//! learnable scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! mean   = sum(x) / N
//! var    = sum((x - mean)²) / N
//! x_norm = (x - mean) / √(var + ε)
//! y      = γ * x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ      = sum(grad_y * x_norm)
//! grad_β      = sum(grad_y)
//! grad_x_norm = grad_y * γ
//! grad_x      = (grad_x_norm - E[grad_x_norm] - x_norm * E[grad_x_norm * x_norm]) / √(var + ε)
//! ```
//!
//! The two expectation terms account for every element's influence on the
//! row mean and the row variance.

use rayon::prelude::*;

use crate::params::{join, Gradients, Parameterized};
use crate::tensor::Tensor;

/// Layer normalization over the feature dimension.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    /// Scale parameter [dim]
    pub gamma: Tensor,
    /// Shift parameter [dim]
    pub beta: Tensor,
    pub eps: f32,
}

impl LayerNorm {
    /// gamma = 1, beta = 0.
    pub fn new(dim: usize, eps: f32) -> Self {
        Self {
            gamma: Tensor::ones(vec![dim]),
            beta: Tensor::zeros(vec![dim]),
            eps,
        }
    }

    /// # Arguments
    ///
    /// * `x` - Input tensor [seq_len, dim]
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let dim = self.gamma.numel();
        let rows = x.numel() / dim;

        let stats: Vec<(f32, f32)> = x
            .data
            .par_chunks(dim)
            .map(|row| {
                let mean = row.iter().sum::<f32>() / dim as f32;
                let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
                (mean, (var + self.eps).sqrt())
            })
            .collect();

        let mut x_norm = vec![0.0; x.numel()];
        x_norm
            .par_chunks_mut(dim)
            .zip(x.data.par_chunks(dim))
            .zip(stats.par_iter())
            .for_each(|((out, row), &(mean, std))| {
                for (o, &v) in out.iter_mut().zip(row) {
                    *o = (v - mean) / std;
                }
            });
        let x_norm = Tensor::new(x_norm, x.shape.clone());
        let y = x_norm.mul(&self.gamma).add(&self.beta);

        let std = Tensor::new(stats.into_iter().map(|(_, s)| s).collect(), vec![rows]);
        (y, LayerNormCache { x_norm, std })
    }

    /// Gradients for gamma, beta and the input, following the formulas above.
    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let dim = self.gamma.numel();
        let rows = grad_out.numel() / dim;

        let mut grad_gamma = vec![0.0; dim];
        let mut grad_beta = vec![0.0; dim];
        for i in 0..rows {
            for j in 0..dim {
                let idx = i * dim + j;
                grad_gamma[j] += grad_out.data[idx] * cache.x_norm.data[idx];
                grad_beta[j] += grad_out.data[idx];
            }
        }

        let grad_x_norm = grad_out.mul(&self.gamma);

        let mut grad_x = vec![0.0; rows * dim];
        grad_x
            .par_chunks_mut(dim)
            .enumerate()
            .for_each(|(i, out)| {
                let g = &grad_x_norm.data[i * dim..(i + 1) * dim];
                let xn = &cache.x_norm.data[i * dim..(i + 1) * dim];
                let std = cache.std.data[i];

                let mean_grad = g.iter().sum::<f32>() / dim as f32;
                let mean_grad_x = g.iter().zip(xn).map(|(a, b)| a * b).sum::<f32>() / dim as f32;

                for j in 0..dim {
                    out[j] = (g[j] - mean_grad - xn[j] * mean_grad_x) / std;
                }
            });

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![dim]),
            beta: Tensor::new(grad_beta, vec![dim]),
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }
}

impl Parameterized for LayerNorm {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((join(prefix, "gamma"), &self.gamma));
        out.push((join(prefix, "beta"), &self.beta));
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        out.push((join(prefix, "gamma"), &mut self.gamma));
        out.push((join(prefix, "beta"), &mut self.beta));
    }
}

/// Cache for layer norm backward pass
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// Per-row √(var + ε)
    pub std: Tensor,
}

/// Gradients for layer norm
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

impl LayerNormGradients {
    pub fn record(self, sink: &mut Gradients, prefix: &str) -> Tensor {
        sink.record(join(prefix, "gamma"), self.gamma);
        sink.record(join(prefix, "beta"), self.beta);
        self.x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_normalizes_rows() {
        let ln = LayerNorm::new(4, 1e-5);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 4.0], vec![2, 4]);
        let (y, _) = ln.forward(&x);
        for r in 0..2 {
            let row = y.row(r);
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let mut ln = LayerNorm::new(3, 1e-5);
        ln.gamma = Tensor::new(vec![0.5, -1.0, 2.0], vec![3]);
        let x = Tensor::new(vec![0.3, -0.7, 1.1], vec![1, 3]);
        let weights = Tensor::new(vec![1.0, 2.0, -1.0], vec![1, 3]);

        // loss = sum(y * weights)
        let loss = |input: &Tensor| -> f32 {
            let (y, _) = ln.forward(input);
            y.data.iter().zip(&weights.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = ln.forward(&x);
        let grads = ln.backward(&weights, &cache);

        let eps = 1e-3;
        for i in 0..3 {
            let mut plus = x.clone();
            plus.data[i] += eps;
            let mut minus = x.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!(
                (numeric - grads.x.data[i]).abs() < 1e-2,
                "index {i}: numeric {numeric} analytic {}",
                grads.x.data[i]
            );
        }
    }
}
