//! Multi-Head Causal Self-Attention
//!
//! Each head attends over a `head_dim = dim / n_heads` slice of the
//! projected queries, keys and values:
//!
//! ```text
//! Q, K, V   = x @ W_q, x @ W_k, x @ W_v
//! scores_h  = (Q_h @ K_h^T) / √head_dim
//! weights_h = softmax(masked_fill(scores_h, mask, -1e9))
//! out       = concat_h(weights_h @ V_h) @ W_o
//! ```
//!
//! The mask is supplied by the caller (see [`crate::mask`]); a non-zero
//! entry at `[i, j]` hides key `j` from query `i`. Masked scores become
//! exactly zero after the softmax, so a position's output never depends on
//! masked positions.
//!
//! ## Backward Pass
//!
//! Per head, in reverse:
//! 1. `grad_V_h = weights_h^T @ grad_out_h`
//! 2. `grad_weights_h = grad_out_h @ V_h^T` (then through attention dropout)
//! 3. Softmax backward per row: `grad_s = w * (grad_w - sum(grad_w * w))`
//! 4. `grad_Q_h = grad_s @ K_h / √d`, `grad_K_h = grad_s^T @ Q_h / √d`
//!
//! Head gradients are concatenated and pushed through the input projections.

use rand::Rng;
use rayon::prelude::*;

use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache};
use crate::params::{join, Gradients, Parameterized};
use crate::tensor::Tensor;

/// Score written into masked positions before the softmax.
const MASK_FILL: f32 = -1e9;

/// Causal multi-head self-attention with four `[dim, dim]` projections.
///
/// Parameters are named `q_proj`, `k_proj`, `v_proj` and `out_proj`, each
/// with a `weight` and a `bias`. Heads are computed in parallel.
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
    pub attn_dropout: Dropout,
    pub resid_dropout: Dropout,
    pub n_heads: usize,
}

impl MultiHeadAttention {
    /// `dim` must be divisible by `n_heads`; checked by config validation.
    pub fn new<R: Rng>(dim: usize, n_heads: usize, dropout_rate: f32, rng: &mut R) -> Self {
        Self {
            q_proj: Linear::new(dim, dim, rng),
            k_proj: Linear::new(dim, dim, rng),
            v_proj: Linear::new(dim, dim, rng),
            out_proj: Linear::new(dim, dim, rng),
            attn_dropout: Dropout::new(dropout_rate),
            resid_dropout: Dropout::new(dropout_rate),
            n_heads,
        }
    }

    fn head_dim(&self) -> usize {
        self.q_proj.out_features() / self.n_heads
    }

    /// # Arguments
    ///
    /// * `x` - Input tensor [seq_len, dim]
    /// * `mask` - [seq_len, seq_len], non-zero = hidden
    /// * `training` - enables both dropouts
    pub fn forward(&self, x: &Tensor, mask: &Tensor, training: bool) -> (Tensor, AttentionCache) {
        let (q, q_cache) = self.q_proj.forward(x);
        let (k, k_cache) = self.k_proj.forward(x);
        let (v, v_cache) = self.v_proj.forward(x);

        let head_dim = self.head_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();

        let heads: Vec<(Tensor, HeadCache)> = (0..self.n_heads)
            .into_par_iter()
            .map(|h| {
                let (start, end) = (h * head_dim, (h + 1) * head_dim);
                let q_h = q.slice_cols(start, end);
                let k_h = k.slice_cols(start, end);
                let v_h = v.slice_cols(start, end);

                let scores = q_h.matmul(&k_h.transpose()).mul_scalar(scale);
                let weights = scores.masked_fill(mask, MASK_FILL).softmax_rows();
                let (dropped, dropout_cache) = self.attn_dropout.forward(&weights, training);
                let out_h = dropped.matmul(&v_h);

                (
                    out_h,
                    HeadCache {
                        q: q_h,
                        k: k_h,
                        v: v_h,
                        weights,
                        dropped,
                        dropout_cache,
                    },
                )
            })
            .collect();

        let (outs, head_caches): (Vec<Tensor>, Vec<HeadCache>) = heads.into_iter().unzip();
        let attn_out = Tensor::concat_cols(&outs);

        let (y_proj, out_cache) = self.out_proj.forward(&attn_out);
        let (y, resid_dropout_cache) = self.resid_dropout.forward(&y_proj, training);

        let cache = AttentionCache {
            q_cache,
            k_cache,
            v_cache,
            heads: head_caches,
            out_cache,
            resid_dropout_cache,
        };
        (y, cache)
    }

    /// Records parameter gradients under `prefix` and returns the input gradient.
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &AttentionCache,
        sink: &mut Gradients,
        prefix: &str,
    ) -> Tensor {
        let head_dim = self.head_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();

        let grad_y_proj = self
            .resid_dropout
            .backward(grad_out, &cache.resid_dropout_cache);
        let grad_attn_out = self
            .out_proj
            .backward(&grad_y_proj, &cache.out_cache)
            .record(sink, &join(prefix, "out_proj"));

        let head_grads: Vec<(Tensor, Tensor, Tensor)> = cache
            .heads
            .par_iter()
            .enumerate()
            .map(|(h, head)| {
                let grad_out_h = grad_attn_out.slice_cols(h * head_dim, (h + 1) * head_dim);

                let grad_v = head.dropped.transpose().matmul(&grad_out_h);
                let grad_dropped = grad_out_h.matmul(&head.v.transpose());
                let grad_weights = self
                    .attn_dropout
                    .backward(&grad_dropped, &head.dropout_cache);

                let grad_scores = softmax_backward(&head.weights, &grad_weights);

                let grad_q = grad_scores.matmul(&head.k).mul_scalar(scale);
                let grad_k = grad_scores.transpose().matmul(&head.q).mul_scalar(scale);
                (grad_q, grad_k, grad_v)
            })
            .collect();

        let mut grad_q = Vec::with_capacity(self.n_heads);
        let mut grad_k = Vec::with_capacity(self.n_heads);
        let mut grad_v = Vec::with_capacity(self.n_heads);
        for (q, k, v) in head_grads {
            grad_q.push(q);
            grad_k.push(k);
            grad_v.push(v);
        }

        let mut grad_x = self
            .q_proj
            .backward(&Tensor::concat_cols(&grad_q), &cache.q_cache)
            .record(sink, &join(prefix, "q_proj"));
        grad_x.add_assign(
            &self
                .k_proj
                .backward(&Tensor::concat_cols(&grad_k), &cache.k_cache)
                .record(sink, &join(prefix, "k_proj")),
        );
        grad_x.add_assign(
            &self
                .v_proj
                .backward(&Tensor::concat_cols(&grad_v), &cache.v_cache)
                .record(sink, &join(prefix, "v_proj")),
        );
        grad_x
    }
}

/// Row-wise softmax gradient: `grad_s = w * (grad_w - sum(grad_w * w))`.
fn softmax_backward(weights: &Tensor, grad_weights: &Tensor) -> Tensor {
    let cols = weights.shape[1];
    let mut grad_scores = vec![0.0; weights.numel()];
    grad_scores
        .par_chunks_mut(cols)
        .enumerate()
        .for_each(|(i, out)| {
            let w = weights.row(i);
            let g = grad_weights.row(i);
            let dot: f32 = w.iter().zip(g).map(|(a, b)| a * b).sum();
            for j in 0..cols {
                out[j] = w[j] * (g[j] - dot);
            }
        });
    Tensor::new(grad_scores, weights.shape.clone())
}

impl Parameterized for MultiHeadAttention {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.q_proj.visit_params(&join(prefix, "q_proj"), out);
        self.k_proj.visit_params(&join(prefix, "k_proj"), out);
        self.v_proj.visit_params(&join(prefix, "v_proj"), out);
        self.out_proj.visit_params(&join(prefix, "out_proj"), out);
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.q_proj.visit_params_mut(&join(prefix, "q_proj"), out);
        self.k_proj.visit_params_mut(&join(prefix, "k_proj"), out);
        self.v_proj.visit_params_mut(&join(prefix, "v_proj"), out);
        self.out_proj.visit_params_mut(&join(prefix, "out_proj"), out);
    }
}

/// Per-head values kept for the backward pass.
pub struct HeadCache {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Softmax output before dropout
    pub weights: Tensor,
    /// Weights actually applied to V
    pub dropped: Tensor,
    pub dropout_cache: DropoutCache,
}

/// Cache for attention backward pass
pub struct AttentionCache {
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    pub heads: Vec<HeadCache>,
    pub out_cache: LinearCache,
    pub resid_dropout_cache: DropoutCache,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::causal_mask;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_future_positions_do_not_leak() {
        let mut rng = StdRng::seed_from_u64(11);
        let attn = MultiHeadAttention::new(8, 2, 0.0, &mut rng);
        let mask = causal_mask(4);

        let mut x = Tensor::new((0..32).map(|i| (i as f32 * 0.37).sin()).collect(), vec![4, 8]);
        let (before, _) = attn.forward(&x, &mask, false);
        for v in &mut x.data[3 * 8..] {
            *v += 5.0;
        }
        let (after, _) = attn.forward(&x, &mask, false);

        assert_eq!(before.data[..3 * 8], after.data[..3 * 8]);
        assert_ne!(before.row(3), after.row(3));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let attn = MultiHeadAttention::new(4, 2, 0.0, &mut rng);
        let mask = causal_mask(3);
        let x = Tensor::new((0..12).map(|i| (i as f32 * 0.91).cos()).collect(), vec![3, 4]);
        let upstream = Tensor::new((0..12).map(|i| (i as f32 * 0.53).sin()).collect(), vec![3, 4]);

        let loss = |input: &Tensor| -> f32 {
            let (y, _) = attn.forward(input, &mask, false);
            y.data.iter().zip(&upstream.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = attn.forward(&x, &mask, false);
        let mut sink = Gradients::new();
        let grad_x = attn.backward(&upstream, &cache, &mut sink, "attn");
        assert!(sink.get("attn.q_proj.weight").is_some());
        assert!(sink.get("attn.out_proj.bias").is_some());

        let eps = 1e-2;
        for i in [0, 5, 11] {
            let mut plus = x.clone();
            plus.data[i] += eps;
            let mut minus = x.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!(
                (numeric - grad_x.data[i]).abs() < 1e-3,
                "index {i}: numeric {numeric} analytic {}",
                grad_x.data[i]
            );
        }
    }
}
