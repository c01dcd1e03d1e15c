//! Transformer Block
//!
//! Pre-norm block with two residual branches:
//!
//! ```text
//! x → LayerNorm → Attention → (+) → LayerNorm → FeedForward → (+) → output
//! │                            ↑                              ↑
//! └────────────────────────────┘                              │
//!                              └──────────────────────────────┘
//! ```
//!
//! In the backward pass the gradient at each `(+)` flows both into the
//! sublayer and straight through the skip connection; the two are summed.

use rand::Rng;

use super::activation::Activation;
use super::attention::{AttentionCache, MultiHeadAttention};
use super::layer_norm::{LayerNorm, LayerNormCache};
use super::mlp::{FeedForward, FeedForwardCache};
use crate::params::{join, Gradients, Parameterized};
use crate::tensor::Tensor;

/// Hyper-parameters shared by every block of a decoder.
#[derive(Clone, Copy, Debug)]
pub struct BlockConfig {
    pub dim: usize,
    pub heads: usize,
    pub d_ff: usize,
    pub dropout_rate: f32,
    pub eps: f32,
    pub activation: Activation,
}

/// One pre-norm decoder block: attention then feed-forward, each wrapped in
/// a residual connection.
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ln2: LayerNorm,
    pub mlp: FeedForward,
}

impl TransformerBlock {
    pub fn new<R: Rng>(layout: &BlockConfig, rng: &mut R) -> Self {
        Self {
            ln1: LayerNorm::new(layout.dim, layout.eps),
            attn: MultiHeadAttention::new(layout.dim, layout.heads, layout.dropout_rate, rng),
            ln2: LayerNorm::new(layout.dim, layout.eps),
            mlp: FeedForward::new(layout.dim, layout.d_ff, layout.activation, layout.dropout_rate, rng),
        }
    }

    /// `[seq_len, dim] -> [seq_len, dim]`. The mask is passed through to attention.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, training: bool) -> (Tensor, BlockCache) {
        let (ln1_out, ln1_cache) = self.ln1.forward(x);
        let (attn_out, attn_cache) = self.attn.forward(&ln1_out, mask, training);
        let x_after_attn = x.add(&attn_out);

        let (ln2_out, ln2_cache) = self.ln2.forward(&x_after_attn);
        let (mlp_out, mlp_cache) = self.mlp.forward(&ln2_out, training);
        let y = x_after_attn.add(&mlp_out);

        let cache = BlockCache {
            ln1_cache,
            attn_cache,
            ln2_cache,
            mlp_cache,
        };
        (y, cache)
    }

    /// Records gradients as `{prefix}.ln1.*`, `{prefix}.attn.*`, `{prefix}.ln2.*`
    /// and `{prefix}.mlp.*`, and returns the gradient for the block input.
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &BlockCache,
        sink: &mut Gradients,
        prefix: &str,
    ) -> Tensor {
        // second residual
        let grad_ln2_out = self
            .mlp
            .backward(grad_out, &cache.mlp_cache, sink, &join(prefix, "mlp"));
        let mut grad_x_after_attn = self
            .ln2
            .backward(&grad_ln2_out, &cache.ln2_cache)
            .record(sink, &join(prefix, "ln2"));
        grad_x_after_attn.add_assign(grad_out);

        // first residual
        let grad_ln1_out = self.attn.backward(
            &grad_x_after_attn,
            &cache.attn_cache,
            sink,
            &join(prefix, "attn"),
        );
        let mut grad_x = self
            .ln1
            .backward(&grad_ln1_out, &cache.ln1_cache)
            .record(sink, &join(prefix, "ln1"));
        grad_x.add_assign(&grad_x_after_attn);
        grad_x
    }
}

impl Parameterized for TransformerBlock {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.ln1.visit_params(&join(prefix, "ln1"), out);
        self.attn.visit_params(&join(prefix, "attn"), out);
        self.ln2.visit_params(&join(prefix, "ln2"), out);
        self.mlp.visit_params(&join(prefix, "mlp"), out);
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.ln1.visit_params_mut(&join(prefix, "ln1"), out);
        self.attn.visit_params_mut(&join(prefix, "attn"), out);
        self.ln2.visit_params_mut(&join(prefix, "ln2"), out);
        self.mlp.visit_params_mut(&join(prefix, "mlp"), out);
    }
}

/// Cache for transformer block backward pass
pub struct BlockCache {
    pub ln1_cache: LayerNormCache,
    pub attn_cache: AttentionCache,
    pub ln2_cache: LayerNormCache,
    pub mlp_cache: FeedForwardCache,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::causal_mask;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_block_input_gradient_matches_finite_difference() {
        let layout = BlockConfig {
            dim: 4,
            heads: 2,
            d_ff: 8,
            dropout_rate: 0.0,
            eps: 1e-5,
            activation: Activation::Gelu,
        };
        let mut rng = StdRng::seed_from_u64(5);
        let block = TransformerBlock::new(&layout, &mut rng);
        let mask = causal_mask(3);
        let x = Tensor::new((0..12).map(|i| (i as f32 * 0.77).sin()).collect(), vec![3, 4]);
        let upstream = Tensor::new((0..12).map(|i| 0.1 * i as f32 - 0.5).collect(), vec![3, 4]);

        let loss = |input: &Tensor| -> f32 {
            let (y, _) = block.forward(input, &mask, false);
            y.data.iter().zip(&upstream.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = block.forward(&x, &mask, false);
        let mut sink = Gradients::new();
        let grad_x = block.backward(&upstream, &cache, &mut sink, "b");
        assert_eq!(sink.len(), block.named_parameters().len());

        let eps = 1e-2;
        for i in [0, 6, 11] {
            let mut plus = x.clone();
            plus.data[i] += eps;
            let mut minus = x.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!(
                (numeric - grad_x.data[i]).abs() < 5e-3,
                "index {i}: numeric {numeric} analytic {}",
                grad_x.data[i]
            );
        }
    }
}
