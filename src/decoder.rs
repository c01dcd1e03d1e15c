//! Decoder stack.
//!
//! ```text
//! embedded [seq, dim]
//!   + sinusoidal positions
//!   → dropout
//!   → block × n
//!   → final layer norm
//!   → linear (dim → token_size)      the output projection
//!   = logits [seq, token_size]
//! ```
//!
//! Positions are encoded with fixed sines and cosines, so the decoder has no
//! maximum sequence length and no positional parameters.

use rand::Rng;

use crate::config::ModelConfig;
use crate::layers::{
    BlockCache, Dropout, DropoutCache, LayerNorm, LayerNormCache, Linear, LinearCache,
    TransformerBlock,
};
use crate::params::{join, Gradients, ParamGroup, Parameterized, TrainableSet};
use crate::tensor::Tensor;

const POSITION_BASE: f32 = 10_000.0;

/// `[seq_len, dim]` sinusoidal table: even columns sine, odd columns cosine.
pub fn sinusoidal_positions(seq_len: usize, dim: usize) -> Tensor {
    let mut table = vec![0.0; seq_len * dim];
    for pos in 0..seq_len {
        for i in 0..dim {
            let two_i = (i / 2 * 2) as f32;
            let angle = pos as f32 / POSITION_BASE.powf(two_i / dim as f32);
            table[pos * dim + i] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }
    Tensor::new(table, vec![seq_len, dim])
}

#[derive(Clone, Debug)]
pub struct Decoder {
    pub blocks: Vec<TransformerBlock>,
    pub ln_final: LayerNorm,
    /// Output projection to vocabulary logits
    pub linear: Linear,
    pub dropout: Dropout,
}

impl Decoder {
    pub fn new<R: Rng>(config: &ModelConfig, rng: &mut R) -> Self {
        let layout = config.block_config();
        Self {
            blocks: (0..config.n)
                .map(|_| TransformerBlock::new(&layout, rng))
                .collect(),
            ln_final: LayerNorm::new(config.embedding_dim, config.eps),
            linear: Linear::new(config.embedding_dim, config.token_size, rng),
            dropout: Dropout::new(config.dropout_rate),
        }
    }

    /// # Arguments
    ///
    /// * `x` - Embedded sequence [seq_len, dim]
    /// * `mask` - Causal mask [seq_len, seq_len]
    /// * `training` - enables dropout
    pub fn forward(&self, x: &Tensor, mask: &Tensor, training: bool) -> (Tensor, DecoderCache) {
        let dim = x.shape[1];
        let positioned = x.add(&sinusoidal_positions(x.shape[0], dim));
        let (mut h, dropout_cache) = self.dropout.forward(&positioned, training);

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, cache) = block.forward(&h, mask, training);
            block_caches.push(cache);
            h = next;
        }

        let (normed, ln_final_cache) = self.ln_final.forward(&h);
        let (logits, linear_cache) = self.linear.forward(&normed);

        let cache = DecoderCache {
            dropout_cache,
            block_caches,
            ln_final_cache,
            linear_cache,
        };
        (logits, cache)
    }

    /// Backpropagate logits gradients.
    ///
    /// Parameter gradients are recorded under `prefix`. Returns the gradient
    /// w.r.t. the embedded input, or `None` when nothing below the output
    /// projection is trainable and the pass stopped early.
    pub fn backward(
        &self,
        grad_logits: &Tensor,
        cache: &DecoderCache,
        trainable: &TrainableSet,
        sink: &mut Gradients,
        prefix: &str,
    ) -> Option<Tensor> {
        let grad_normed = self
            .linear
            .backward(grad_logits, &cache.linear_cache)
            .record(sink, &join(prefix, "linear"));

        if !trainable.is_trainable(ParamGroup::Decoder)
            && !trainable.is_trainable(ParamGroup::Embedding)
        {
            return None;
        }

        let mut grad = self
            .ln_final
            .backward(&grad_normed, &cache.ln_final_cache)
            .record(sink, &join(prefix, "ln_final"));

        for (i, (block, block_cache)) in self
            .blocks
            .iter()
            .zip(&cache.block_caches)
            .enumerate()
            .rev()
        {
            grad = block.backward(&grad, block_cache, sink, &join(prefix, &format!("blocks.{i}")));
        }

        // positions are constant, so the gradient passes straight through the add
        Some(self.dropout.backward(&grad, &cache.dropout_cache))
    }
}

impl Parameterized for Decoder {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        for (i, block) in self.blocks.iter().enumerate() {
            block.visit_params(&join(prefix, &format!("blocks.{i}")), out);
        }
        self.ln_final.visit_params(&join(prefix, "ln_final"), out);
        self.linear.visit_params(&join(prefix, "linear"), out);
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.visit_params_mut(&join(prefix, &format!("blocks.{i}")), out);
        }
        self.ln_final.visit_params_mut(&join(prefix, "ln_final"), out);
        self.linear.visit_params_mut(&join(prefix, "linear"), out);
    }
}

/// Cache for decoder backward pass
pub struct DecoderCache {
    pub dropout_cache: DropoutCache,
    pub block_caches: Vec<BlockCache>,
    pub ln_final_cache: LayerNormCache,
    pub linear_cache: LinearCache,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sinusoidal_first_rows() {
        let table = sinusoidal_positions(2, 4);
        assert_eq!(table.row(0), &[0.0, 1.0, 0.0, 1.0]);
        assert!((table.data[4] - 1f32.sin()).abs() < 1e-6);
        assert!((table.data[5] - 1f32.cos()).abs() < 1e-6);
    }
}
