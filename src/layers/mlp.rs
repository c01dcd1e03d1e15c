//! Position-wise feed-forward sublayer.
//!
//! ```text
//! x → Linear(dim → d_ff) → activation → Linear(d_ff → dim) → dropout → y
//! ```

use rand::Rng;

use super::activation::Activation;
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache};
use crate::params::{join, Gradients, Parameterized};
use crate::tensor::Tensor;

/// Two-layer MLP applied independently to every position.
#[derive(Clone, Debug)]
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
    pub activation: Activation,
    pub resid_dropout: Dropout,
}

impl FeedForward {
    pub fn new<R: Rng>(
        dim: usize,
        d_ff: usize,
        activation: Activation,
        dropout_rate: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            fc1: Linear::new(dim, d_ff, rng),
            fc2: Linear::new(d_ff, dim, rng),
            activation,
            resid_dropout: Dropout::new(dropout_rate),
        }
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> (Tensor, FeedForwardCache) {
        let (h, fc1_cache) = self.fc1.forward(x);
        let h_activated = self.activation.forward(&h);
        let (y_proj, fc2_cache) = self.fc2.forward(&h_activated);
        let (y, resid_dropout_cache) = self.resid_dropout.forward(&y_proj, training);

        let cache = FeedForwardCache {
            fc1_cache,
            h,
            fc2_cache,
            resid_dropout_cache,
        };
        (y, cache)
    }

    /// Records gradients under `{prefix}.fc1` and `{prefix}.fc2`.
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &FeedForwardCache,
        sink: &mut Gradients,
        prefix: &str,
    ) -> Tensor {
        let grad_y_proj = self
            .resid_dropout
            .backward(grad_out, &cache.resid_dropout_cache);
        let grad_activated = self
            .fc2
            .backward(&grad_y_proj, &cache.fc2_cache)
            .record(sink, &join(prefix, "fc2"));
        let grad_h = self.activation.backward(&grad_activated, &cache.h);
        self.fc1
            .backward(&grad_h, &cache.fc1_cache)
            .record(sink, &join(prefix, "fc1"))
    }
}

impl Parameterized for FeedForward {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.fc1.visit_params(&join(prefix, "fc1"), out);
        self.fc2.visit_params(&join(prefix, "fc2"), out);
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.fc1.visit_params_mut(&join(prefix, "fc1"), out);
        self.fc2.visit_params_mut(&join(prefix, "fc2"), out);
    }
}

/// Cache for feed-forward backward pass
pub struct FeedForwardCache {
    pub fc1_cache: LinearCache,
    /// Pre-activation, needed for the activation backward
    pub h: Tensor,
    pub fc2_cache: LinearCache,
    pub resid_dropout_cache: DropoutCache,
}
