//! Task head for fine-tuning.
//!
//! The head maps every position's vocabulary logits `[seq_len, token_size]`
//! to class logits `[seq_len, num_classes]`. Labels are therefore given per
//! position; greedy decoding reads the class at the last position.

use rand::Rng;

use crate::layers::{Linear, LinearCache};
use crate::params::{Gradients, Parameterized};
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct Classifier {
    pub linear: Linear,
}

impl Classifier {
    pub fn new<R: Rng>(token_size: usize, num_classes: usize, rng: &mut R) -> Self {
        Self {
            linear: Linear::new(token_size, num_classes, rng),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.linear.out_features()
    }

    pub fn forward(&self, decoder_output: &Tensor) -> (Tensor, LinearCache) {
        self.linear.forward(decoder_output)
    }

    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &LinearCache,
        sink: &mut Gradients,
        prefix: &str,
    ) -> Tensor {
        self.linear.backward(grad_out, cache).record(sink, prefix)
    }

    /// Mean over positions, `[seq_len, dim] -> [1, dim]`. Feeding the pooled
    /// row through [`forward`](Self::forward) gives one label per sequence.
    pub fn pool_mean(decoder_output: &Tensor) -> Tensor {
        decoder_output.mean_rows()
    }
}

impl Parameterized for Classifier {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.linear.visit_params(prefix, out);
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.linear.visit_params_mut(prefix, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_per_position_and_pooled_logits() {
        let head = Classifier::new(6, 3, &mut StdRng::seed_from_u64(0));
        let x = Tensor::new((0..24).map(|i| i as f32 * 0.1).collect(), vec![4, 6]);

        let (logits, _) = head.forward(&x);
        assert_eq!(logits.shape, vec![4, 3]);

        let pooled = Classifier::pool_mean(&x);
        assert_eq!(pooled.shape, vec![1, 6]);
        assert!((pooled.data[0] - 0.9).abs() < 1e-5);
        assert_eq!(head.forward(&pooled).0.shape, vec![1, 3]);
    }

    #[test]
    fn test_parameter_names() {
        let head = Classifier::new(6, 3, &mut StdRng::seed_from_u64(0));
        let mut names = Vec::new();
        head.visit_params("classifier", &mut names);
        let names: Vec<_> = names.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["classifier.weight", "classifier.bias"]);
        assert_eq!(head.num_classes(), 3);
    }
}
