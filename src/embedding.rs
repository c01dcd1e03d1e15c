//! Token embedding table.

use rand::Rng;

use crate::error::{GptError, Result};
use crate::layers::linear::{normal_init, INIT_STD};
use crate::params::{join, Gradients, Parameterized};
use crate::tensor::Tensor;

/// Lookup table `[token_size, embedding_dim]`.
#[derive(Clone, Debug)]
pub struct Embedding {
    pub weight: Tensor,
}

impl Embedding {
    pub fn new<R: Rng>(token_size: usize, embedding_dim: usize, rng: &mut R) -> Self {
        Self {
            weight: Tensor::new(
                normal_init(token_size * embedding_dim, INIT_STD, rng),
                vec![token_size, embedding_dim],
            ),
        }
    }

    pub fn token_size(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn dim(&self) -> usize {
        self.weight.shape[1]
    }

    /// Reject ids outside the vocabulary before they reach the lookup.
    pub fn check_ids(&self, ids: &[usize]) -> Result<()> {
        match ids.iter().find(|&&id| id >= self.token_size()) {
            Some(&id) => Err(GptError::invalid_input(format!(
                "token id {id} is out of range for a vocabulary of {}",
                self.token_size()
            ))),
            None => Ok(()),
        }
    }

    /// `[seq_len] -> [seq_len, embedding_dim]`. Ids must already be checked.
    pub fn forward(&self, ids: &[usize]) -> Tensor {
        let dim = self.dim();
        let mut out = Vec::with_capacity(ids.len() * dim);
        for &id in ids {
            out.extend_from_slice(self.weight.row(id));
        }
        Tensor::new(out, vec![ids.len(), dim])
    }

    /// Scatter-add the output gradient back into the rows that were looked up.
    pub fn backward(&self, grad_out: &Tensor, ids: &[usize], sink: &mut Gradients, prefix: &str) {
        let dim = self.dim();
        let mut grad = Tensor::zeros(self.weight.shape.clone());
        for (pos, &id) in ids.iter().enumerate() {
            let row = &mut grad.data[id * dim..(id + 1) * dim];
            for (g, &v) in row.iter_mut().zip(grad_out.row(pos)) {
                *g += v;
            }
        }
        sink.record(join(prefix, "weight"), grad);
    }
}

impl Parameterized for Embedding {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        out.push((join(prefix, "weight"), &self.weight));
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        out.push((join(prefix, "weight"), &mut self.weight));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_lookup_and_scatter() {
        let mut rng = StdRng::seed_from_u64(1);
        let emb = Embedding::new(5, 3, &mut rng);
        let out = emb.forward(&[2, 2, 4]);
        assert_eq!(out.row(0), emb.weight.row(2));
        assert_eq!(out.row(2), emb.weight.row(4));

        let mut sink = Gradients::new();
        emb.backward(&Tensor::ones(vec![3, 3]), &[2, 2, 4], &mut sink, "embedding");
        let grad = sink.get("embedding.weight").unwrap();
        assert_eq!(grad.row(2), &[2.0, 2.0, 2.0]);
        assert_eq!(grad.row(4), &[1.0, 1.0, 1.0]);
        assert_eq!(grad.row(0), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_out_of_range_ids_are_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let emb = Embedding::new(5, 3, &mut rng);
        assert!(emb.check_ids(&[0, 4]).is_ok());
        assert!(emb.check_ids(&[5]).is_err());
    }
}
