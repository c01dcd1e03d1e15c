//! GPT backbone: token embedding followed by the decoder stack.
//!
//! [`GPTModel`] is shared by both training regimes. Pretraining reads its
//! vocabulary logits directly; fine-tuning feeds them into a
//! [`Classifier`](crate::classifier::Classifier).
//!
//! The layers work one sequence at a time. Batched entry points run the
//! sequences of a batch in parallel and stack the results.

use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::ModelConfig;
use crate::decoder::{Decoder, DecoderCache};
use crate::embedding::Embedding;
use crate::error::{GptError, Result};
use crate::mask::uniform_length;
use crate::params::{join, Gradients, ParamGroup, Parameterized, TrainableSet};
use crate::tensor::Tensor;
use crate::train::SequenceModel;

/// Base language model.
#[derive(Clone, Debug)]
pub struct GPTModel {
    pub embedding_layer: Embedding,
    pub decoder: Decoder,
    config: ModelConfig,
}

impl GPTModel {
    /// Build a freshly initialized model; weights are drawn from a
    /// generator seeded with `config.seed`.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            embedding_layer: Embedding::new(config.token_size, config.embedding_dim, &mut rng),
            decoder: Decoder::new(config, &mut rng),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Logits `[batch, seq_len, token_size]` for a batch of equal-length sequences.
    pub fn forward(&self, token_ids: &[Vec<usize>], mask: &Tensor, training: bool) -> Result<Tensor> {
        uniform_length(token_ids)?;
        let logits = token_ids
            .par_iter()
            .map(|ids| self.forward_sequence(ids, mask, training).map(|(l, _)| l))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&logits))
    }

    /// Logits `[seq_len, token_size]` for one sequence, plus the backward cache.
    pub fn forward_sequence(
        &self,
        ids: &[usize],
        mask: &Tensor,
        training: bool,
    ) -> Result<(Tensor, GPTModelCache)> {
        if ids.is_empty() {
            return Err(GptError::invalid_input("empty sequence"));
        }
        if mask.shape != [ids.len(), ids.len()] {
            return Err(GptError::ShapeMismatch {
                name: "mask".into(),
                expected: vec![ids.len(), ids.len()],
                found: mask.shape.clone(),
            });
        }
        self.embedding_layer.check_ids(ids)?;

        let embedded = self.embedding_layer.forward(ids);
        let (logits, decoder) = self.decoder.forward(&embedded, mask, training);
        Ok((
            logits,
            GPTModelCache {
                ids: ids.to_vec(),
                decoder,
            },
        ))
    }

    /// Record gradients for one sequence under `prefix`. Frozen groups are
    /// still traversed when a trainable group sits below them, but callers
    /// drop their gradients with [`Gradients::retain_trainable`].
    pub fn backward_sequence(
        &self,
        grad_logits: &Tensor,
        cache: &GPTModelCache,
        trainable: &TrainableSet,
        sink: &mut Gradients,
        prefix: &str,
    ) {
        let grad_embedded = self.decoder.backward(
            grad_logits,
            &cache.decoder,
            trainable,
            sink,
            &join(prefix, "decoder"),
        );
        if let Some(grad) = grad_embedded {
            if trainable.is_trainable(ParamGroup::Embedding) {
                self.embedding_layer
                    .backward(&grad, &cache.ids, sink, &join(prefix, "embedding"));
            }
        }
    }
}

impl Parameterized for GPTModel {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.embedding_layer.visit_params(&join(prefix, "embedding"), out);
        self.decoder.visit_params(&join(prefix, "decoder"), out);
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.embedding_layer
            .visit_params_mut(&join(prefix, "embedding"), out);
        self.decoder.visit_params_mut(&join(prefix, "decoder"), out);
    }
}

impl SequenceModel for GPTModel {
    type Cache = GPTModelCache;

    fn forward_train(&self, ids: &[usize], mask: &Tensor, training: bool) -> Result<(Tensor, GPTModelCache)> {
        self.forward_sequence(ids, mask, training)
    }

    fn backward_train(&self, grad_logits: &Tensor, cache: &GPTModelCache, trainable: &TrainableSet) -> Gradients {
        let mut sink = Gradients::new();
        self.backward_sequence(grad_logits, cache, trainable, &mut sink, "");
        sink
    }
}

/// Cache for backbone backward pass
pub struct GPTModelCache {
    pub ids: Vec<usize>,
    pub decoder: DecoderCache,
}

/// Parameter counts per group together with their trainable tags.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelSummary {
    pub groups: Vec<GroupSummary>,
    pub total: usize,
    pub trainable: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupSummary {
    pub group: ParamGroup,
    pub tensors: usize,
    pub parameters: usize,
    pub trainable: bool,
}

impl ModelSummary {
    pub fn of<M: Parameterized + ?Sized>(model: &M, trainable: &TrainableSet) -> Self {
        let mut groups: Vec<GroupSummary> = ParamGroup::ALL
            .iter()
            .map(|&group| GroupSummary {
                group,
                tensors: 0,
                parameters: 0,
                trainable: trainable.is_trainable(group),
            })
            .collect();

        for (name, tensor) in model.named_parameters() {
            let group = ParamGroup::of(&name);
            if let Some(entry) = groups.iter_mut().find(|g| g.group == group) {
                entry.tensors += 1;
                entry.parameters += tensor.numel();
            }
        }
        groups.retain(|g| g.tensors > 0);

        let total = groups.iter().map(|g| g.parameters).sum();
        let trainable = groups
            .iter()
            .filter(|g| g.trainable)
            .map(|g| g.parameters)
            .sum();
        Self {
            groups,
            total,
            trainable,
        }
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<20} {:>8} {:>14} {:>10}", "group", "tensors", "parameters", "trainable")?;
        for g in &self.groups {
            writeln!(
                f,
                "{:<20} {:>8} {:>14} {:>10}",
                g.group.to_string(),
                g.tensors,
                g.parameters,
                if g.trainable { "yes" } else { "no" }
            )?;
        }
        write!(f, "total {} parameters, {} trainable", self.total, self.trainable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{causal_mask, generate_mask};

    fn tiny() -> GPTModel {
        GPTModel::new(&ModelConfig::tiny(20)).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let model = tiny();
        let batch = vec![vec![1, 2, 3, 4, 5], vec![5, 4, 3, 2, 1]];
        let (_, mask) = generate_mask(&batch).unwrap();
        let logits = model.forward(&batch, &mask, false).unwrap();
        assert_eq!(logits.shape, vec![2, 5, 20]);
    }

    #[test]
    fn test_same_seed_same_weights() {
        assert_eq!(tiny().state_dict(), tiny().state_dict());
    }

    #[test]
    fn test_causality_of_logits() {
        let model = tiny();
        let original = vec![3, 7, 1, 9, 4, 12];
        let mask = causal_mask(original.len());
        let (base, _) = model.forward_sequence(&original, &mask, false).unwrap();

        for i in 0..original.len() - 1 {
            let mut perturbed = original.clone();
            for t in perturbed.iter_mut().skip(i + 1) {
                *t = (*t + 5) % 20;
            }
            let (changed, _) = model.forward_sequence(&perturbed, &mask, false).unwrap();
            for pos in 0..=i {
                assert_eq!(base.row(pos), changed.row(pos), "position {pos} saw the future");
            }
        }
    }

    #[test]
    fn test_rejects_out_of_vocabulary_and_bad_mask() {
        let model = tiny();
        assert!(model.forward_sequence(&[1, 25], &causal_mask(2), false).is_err());
        assert!(model.forward_sequence(&[1, 2], &causal_mask(3), false).is_err());
    }

    #[test]
    fn test_transfer_policy_stops_at_output_projection() {
        let model = tiny();
        let ids = [1, 2, 3];
        let (logits, cache) = model.forward_sequence(&ids, &causal_mask(3), true).unwrap();
        let mut sink = Gradients::new();
        model.backward_sequence(
            &Tensor::ones(logits.shape.clone()),
            &cache,
            &TrainableSet::transfer(),
            &mut sink,
            "",
        );
        let names: Vec<&str> = sink.names().collect();
        assert_eq!(names, vec!["decoder.linear.bias", "decoder.linear.weight"]);
    }

    #[test]
    fn test_summary_counts_groups() {
        let model = tiny();
        let summary = ModelSummary::of(&model, &TrainableSet::transfer());
        assert_eq!(summary.total, model.num_parameters());
        let projection = summary
            .groups
            .iter()
            .find(|g| g.group == ParamGroup::OutputProjection)
            .unwrap();
        assert_eq!(projection.parameters, 16 * 20 + 20);
        assert_eq!(summary.trainable, projection.parameters);
    }
}
