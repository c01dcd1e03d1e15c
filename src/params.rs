//! Named parameters, gradient maps and the trainable/frozen policy.
//!
//! Every layer exposes its tensors under a dotted name such as
//! `decoder.blocks.0.attn.q_proj.weight`. The optimizer, checkpoints and
//! the freeze policy all key off these names, so adding a layer only means
//! implementing [`Parameterized`] for it.
//!
//! ## Groups
//!
//! Names map onto four coarse groups:
//!
//! ```text
//! embedding.*           -> Embedding
//! decoder.linear.*      -> OutputProjection
//! decoder.*             -> Decoder
//! classifier.*          -> Classifier
//! ```
//!
//! A leading `pretrained_model.` (the backbone inside the fine-tune model)
//! is ignored when classifying.

use std::collections::BTreeMap;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{GptError, Result};
use crate::tensor::Tensor;

/// Ordered snapshot of parameter values by name.
pub type StateDict = BTreeMap<String, Tensor>;

/// Join a parent prefix and a child name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Coarse parameter groups that the freeze policy operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParamGroup {
    Embedding,
    Decoder,
    OutputProjection,
    Classifier,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 4] = [
        ParamGroup::Embedding,
        ParamGroup::Decoder,
        ParamGroup::OutputProjection,
        ParamGroup::Classifier,
    ];

    /// Classify a dotted parameter name.
    pub fn of(name: &str) -> ParamGroup {
        let name = name.strip_prefix("pretrained_model.").unwrap_or(name);
        if name.starts_with("classifier.") {
            ParamGroup::Classifier
        } else if name.starts_with("embedding.") {
            ParamGroup::Embedding
        } else if name.starts_with("decoder.linear.") {
            ParamGroup::OutputProjection
        } else {
            ParamGroup::Decoder
        }
    }
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ParamGroup::Embedding => "embedding",
            ParamGroup::Decoder => "decoder",
            ParamGroup::OutputProjection => "output_projection",
            ParamGroup::Classifier => "classifier",
        };
        f.write_str(label)
    }
}

/// Per-group tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tag {
    Trainable,
    Frozen,
}

/// Which parameter groups receive gradients and optimizer updates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainableSet {
    tags: BTreeMap<ParamGroup, Tag>,
}

impl TrainableSet {
    /// Every group trainable (pretraining).
    pub fn all() -> Self {
        Self {
            tags: ParamGroup::ALL
                .iter()
                .map(|&g| (g, Tag::Trainable))
                .collect(),
        }
    }

    /// Transfer-learning policy: the backbone is frozen except for the
    /// decoder's output projection; the classifier head stays trainable.
    pub fn transfer() -> Self {
        let mut set = Self::all();
        set.freeze(ParamGroup::Embedding);
        set.freeze(ParamGroup::Decoder);
        set
    }

    pub fn tag(&self, group: ParamGroup) -> Tag {
        self.tags.get(&group).copied().unwrap_or(Tag::Trainable)
    }

    pub fn is_trainable(&self, group: ParamGroup) -> bool {
        self.tag(group) == Tag::Trainable
    }

    pub fn is_name_trainable(&self, name: &str) -> bool {
        self.is_trainable(ParamGroup::of(name))
    }

    pub fn freeze(&mut self, group: ParamGroup) {
        self.tags.insert(group, Tag::Frozen);
    }

    pub fn unfreeze(&mut self, group: ParamGroup) {
        self.tags.insert(group, Tag::Trainable);
    }
}

impl Default for TrainableSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Anything that owns named parameter tensors.
pub trait Parameterized {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>);

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>);

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        self.visit_params("", &mut out);
        out
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut out = Vec::new();
        self.visit_params_mut("", &mut out);
        out
    }

    fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.numel()).sum()
    }

    fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.clone()))
            .collect()
    }

    /// Verify that `state` has exactly this model's names and shapes,
    /// without touching any parameter.
    fn check_state_dict(&self, state: &StateDict) -> Result<()> {
        let params = self.named_parameters();

        for (name, param) in &params {
            let incoming = state
                .get(name)
                .ok_or_else(|| GptError::MissingParameter(name.clone()))?;
            if incoming.shape != param.shape {
                return Err(GptError::ShapeMismatch {
                    name: name.clone(),
                    expected: param.shape.clone(),
                    found: incoming.shape.clone(),
                });
            }
        }
        if state.len() != params.len() {
            let known: std::collections::BTreeSet<&str> =
                params.iter().map(|(n, _)| n.as_str()).collect();
            if let Some(extra) = state.keys().find(|k| !known.contains(k.as_str())) {
                return Err(GptError::UnexpectedParameter(extra.clone()));
            }
        }
        Ok(())
    }

    /// Strict load: the key set and every shape must match exactly. On
    /// error nothing has been written.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.check_state_dict(state)?;
        for (name, param) in self.named_parameters_mut() {
            if let Some(incoming) = state.get(&name) {
                param.data.copy_from_slice(&incoming.data);
            }
        }
        Ok(())
    }
}

/// Gradients keyed by parameter name. Recording the same name twice sums.
#[derive(Clone, Debug, Default)]
pub struct Gradients {
    grads: BTreeMap<String, Tensor>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: String, grad: Tensor) {
        match self.grads.get_mut(&name) {
            Some(existing) => existing.add_assign(&grad),
            None => {
                self.grads.insert(name, grad);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.grads.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.grads.iter()
    }

    /// Sum another gradient map into this one.
    pub fn accumulate(&mut self, other: Gradients) {
        for (name, grad) in other.grads {
            self.record(name, grad);
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for grad in self.grads.values_mut() {
            grad.data.par_iter_mut().for_each(|g| *g *= factor);
        }
    }

    /// Drop gradients of frozen groups.
    pub fn retain_trainable(&mut self, trainable: &TrainableSet) {
        self.grads.retain(|name, _| trainable.is_name_trainable(name));
    }

    /// Global L2 norm across every recorded gradient.
    pub fn global_norm(&self) -> f32 {
        self.grads
            .values()
            .map(Tensor::sum_squares)
            .sum::<f32>()
            .sqrt()
    }

    /// Scale all gradients so the global norm is at most `max_norm`.
    /// Returns the norm measured before clipping.
    pub fn clip(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
        norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        weight: Tensor,
        bias: Tensor,
    }

    impl Parameterized for Pair {
        fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
            out.push((join(prefix, "weight"), &self.weight));
            out.push((join(prefix, "bias"), &self.bias));
        }

        fn visit_params_mut<'a>(
            &'a mut self,
            prefix: &str,
            out: &mut Vec<(String, &'a mut Tensor)>,
        ) {
            out.push((join(prefix, "weight"), &mut self.weight));
            out.push((join(prefix, "bias"), &mut self.bias));
        }
    }

    fn pair(v: f32) -> Pair {
        Pair {
            weight: Tensor::new(vec![v; 4], vec![2, 2]),
            bias: Tensor::new(vec![v; 2], vec![2]),
        }
    }

    #[test]
    fn test_group_classification() {
        assert_eq!(ParamGroup::of("embedding.weight"), ParamGroup::Embedding);
        assert_eq!(
            ParamGroup::of("pretrained_model.decoder.linear.bias"),
            ParamGroup::OutputProjection
        );
        assert_eq!(
            ParamGroup::of("pretrained_model.decoder.blocks.0.ln1.gamma"),
            ParamGroup::Decoder
        );
        assert_eq!(ParamGroup::of("classifier.weight"), ParamGroup::Classifier);
    }

    #[test]
    fn test_transfer_policy_tags() {
        let set = TrainableSet::transfer();
        assert!(!set.is_trainable(ParamGroup::Embedding));
        assert!(!set.is_trainable(ParamGroup::Decoder));
        assert!(set.is_trainable(ParamGroup::OutputProjection));
        assert!(set.is_trainable(ParamGroup::Classifier));
    }

    #[test]
    fn test_strict_state_dict_load() {
        let source = pair(3.0);
        let mut target = pair(0.0);
        target.load_state_dict(&source.state_dict()).unwrap();
        assert_eq!(target.weight.data, vec![3.0; 4]);

        let mut bad = source.state_dict();
        bad.insert("bias".into(), Tensor::zeros(vec![3]));
        assert!(matches!(
            target.load_state_dict(&bad),
            Err(GptError::ShapeMismatch { .. })
        ));

        let mut missing = source.state_dict();
        missing.remove("bias");
        assert!(matches!(
            target.load_state_dict(&missing),
            Err(GptError::MissingParameter(_))
        ));

        let mut extra = source.state_dict();
        extra.insert("other".into(), Tensor::zeros(vec![1]));
        assert!(matches!(
            target.load_state_dict(&extra),
            Err(GptError::UnexpectedParameter(_))
        ));
    }

    #[test]
    fn test_gradients_accumulate_and_clip() {
        let mut grads = Gradients::new();
        grads.record("a".into(), Tensor::new(vec![3.0], vec![1]));
        grads.record("a".into(), Tensor::new(vec![1.0], vec![1]));
        grads.record("b".into(), Tensor::new(vec![3.0], vec![1]));
        assert_eq!(grads.get("a").unwrap().data, vec![4.0]);
        assert!((grads.global_norm() - 5.0).abs() < 1e-6);

        let before = grads.clip(1.0);
        assert!((before - 5.0).abs() < 1e-6);
        assert!((grads.global_norm() - 1.0).abs() < 1e-5);
    }
}
