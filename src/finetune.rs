//! Transfer learning on top of a pretrained backbone.
//!
//! [`GPTFineTune`] stacks a [`Classifier`] on a [`GPTModel`]. [`GPT`] drives
//! it through the transfer protocol:
//!
//! ```text
//! untrained --load_pretrained_model--> pretrained-loaded --fit--> fine-tuned
//!     |                                                              |
//!     +------------------load_model (full checkpoint)----------------+
//! ```
//!
//! Loading either a pretrained backbone or a full fine-tune checkpoint
//! switches the trainable set to the transfer policy: the embedding and the
//! decoder blocks are frozen, while the decoder's output projection and the
//! classifier keep training.

use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::checkpoint::{resolve_path, Checkpoint, CheckpointStatus};
use crate::classifier::Classifier;
use crate::config::{FitOptions, ModelConfig, TrainerConfig};
use crate::error::{GptError, Result};
use crate::layers::LinearCache;
use crate::mask::{causal_mask, uniform_length};
use crate::model::{GPTModel, GPTModelCache, ModelSummary};
use crate::optimizer::{AdamHyperParams, AdamW};
use crate::params::{join, Gradients, ParamGroup, Parameterized, TrainableSet};
use crate::tensor::Tensor;
use crate::train::{apply_gradients, batch_gradients, run_epochs, SequenceModel};
use crate::training_logger::{FitReport, StepMetrics, TrainingLogger};

/// Backbone plus classification head.
#[derive(Clone, Debug)]
pub struct GPTFineTune {
    pub pretrained_model: GPTModel,
    pub classifier: Classifier,
}

impl GPTFineTune {
    /// Fresh backbone from `config` and a head of `num_classes` outputs. The
    /// head is seeded from `config.seed + 1` so it never shares draws with
    /// the backbone.
    pub fn new(config: &ModelConfig, num_classes: usize) -> Result<Self> {
        if num_classes == 0 {
            return Err(GptError::config("num_classes must be positive"));
        }
        let pretrained_model = GPTModel::new(config)?;
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        Ok(Self {
            pretrained_model,
            classifier: Classifier::new(config.token_size, num_classes, &mut rng),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.classifier.num_classes()
    }

    /// Class logits `[batch, seq_len, num_classes]`.
    pub fn forward(&self, token_ids: &[Vec<usize>], mask: &Tensor, training: bool) -> Result<Tensor> {
        uniform_length(token_ids)?;
        let logits = token_ids
            .par_iter()
            .map(|ids| self.forward_sequence(ids, mask, training).map(|(l, _)| l))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&logits))
    }

    pub fn forward_sequence(
        &self,
        ids: &[usize],
        mask: &Tensor,
        training: bool,
    ) -> Result<(Tensor, FineTuneCache)> {
        let (hidden, backbone) = self.pretrained_model.forward_sequence(ids, mask, training)?;
        let (logits, classifier) = self.classifier.forward(&hidden);
        Ok((logits, FineTuneCache { backbone, classifier }))
    }

    /// Gradients for one sequence, recorded under `prefix`.
    ///
    /// The head always runs backward. The backbone is skipped entirely when
    /// none of its groups is trainable, which is the common case under the
    /// transfer policy.
    pub fn backward_sequence(
        &self,
        grad_logits: &Tensor,
        cache: &FineTuneCache,
        trainable: &TrainableSet,
        sink: &mut Gradients,
        prefix: &str,
    ) {
        let grad_hidden =
            self.classifier
                .backward(grad_logits, &cache.classifier, sink, &join(prefix, "classifier"));

        let backbone_trainable = [
            ParamGroup::OutputProjection,
            ParamGroup::Decoder,
            ParamGroup::Embedding,
        ]
        .into_iter()
        .any(|g| trainable.is_trainable(g));
        if backbone_trainable {
            self.pretrained_model.backward_sequence(
                &grad_hidden,
                &cache.backbone,
                trainable,
                sink,
                &join(prefix, "pretrained_model"),
            );
        }
    }
}

impl Parameterized for GPTFineTune {
    fn visit_params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        self.pretrained_model
            .visit_params(&join(prefix, "pretrained_model"), out);
        self.classifier.visit_params(&join(prefix, "classifier"), out);
    }

    fn visit_params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.pretrained_model
            .visit_params_mut(&join(prefix, "pretrained_model"), out);
        self.classifier
            .visit_params_mut(&join(prefix, "classifier"), out);
    }
}

impl SequenceModel for GPTFineTune {
    type Cache = FineTuneCache;

    fn forward_train(&self, ids: &[usize], mask: &Tensor, training: bool) -> Result<(Tensor, FineTuneCache)> {
        self.forward_sequence(ids, mask, training)
    }

    fn backward_train(&self, grad_logits: &Tensor, cache: &FineTuneCache, trainable: &TrainableSet) -> Gradients {
        let mut sink = Gradients::new();
        self.backward_sequence(grad_logits, cache, trainable, &mut sink, "");
        sink
    }
}

pub struct FineTuneCache {
    pub backbone: GPTModelCache,
    pub classifier: LinearCache,
}

/// Fine-tuning and inference orchestrator.
///
/// Owns a [`GPTFineTune`], its optimizer and the [`TrainableSet`] that
/// decides which parameter groups are updated. A fresh `GPT` trains every
/// group. Loading backbone weights switches to the transfer policy, where
/// only the backbone output projection and the classifier learn.
///
/// # Example
///
/// ```rust,no_run
/// # use std::path::Path;
/// # use gpt_transfer::{FitOptions, ModelConfig, TrainerConfig, GPT};
/// # fn main() -> gpt_transfer::Result<()> {
/// let mut gpt = GPT::new(&ModelConfig::tiny(100), 100, TrainerConfig::default())?;
/// gpt.load_pretrained_model(Path::new("pretrain.ckpt"))?;
///
/// let inputs = vec![vec![1, 2, 3]];
/// let labels = vec![vec![2, 3, 4]];
/// gpt.fit(&inputs, &labels, None, &FitOptions::default())?;
///
/// let tokens = gpt.predict(&[1, 2], 10, 0)?;
/// # Ok(())
/// # }
/// ```
pub struct GPT {
    model: GPTFineTune,
    optimizer: AdamW,
    config: TrainerConfig,
    trainable: TrainableSet,
    epoch: usize,
    pretrained_loaded: bool,
    rng: StdRng,
}

impl GPT {
    /// Build a fresh model, then load the configured checkpoint if its
    /// file exists.
    pub fn new(model_config: &ModelConfig, num_classes: usize, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let model = GPTFineTune::new(model_config, num_classes)?;
        let optimizer = AdamW::new(&model, AdamHyperParams::from(&config));
        let rng = StdRng::seed_from_u64(config.seed);
        let mut gpt = Self {
            model,
            optimizer,
            config,
            trainable: TrainableSet::all(),
            epoch: 0,
            pretrained_loaded: false,
            rng,
        };
        if gpt.config.checkpoint.is_some() {
            gpt.load_model(None)?;
        }
        Ok(gpt)
    }

    /// The backbone and head being trained.
    pub fn model(&self) -> &GPTFineTune {
        &self.model
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Parameter groups that currently receive updates.
    pub fn trainable(&self) -> &TrainableSet {
        &self.trainable
    }

    /// Whether backbone weights have been loaded and the transfer policy applied.
    pub fn is_pretrained_loaded(&self) -> bool {
        self.pretrained_loaded
    }

    pub fn summary(&self) -> ModelSummary {
        let summary = ModelSummary::of(&self.model, &self.trainable);
        debug!("model summary\n{summary}");
        summary
    }

    fn apply_transfer_policy(&mut self) {
        self.trainable = TrainableSet::transfer();
        self.pretrained_loaded = true;
    }

    /// Load backbone parameters from a pretraining checkpoint and freeze
    /// everything but the output projection. The file must exist.
    pub fn load_pretrained_model(&mut self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint::read(path)?;
        self.model
            .pretrained_model
            .load_state_dict(&checkpoint.model)?;
        self.apply_transfer_policy();
        info!(path = %path.display(), "loaded pretrained model");
        Ok(())
    }

    /// Restore a full fine-tune checkpoint. A missing file is skipped;
    /// a loaded one applies the transfer policy.
    pub fn load_model(&mut self, path: Option<&Path>) -> Result<CheckpointStatus> {
        let Some(path) = resolve_path(path, &mut self.config.checkpoint) else {
            return Ok(CheckpointStatus::NotConfigured);
        };
        let Some(checkpoint) = Checkpoint::load(&path)? else {
            return Ok(CheckpointStatus::FileMissing(path));
        };
        if let Some(classes) = checkpoint.num_classes {
            if classes != self.model.num_classes() {
                return Err(GptError::Checkpoint(format!(
                    "checkpoint has {classes} classes, model has {}",
                    self.model.num_classes()
                )));
            }
        }
        // validate everything before committing anything
        self.model.check_state_dict(&checkpoint.model)?;
        if let Some(state) = &checkpoint.optimizer {
            self.optimizer.check_state(state)?;
        }

        self.model.load_state_dict(&checkpoint.model)?;
        if let Some(state) = checkpoint.optimizer {
            self.optimizer.load_state(state)?;
        }
        self.epoch = checkpoint.epoch;
        self.apply_transfer_policy();
        Ok(CheckpointStatus::Loaded(path))
    }

    /// Save parameters, optimizer state and epoch along with the model
    /// config and class count, so a later [`GPT::load_model`] can reject a
    /// checkpoint built for a different head.
    ///
    /// `path` overrides and replaces the configured checkpoint path. With
    /// neither, nothing is written and `NotConfigured` is returned.
    pub fn save_model(&mut self, path: Option<&Path>) -> Result<CheckpointStatus> {
        let Some(path) = resolve_path(path, &mut self.config.checkpoint) else {
            return Ok(CheckpointStatus::NotConfigured);
        };
        let mut checkpoint = Checkpoint::new(
            self.model.state_dict(),
            Some(self.optimizer.state()),
            self.epoch,
        );
        checkpoint.model_config = Some(self.model.pretrained_model.config().clone());
        checkpoint.num_classes = Some(self.model.num_classes());
        checkpoint.save(&path)?;
        Ok(CheckpointStatus::Saved(path))
    }

    /// One optimizer step with per-position class labels. Only trainable
    /// groups receive updates.
    pub fn train_step(&mut self, inputs: &[Vec<usize>], labels: &[Vec<usize>]) -> Result<StepMetrics> {
        let (loss, grads) = batch_gradients(&self.model, inputs, labels, &self.trainable)?;
        apply_gradients(&mut self.optimizer, &mut self.model, grads, self.config.grad_clip)?;
        Ok(StepMetrics {
            loss,
            perplexity: None,
        })
    }

    /// Fine-tune on `(inputs, labels)`. Without a loaded checkpoint the
    /// backbone comes from `pretrained_path`, which is then required.
    pub fn fit(
        &mut self,
        inputs: &[Vec<usize>],
        labels: &[Vec<usize>],
        pretrained_path: Option<&Path>,
        options: &FitOptions,
    ) -> Result<FitReport> {
        options.validate()?;
        if inputs.len() != labels.len() {
            return Err(GptError::invalid_input(format!(
                "{} input sequences but {} label sequences",
                inputs.len(),
                labels.len()
            )));
        }
        if self.config.checkpoint.is_some() {
            self.load_model(None)?;
        }
        if !self.pretrained_loaded {
            let path = pretrained_path.ok_or(GptError::MissingPretrained)?;
            self.load_pretrained_model(path)?;
        }
        let summary = self.summary();
        info!(
            examples = inputs.len(),
            parameters = summary.total,
            trainable = summary.trainable,
            epochs = options.epochs,
            "starting fine-tuning"
        );

        let mut logger = self
            .config
            .log_csv
            .as_deref()
            .map(TrainingLogger::new)
            .transpose()?;
        let device = self.config.device.clone();
        let mut rng = self.rng.clone();
        let mut epoch = self.epoch;

        let result = device.install(|| {
            run_epochs(
                inputs.len(),
                options,
                &mut rng,
                &mut epoch,
                logger.as_mut(),
                |indices| {
                    let batch_inputs: Vec<Vec<usize>> =
                        indices.iter().map(|&i| inputs[i].clone()).collect();
                    let batch_labels: Vec<Vec<usize>> =
                        indices.iter().map(|&i| labels[i].clone()).collect();
                    self.train_step(&batch_inputs, &batch_labels)
                },
            )
        })?;
        self.rng = rng;
        self.epoch = epoch;
        let report = result?;

        if self.config.checkpoint.is_some() {
            self.save_model(None)?;
        }
        Ok(report)
    }

    /// Greedy decoding from `prompt`: append the top class at the last
    /// position up to `limit_tokens` times, stopping before `end_token`.
    pub fn predict(&self, prompt: &[usize], limit_tokens: usize, end_token: usize) -> Result<Vec<usize>> {
        if prompt.is_empty() {
            return Err(GptError::invalid_input("prompt is empty"));
        }
        let mut sequence = prompt.to_vec();
        for _ in 0..limit_tokens {
            let mask = causal_mask(sequence.len());
            let (logits, _) = self.model.forward_sequence(&sequence, &mask, false)?;
            let token = Tensor::argmax(logits.row(sequence.len() - 1));
            if token == end_token {
                break;
            }
            sequence.push(token);
        }
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pretrain::GPTPretrain;

    const VOCAB: usize = 12;

    fn pretrained_checkpoint(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("backbone.ckpt");
        let mut pretrain =
            GPTPretrain::new(&ModelConfig::tiny(VOCAB), TrainerConfig::default()).unwrap();
        pretrain.pretrain_step(&[vec![1, 2, 3, 4]]).unwrap();
        pretrain.save_model(Some(&path)).unwrap();
        path
    }

    fn gpt(config: TrainerConfig) -> GPT {
        GPT::new(&ModelConfig::tiny(VOCAB), VOCAB, config).unwrap()
    }

    #[test]
    fn test_fit_without_backbone_fails_loudly() {
        let mut gpt = gpt(TrainerConfig::default());
        let result = gpt.fit(&[vec![1, 2]], &[vec![2, 3]], None, &FitOptions::default());
        assert!(matches!(result, Err(GptError::MissingPretrained)));
    }

    #[test]
    fn test_pretrained_load_freezes_all_but_projection() {
        let dir = tempfile::tempdir().unwrap();
        let path = pretrained_checkpoint(dir.path());
        let mut gpt = gpt(TrainerConfig::default());
        gpt.load_pretrained_model(&path).unwrap();
        assert!(gpt.is_pretrained_loaded());

        let backbone = Checkpoint::read(&path).unwrap().model;
        assert_eq!(gpt.model().pretrained_model.state_dict(), backbone);

        let inputs = vec![vec![1, 2, 3], vec![3, 2, 1]];
        let labels = vec![vec![2, 3, 4], vec![2, 1, 0]];
        let (_, grads) =
            batch_gradients(gpt.model(), &inputs, &labels, gpt.trainable()).unwrap();
        let names: Vec<&str> = grads.names().collect();
        assert_eq!(
            names,
            vec![
                "classifier.bias",
                "classifier.weight",
                "pretrained_model.decoder.linear.bias",
                "pretrained_model.decoder.linear.weight",
            ]
        );

        let before = gpt.model().state_dict();
        gpt.train_step(&inputs, &labels).unwrap();
        let after = gpt.model().state_dict();
        for (name, tensor) in &after {
            let changed = *tensor != before[name];
            let trainable = gpt.trainable().is_name_trainable(name);
            assert_eq!(changed, trainable, "{name}");
        }
    }

    #[test]
    fn test_full_checkpoint_resume_applies_policy() {
        let dir = tempfile::tempdir().unwrap();
        let backbone = pretrained_checkpoint(dir.path());
        let path = dir.path().join("finetune.ckpt");

        let mut first = gpt(TrainerConfig::default().with_checkpoint(&path));
        let options = FitOptions {
            batch_size: 2,
            epochs: 1,
            shuffle: false,
            mini_batch: 1,
        };
        let inputs = vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]];
        let labels = vec![vec![2, 3, 4], vec![5, 6, 7], vec![8, 9, 10]];
        let report = first.fit(&inputs, &labels, Some(&backbone), &options).unwrap();
        assert_eq!(report.windows.len(), 2);
        assert!(report.windows.iter().all(|w| w.perplexity.is_none()));

        let resumed = gpt(TrainerConfig::default().with_checkpoint(&path));
        assert!(resumed.is_pretrained_loaded());
        assert_eq!(resumed.epoch(), 1);
        assert_eq!(resumed.trainable(), &TrainableSet::transfer());
        assert_eq!(resumed.model().state_dict(), first.model().state_dict());
        assert_eq!(resumed.optimizer().state(), first.optimizer().state());
    }

    #[test]
    fn test_rejected_checkpoint_leaves_model_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ckpt");

        let mut source = gpt(TrainerConfig::default());
        source.train_step(&[vec![1, 2, 3]], &[vec![2, 3, 4]]).unwrap();
        let mut optimizer = source.optimizer().state();
        optimizer
            .moments
            .remove("pretrained_model.embedding.weight");
        let mut checkpoint = Checkpoint::new(source.model().state_dict(), Some(optimizer), 3);
        checkpoint.num_classes = Some(VOCAB);
        checkpoint.save(&path).unwrap();

        let mut target = gpt(TrainerConfig::default());
        let weights = target.model().state_dict();
        assert!(target.load_model(Some(&path)).is_err());
        assert_eq!(target.model().state_dict(), weights);
        assert_eq!(target.epoch(), 0);
        assert!(!target.is_pretrained_loaded());
        assert_eq!(target.trainable(), &TrainableSet::all());
    }

    #[test]
    fn test_unfrozen_decoder_receives_gradients_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = pretrained_checkpoint(dir.path());
        let mut gpt = gpt(TrainerConfig::default());
        gpt.load_pretrained_model(&path).unwrap();

        let inputs = vec![vec![1, 2, 3]];
        let labels = vec![vec![2, 3, 4]];
        let mut policy = gpt.trainable().clone();
        let (_, frozen) = batch_gradients(gpt.model(), &inputs, &labels, &policy).unwrap();
        assert!(frozen.names().all(|n| !n.contains("blocks.")));

        policy.unfreeze(ParamGroup::Decoder);
        let (_, grads) = batch_gradients(gpt.model(), &inputs, &labels, &policy).unwrap();
        assert!(grads.get("pretrained_model.decoder.blocks.0.attn.q_proj.weight").is_some());
        assert!(grads.get("pretrained_model.decoder.ln_final.gamma").is_some());
        assert!(grads.names().all(|n| !n.contains("embedding")));
    }

    #[test]
    fn test_predict_respects_limit() {
        let gpt = gpt(TrainerConfig::default());
        let prompt = vec![1, 2, 3];
        // no id reaches VOCAB, so the end token never fires
        let out = gpt.predict(&prompt, 4, VOCAB).unwrap();
        assert_eq!(out.len(), prompt.len() + 4);
        assert_eq!(&out[..3], &prompt[..]);
        assert!(out.iter().all(|&t| t < VOCAB));
        assert_eq!(gpt.predict(&prompt, 0, VOCAB).unwrap(), prompt);
    }

    #[test]
    fn test_predict_stops_before_end_token() {
        let gpt = gpt(TrainerConfig::default());
        let prompt = vec![4, 5];
        let free = gpt.predict(&prompt, 6, VOCAB).unwrap();

        // the first generated token used as the end token stops at step 0
        let first = free[prompt.len()];
        assert_eq!(gpt.predict(&prompt, 6, first).unwrap(), prompt);

        // an end token emitted at step k leaves exactly k new tokens
        let k = 2;
        let end = free[prompt.len() + k];
        let stopped = gpt.predict(&prompt, 6, end).unwrap();
        let expected_len = free[prompt.len()..]
            .iter()
            .position(|&t| t == end)
            .map_or(free.len(), |p| prompt.len() + p);
        assert_eq!(stopped.len(), expected_len);
        assert!(!stopped[prompt.len()..].contains(&end));
    }

    #[test]
    fn test_class_count_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ft.ckpt");
        gpt(TrainerConfig::default()).save_model(Some(&path)).unwrap();
        let result = GPT::new(
            &ModelConfig::tiny(VOCAB),
            3,
            TrainerConfig::default().with_checkpoint(&path),
        );
        assert!(matches!(result, Err(GptError::Checkpoint(_))));
    }
}
