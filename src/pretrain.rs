//! Next-token pretraining of the backbone.
//!
//! Each sequence of length `L` in a batch becomes one training example:
//!
//! ```text
//! sequence: [t0, t1, t2, t3, t4]
//! inputs:   [t0, t1, t2, t3]
//! labels:   [t1, t2, t3, t4]
//! ```
//!
//! Every parameter group is trainable. Checkpoints hold the model
//! parameters, the optimizer moments and the epoch counter.

use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::checkpoint::{resolve_path, Checkpoint, CheckpointStatus};
use crate::config::{FitOptions, ModelConfig, TrainerConfig};
use crate::error::{GptError, Result};
use crate::loss::perplexity;
use crate::mask::uniform_length;
use crate::model::{GPTModel, ModelSummary};
use crate::optimizer::{AdamHyperParams, AdamW};
use crate::params::{Parameterized, TrainableSet};
use crate::train::{apply_gradients, batch_gradients, batch_loss, run_epochs};
use crate::training_logger::{FitReport, StepMetrics, TrainingLogger};

/// Input/label pairs for next-token prediction.
pub fn shift_targets(batch: &[Vec<usize>]) -> Result<(Vec<Vec<usize>>, Vec<Vec<usize>>)> {
    let len = uniform_length(batch)?;
    if len < 2 {
        return Err(GptError::invalid_input(
            "pretraining sequences need at least two tokens",
        ));
    }
    let inputs = batch.iter().map(|s| s[..len - 1].to_vec()).collect();
    let labels = batch.iter().map(|s| s[1..].to_vec()).collect();
    Ok((inputs, labels))
}

/// Next-token pretraining of a [`GPTModel`].
///
/// Every parameter group is trainable. The trainer keeps its epoch counter
/// across [`GPTPretrain::fit`] calls and checkpoints, so a resumed run picks
/// up where the last one stopped.
pub struct GPTPretrain {
    model: GPTModel,
    optimizer: AdamW,
    config: TrainerConfig,
    trainable: TrainableSet,
    epoch: usize,
    rng: StdRng,
}

impl GPTPretrain {
    /// Build a fresh model and optimizer, then load the configured
    /// checkpoint if its file exists.
    pub fn new(model_config: &ModelConfig, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let model = GPTModel::new(model_config)?;
        let optimizer = AdamW::new(&model, AdamHyperParams::from(&config));
        let rng = StdRng::seed_from_u64(config.seed);
        let mut trainer = Self {
            model,
            optimizer,
            config,
            trainable: TrainableSet::all(),
            epoch: 0,
            rng,
        };
        if trainer.config.checkpoint.is_some() {
            trainer.load_model(None)?;
        }
        Ok(trainer)
    }

    pub fn model(&self) -> &GPTModel {
        &self.model
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    /// Epochs completed so far, including those restored from a checkpoint.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Path used when `save_model`/`load_model` get `None`.
    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.config.checkpoint.as_deref()
    }

    pub fn summary(&self) -> ModelSummary {
        let summary = ModelSummary::of(&self.model, &self.trainable);
        debug!("model summary\n{summary}");
        summary
    }

    /// One optimizer step on a batch of equal-length sequences.
    pub fn pretrain_step(&mut self, batch: &[Vec<usize>]) -> Result<StepMetrics> {
        let (inputs, labels) = shift_targets(batch)?;
        let (loss, grads) = batch_gradients(&self.model, &inputs, &labels, &self.trainable)?;
        apply_gradients(&mut self.optimizer, &mut self.model, grads, self.config.grad_clip)?;
        Ok(StepMetrics {
            loss,
            perplexity: Some(perplexity(loss)),
        })
    }

    /// Mean next-token loss over `data` without updating anything.
    pub fn evaluate(&self, data: &[Vec<usize>]) -> Result<StepMetrics> {
        let (inputs, labels) = shift_targets(data)?;
        let loss = batch_loss(&self.model, &inputs, &labels)?;
        Ok(StepMetrics {
            loss,
            perplexity: Some(perplexity(loss)),
        })
    }

    /// Train over `data` for `options.epochs` epochs, reporting progress
    /// every `options.mini_batch` steps. Resumes from and saves to the
    /// configured checkpoint.
    pub fn fit(&mut self, data: &[Vec<usize>], options: &FitOptions) -> Result<FitReport> {
        options.validate()?;
        if self.config.checkpoint.is_some() {
            self.load_model(None)?;
        }
        let summary = self.summary();
        info!(
            examples = data.len(),
            parameters = summary.total,
            epochs = options.epochs,
            batch_size = options.batch_size,
            "starting pretraining"
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
                data.len(),
                options,
                &mut rng,
                &mut epoch,
                logger.as_mut(),
                |indices| {
                    let batch: Vec<Vec<usize>> = indices.iter().map(|&i| data[i].clone()).collect();
                    self.pretrain_step(&batch)
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

    /// Save parameters, optimizer state and epoch. `path` overrides and
    /// replaces the configured checkpoint path.
    pub fn save_model(&mut self, path: Option<&Path>) -> Result<CheckpointStatus> {
        let Some(path) = resolve_path(path, &mut self.config.checkpoint) else {
            return Ok(CheckpointStatus::NotConfigured);
        };
        let mut checkpoint = Checkpoint::new(
            self.model.state_dict(),
            Some(self.optimizer.state()),
            self.epoch,
        );
        checkpoint.model_config = Some(self.model.config().clone());
        checkpoint.save(&path)?;
        Ok(CheckpointStatus::Saved(path))
    }

    /// Restore from a checkpoint. A missing file leaves the trainer as is.
    pub fn load_model(&mut self, path: Option<&Path>) -> Result<CheckpointStatus> {
        let Some(path) = resolve_path(path, &mut self.config.checkpoint) else {
            return Ok(CheckpointStatus::NotConfigured);
        };
        let Some(checkpoint) = Checkpoint::load(&path)? else {
            return Ok(CheckpointStatus::FileMissing(path));
        };
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
        Ok(CheckpointStatus::Loaded(path))
    }
}
