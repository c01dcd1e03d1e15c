//! Batching and the shared training loop.
//!
//! ## Batches
//!
//! [`BatchIterator`] walks the indices of a dataset in batches of
//! `batch_size`, optionally shuffled by a seeded RNG. The final partial batch
//! is kept, so an epoch over `N` examples has `ceil(N / batch_size)` steps.
//!
//! ```text
//! N = 5, batch_size = 2, no shuffle
//!
//!   [0, 1]  [2, 3]  [4]
//! ```
//!
//! ## Batch Gradients
//!
//! Examples of a batch run forward and backward in parallel, one sequence
//! each. Example losses are per-position means; the batch loss is their mean,
//! and the summed gradients are scaled by `1 / batch` to match.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use tracing::debug;

use crate::config::FitOptions;
use crate::error::{GptError, Result};
use crate::loss::cross_entropy;
use crate::mask::{generate_mask, uniform_length};
use crate::optimizer::AdamW;
use crate::params::{Gradients, Parameterized, TrainableSet};
use crate::tensor::Tensor;
use crate::training_logger::{log_window, FitReport, ProgressWindow, StepMetrics, TrainingLogger};

/// Index batches over a dataset of `len` examples.
pub struct BatchIterator {
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl BatchIterator {
    /// Batches of `batch_size` indices covering `0..len` exactly once.
    ///
    /// With `shuffle` the order is a permutation drawn from `rng`; without
    /// it the indices come out in order. The last batch holds the remainder
    /// and may be smaller. A `batch_size` of 0 is treated as 1.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt_transfer::train::BatchIterator;
    /// # use rand::SeedableRng;
    /// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    /// let batches: Vec<_> = BatchIterator::new(5, 2, false, &mut rng).collect();
    /// assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    /// ```
    pub fn new(len: usize, batch_size: usize, shuffle: bool, rng: &mut StdRng) -> Self {
        let mut order: Vec<usize> = (0..len).collect();
        if shuffle {
            order.shuffle(rng);
        }
        Self {
            order,
            batch_size: batch_size.max(1),
            position: 0,
        }
    }

    /// Total number of batches, including a trailing partial one.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl Iterator for BatchIterator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let batch = self.order[self.position..end].to_vec();
        self.position = end;
        Some(batch)
    }
}

/// A model that can be trained one sequence at a time.
///
/// Both [`GPTModel`](crate::GPTModel) and [`Classifier`](crate::Classifier)
/// implement this, so the batch and epoch helpers below serve both trainers.
/// The forward pass is split from the backward pass by an explicit cache
/// holding the activations the backward pass needs, which keeps `&self`
/// shared across the rayon workers of a batch.
pub trait SequenceModel: Parameterized + Sync {
    /// Activations saved by `forward_train` for `backward_train`
    type Cache: Send;

    /// Logits `[seq_len, classes]` for one sequence.
    fn forward_train(&self, ids: &[usize], mask: &Tensor, training: bool) -> Result<(Tensor, Self::Cache)>;

    /// Parameter gradients for one sequence given the logits gradient.
    fn backward_train(&self, grad_logits: &Tensor, cache: &Self::Cache, trainable: &TrainableSet) -> Gradients;
}

fn check_targets(inputs: &[Vec<usize>], targets: &[Vec<usize>]) -> Result<usize> {
    let len = uniform_length(inputs)?;
    if targets.len() != inputs.len() {
        return Err(GptError::invalid_input(format!(
            "{} input sequences but {} target sequences",
            inputs.len(),
            targets.len()
        )));
    }
    Ok(len)
}

/// Mean batch loss and the matching gradients of every trainable parameter.
///
/// Each sequence runs forward and backward on its own rayon task. The
/// per-sequence gradients are then summed in input order and scaled by
/// `1 / batch`, so the result does not depend on thread scheduling.
/// Gradients of frozen parameters are dropped before returning.
///
/// # Errors
///
/// Fails when the batch is empty, when sequences differ in length, when
/// `targets` does not pair with `inputs`, or when a token or label is out
/// of range.
pub fn batch_gradients<M: SequenceModel>(
    model: &M,
    inputs: &[Vec<usize>],
    targets: &[Vec<usize>],
    trainable: &TrainableSet,
) -> Result<(f32, Gradients)> {
    check_targets(inputs, targets)?;
    let (_, mask) = generate_mask(inputs)?;

    let per_example = inputs
        .par_iter()
        .zip(targets.par_iter())
        .map(|(ids, labels)| {
            let (logits, cache) = model.forward_train(ids, &mask, true)?;
            let (loss, grad) = cross_entropy(&logits, labels)?;
            Ok((loss, model.backward_train(&grad, &cache, trainable)))
        })
        .collect::<Result<Vec<_>>>()?;

    let batch = per_example.len() as f32;
    let mut loss = 0.0;
    let mut grads = Gradients::new();
    for (example_loss, example_grads) in per_example {
        loss += example_loss;
        grads.accumulate(example_grads);
    }
    grads.scale(1.0 / batch);
    grads.retain_trainable(trainable);
    Ok((loss / batch, grads))
}

/// Mean batch loss in evaluation mode.
pub fn batch_loss<M: SequenceModel>(
    model: &M,
    inputs: &[Vec<usize>],
    targets: &[Vec<usize>],
) -> Result<f32> {
    check_targets(inputs, targets)?;
    let (_, mask) = generate_mask(inputs)?;

    let losses = inputs
        .par_iter()
        .zip(targets.par_iter())
        .map(|(ids, labels)| {
            let (logits, _) = model.forward_train(ids, &mask, false)?;
            cross_entropy(&logits, labels).map(|(loss, _)| loss)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(losses.iter().sum::<f32>() / losses.len() as f32)
}

/// Clip (when configured) and apply one optimizer step.
pub(crate) fn apply_gradients<M: Parameterized + ?Sized>(
    optimizer: &mut AdamW,
    model: &mut M,
    mut grads: Gradients,
    grad_clip: Option<f32>,
) -> Result<()> {
    if let Some(max_norm) = grad_clip {
        let norm = grads.clip(max_norm);
        if norm > max_norm {
            debug!(norm, max_norm, "clipped gradients");
        }
    }
    optimizer.step(model, &grads)
}

/// Run `options.epochs` epochs over a dataset of `len` examples.
///
/// `step` receives the example indices of each batch and performs one
/// optimizer step. `epoch` is the trainer's running epoch counter and is
/// advanced once per completed epoch.
pub(crate) fn run_epochs<F>(
    len: usize,
    options: &FitOptions,
    rng: &mut StdRng,
    epoch: &mut usize,
    mut logger: Option<&mut TrainingLogger>,
    mut step: F,
) -> Result<FitReport>
where
    F: FnMut(&[usize]) -> Result<StepMetrics>,
{
    options.validate()?;
    if len == 0 {
        return Err(GptError::invalid_input("training data is empty"));
    }

    let mut report = FitReport::default();
    for _ in 0..options.epochs {
        let batches = BatchIterator::new(len, options.batch_size, options.shuffle, rng);
        let num_batches = batches.num_batches();
        let mut window = ProgressWindow::new();

        for (i, batch) in batches.enumerate() {
            window.push(step(&batch)?);
            if ProgressWindow::closes(i, num_batches, options.mini_batch) {
                if let Some(closed) = window.take(*epoch + 1, i + 1) {
                    log_window(&closed);
                    if let Some(logger) = logger.as_deref_mut() {
                        logger.log(&closed)?;
                    }
                    report.windows.push(closed);
                }
            }
        }

        *epoch += 1;
        report.epochs_completed += 1;
    }
    report.final_epoch = *epoch;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_batches_keep_partial_tail() {
        let mut rng = StdRng::seed_from_u64(0);
        let batches: Vec<_> = BatchIterator::new(5, 2, false, &mut rng).collect();
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(BatchIterator::new(5, 2, false, &mut rng).num_batches(), 3);
        assert_eq!(BatchIterator::new(4, 2, false, &mut rng).num_batches(), 2);
    }

    #[test]
    fn test_shuffle_is_seeded_permutation() {
        let a: Vec<_> = BatchIterator::new(10, 3, true, &mut StdRng::seed_from_u64(5))
            .flatten()
            .collect();
        let b: Vec<_> = BatchIterator::new(10, 3, true, &mut StdRng::seed_from_u64(5))
            .flatten()
            .collect();
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_epochs_window_count_and_epoch_counter() {
        let options = FitOptions {
            batch_size: 2,
            epochs: 2,
            shuffle: false,
            mini_batch: 2,
        };
        let mut epoch = 3;
        let mut calls = 0;
        let report = run_epochs(
            7,
            &options,
            &mut StdRng::seed_from_u64(0),
            &mut epoch,
            None,
            |batch| {
                calls += 1;
                Ok(StepMetrics {
                    loss: batch.len() as f32,
                    perplexity: None,
                })
            },
        )
        .unwrap();

        // 4 batches per epoch, windows close after batches 2 and 4
        assert_eq!(calls, 8);
        assert_eq!(report.windows.len(), 4);
        assert_eq!(report.windows[0].epoch, 4);
        assert_eq!(report.windows[1].batch, 4);
        assert!((report.windows[1].loss - 1.5).abs() < 1e-6);
        assert_eq!(report.epochs_completed, 2);
        assert_eq!(epoch, 5);
        assert_eq!(report.final_epoch, 5);
    }

    #[test]
    fn test_run_epochs_rejects_empty_data() {
        let mut epoch = 0;
        let result = run_epochs(
            0,
            &FitOptions::default(),
            &mut StdRng::seed_from_u64(0),
            &mut epoch,
            None,
            |_| unreachable!(),
        );
        assert!(matches!(result, Err(GptError::InvalidInput(_))));
    }
}
