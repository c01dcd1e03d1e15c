//! Cross-entropy loss and perplexity.
//!
//! For one example with logits `[seq_len, classes]` and integer targets:
//!
//! ```text
//! loss      = -mean_t log_softmax(logits[t])[target[t]]
//! grad[t,j] = (softmax(logits[t])[j] - 1{j == target[t]}) / seq_len
//! ```
//!
//! A batch loss is the mean of per-example losses, so every example's
//! gradient is additionally divided by the batch size.

use rayon::prelude::*;

use crate::error::{GptError, Result};
use crate::tensor::Tensor;

/// Mean cross-entropy of one sequence and the gradient w.r.t. its logits.
pub fn cross_entropy(logits: &Tensor, targets: &[usize]) -> Result<(f32, Tensor)> {
    let (rows, classes) = (logits.shape[0], logits.shape[1]);
    if targets.len() != rows {
        return Err(GptError::invalid_input(format!(
            "{} targets for {} positions",
            targets.len(),
            rows
        )));
    }
    if let Some(&bad) = targets.iter().find(|&&t| t >= classes) {
        return Err(GptError::invalid_input(format!(
            "target {bad} is out of range for {classes} classes"
        )));
    }

    let norm = 1.0 / rows as f32;
    let mut grad = vec![0.0; rows * classes];
    let losses: Vec<f32> = grad
        .par_chunks_mut(classes)
        .zip(targets.par_iter())
        .enumerate()
        .map(|(t, (grad_row, &target))| {
            let row = logits.row(t);
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let exp_sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
            let log_sum = exp_sum.ln();

            for (j, g) in grad_row.iter_mut().enumerate() {
                let prob = (row[j] - max).exp() / exp_sum;
                let indicator = if j == target { 1.0 } else { 0.0 };
                *g = (prob - indicator) * norm;
            }
            log_sum - (row[target] - max)
        })
        .collect();

    let loss = losses.iter().sum::<f32>() * norm;
    Ok((loss, Tensor::new(grad, logits.shape.clone())))
}

/// Perplexity as the exponential of cross-entropy.
pub fn perplexity(loss: f32) -> f32 {
    loss.exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_give_log_classes() {
        let logits = Tensor::zeros(vec![2, 4]);
        let (loss, grad) = cross_entropy(&logits, &[1, 3]).unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
        assert!((perplexity(loss) - 4.0).abs() < 1e-4);
        assert!((grad.data[1] - (0.25 - 1.0) / 2.0).abs() < 1e-6);
        assert!((grad.data[0] - 0.125).abs() < 1e-6);
    }

    #[test]
    fn test_gradient_rows_sum_to_zero() {
        let logits = Tensor::new(vec![2.0, -1.0, 0.5, 0.0, 3.0, 1.0], vec![2, 3]);
        let (loss, grad) = cross_entropy(&logits, &[0, 2]).unwrap();
        assert!(loss > 0.0);
        for r in 0..2 {
            assert!(grad.row(r).iter().sum::<f32>().abs() < 1e-6);
        }
    }

    #[test]
    fn test_rejects_bad_targets() {
        let logits = Tensor::zeros(vec![2, 3]);
        assert!(cross_entropy(&logits, &[0]).is_err());
        assert!(cross_entropy(&logits, &[0, 3]).is_err());
    }
}
