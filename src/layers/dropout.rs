//! Dropout Layer
//!
//! Inverted dropout: during training each activation is zeroed with
//! probability `rate` and survivors are scaled by `1 / (1 - rate)`. In
//! evaluation mode values pass through unchanged.

use crate::tensor::Tensor;

/// Inverted dropout with a fixed rate. Has no parameters.
#[derive(Clone, Debug)]
pub struct Dropout {
    pub rate: f32,
}

impl Dropout {
    /// `rate` must lie in `[0, 1]`; configs are validated before layers are built.
    pub fn new(rate: f32) -> Self {
        debug_assert!((0.0..=1.0).contains(&rate), "Dropout rate must be between 0.0 and 1.0");
        Self { rate }
    }

    /// Returns `x` unchanged when not training or when the rate is zero.
    /// Otherwise draws a fresh keep-mask from the thread-local RNG.
    pub fn forward(&self, x: &Tensor, training: bool) -> (Tensor, DropoutCache) {
        if !training || self.rate == 0.0 {
            let cache = DropoutCache {
                mask: None,
                scale: 1.0,
            };
            return (x.clone(), cache);
        }

        if self.rate >= 1.0 {
            let cache = DropoutCache {
                mask: Some(vec![false; x.numel()]),
                scale: 1.0,
            };
            return (Tensor::zeros(x.shape.clone()), cache);
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mut mask = Vec::with_capacity(x.numel());
        let mut output = Tensor::zeros(x.shape.clone());

        for i in 0..x.numel() {
            let keep = rand::random::<f32>() >= self.rate;
            mask.push(keep);
            if keep {
                output.data[i] = x.data[i] * scale;
            }
        }

        (
            output,
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    /// Routes gradient through the kept positions with the same scale.
    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let mut grad_input = Tensor::zeros(grad_output.shape.clone());
                for (i, &keep) in mask.iter().enumerate() {
                    if keep {
                        grad_input.data[i] = grad_output.data[i] * cache.scale;
                    }
                }
                grad_input
            }
            None => grad_output.clone(),
        }
    }
}

/// Cache for dropout backward pass
pub struct DropoutCache {
    /// true = kept; `None` when dropout was not applied
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_mode_is_identity() {
        let dropout = Dropout::new(0.5);
        let x = Tensor::new(vec![1.0, 2.0, 3.0], vec![1, 3]);
        let (y, cache) = dropout.forward(&x, false);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_training_mask_is_reused_in_backward() {
        let dropout = Dropout::new(0.5);
        let x = Tensor::ones(vec![8, 8]);
        let (y, cache) = dropout.forward(&x, true);
        let grad = dropout.backward(&Tensor::ones(vec![8, 8]), &cache);
        for (out, g) in y.data.iter().zip(&grad.data) {
            assert!(*out == 0.0 || (*out - 2.0).abs() < 1e-6);
            assert_eq!(out, g);
        }
    }
}
