//! Activation Functions
//!
//! The feed-forward sublayer applies one of these element-wise between its
//! two projections. ReLU is the default; GELU uses the tanh approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```

use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::GptError;
use crate::tensor::Tensor;

/// Element-wise nonlinearity, selected by name in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// `max(0, x)`
    #[default]
    Relu,
    /// Tanh-approximated GELU
    Gelu,
}

impl Activation {
    pub fn forward(&self, x: &Tensor) -> Tensor {
        match self {
            Activation::Relu => x.map(|v| v.max(0.0)),
            Activation::Gelu => gelu_forward(x),
        }
    }

    /// `grad_x = grad_out * f'(x)` where `x` is the pre-activation input.
    pub fn backward(&self, grad_out: &Tensor, x: &Tensor) -> Tensor {
        match self {
            Activation::Relu => {
                let data = x
                    .data
                    .par_iter()
                    .zip(&grad_out.data)
                    .map(|(&x_val, &g)| if x_val > 0.0 { g } else { 0.0 })
                    .collect();
                Tensor::new(data, x.shape.clone())
            }
            Activation::Gelu => gelu_backward(grad_out, x),
        }
    }
}

impl FromStr for Activation {
    type Err = GptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            other => Err(GptError::config(format!("unknown activation '{other}'"))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Relu => f.write_str("relu"),
            Activation::Gelu => f.write_str("gelu"),
        }
    }
}

fn gelu_forward(x: &Tensor) -> Tensor {
    let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
    x.map(|val| 0.5 * val * (1.0 + (sqrt_2_pi * (val + 0.044715 * val.powi(3))).tanh()))
}

fn gelu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
    let grad_data: Vec<f32> = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &grad_val)| {
            let inner = sqrt_2_pi * (x_val + 0.044715 * x_val.powi(3));
            let tanh_inner = inner.tanh();
            let sech_sq = 1.0 - tanh_inner * tanh_inner;

            let grad_gelu = 0.5 * (1.0 + tanh_inner)
                + 0.5 * x_val * sech_sq * sqrt_2_pi * (1.0 + 3.0 * 0.044715 * x_val.powi(2));

            grad_val * grad_gelu
        })
        .collect();

    Tensor::new(grad_data, x.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_forward_backward() {
        let x = Tensor::new(vec![-1.0, 0.0, 2.0], vec![1, 3]);
        let y = Activation::Relu.forward(&x);
        assert_eq!(y.data, vec![0.0, 0.0, 2.0]);
        let g = Activation::Relu.backward(&Tensor::ones(vec![1, 3]), &x);
        assert_eq!(g.data, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_gelu_gradient_matches_finite_difference() {
        let eps = 1e-3;
        for &v in &[-2.0f32, -0.3, 0.0, 0.7, 3.0] {
            let x = Tensor::new(vec![v], vec![1, 1]);
            let analytic = Activation::Gelu.backward(&Tensor::ones(vec![1, 1]), &x).data[0];
            let plus = Activation::Gelu.forward(&x.add_scalar(eps)).data[0];
            let minus = Activation::Gelu.forward(&x.add_scalar(-eps)).data[0];
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((analytic - numeric).abs() < 1e-2, "x={v}");
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
        assert!("tanh".parse::<Activation>().is_err());
    }
}
