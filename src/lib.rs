//! GPT-style decoder with from-scratch pretraining and transfer learning.
//!
//! A GPT backbone (token embedding, sinusoidal positions, pre-norm
//! transformer blocks, output projection) implemented on a small CPU tensor
//! type with hand-written backward passes. Two trainers sit on top:
//!
//! - [`GPTPretrain`] trains the backbone on next-token prediction.
//! - [`GPT`] loads a pretrained backbone, freezes all of it except the
//!   output projection, trains a [`Classifier`] head and decodes greedily.
//!
//! # Modules
//!
//! - [`tensor`] - Row-major `f32` tensors with parallel matmul
//! - [`layers`] - Linear, layer norm, dropout, attention, feed-forward, blocks
//! - [`embedding`], [`decoder`], [`classifier`], [`model`] - The network
//! - [`mask`] - Causal and padding masks
//! - [`params`] - Named parameters, gradients and the freeze policy
//! - [`optimizer`] - Adam / AdamW over named parameters
//! - [`loss`] - Cross-entropy and perplexity
//! - [`checkpoint`] - Binary checkpoint files
//! - [`train`], [`training_logger`] - Batching, the epoch loop and progress reports
//! - [`pretrain`], [`finetune`] - The two trainers
//!
//! # Example
//!
//! ```rust,no_run
//! use gpt_transfer::{FitOptions, GPTPretrain, ModelConfig, TrainerConfig, GPT};
//! use std::path::Path;
//!
//! let model = ModelConfig::tiny(100);
//! let mut pretrain = GPTPretrain::new(&model, TrainerConfig::default().with_checkpoint("lm.ckpt"))?;
//! let corpus = vec![vec![1, 2, 3, 4, 5]; 8];
//! pretrain.fit(&corpus, &FitOptions::default())?;
//!
//! let mut gpt = GPT::new(&model, 100, TrainerConfig::default())?;
//! let inputs = vec![vec![1, 2, 3, 4]];
//! let labels = vec![vec![2, 3, 4, 5]];
//! gpt.fit(&inputs, &labels, Some(Path::new("lm.ckpt")), &FitOptions::default())?;
//! let continuation = gpt.predict(&[1, 2], 10, 0)?;
//! # Ok::<(), gpt_transfer::GptError>(())
//! ```

pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod decoder;
pub mod embedding;
pub mod error;
pub mod finetune;
pub mod layers;
pub mod loss;
pub mod mask;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod pretrain;
pub mod tensor;
pub mod train;
pub mod training_logger;

pub use checkpoint::{Checkpoint, CheckpointStatus};
pub use classifier::Classifier;
pub use config::{Device, FitOptions, ModelConfig, RunConfig, TrainerConfig};
pub use error::{GptError, Result};
pub use finetune::{GPTFineTune, GPT};
pub use layers::Activation;
pub use mask::{causal_mask, generate_mask, PAD_TOKEN};
pub use model::{GPTModel, ModelSummary};
pub use optimizer::{AdamHyperParams, AdamW, OptimizerState};
pub use params::{Gradients, ParamGroup, Parameterized, StateDict, TrainableSet};
pub use pretrain::GPTPretrain;
pub use tensor::Tensor;
pub use training_logger::{FitReport, StepMetrics, TrainingLogger, WindowReport};
