//! Model, trainer and run configuration.
//!
//! All configuration is plain serde data so it can live in a JSON file:
//!
//! ```json
//! {
//!   "model": { "token_size": 100, "n": 2, "embedding_dim": 32, "heads": 4,
//!              "d_ff": 64, "dropout_rate": 0.1, "eps": 0.1, "activation": "relu" },
//!   "trainer": { "learning_rate": 0.0006, "checkpoint": "gpt.ckpt" }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GptError, Result};
use crate::layers::{Activation, BlockConfig};

/// Shape of the backbone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size
    pub token_size: usize,
    /// Number of transformer blocks
    #[serde(default = "defaults::n")]
    pub n: usize,
    #[serde(default = "defaults::embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "defaults::heads")]
    pub heads: usize,
    /// Hidden width of the feed-forward sublayer
    #[serde(default = "defaults::d_ff")]
    pub d_ff: usize,
    #[serde(default = "defaults::dropout_rate")]
    pub dropout_rate: f32,
    /// Layer norm epsilon
    #[serde(default = "defaults::eps")]
    pub eps: f32,
    #[serde(default)]
    pub activation: Activation,
    /// Seed for weight initialization
    #[serde(default)]
    pub seed: u64,
}

impl ModelConfig {
    /// Full-size defaults: 12 blocks of width 768 with 12 heads.
    pub fn new(token_size: usize) -> Self {
        Self {
            token_size,
            n: defaults::n(),
            embedding_dim: defaults::embedding_dim(),
            heads: defaults::heads(),
            d_ff: defaults::d_ff(),
            dropout_rate: defaults::dropout_rate(),
            eps: defaults::eps(),
            activation: Activation::default(),
            seed: 0,
        }
    }

    /// Small model for experiments and tests.
    pub fn tiny(token_size: usize) -> Self {
        Self {
            token_size,
            n: 2,
            embedding_dim: 16,
            heads: 2,
            d_ff: 32,
            dropout_rate: 0.0,
            eps: 1e-5,
            activation: Activation::Relu,
            seed: 42,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.token_size == 0 {
            return Err(GptError::config("token_size must be positive"));
        }
        if self.embedding_dim == 0 || self.heads == 0 || self.d_ff == 0 {
            return Err(GptError::config(
                "embedding_dim, heads and d_ff must be positive",
            ));
        }
        if self.embedding_dim % self.heads != 0 {
            return Err(GptError::config(format!(
                "embedding_dim {} is not divisible by heads {}",
                self.embedding_dim, self.heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(GptError::config("dropout_rate must be in [0, 1)"));
        }
        if self.eps <= 0.0 {
            return Err(GptError::config("eps must be positive"));
        }
        Ok(())
    }

    pub(crate) fn block_config(&self) -> BlockConfig {
        BlockConfig {
            dim: self.embedding_dim,
            heads: self.heads,
            d_ff: self.d_ff,
            dropout_rate: self.dropout_rate,
            eps: self.eps,
            activation: self.activation,
        }
    }
}

/// Where the numeric work runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// The process-wide rayon pool.
    #[default]
    Cpu,
    /// A dedicated rayon pool with this many worker threads.
    CpuThreads(usize),
}

impl Device {
    /// Run `f` on this device.
    pub fn install<R, F>(&self, f: F) -> Result<R>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match self {
            Device::Cpu => Ok(f()),
            Device::CpuThreads(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(*threads)
                    .build()?;
                Ok(pool.install(f))
            }
        }
    }
}

/// Optimizer and checkpointing settings for a trainer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "defaults::learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "defaults::beta1")]
    pub beta1: f32,
    #[serde(default = "defaults::beta2")]
    pub beta2: f32,
    #[serde(default = "defaults::epsilon")]
    pub epsilon: f32,
    #[serde(default)]
    pub weight_decay: f32,
    /// Clip the global gradient norm to this value when set
    #[serde(default)]
    pub grad_clip: Option<f32>,
    /// Default checkpoint path for save/load
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    /// Optional CSV file receiving one row per progress window
    #[serde(default)]
    pub log_csv: Option<PathBuf>,
    #[serde(default)]
    pub device: Device,
    /// Seed for batch shuffling
    #[serde(default)]
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: defaults::learning_rate(),
            beta1: defaults::beta1(),
            beta2: defaults::beta2(),
            epsilon: defaults::epsilon(),
            weight_decay: 0.0,
            grad_clip: None,
            checkpoint: None,
            log_csv: None,
            device: Device::Cpu,
            seed: 0,
        }
    }
}

impl TrainerConfig {
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(GptError::config("learning_rate must be positive"));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(GptError::config("betas must be in [0, 1)"));
        }
        if let Some(clip) = self.grad_clip {
            if clip <= 0.0 {
                return Err(GptError::config("grad_clip must be positive"));
            }
        }
        if let Device::CpuThreads(0) = self.device {
            return Err(GptError::config("device thread count must be positive"));
        }
        Ok(())
    }
}

/// Options for one `fit` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitOptions {
    #[serde(default = "defaults::one")]
    pub batch_size: usize,
    #[serde(default = "defaults::one")]
    pub epochs: usize,
    #[serde(default = "defaults::yes")]
    pub shuffle: bool,
    /// Steps per progress report
    #[serde(default = "defaults::one")]
    pub mini_batch: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            epochs: 1,
            shuffle: true,
            mini_batch: 1,
        }
    }
}

impl FitOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.mini_batch == 0 {
            return Err(GptError::config("batch_size and mini_batch must be positive"));
        }
        Ok(())
    }
}

/// Everything a command-line run needs, loadable from one JSON file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub fit: FitOptions,
    /// Classes of the fine-tune head; defaults to `token_size`
    #[serde(default)]
    pub num_classes: Option<usize>,
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&text)?;
        config.model.validate()?;
        config.trainer.validate()?;
        config.fit.validate()?;
        Ok(config)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes.unwrap_or(self.model.token_size)
    }
}

mod defaults {
    pub fn n() -> usize {
        12
    }
    pub fn embedding_dim() -> usize {
        768
    }
    pub fn heads() -> usize {
        12
    }
    pub fn d_ff() -> usize {
        2048
    }
    pub fn dropout_rate() -> f32 {
        0.1
    }
    pub fn eps() -> f32 {
        0.1
    }
    pub fn learning_rate() -> f32 {
        0.0006
    }
    pub fn beta1() -> f32 {
        0.9
    }
    pub fn beta2() -> f32 {
        0.999
    }
    pub fn epsilon() -> f32 {
        1e-8
    }
    pub fn one() -> usize {
        1
    }
    pub fn yes() -> bool {
        true
    }
}
