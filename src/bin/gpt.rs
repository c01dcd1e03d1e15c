//! Command-line front end for pretraining, fine-tuning and greedy decoding.
//!
//! Datasets are JSON token ids; tokenization happens elsewhere.
//!
//! ```bash
//! # corpus.json: [[1, 5, 9, 2], [1, 7, 7, 2], ...]
//! gpt pretrain --config run.json --data corpus.json
//!
//! # task.json: {"inputs": [[1, 5, 9]], "labels": [[5, 9, 2]]}
//! gpt finetune --config run.json --data task.json --pretrained lm.ckpt
//!
//! gpt predict --config run.json --prompt 1,5 --limit 20 --end-token 2
//! ```
//!
//! Set `RUST_LOG=debug` to see model summaries.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gpt_transfer::{GPTPretrain, GptError, Result, RunConfig, GPT};

#[derive(Parser)]
#[command(name = "gpt", about = "Pretrain, fine-tune and decode with a GPT-style model")]
struct Args {
    /// JSON run configuration (model, trainer and fit sections)
    #[arg(long, global = true, default_value = "run.json")]
    config: PathBuf,

    /// Override the checkpoint path from the configuration
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Next-token pretraining on a corpus of token id sequences
    Pretrain {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Fine-tune a classifier head on top of a pretrained backbone
    Finetune {
        #[arg(long)]
        data: PathBuf,
        /// Pretraining checkpoint to start from when no fine-tune checkpoint exists
        #[arg(long)]
        pretrained: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Greedy decoding from a prompt
    Predict {
        /// Comma separated token ids
        #[arg(long, value_delimiter = ',', required = true)]
        prompt: Vec<usize>,
        #[arg(long, default_value_t = 32)]
        limit: usize,
        #[arg(long)]
        end_token: usize,
    },
}

#[derive(Deserialize)]
struct LabeledData {
    inputs: Vec<Vec<usize>>,
    labels: Vec<Vec<usize>>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn run(args: Args) -> Result<()> {
    let mut run = RunConfig::from_file(&args.config)?;
    if let Some(path) = args.checkpoint {
        run.trainer.checkpoint = Some(path);
    }

    match args.command {
        Command::Pretrain {
            data,
            epochs,
            batch_size,
        } => {
            let corpus: Vec<Vec<usize>> = read_json(&data)?;
            let mut fit = run.fit.clone();
            fit.epochs = epochs.unwrap_or(fit.epochs);
            fit.batch_size = batch_size.unwrap_or(fit.batch_size);

            let mut trainer = GPTPretrain::new(&run.model, run.trainer.clone())?;
            let report = trainer.fit(&corpus, &fit)?;
            info!(
                epochs = report.final_epoch,
                last_loss = report.last_loss(),
                "pretraining finished"
            );
        }
        Command::Finetune {
            data,
            pretrained,
            epochs,
            batch_size,
        } => {
            let task: LabeledData = read_json(&data)?;
            let mut fit = run.fit.clone();
            fit.epochs = epochs.unwrap_or(fit.epochs);
            fit.batch_size = batch_size.unwrap_or(fit.batch_size);

            let mut gpt = GPT::new(&run.model, run.num_classes(), run.trainer.clone())?;
            let report = gpt.fit(&task.inputs, &task.labels, pretrained.as_deref(), &fit)?;
            info!(
                epochs = report.final_epoch,
                last_loss = report.last_loss(),
                "fine-tuning finished"
            );
        }
        Command::Predict {
            prompt,
            limit,
            end_token,
        } => {
            if run.trainer.checkpoint.is_none() {
                return Err(GptError::config("predict needs a checkpoint"));
            }
            let gpt = GPT::new(&run.model, run.num_classes(), run.trainer.clone())?;
            let tokens = gpt.predict(&prompt, limit, end_token)?;
            println!("{}", serde_json::to_string(&tokens)?);
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
