//! Training progress windows and the CSV training log.
//!
//! A fit reports progress every `mini_batch` optimizer steps and on the last
//! batch of each epoch. Each report carries the mean loss (and, for
//! language-model training, the mean perplexity) over the steps of the
//! window that just closed.
//!
//! ## Perplexity
//!
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! A perfect model scores 1.0. Uniform guessing over a vocabulary of `V`
//! tokens scores `V`.
//!
//! ## CSV Format
//!
//! When a log path is configured every report is also appended to a CSV file
//! with the columns `epoch,batch,loss,perplexity,elapsed_seconds`. The
//! perplexity column is empty for classifier training.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::error::Result;

/// Loss of one optimizer step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StepMetrics {
    pub loss: f32,
    pub perplexity: Option<f32>,
}

/// One progress report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WindowReport {
    /// 1-based epoch
    pub epoch: usize,
    /// 1-based batch index within the epoch
    pub batch: usize,
    pub loss: f32,
    pub perplexity: Option<f32>,
    /// Steps averaged into this report
    pub steps: usize,
}

/// Outcome of a `fit` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FitReport {
    pub windows: Vec<WindowReport>,
    pub epochs_completed: usize,
    /// Epoch counter after the fit, including epochs from earlier runs
    pub final_epoch: usize,
}

impl FitReport {
    pub fn last_loss(&self) -> Option<f32> {
        self.windows.last().map(|w| w.loss)
    }
}

/// Running sums for the current window.
#[derive(Debug, Default)]
pub struct ProgressWindow {
    loss: f32,
    perplexity: f32,
    has_perplexity: bool,
    steps: usize,
}

impl ProgressWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: StepMetrics) {
        if self.steps == 0 {
            self.has_perplexity = metrics.perplexity.is_some();
        }
        self.loss += metrics.loss;
        match metrics.perplexity {
            Some(p) => self.perplexity += p,
            None => self.has_perplexity = false,
        }
        self.steps += 1;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Whether the step at `batch_index` (0-based) closes a window.
    pub fn closes(batch_index: usize, num_batches: usize, mini_batch: usize) -> bool {
        batch_index % mini_batch == mini_batch - 1 || batch_index + 1 == num_batches
    }

    /// Close the window and reset it; `None` if no step was recorded.
    pub fn take(&mut self, epoch: usize, batch: usize) -> Option<WindowReport> {
        if self.steps == 0 {
            return None;
        }
        let n = self.steps as f32;
        let report = WindowReport {
            epoch,
            batch,
            loss: self.loss / n,
            perplexity: self.has_perplexity.then(|| self.perplexity / n),
            steps: self.steps,
        };
        *self = Self::default();
        Some(report)
    }
}

/// Emit a report through `tracing`.
pub fn log_window(report: &WindowReport) {
    match report.perplexity {
        Some(perplexity) => info!(
            epoch = report.epoch,
            batch = report.batch,
            loss = report.loss,
            perplexity,
            "training progress"
        ),
        None => info!(
            epoch = report.epoch,
            batch = report.batch,
            loss = report.loss,
            "training progress"
        ),
    }
}

/// Appends progress reports to a CSV file.
pub struct TrainingLogger {
    out: BufWriter<File>,
    start_time: Instant,
}

impl TrainingLogger {
    /// Create (truncate) the CSV file and write the header.
    pub fn new(path: &Path) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "epoch,batch,loss,perplexity,elapsed_seconds")?;
        out.flush()?;
        Ok(Self {
            out,
            start_time: Instant::now(),
        })
    }

    pub fn log(&mut self, report: &WindowReport) -> Result<()> {
        let perplexity = report
            .perplexity
            .map(|p| format!("{p:.4}"))
            .unwrap_or_default();
        writeln!(
            self.out,
            "{},{},{:.6},{},{:.2}",
            report.epoch,
            report.batch,
            report.loss,
            perplexity,
            self.start_time.elapsed().as_secs_f32()
        )?;
        // flushed per row so a crashed run keeps its history
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(loss: f32) -> StepMetrics {
        StepMetrics {
            loss,
            perplexity: Some(loss.exp()),
        }
    }

    #[test]
    fn test_window_averages_actual_steps() {
        let mut window = ProgressWindow::new();
        window.push(step(1.0));
        window.push(step(3.0));
        let report = window.take(1, 2).unwrap();
        assert_eq!(report.steps, 2);
        assert!((report.loss - 2.0).abs() < 1e-6);
        let expected = (1f32.exp() + 3f32.exp()) / 2.0;
        assert!((report.perplexity.unwrap() - expected).abs() < 1e-4);

        assert_eq!(window.steps(), 0);
        assert!(window.take(1, 3).is_none());
    }

    #[test]
    fn test_window_without_perplexity() {
        let mut window = ProgressWindow::new();
        window.push(StepMetrics {
            loss: 0.5,
            perplexity: None,
        });
        assert_eq!(window.take(2, 1).unwrap().perplexity, None);
    }

    #[test]
    fn test_window_boundaries() {
        // 5 batches, windows of 2: closes after batches 1, 3 and the last one
        let closing: Vec<_> = (0..5)
            .filter(|&i| ProgressWindow::closes(i, 5, 2))
            .collect();
        assert_eq!(closing, vec![1, 3, 4]);
        assert!((0..3).all(|i| ProgressWindow::closes(i, 3, 1)));
    }

    #[test]
    fn test_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut logger = TrainingLogger::new(&path).unwrap();
        logger
            .log(&WindowReport {
                epoch: 1,
                batch: 4,
                loss: 0.25,
                perplexity: None,
                steps: 4,
            })
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "epoch,batch,loss,perplexity,elapsed_seconds");
        assert!(lines[1].starts_with("1,4,0.250000,,"));
    }
}
