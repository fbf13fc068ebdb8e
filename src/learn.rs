use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Neural networks.
pub mod neural_network;

/// Training / Testing statistics.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    loss: f32,
    correct: usize,
}

impl Stats {
    /// The number of samples seen.
    pub fn count(&self) -> usize {
        self.count
    }
    /// Mean loss over the samples seen; zero when empty.
    pub fn mean_loss(&self) -> f32 {
        self.loss / self.count.max(1) as f32
    }
    /// Fraction of correct predictions; zero when empty.
    pub fn accuracy(&self) -> f32 {
        self.correct as f32 / self.count.max(1) as f32
    }
    pub(crate) fn record(&mut self, loss: f32, correct: bool) {
        self.count += 1;
        self.loss += loss;
        self.correct += correct as usize;
    }
    pub(crate) fn merge(&mut self, other: &Stats) {
        self.count += other.count;
        self.loss += other.loss;
        self.correct += other.correct;
    }
}

/// Learning rate schedule.
pub trait LrSchedule {
    /// Returns the learning rate for `epoch`.
    fn lr(&self, epoch: usize) -> f32;
}

/// Constant learning rate.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ConstantLr(pub f32);

impl LrSchedule for ConstantLr {
    fn lr(&self, _epoch: usize) -> f32 {
        self.0
    }
}

/// A progress report handed to a [`ProgressSink`] after every batch.
///
/// `test_loss` / `test_accuracy` are present only on the end-of-epoch report.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Progress {
    /// Zero-based epoch.
    pub epoch: usize,
    /// Batches completed within the epoch.
    pub batch: u64,
    /// Batches per epoch.
    pub batches: u64,
    /// Running mean training loss for the epoch.
    pub train_loss: f32,
    /// Running training accuracy for the epoch.
    pub train_accuracy: f32,
    /// Mean loss over the held-out test set.
    pub test_loss: Option<f32>,
    /// Accuracy over the held-out test set.
    pub test_accuracy: Option<f32>,
    /// Time since training started.
    pub elapsed: Duration,
}

/// Receives training progress.
///
/// The learner tolerates any sink, including one that does nothing.
pub trait ProgressSink {
    /// Called after every batch and once more at the end of each epoch.
    fn report(&mut self, progress: &Progress);
}

/// Discards all reports.
#[derive(Default, Debug)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&mut self, _progress: &Progress) {}
}

/// Renders progress as a console bar with per-epoch summary lines.
#[derive(Default)]
pub struct ConsoleSink {
    bar: Option<ProgressBar>,
}

impl ConsoleSink {
    /// Creates the sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for ConsoleSink {
    fn report(&mut self, progress: &Progress) {
        let bar = self.bar.get_or_insert_with(|| {
            let style = ProgressStyle::with_template(
                "{prefix:>8} {bar:40} {pos}/{len} batches {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            ProgressBar::new(progress.batches.max(1)).with_style(style)
        });
        bar.set_prefix(format!("epoch {}", progress.epoch));
        bar.set_position(progress.batch);
        bar.set_message(format!(
            "loss {:.5} acc {:.2}%",
            progress.train_loss,
            progress.train_accuracy * 100.0,
        ));
        if let (Some(test_loss), Some(test_accuracy)) = (progress.test_loss, progress.test_accuracy)
        {
            bar.finish_and_clear();
            self.bar = None;
            println!(
                "epoch {:>4}  train loss {:.5}  test loss {:.5}  train acc {:.2}%  test acc {:.2}%  ({:.1?})",
                progress.epoch,
                progress.train_loss,
                test_loss,
                progress.train_accuracy * 100.0,
                test_accuracy * 100.0,
                progress.elapsed,
            );
        }
    }
}
