//!
/*!
Sample supply for training.

A [`SampleSource`] enumerates decoded samples by class; [`BufferedLoader`]
turns one into a double-buffered [`DataLoader`] that prepares the next batch
while the current one is consumed. Ordering is enforced by the
wait → swap → preload protocol, never by locking the buffer contents: the
slot being read is never the slot an in-flight fill is writing.
*/
use anyhow::{anyhow, ensure, Result};
use crossbeam_channel::{bounded, Receiver};
use ndarray::Array1;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use std::{sync::Arc, thread};

/// Directory-tree sample sources.
pub mod directory;

/// One training sample: an input vector and a one-hot target.
#[derive(Clone, Debug, PartialEq)]
pub struct DataPoint {
    /// The input vector.
    pub input: Array1<f32>,
    /// The one-hot target; its length equals the class count.
    pub target: Array1<f32>,
}

/// Abstract sample supplier, enumerated by class.
///
/// Implementors expose a gallery of samples per class; decoding is the
/// implementor's concern.
pub trait SampleSource: Send + Sync {
    /// The number of classes.
    fn class_count(&self) -> usize;
    /// The number of samples in `class`'s gallery.
    fn samples_per_class(&self, class: usize) -> usize;
    /// Decodes the sample at `index` within `class`.
    fn sample(&self, class: usize, index: usize) -> Result<Array1<f32>>;
}

/// Double-buffered batch supplier.
///
/// The consumer drives the protocol: [`async_preload`](Self::async_preload)
/// begins filling the inactive slot, [`wait_for_batch`](Self::wait_for_batch)
/// blocks until that fill lands, and [`swap_buffers`](Self::swap_buffers)
/// makes it current. Violating the order (swapping before waiting, or
/// preloading twice) is a caller bug, not a recoverable error.
pub trait DataLoader {
    /// The configured batch size.
    fn batch_size(&self) -> usize;
    /// Total samples across all classes, training and test portions alike.
    fn num_samples(&self) -> u64;
    /// Begins filling the inactive slot with `batch_size` fresh samples.
    fn async_preload(&mut self, batch_size: usize) -> Result<()>;
    /// Blocks until the in-flight preload completes; no-op when idle.
    fn wait_for_batch(&mut self) -> Result<()>;
    /// Flips which slot is current. Call only after
    /// [`wait_for_batch`](Self::wait_for_batch).
    fn swap_buffers(&mut self);
    /// Synchronously fills the current slot with a fresh batch.
    fn load_batch(&mut self, batch_size: usize) -> Result<()>;
    /// Fills the current slot with every held-out test sample, in
    /// enumeration order.
    fn load_test_set(&mut self) -> Result<()>;
    /// Whether the current slot still holds samples.
    fn has_next(&self) -> bool;
    /// Pops the next sample from the current slot.
    ///
    /// # Panics
    /// Panics when the slot is empty.
    fn next(&mut self) -> DataPoint;
}

/// Identifies a buffer slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    A,
    B,
}

impl Slot {
    fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
    fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

enum InFlight {
    /// A background fill, resolved by `wait_for_batch`.
    Task(Receiver<Result<Vec<DataPoint>>>),
    /// A deferred synchronous fill (`threads == 0`).
    Deferred { batch_size: usize },
}

/// Builder for creating a [`BufferedLoader`].
pub mod builder {
    use super::*;

    /// Builder for creating a [`BufferedLoader`].
    pub struct BufferedLoaderBuilder<S> {
        source: S,
        batch_size: usize,
        train_split: f32,
        threads: usize,
        seed: Option<u64>,
    }

    impl<S: SampleSource> BufferedLoaderBuilder<S> {
        pub(super) fn new(source: S) -> Self {
            Self {
                source,
                batch_size: 64,
                train_split: 0.8,
                threads: 1,
                seed: None,
            }
        }
        /// Samples per batch. Default is 64.
        pub fn batch_size(self, batch_size: usize) -> Self {
            Self { batch_size, ..self }
        }
        /// Fraction of each class's gallery reserved for training; the rest
        /// forms the test set. Default is 0.8.
        pub fn train_split(self, train_split: f32) -> Self {
            Self {
                train_split,
                ..self
            }
        }
        /// Background fill threads; `0` fills synchronously on demand.
        /// Default is 1.
        pub fn threads(self, threads: usize) -> Self {
            Self { threads, ..self }
        }
        /// Seeds the sampling RNG for reproducible batches.
        pub fn seed(self, seed: u64) -> Self {
            Self {
                seed: Some(seed),
                ..self
            }
        }
        /// Builds the loader.
        ///
        /// **Errors**
        ///
        /// The batch size is zero or the train split is outside `(0, 1]`.
        pub fn build(self) -> Result<BufferedLoader<S>> {
            let Self {
                source,
                batch_size,
                train_split,
                threads,
                seed,
            } = self;
            ensure!(batch_size > 0, "Batch size must be nonzero!");
            ensure!(
                train_split > 0.0 && train_split <= 1.0,
                "Train split {train_split} must be within (0, 1]!"
            );
            let num_samples = (0..source.class_count())
                .map(|class| source.samples_per_class(class) as u64)
                .sum();
            let rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            Ok(BufferedLoader {
                source: Arc::new(source),
                batch_size,
                train_split,
                threads,
                num_samples,
                slots: [Vec::new(), Vec::new()],
                active: Slot::A,
                in_flight: None,
                rng,
            })
        }
    }
}
use builder::BufferedLoaderBuilder;

/// Double-buffered loader over a [`SampleSource`].
///
/// Owns the buffering and concurrency contract: one slot is consumed while
/// the other is populated, on a background thread when `threads > 0`. Batch
/// samples are drawn by uniformly picking a class, then uniformly picking a
/// sample within the class's training portion
/// (`floor(count * train_split)` samples are eligible).
pub struct BufferedLoader<S> {
    source: Arc<S>,
    batch_size: usize,
    train_split: f32,
    threads: usize,
    num_samples: u64,
    slots: [Vec<DataPoint>; 2],
    active: Slot,
    in_flight: Option<InFlight>,
    rng: StdRng,
}

impl<S: SampleSource + 'static> BufferedLoader<S> {
    /// A builder for creating a [`BufferedLoader`].
    pub fn builder(source: S) -> BufferedLoaderBuilder<S> {
        BufferedLoaderBuilder::new(source)
    }
    /// The sample source.
    pub fn source(&self) -> &S {
        self.source.as_ref()
    }
}

fn train_count(count: usize, train_split: f32) -> usize {
    (count as f32 * train_split) as usize
}

fn one_hot(len: usize, class: usize) -> Array1<f32> {
    let mut target = Array1::zeros(len);
    target[class] = 1.0;
    target
}

/// Draws and decodes one batch.
///
/// The (class, index) picks are drawn from `rng` up front so the sampling
/// stream is identical whether decoding runs sequentially or in parallel.
fn fill_batch<S: SampleSource>(
    source: &S,
    batch_size: usize,
    train_split: f32,
    rng: &mut StdRng,
) -> Result<Vec<DataPoint>> {
    let classes = source.class_count();
    ensure!(classes > 0, "Sample source has no classes!");
    let mut picks = Vec::with_capacity(batch_size);
    for _ in 0..batch_size {
        let class = rng.gen_range(0..classes);
        let eligible = train_count(source.samples_per_class(class), train_split);
        ensure!(eligible > 0, "Class {class} has no training samples!");
        picks.push((class, rng.gen_range(0..eligible)));
    }
    picks
        .into_par_iter()
        .map(|(class, index)| {
            let input = source.sample(class, index)?;
            Ok(DataPoint {
                input,
                target: one_hot(classes, class),
            })
        })
        .collect()
}

impl<S: SampleSource + 'static> DataLoader for BufferedLoader<S> {
    fn batch_size(&self) -> usize {
        self.batch_size
    }
    fn num_samples(&self) -> u64 {
        self.num_samples
    }
    fn async_preload(&mut self, batch_size: usize) -> Result<()> {
        assert!(
            self.in_flight.is_none(),
            "async_preload called with a preload already in flight!"
        );
        if self.threads == 0 {
            self.in_flight = Some(InFlight::Deferred { batch_size });
            return Ok(());
        }
        let source = Arc::clone(&self.source);
        let train_split = self.train_split;
        // Hand the fill thread its own seeded RNG so the sampling stream
        // stays reproducible for a seeded loader.
        let seed = self.rng.gen::<u64>();
        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name("backprop-preload".into())
            .spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let _ = tx.send(fill_batch(source.as_ref(), batch_size, train_split, &mut rng));
            })?;
        self.in_flight = Some(InFlight::Task(rx));
        Ok(())
    }
    fn wait_for_batch(&mut self) -> Result<()> {
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(());
        };
        let batch = match in_flight {
            InFlight::Task(rx) => rx
                .recv()
                .map_err(|_| anyhow!("Preload thread exited without a result!"))??,
            InFlight::Deferred { batch_size } => fill_batch(
                self.source.as_ref(),
                batch_size,
                self.train_split,
                &mut self.rng,
            )?,
        };
        self.slots[self.active.other().index()] = batch;
        Ok(())
    }
    fn swap_buffers(&mut self) {
        assert!(
            self.in_flight.is_none(),
            "swap_buffers called before wait_for_batch!"
        );
        self.active = self.active.other();
    }
    fn load_batch(&mut self, batch_size: usize) -> Result<()> {
        let batch = fill_batch(
            self.source.as_ref(),
            batch_size,
            self.train_split,
            &mut self.rng,
        )?;
        self.slots[self.active.index()] = batch;
        Ok(())
    }
    fn load_test_set(&mut self) -> Result<()> {
        let classes = self.source.class_count();
        ensure!(classes > 0, "Sample source has no classes!");
        let mut samples = Vec::new();
        for class in 0..classes {
            let count = self.source.samples_per_class(class);
            for index in train_count(count, self.train_split)..count {
                let input = self.source.sample(class, index)?;
                samples.push(DataPoint {
                    input,
                    target: one_hot(classes, class),
                });
            }
        }
        self.slots[self.active.index()] = samples;
        Ok(())
    }
    fn has_next(&self) -> bool {
        !self.slots[self.active.index()].is_empty()
    }
    fn next(&mut self) -> DataPoint {
        self.slots[self.active.index()]
            .pop()
            .expect("next() called on an empty batch!")
    }
}
