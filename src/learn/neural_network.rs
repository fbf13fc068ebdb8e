//!
/*!
Feed-forward networks and their training loop.

A [`Network`] is an ordered sequence of [`Layer`]s, input layer first. The
[`Learner`] drives mini-batch gradient descent over a
[`DataLoader`](crate::dataset::DataLoader): per batch it swaps in a prepared
buffer, accumulates per-sample gradients (optionally across a worker pool),
averages, clips by global norm and hands the result to an
[`Optimizer`](optimizer::Optimizer).
*/
use crate::{
    dataset::{DataLoader, DataPoint},
    learn::{ConstantLr, LrSchedule, NullSink, Progress, ProgressSink, Stats},
};
use activation::Activation;
use anyhow::{bail, ensure, Result};
use layer::Layer;
use ndarray::{Array1, Array2, Zip};
use optimizer::Optimizer;
use rand::{
    distributions::{Distribution, Uniform},
    Rng,
};
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Activation functions.
pub mod activation;
/// Layers.
pub mod layer;
/// Optimizers.
pub mod optimizer;
/// Weight persistence.
pub mod saved;

/// Raised when a supplied vector or stored tensor does not match the
/// network's declared shape.
#[derive(Debug, Error)]
#[error("Shape mismatch: expected {expected}, found {found}!")]
pub struct ShapeMismatch {
    /// The length the network declares.
    pub expected: usize,
    /// The length that was supplied.
    pub found: usize,
}

/// Weight initialization method.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Init {
    /// Uniform in `[-limit, limit]` with `limit = sqrt(6 / (fan_in + fan_out))`.
    XavierUniform,
    /// Normal with `stddev = sqrt(2 / fan_in)`.
    HeNormal,
}

/// A fully connected feed-forward network.
///
/// Layers are ordered input first, with at least one trainable layer.
/// Adjacent layers are shape compatible: layer `l`'s weight matrix has one
/// column per neuron of layer `l - 1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    /// Creates a network with an input layer and one trainable output layer.
    pub fn new(input_size: usize, output_size: usize, output_activation: Activation) -> Self {
        Self {
            layers: vec![
                Layer::input(input_size),
                Layer::new(output_size, output_activation),
            ],
        }
    }
    /// Inserts a trainable layer before the output layer.
    pub fn add_layer(mut self, size: usize, activation: Activation) -> Self {
        let index = self.layers.len() - 1;
        self.layers.insert(index, Layer::new(size, activation));
        self
    }
    pub(crate) fn from_layers(layers: Vec<Layer>) -> Result<Self> {
        ensure!(
            layers.len() >= 2,
            "A network needs an input layer and at least one trainable layer!"
        );
        Ok(Self { layers })
    }
    /// The layers, input first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
    /// Mutable access to the layer at `index`.
    pub fn layer_mut(&mut self, index: usize) -> &mut Layer {
        &mut self.layers[index]
    }
    pub(crate) fn trainable_layers_mut(&mut self) -> impl Iterator<Item = &mut Layer> + '_ {
        self.layers.iter_mut().skip(1)
    }
    /// Initializes the weights; biases start at zero.
    ///
    /// See [`.init_with_rng()`](Self::init_with_rng).
    pub fn init(&mut self, init: Init) {
        self.init_with_rng(init, &mut rand::thread_rng());
    }
    /// Initializes the weights with `rng`; biases start at zero.
    ///
    /// Call once before training; re-initializing discards learned
    /// parameters.
    pub fn init_with_rng<R: Rng + ?Sized>(&mut self, init: Init, rng: &mut R) {
        for l in 1..self.layers.len() {
            let fan_in = self.layers[l - 1].size();
            let layer = &mut self.layers[l];
            let fan_out = layer.size();
            layer.construct(fan_in);
            match init {
                Init::XavierUniform => {
                    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                    let dist = Uniform::new_inclusive(-limit, limit);
                    for w in layer.weights_mut().iter_mut() {
                        *w = dist.sample(rng);
                    }
                }
                Init::HeNormal => {
                    let std_dev = (2.0 / fan_in.max(1) as f32).sqrt();
                    let dist = Normal::new(0.0, std_dev).unwrap();
                    for w in layer.weights_mut().iter_mut() {
                        *w = dist.sample(rng);
                    }
                }
            }
            layer.biases_mut().fill(0.0);
        }
    }
    /// Binds the input layer to `input`.
    ///
    /// **Errors**
    ///
    /// [`ShapeMismatch`] if the sample length differs from the input layer's
    /// size.
    pub fn load(&mut self, input: &Array1<f32>) -> Result<()> {
        let size = self.layers[0].size();
        ensure!(
            input.len() == size,
            ShapeMismatch {
                expected: size,
                found: input.len(),
            }
        );
        self.layers[0].bind_input(input);
        Ok(())
    }
    /// Runs every layer's forward computation in order.
    pub fn forward_pass(&mut self) {
        for l in 1..self.layers.len() {
            let (prev, rest) = self.layers.split_at_mut(l);
            rest[0].forward(&prev[l - 1]);
        }
    }
    /// The final layer's activated output.
    pub fn output(&self) -> &Array1<f32> {
        self.layers[self.layers.len() - 1].activated()
    }
    /// Zeroes every layer's gradient buffers.
    pub fn zero_grad(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.zero_grad();
        }
    }
    /// Rescales the gradients when their global L2 norm exceeds `max_norm`.
    ///
    /// No-op when the norm is zero or already within the bound.
    pub fn clip_grad(&mut self, max_norm: f32) {
        let mut sum_sq = 0.0f32;
        for layer in self.layers.iter() {
            sum_sq += layer.weight_grad().iter().map(|g| g * g).sum::<f32>();
            sum_sq += layer.bias_grad().iter().map(|g| g * g).sum::<f32>();
        }
        let norm = sum_sq.sqrt();
        if norm > max_norm && norm > 0.0 {
            let scale = max_norm / norm;
            for layer in self.layers.iter_mut() {
                layer.weight_grad_mut().mapv_inplace(|g| g * scale);
                layer.bias_grad_mut().mapv_inplace(|g| g * scale);
            }
        }
    }
}

/// Per-batch gradient accumulator mirroring the trainable layers.
///
/// Contributions are summed across samples (and merged across workers)
/// before [`.apply()`](Self::apply) divides by the batch size and adds the
/// mean into the network's gradient buffers.
#[derive(Clone, Debug)]
pub struct GradientBuffer {
    weights: Vec<Array2<f32>>,
    biases: Vec<Array1<f32>>,
}

impl GradientBuffer {
    /// A zeroed buffer shaped like `network`'s trainable layers.
    pub fn zeros_like(network: &Network) -> Self {
        let mut weights = Vec::with_capacity(network.layers().len() - 1);
        let mut biases = Vec::with_capacity(network.layers().len() - 1);
        for layer in network.layers().iter().skip(1) {
            weights.push(Array2::zeros(layer.weights().raw_dim()));
            biases.push(Array1::zeros(layer.size()));
        }
        Self { weights, biases }
    }
    /// Adds one sample's contribution from the deltas of a backward pass.
    pub(crate) fn accumulate(&mut self, network: &Network, deltas: &[Array1<f32>]) {
        for l in 0..self.weights.len() {
            let delta = &deltas[l + 1];
            let prev = network.layers()[l].activated();
            Zip::from(self.weights[l].rows_mut())
                .and(delta)
                .for_each(|mut row, &d| row.scaled_add(d, prev));
            self.biases[l] += delta;
        }
    }
    /// Sums `other` into this buffer.
    pub(crate) fn merge(&mut self, other: &GradientBuffer) {
        for (weights, other) in self.weights.iter_mut().zip(other.weights.iter()) {
            *weights += other;
        }
        for (biases, other) in self.biases.iter_mut().zip(other.biases.iter()) {
            *biases += other;
        }
    }
    /// Adds the mean over `batch_size` samples into the network's gradient
    /// buffers.
    pub fn apply(&self, network: &mut Network, batch_size: usize) {
        let scale = 1.0 / batch_size.max(1) as f32;
        for (layer, (weights, biases)) in network
            .trainable_layers_mut()
            .zip(self.weights.iter().zip(self.biases.iter()))
        {
            layer.weight_grad_mut().scaled_add(scale, weights);
            layer.bias_grad_mut().scaled_add(scale, biases);
        }
    }
}

/// Mean squared error of the output layer against `target`.
///
/// # Panics
/// Panics if any `activated - target` term is not finite; a non-finite term
/// means the run has diverged.
pub fn mse(output: &Layer, target: &Array1<f32>) -> f32 {
    assert_eq!(output.size(), target.len());
    let mut loss = 0.0;
    for (&a, &t) in output.activated().iter().zip(target.iter()) {
        let diff = a - t;
        assert!(diff.is_finite(), "Non-finite loss term!");
        loss += diff * diff;
    }
    loss / output.size().max(1) as f32
}

fn mse_deriv(output: &Layer, target: &Array1<f32>) -> Array1<f32> {
    let size = output.size().max(1) as f32;
    Zip::from(output.activated())
        .and(target)
        .map_collect(|&a, &t| {
            let diff = a - t;
            assert!(diff.is_finite(), "Non-finite loss term!");
            2.0 * diff / size
        })
}

/// Computes per-layer error terms for `target` from the network's current
/// forward state.
///
/// The output layer takes the mean-squared-error derivative directly; hidden
/// layers backpropagate through the next layer's weights and the activation
/// derivative (a function of the activated output).
///
/// **Errors**
///
/// A hidden layer whose activation has no derivative (softmax) is a
/// configuration error.
pub fn backward(network: &Network, target: &Array1<f32>) -> Result<Vec<Array1<f32>>> {
    let layers = network.layers();
    let last = layers.len() - 1;
    ensure!(
        target.len() == layers[last].size(),
        ShapeMismatch {
            expected: layers[last].size(),
            found: target.len(),
        }
    );
    let mut deltas: Vec<Array1<f32>> = layers.iter().map(|l| Array1::zeros(l.size())).collect();
    deltas[last] = mse_deriv(&layers[last], target);
    for l in (1..last).rev() {
        let error = layers[l + 1].weights().t().dot(&deltas[l + 1]);
        let layer = &layers[l];
        let activation = layer.activation();
        let mut delta = Array1::zeros(layer.size());
        for ((d, &e), &a) in delta
            .iter_mut()
            .zip(error.iter())
            .zip(layer.activated().iter())
        {
            *d = e * activation.derivative(a)?;
        }
        deltas[l] = delta;
    }
    Ok(deltas)
}

fn argmax(values: &Array1<f32>) -> usize {
    let mut max = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[max] {
            max = i;
        }
    }
    max
}

fn is_correct(output: &Array1<f32>, target: &Array1<f32>) -> bool {
    argmax(output) == argmax(target)
}

fn process_samples<'a>(
    network: &mut Network,
    samples: impl Iterator<Item = &'a DataPoint>,
) -> Result<(GradientBuffer, Stats)> {
    let mut grads = GradientBuffer::zeros_like(network);
    let mut stats = Stats::default();
    for sample in samples {
        network.load(&sample.input)?;
        network.forward_pass();
        let last = network.layers().len() - 1;
        stats.record(
            mse(&network.layers()[last], &sample.target),
            is_correct(network.output(), &sample.target),
        );
        let deltas = backward(network, &sample.target)?;
        grads.accumulate(network, &deltas);
    }
    Ok((grads, stats))
}

/// Fans the batch out over the rayon pool.
///
/// Every worker owns a private network clone and gradient accumulator, so
/// the parallel region shares nothing mutable; results are merged
/// single-threaded afterwards.
fn process_batch_parallel(
    network: &Network,
    samples: &[DataPoint],
    workers: usize,
) -> Result<(GradientBuffer, Stats)> {
    let workers = workers
        .min(rayon::current_num_threads())
        .min(samples.len())
        .max(1);
    let (tx, rx) = crossbeam_channel::bounded(workers);
    rayon::in_place_scope(|scope| {
        scope.spawn_broadcast(|_scope, context| {
            let worker = context.index();
            if worker >= workers {
                return;
            }
            let mut worker_net = network.clone();
            let result = process_samples(
                &mut worker_net,
                samples.iter().skip(worker).step_by(workers),
            );
            let _ = tx.clone().send(result);
        });
    });
    drop(tx);
    let mut merged: Option<(GradientBuffer, Stats)> = None;
    for result in rx {
        let (grads, stats) = result?;
        match merged.as_mut() {
            Some((merged_grads, merged_stats)) => {
                merged_grads.merge(&grads);
                merged_stats.merge(&stats);
            }
            None => merged = Some((grads, stats)),
        }
    }
    match merged {
        Some(result) => Ok(result),
        None => bail!("Worker pool produced no results!"),
    }
}

fn train_one_batch<D: DataLoader, O: Optimizer>(
    network: &mut Network,
    loader: &mut D,
    optimizer: &mut O,
    batch_size: usize,
    lr: f32,
) -> Result<f32> {
    loader.load_batch(batch_size)?;
    optimizer.zero_grad(network);
    let mut samples = Vec::with_capacity(batch_size);
    while loader.has_next() {
        samples.push(loader.next());
    }
    let (grads, stats) = process_samples(network, samples.iter())?;
    grads.apply(network, samples.len());
    optimizer.clip_grad(network, 1.0);
    optimizer.step(network, lr);
    Ok(stats.mean_loss())
}

/// Options for [`Learner::find_lr`].
#[derive(Clone, Copy, Debug)]
pub struct FindLrOptions {
    /// Learning rate used for the warm-up epoch.
    pub base_lr: f32,
    /// Start of the sweep.
    pub lower_lr: f32,
    /// End of the sweep.
    pub upper_lr: f32,
    /// Number of batches swept.
    pub num_iters: usize,
    /// Stop once the loss exceeds four times the best seen.
    pub stop_early: bool,
}

impl Default for FindLrOptions {
    fn default() -> Self {
        Self {
            base_lr: 1e-3,
            lower_lr: 1e-7,
            upper_lr: 10.0,
            num_iters: 100,
            stop_early: true,
        }
    }
}

fn lr_finder_should_stop(loss: f32, best_loss: f32) -> bool {
    loss > 4.0 * best_loss
}

fn lr_at_min_loss(lrs: &[f32], losses: &[f32]) -> f32 {
    let mut min = 0;
    for (i, &loss) in losses.iter().enumerate() {
        if loss < losses[min] {
            min = i;
        }
    }
    lrs[min]
}

/// Orchestrates mini-batch training.
///
/// Owns the network, the loader and the optimizer. Batches are prepared by
/// the loader's double buffer while the previous batch trains; samples
/// within a batch are processed sequentially or across a fixed worker pool.
pub struct Learner<D, O> {
    network: Network,
    loader: D,
    optimizer: O,
    workers: usize,
}

impl<D: DataLoader, O: Optimizer + Clone> Learner<D, O> {
    /// Creates a learner.
    pub fn new(network: Network, loader: D, optimizer: O) -> Self {
        Self {
            network,
            loader,
            optimizer,
            workers: 1,
        }
    }
    /// Sets the worker pool size for intra-batch parallelism.
    ///
    /// `0` or `1` processes samples sequentially on the calling thread.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
    /// The network.
    pub fn network(&self) -> &Network {
        &self.network
    }
    /// Consumes the learner, returning the trained network.
    pub fn into_network(self) -> Network {
        self.network
    }
    /// Trains for `epochs` epochs without progress reporting.
    ///
    /// Returns the final epoch's training and test statistics.
    pub fn fit<S: LrSchedule>(&mut self, schedule: &S, epochs: usize) -> Result<(Stats, Stats)> {
        self.fit_with(schedule, epochs, &mut NullSink)
    }
    /// Trains for `epochs` epochs, reporting progress to `sink`.
    ///
    /// Per epoch: the first batch is preloaded, then for every batch the
    /// prepared buffer is swapped in, the next preload starts, gradients are
    /// accumulated over the batch, averaged, clipped to a global norm of 1
    /// and applied with the schedule's rate for the epoch. The epoch ends
    /// with an evaluation over the held-out test set.
    ///
    /// Returns the final epoch's training and test statistics.
    pub fn fit_with<S: LrSchedule>(
        &mut self,
        schedule: &S,
        epochs: usize,
        sink: &mut dyn ProgressSink,
    ) -> Result<(Stats, Stats)> {
        let batch_size = self.loader.batch_size();
        ensure!(batch_size > 0, "Batch size must be nonzero!");
        let batches_per_epoch = self.loader.num_samples() / batch_size as u64;
        ensure!(
            batches_per_epoch > 0,
            "Not enough samples ({}) for one batch of {batch_size}!",
            self.loader.num_samples(),
        );
        let start = Instant::now();
        let mut train = Stats::default();
        let mut test = Stats::default();
        for epoch in 0..epochs {
            train = Stats::default();
            let lr = schedule.lr(epoch);
            self.loader.async_preload(batch_size)?;
            for batch in 0..batches_per_epoch {
                self.loader.wait_for_batch()?;
                self.loader.swap_buffers();
                if batch + 1 < batches_per_epoch {
                    self.loader.async_preload(batch_size)?;
                }
                self.optimizer.zero_grad(&mut self.network);
                let mut samples = Vec::with_capacity(batch_size);
                for _ in 0..batch_size {
                    samples.push(self.loader.next());
                }
                let (grads, stats) = if self.workers > 1 && samples.len() > 1 {
                    process_batch_parallel(&self.network, &samples, self.workers)?
                } else {
                    process_samples(&mut self.network, samples.iter())?
                };
                grads.apply(&mut self.network, samples.len());
                self.optimizer.clip_grad(&mut self.network, 1.0);
                self.optimizer.step(&mut self.network, lr);
                train.merge(&stats);
                sink.report(&Progress {
                    epoch,
                    batch: batch + 1,
                    batches: batches_per_epoch,
                    train_loss: train.mean_loss(),
                    train_accuracy: train.accuracy(),
                    test_loss: None,
                    test_accuracy: None,
                    elapsed: start.elapsed(),
                });
            }
            test = self.evaluate()?;
            sink.report(&Progress {
                epoch,
                batch: batches_per_epoch,
                batches: batches_per_epoch,
                train_loss: train.mean_loss(),
                train_accuracy: train.accuracy(),
                test_loss: Some(test.mean_loss()),
                test_accuracy: Some(test.accuracy()),
                elapsed: start.elapsed(),
            });
        }
        Ok((train, test))
    }
    /// Runs a forward-only pass over the held-out test set.
    ///
    /// An empty test set yields neutral statistics rather than failing.
    pub fn evaluate(&mut self) -> Result<Stats> {
        self.loader.load_test_set()?;
        let mut stats = Stats::default();
        while self.loader.has_next() {
            let sample = self.loader.next();
            self.network.load(&sample.input)?;
            self.network.forward_pass();
            let last = self.network.layers().len() - 1;
            stats.record(
                mse(&self.network.layers()[last], &sample.target),
                is_correct(self.network.output(), &sample.target),
            );
        }
        Ok(stats)
    }
    /// Sweeps the learning rate geometrically from `lower_lr` to `upper_lr`
    /// and returns the rate with the lowest recorded batch loss.
    ///
    /// Runs sequentially over disposable copies of the network and the
    /// optimizer; the learner's own state is untouched apart from consuming
    /// loader batches. Each sweep iteration starts from a fresh optimizer
    /// clone so momentum does not leak between rates. Stops early once the
    /// loss exceeds four times the best seen, unless disabled.
    pub fn find_lr(&mut self, options: &FindLrOptions) -> Result<f32> {
        ensure!(options.num_iters > 0, "num_iters must be nonzero!");
        let batch_size = self.loader.batch_size();
        ensure!(batch_size > 0, "Batch size must be nonzero!");
        let mult = (options.upper_lr / options.lower_lr).powf(1.0 / options.num_iters as f32);
        let mut network = self.network.clone();
        // Warm up the disposable copy for one epoch at the base rate.
        let warmup = ConstantLr(options.base_lr);
        let mut warmup_optimizer = self.optimizer.clone();
        let warmup_batches = (self.loader.num_samples() / batch_size as u64).max(1);
        for _ in 0..warmup_batches {
            train_one_batch(
                &mut network,
                &mut self.loader,
                &mut warmup_optimizer,
                batch_size,
                warmup.lr(0),
            )?;
        }
        let mut lr = options.lower_lr;
        let mut best_loss = f32::INFINITY;
        let mut lrs = Vec::with_capacity(options.num_iters);
        let mut losses = Vec::with_capacity(options.num_iters);
        for _ in 0..options.num_iters {
            let mut optimizer = self.optimizer.clone();
            let loss = train_one_batch(&mut network, &mut self.loader, &mut optimizer, batch_size, lr)?;
            lrs.push(lr);
            losses.push(loss);
            if loss < best_loss {
                best_loss = loss;
            }
            if options.stop_early && lr_finder_should_stop(loss, best_loss) {
                break;
            }
            lr *= mult;
        }
        Ok(lr_at_min_loss(&lrs, &losses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    fn loss_of(mut network: Network, input: &Array1<f32>, target: &Array1<f32>) -> f32 {
        network.load(input).unwrap();
        network.forward_pass();
        let last = network.layers().len() - 1;
        mse(&network.layers()[last], target)
    }

    fn fixture_network() -> Network {
        let mut network =
            Network::new(3, 2, Activation::Identity).add_layer(3, Activation::Relu);
        let mut rng = StdRng::seed_from_u64(11);
        network.init_with_rng(Init::XavierUniform, &mut rng);
        // Fixed weights keep every hidden pre-activation well away from the
        // ReLU kink so finite differences stay on one side of it.
        network
            .layer_mut(1)
            .weights_mut()
            .assign(&array![[0.5, -0.2, 0.1], [-0.3, 0.4, 0.6], [-0.5, 0.2, -0.4]]);
        network
            .layer_mut(1)
            .biases_mut()
            .assign(&array![0.05, -0.1, -0.2]);
        network
            .layer_mut(2)
            .weights_mut()
            .assign(&array![[0.7, -0.4, 0.2], [0.1, 0.9, -0.3]]);
        network.layer_mut(2).biases_mut().assign(&array![0.1, -0.2]);
        network
    }

    #[test]
    fn network_shapes_after_init() {
        let mut network =
            Network::new(4, 2, Activation::Softmax).add_layer(8, Activation::Relu);
        let mut rng = StdRng::seed_from_u64(0);
        network.init_with_rng(Init::HeNormal, &mut rng);
        let layers = network.layers();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[1].weights().dim(), (8, 4));
        assert_eq!(layers[2].weights().dim(), (2, 8));
        assert!(layers[1].biases().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn xavier_init_respects_limit() {
        let mut network = Network::new(6, 4, Activation::Identity);
        let mut rng = StdRng::seed_from_u64(3);
        network.init_with_rng(Init::XavierUniform, &mut rng);
        let limit = (6.0f32 / (6 + 4) as f32).sqrt();
        assert!(network.layers()[1]
            .weights()
            .iter()
            .all(|&w| w.abs() <= limit));
    }

    #[test]
    fn load_rejects_wrong_length() {
        let mut network = Network::new(3, 2, Activation::Identity);
        assert!(network.load(&array![1.0, 2.0]).is_err());
        assert!(network.load(&array![1.0, 2.0, 3.0]).is_ok());
    }

    #[test]
    fn backward_rejects_hidden_softmax() {
        let mut network =
            Network::new(3, 2, Activation::Identity).add_layer(3, Activation::Softmax);
        let mut rng = StdRng::seed_from_u64(5);
        network.init_with_rng(Init::XavierUniform, &mut rng);
        network.load(&array![0.1, 0.2, 0.3]).unwrap();
        network.forward_pass();
        assert!(backward(&network, &array![1.0, 0.0]).is_err());
    }

    #[test]
    fn gradient_check_matches_finite_differences() {
        let network = fixture_network();
        let input = array![0.3, -0.7, 0.9];
        let target = array![1.0, 0.0];
        let mut forward = network.clone();
        forward.load(&input).unwrap();
        forward.forward_pass();
        let deltas = backward(&forward, &target).unwrap();
        let mut grads = GradientBuffer::zeros_like(&forward);
        grads.accumulate(&forward, &deltas);
        let h = 1e-2f32;
        for l in 1..network.layers().len() {
            let (rows, cols) = network.layers()[l].weights().dim();
            for i in 0..rows {
                for j in 0..cols {
                    let mut plus = network.clone();
                    plus.layer_mut(l).weights_mut()[[i, j]] += h;
                    let mut minus = network.clone();
                    minus.layer_mut(l).weights_mut()[[i, j]] -= h;
                    let numeric =
                        (loss_of(plus, &input, &target) - loss_of(minus, &input, &target))
                            / (2.0 * h);
                    let analytic = grads.weights[l - 1][[i, j]];
                    assert_relative_eq!(analytic, numeric, epsilon = 1e-3, max_relative = 1e-2);
                }
                let mut plus = network.clone();
                plus.layer_mut(l).biases_mut()[i] += h;
                let mut minus = network.clone();
                minus.layer_mut(l).biases_mut()[i] -= h;
                let numeric = (loss_of(plus, &input, &target)
                    - loss_of(minus, &input, &target))
                    / (2.0 * h);
                let analytic = grads.biases[l - 1][i];
                assert_relative_eq!(analytic, numeric, epsilon = 1e-3, max_relative = 1e-2);
            }
        }
    }

    #[test]
    fn clip_grad_bounds_global_norm() {
        let mut network = fixture_network();
        let input = array![0.3, -0.7, 0.9];
        let target = array![1.0, 0.0];
        network.load(&input).unwrap();
        network.forward_pass();
        let deltas = backward(&network, &target).unwrap();
        let mut grads = GradientBuffer::zeros_like(&network);
        grads.accumulate(&network, &deltas);
        grads.apply(&mut network, 1);
        let norm_of = |network: &Network| {
            let mut sum = 0.0f32;
            for layer in network.layers() {
                sum += layer.weight_grad().iter().map(|g| g * g).sum::<f32>();
                sum += layer.bias_grad().iter().map(|g| g * g).sum::<f32>();
            }
            sum.sqrt()
        };
        let max_norm = norm_of(&network) / 2.0;
        network.clip_grad(max_norm);
        assert!(norm_of(&network) <= max_norm + 1e-5);
    }

    #[test]
    fn clip_grad_is_noop_within_bound() {
        let mut network = fixture_network();
        network.zero_grad();
        network.layer_mut(1).weight_grad_mut()[[0, 0]] = 0.25;
        network.clip_grad(1.0);
        assert_eq!(network.layers()[1].weight_grad()[[0, 0]], 0.25);
    }

    #[test]
    fn zero_grad_resets_buffers() {
        let mut network = fixture_network();
        network.layer_mut(1).weight_grad_mut().fill(3.0);
        network.layer_mut(2).bias_grad_mut().fill(-1.0);
        network.zero_grad();
        for layer in network.layers() {
            assert!(layer.weight_grad().iter().all(|&g| g == 0.0));
            assert!(layer.bias_grad().iter().all(|&g| g == 0.0));
        }
    }

    #[test]
    fn argmax_ties_break_to_first() {
        assert_eq!(argmax(&array![1.0, 1.0, 0.5]), 0);
        assert_eq!(argmax(&array![0.1, 0.9, 0.9]), 1);
    }

    #[test]
    fn lr_finder_selects_minimum_loss() {
        let lrs = [1e-4, 1e-3, 1e-2, 1e-1];
        let losses = [0.9, 0.2, 0.4, 3.0];
        assert_eq!(lr_at_min_loss(&lrs, &losses), 1e-3);
        // Ties resolve to the first occurrence.
        assert_eq!(lr_at_min_loss(&lrs, &[0.5, 0.5, 0.5, 0.5]), 1e-4);
    }

    #[test]
    fn lr_finder_stops_exactly_above_four_times_best() {
        assert!(!lr_finder_should_stop(4.0, 1.0));
        assert!(lr_finder_should_stop(4.0 + 1e-6, 1.0));
        assert!(!lr_finder_should_stop(0.5, 1.0));
    }

    #[test]
    #[should_panic(expected = "Non-finite loss term")]
    fn non_finite_loss_is_fatal() {
        let mut network = fixture_network();
        network
            .load(&array![f32::INFINITY, 0.0, 0.0])
            .unwrap();
        network.forward_pass();
        let last = network.layers().len() - 1;
        mse(&network.layers()[last], &array![0.0, 0.0]);
    }

    #[test]
    fn gradient_accumulation_is_additive() {
        let network = fixture_network();
        let input = array![0.3, -0.7, 0.9];
        let target = array![1.0, 0.0];
        let mut forward = network.clone();
        forward.load(&input).unwrap();
        forward.forward_pass();
        let deltas = backward(&forward, &target).unwrap();
        let mut once = GradientBuffer::zeros_like(&forward);
        once.accumulate(&forward, &deltas);
        let mut twice = GradientBuffer::zeros_like(&forward);
        twice.accumulate(&forward, &deltas);
        twice.accumulate(&forward, &deltas);
        let mut merged = once.clone();
        merged.merge(&once);
        for (a, b) in twice.weights.iter().zip(merged.weights.iter()) {
            assert_relative_eq!(
                a.iter().sum::<f32>(),
                b.iter().sum::<f32>(),
                epsilon = 1e-6
            );
        }
    }
}
