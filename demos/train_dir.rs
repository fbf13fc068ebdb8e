//! Trains a classifier on a directory dataset of raw grayscale samples.
//!
//! Each immediate subdirectory of `--data` is one class; every file inside
//! is one sample, decoded as raw 8-bit grayscale bytes.

use anyhow::Result;
use backprop::{
    dataset::{
        directory::{decode_gray_bytes, DirectorySource},
        BufferedLoader, DataLoader, SampleSource,
    },
    learn::{
        neural_network::{
            activation::Activation,
            optimizer::{Adam, Optimizer, RmsProp, Sgd},
            saved::save_weights,
            Init, Learner, Network,
        },
        ConsoleSink, ConstantLr,
    },
};
use clap::{Parser, ValueEnum};
use num_format::{Locale, ToFormattedString};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OptimizerKind {
    Sgd,
    RmsProp,
    Adam,
}

#[derive(Parser, Debug)]
#[command(about = "Train a feed-forward classifier on a directory dataset.")]
struct Options {
    /// Directory with one subdirectory per class.
    #[arg(long)]
    data: PathBuf,
    /// Hidden layer size.
    #[arg(long, default_value_t = 64)]
    hidden: usize,
    /// Samples per batch.
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
    /// Fraction of each class reserved for training.
    #[arg(long, default_value_t = 0.8)]
    train_split: f32,
    /// Epochs to train.
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 0.01)]
    lr: f32,
    /// Worker threads per batch; 1 is sequential.
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Optimizer.
    #[arg(long, value_enum, default_value = "sgd")]
    optimizer: OptimizerKind,
    /// Where to save the trained weights.
    #[arg(long)]
    save: Option<PathBuf>,
}

fn train<O: Optimizer + Clone>(
    network: Network,
    loader: BufferedLoader<DirectorySource<fn(&Path) -> Result<ndarray::Array1<f32>>>>,
    optimizer: O,
    options: &Options,
) -> Result<Network> {
    let mut learner = Learner::new(network, loader, optimizer).with_workers(options.workers);
    let (train, test) =
        learner.fit_with(&ConstantLr(options.lr), options.epochs, &mut ConsoleSink::new())?;
    println!(
        "final: train loss {:.5} acc {:.2}% | test loss {:.5} acc {:.2}%",
        train.mean_loss(),
        train.accuracy() * 100.0,
        test.mean_loss(),
        test.accuracy() * 100.0,
    );
    Ok(learner.into_network())
}

fn main() -> Result<()> {
    let options = Options::parse();
    let decode = decode_gray_bytes as fn(&Path) -> Result<ndarray::Array1<f32>>;
    let source = DirectorySource::scan(&options.data, decode)?;
    let classes = source.class_count();
    anyhow::ensure!(
        classes > 0 && source.samples_per_class(0) > 0,
        "Data directory {:?} has no class subdirectories with samples!",
        options.data,
    );
    let input_size = source.sample(0, 0)?.len();
    let loader = BufferedLoader::builder(source)
        .batch_size(options.batch_size)
        .train_split(options.train_split)
        .build()?;
    println!(
        "Found {classes} classes, {} samples, {input_size} inputs",
        loader.num_samples().to_formatted_string(&Locale::en),
    );

    let mut network = Network::new(input_size, classes, Activation::Softmax)
        .add_layer(options.hidden, Activation::Relu);
    network.init(Init::HeNormal);

    let network = match options.optimizer {
        OptimizerKind::Sgd => train(network, loader, Sgd::builder().build(), &options)?,
        OptimizerKind::RmsProp => train(network, loader, RmsProp::builder().build(), &options)?,
        OptimizerKind::Adam => train(network, loader, Adam::builder().build(), &options)?,
    };

    if let Some(path) = options.save.as_ref() {
        save_weights(path, &network)?;
        println!("Saved weights to {path:?}");
    }
    Ok(())
}
