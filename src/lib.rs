//!
/*!
Mini-batch training for fully connected feed-forward networks.

The training engine lives in [`learn::neural_network`]: layers with explicit
forward/backward math, pluggable [optimizers](learn::neural_network::optimizer),
and a [`Learner`](learn::neural_network::Learner) that orchestrates epochs,
batches and an optional worker pool. Samples are supplied through the
double-buffered loaders in [`dataset`], which overlap sample preparation with
training.

# Example
```no_run
use backprop::{
    dataset::{directory::{decode_gray_bytes, DirectorySource}, BufferedLoader},
    learn::{
        neural_network::{activation::Activation, optimizer::Sgd, Init, Learner, Network},
        ConstantLr,
    },
    result::Result,
};

fn main() -> Result<()> {
    let source = DirectorySource::scan("data", decode_gray_bytes)?;
    let loader = BufferedLoader::builder(source)
        .batch_size(64)
        .train_split(0.8)
        .build()?;
    let mut network = Network::new(28 * 28, 10, Activation::Softmax)
        .add_layer(64, Activation::Relu);
    network.init(Init::HeNormal);
    let mut learner = Learner::new(network, loader, Sgd::builder().build());
    learner.fit(&ConstantLr(0.01), 10)?;
    Ok(())
}
```
*/

/// Datasets and loaders.
pub mod dataset;
/// Training.
pub mod learn;

/// Result type.
pub mod result {
    /// Type alias for [`anyhow::Result`].
    pub type Result<T, E = anyhow::Error> = anyhow::Result<T, E>;
}
