use super::Network;
use ndarray::{Array1, Array2, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Sgd`].
    pub struct SgdBuilder {
        momentum: f32,
    }

    impl SgdBuilder {
        pub(super) fn new() -> Self {
            Self { momentum: 0.9 }
        }
        /// Momentum. Default is 0.9.
        pub fn momentum(self, momentum: f32) -> Self {
            Self { momentum }
        }
        /// Builds the optimizer.
        pub fn build(self) -> Sgd {
            let Self { momentum } = self;
            Sgd {
                momentum,
                velocity: Vec::new(),
            }
        }
    }

    /// Builder for creating a [`RmsProp`].
    pub struct RmsPropBuilder {
        beta: f32,
        epsilon: f32,
    }

    impl RmsPropBuilder {
        pub(super) fn new() -> Self {
            Self {
                beta: 0.9,
                epsilon: 1e-8,
            }
        }
        /// Decay of the running squared-gradient average. Default is 0.9.
        pub fn beta(self, beta: f32) -> Self {
            Self { beta, ..self }
        }
        /// Divisor guard. Default is 1e-8.
        pub fn epsilon(self, epsilon: f32) -> Self {
            Self { epsilon, ..self }
        }
        /// Builds the optimizer.
        pub fn build(self) -> RmsProp {
            let Self { beta, epsilon } = self;
            RmsProp {
                beta,
                epsilon,
                square: Vec::new(),
            }
        }
    }

    /// Builder for creating an [`Adam`].
    pub struct AdamBuilder {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: Option<f32>,
    }

    impl AdamBuilder {
        pub(super) fn new() -> Self {
            Self {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: None,
            }
        }
        /// First-moment decay. Default is 0.9.
        pub fn beta1(self, beta1: f32) -> Self {
            Self { beta1, ..self }
        }
        /// Second-moment decay. Default is 0.999.
        pub fn beta2(self, beta2: f32) -> Self {
            Self { beta2, ..self }
        }
        /// Divisor guard. Default is 1e-8.
        pub fn epsilon(self, epsilon: f32) -> Self {
            Self { epsilon, ..self }
        }
        /// Decoupled weight decay, applied as `param *= 1 - lr * decay`
        /// before the gradient step. Default is none.
        pub fn weight_decay(self, weight_decay: f32) -> Self {
            Self {
                weight_decay: Some(weight_decay),
                ..self
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> Adam {
            let Self {
                beta1,
                beta2,
                epsilon,
                weight_decay,
            } = self;
            Adam {
                beta1,
                beta2,
                epsilon,
                weight_decay,
                iteration: 0,
                first: Vec::new(),
                second: Vec::new(),
            }
        }
    }
}
use builder::*;

/// Per-parameter auxiliary state shaped like one trainable layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LayerState {
    weights: Array2<f32>,
    biases: Array1<f32>,
}

/// Lazily (re)allocates `states` to mirror the network's trainable layers.
///
/// Existing state is kept when the shapes already match, so cloning an
/// optimizer onto a same-shaped network copy carries its progress over.
fn init_states(states: &mut Vec<LayerState>, network: &Network) {
    let matches = states.len() == network.layers().len().saturating_sub(1)
        && states
            .iter()
            .zip(network.layers().iter().skip(1))
            .all(|(state, layer)| {
                state.weights.raw_dim() == layer.weights().raw_dim()
                    && state.biases.len() == layer.size()
            });
    if matches {
        return;
    }
    states.clear();
    for layer in network.layers().iter().skip(1) {
        states.push(LayerState {
            weights: Array2::zeros(layer.weights().raw_dim()),
            biases: Array1::zeros(layer.size()),
        });
    }
}

/// Optimizer.
///
/// `step` is the only point at which the network's parameters change during
/// training. Cloning an optimizer yields independent auxiliary state, usable
/// against a (same-shaped) network copy.
pub trait Optimizer: Send {
    /// Performs the optimization, updating the parameters with
    /// `learning_rate` from the network's accumulated gradients.
    fn step(&mut self, network: &mut Network, learning_rate: f32);
    /// Resets the network's gradient buffers to zero.
    fn zero_grad(&mut self, network: &mut Network) {
        network.zero_grad();
    }
    /// Rescales the gradients so their global L2 norm is at most `max_norm`.
    fn clip_grad(&mut self, network: &mut Network, max_norm: f32) {
        network.clip_grad(max_norm);
    }
}

/// Stochastic gradient descent with momentum.
///
/// `velocity = momentum * velocity - lr * gradient; param += velocity`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sgd {
    momentum: f32,
    velocity: Vec<LayerState>,
}

impl Sgd {
    /// An SGD builder.
    pub fn builder() -> SgdBuilder {
        SgdBuilder::new()
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, network: &mut Network, learning_rate: f32) {
        init_states(&mut self.velocity, network);
        let momentum = self.momentum;
        for (layer, state) in network.trainable_layers_mut().zip(self.velocity.iter_mut()) {
            let views = layer.update_views();
            Zip::from(views.weights)
                .and(views.weight_grad)
                .and(&mut state.weights)
                .for_each(|w, &g, v| {
                    *v = momentum * *v - learning_rate * g;
                    *w += *v;
                });
            Zip::from(views.biases)
                .and(views.bias_grad)
                .and(&mut state.biases)
                .for_each(|b, &g, v| {
                    *v = momentum * *v - learning_rate * g;
                    *b += *v;
                });
        }
    }
}

/// RMSprop.
///
/// `sq = beta * sq + (1 - beta) * grad²; param -= lr * grad / (sqrt(sq) + epsilon)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RmsProp {
    beta: f32,
    epsilon: f32,
    square: Vec<LayerState>,
}

impl RmsProp {
    /// An RMSprop builder.
    pub fn builder() -> RmsPropBuilder {
        RmsPropBuilder::new()
    }
}

impl Default for RmsProp {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Optimizer for RmsProp {
    fn step(&mut self, network: &mut Network, learning_rate: f32) {
        init_states(&mut self.square, network);
        let (beta, epsilon) = (self.beta, self.epsilon);
        for (layer, state) in network.trainable_layers_mut().zip(self.square.iter_mut()) {
            let views = layer.update_views();
            Zip::from(views.weights)
                .and(views.weight_grad)
                .and(&mut state.weights)
                .for_each(|w, &g, sq| {
                    *sq = beta * *sq + (1.0 - beta) * g * g;
                    *w -= learning_rate * g / (sq.sqrt() + epsilon);
                });
            Zip::from(views.biases)
                .and(views.bias_grad)
                .and(&mut state.biases)
                .for_each(|b, &g, sq| {
                    *sq = beta * *sq + (1.0 - beta) * g * g;
                    *b -= learning_rate * g / (sq.sqrt() + epsilon);
                });
        }
    }
}

/// Adam with bias-corrected moments and optional decoupled weight decay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: Option<f32>,
    iteration: u64,
    first: Vec<LayerState>,
    second: Vec<LayerState>,
}

impl Adam {
    /// An Adam builder.
    pub fn builder() -> AdamBuilder {
        AdamBuilder::new()
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Optimizer for Adam {
    fn step(&mut self, network: &mut Network, learning_rate: f32) {
        init_states(&mut self.first, network);
        init_states(&mut self.second, network);
        self.iteration += 1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let correction1 = 1.0 - beta1.powi(self.iteration as i32);
        let correction2 = 1.0 - beta2.powi(self.iteration as i32);
        let decay = self.weight_decay;
        for ((layer, first), second) in network
            .trainable_layers_mut()
            .zip(self.first.iter_mut())
            .zip(self.second.iter_mut())
        {
            let views = layer.update_views();
            if let Some(decay) = decay {
                views.weights.mapv_inplace(|w| w * (1.0 - learning_rate * decay));
                views.biases.mapv_inplace(|b| b * (1.0 - learning_rate * decay));
            }
            Zip::from(views.weights)
                .and(views.weight_grad)
                .and(&mut first.weights)
                .and(&mut second.weights)
                .for_each(|w, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / correction1;
                    let v_hat = *v / correction2;
                    *w -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
                });
            Zip::from(views.biases)
                .and(views.bias_grad)
                .and(&mut first.biases)
                .and(&mut second.biases)
                .for_each(|b, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / correction1;
                    let v_hat = *v / correction2;
                    *b -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
                });
        }
    }
}
