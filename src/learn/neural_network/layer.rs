use super::activation::Activation;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// One network stage.
///
/// `weights` has one row per neuron and one column per neuron of the previous
/// layer; `biases`, `pre_activation` and `activated` all have `size` entries.
/// The gradient buffers mirror the weight and bias shapes so that several
/// samples can be accumulated before a parameter update.
///
/// The input layer carries no weights, biases or gradients; its `activated`
/// vector is bound to the externally supplied sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Layer {
    size: usize,
    activation: Activation,
    weights: Array2<f32>,
    biases: Array1<f32>,
    weight_grad: Array2<f32>,
    bias_grad: Array1<f32>,
    pre_activation: Array1<f32>,
    activated: Array1<f32>,
}

impl Layer {
    /// Creates the input layer.
    pub fn input(size: usize) -> Self {
        Self {
            size,
            activation: Activation::Identity,
            weights: Array2::zeros((0, 0)),
            biases: Array1::zeros(0),
            weight_grad: Array2::zeros((0, 0)),
            bias_grad: Array1::zeros(0),
            pre_activation: Array1::zeros(size),
            activated: Array1::zeros(size),
        }
    }
    /// Creates a trainable layer.
    ///
    /// Weight storage is allocated against the previous layer by
    /// [`Network::init`](super::Network::init).
    pub fn new(size: usize, activation: Activation) -> Self {
        Self {
            size,
            activation,
            weights: Array2::zeros((size, 0)),
            biases: Array1::zeros(size),
            weight_grad: Array2::zeros((size, 0)),
            bias_grad: Array1::zeros(size),
            pre_activation: Array1::zeros(size),
            activated: Array1::zeros(size),
        }
    }
    /// Allocates weight and gradient storage for `previous_size` inputs.
    pub(crate) fn construct(&mut self, previous_size: usize) {
        self.weights = Array2::zeros((self.size, previous_size));
        self.weight_grad = Array2::zeros((self.size, previous_size));
    }
    /// The neuron count.
    pub fn size(&self) -> usize {
        self.size
    }
    /// The activation kind.
    pub fn activation(&self) -> Activation {
        self.activation
    }
    /// The weight matrix, `size × previous.size`.
    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }
    /// The bias vector.
    pub fn biases(&self) -> &Array1<f32> {
        &self.biases
    }
    /// The activated output of the last forward pass.
    pub fn activated(&self) -> &Array1<f32> {
        &self.activated
    }
    /// The pre-activation of the last forward pass.
    pub fn pre_activation(&self) -> &Array1<f32> {
        &self.pre_activation
    }
    /// The accumulated weight gradients.
    pub fn weight_grad(&self) -> &Array2<f32> {
        &self.weight_grad
    }
    /// The accumulated bias gradients.
    pub fn bias_grad(&self) -> &Array1<f32> {
        &self.bias_grad
    }
    /// Mutable access to the weights.
    pub fn weights_mut(&mut self) -> &mut Array2<f32> {
        &mut self.weights
    }
    /// Mutable access to the biases.
    pub fn biases_mut(&mut self) -> &mut Array1<f32> {
        &mut self.biases
    }
    pub(crate) fn weight_grad_mut(&mut self) -> &mut Array2<f32> {
        &mut self.weight_grad
    }
    pub(crate) fn bias_grad_mut(&mut self) -> &mut Array1<f32> {
        &mut self.bias_grad
    }
    /// Binds the input layer's output to `input`.
    pub(crate) fn bind_input(&mut self, input: &Array1<f32>) {
        self.pre_activation.assign(input);
        self.activated.assign(input);
    }
    /// Splits the layer into parameter and gradient views for an update.
    pub(crate) fn update_views(&mut self) -> UpdateViews {
        UpdateViews {
            weights: &mut self.weights,
            weight_grad: &self.weight_grad,
            biases: &mut self.biases,
            bias_grad: &self.bias_grad,
        }
    }
    /// Zeroes the gradient buffers.
    pub(crate) fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
    /// Computes this layer's output from the previous layer's.
    ///
    /// `pre_activation = biases + weights · previous.activated`, then the
    /// activation is applied. Pure in everything except the two output
    /// vectors, which are recomputed on every call.
    pub fn forward(&mut self, previous: &Layer) {
        self.pre_activation = &self.biases + &self.weights.dot(&previous.activated);
        self.activated = self.activation.apply(&self.pre_activation);
    }
}

/// Disjoint parameter / gradient borrows of one layer.
pub(crate) struct UpdateViews<'a> {
    pub weights: &'a mut Array2<f32>,
    pub weight_grad: &'a Array2<f32>,
    pub biases: &'a mut Array1<f32>,
    pub bias_grad: &'a Array1<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn construct_shapes() {
        let mut layer = Layer::new(3, Activation::Relu);
        layer.construct(5);
        assert_eq!(layer.weights().dim(), (3, 5));
        assert_eq!(layer.weight_grad().dim(), (3, 5));
        assert_eq!(layer.biases().len(), 3);
        assert_eq!(layer.bias_grad().len(), 3);
    }

    #[test]
    fn forward_output_length_equals_size() {
        let mut input = Layer::input(2);
        input.bind_input(&array![1.0, -1.0]);
        let mut layer = Layer::new(3, Activation::Identity);
        layer.construct(2);
        layer.forward(&input);
        assert_eq!(layer.activated().len(), 3);
        assert_eq!(layer.pre_activation().len(), 3);
    }

    #[test]
    fn forward_computes_affine_map() {
        let mut input = Layer::input(2);
        input.bind_input(&array![2.0, 3.0]);
        let mut layer = Layer::new(2, Activation::Identity);
        layer.construct(2);
        layer
            .weights_mut()
            .assign(&array![[1.0, 0.0], [0.5, -1.0]]);
        layer.biases_mut().assign(&array![0.25, 1.0]);
        layer.forward(&input);
        assert_relative_eq!(layer.activated()[0], 2.25);
        assert_relative_eq!(layer.activated()[1], -1.0);
    }

    #[test]
    fn forward_applies_activation() {
        let mut input = Layer::input(1);
        input.bind_input(&array![-4.0]);
        let mut layer = Layer::new(1, Activation::Relu);
        layer.construct(1);
        layer.weights_mut().assign(&array![[1.0]]);
        layer.forward(&input);
        assert_eq!(layer.pre_activation()[0], -4.0);
        assert_eq!(layer.activated()[0], 0.0);
    }
}
