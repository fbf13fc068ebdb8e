use anyhow::{bail, Result};
use derive_more::Display;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Layer activation functions.
///
/// The discriminants are fixed by the weight file format and must not change.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum Activation {
    #[display(fmt = "TANH")]
    Tanh = 0,
    #[display(fmt = "RELU")]
    Relu = 1,
    #[display(fmt = "CRELU")]
    CRelu = 2,
    #[display(fmt = "SCRELU")]
    SCRelu = 3,
    #[display(fmt = "SQRELU")]
    SqRelu = 4,
    #[display(fmt = "SIGMOID")]
    Sigmoid = 5,
    #[display(fmt = "SOFTMAX")]
    Softmax = 6,
    #[display(fmt = "FSIGMOID")]
    FSigmoid = 7,
    #[display(fmt = "SOFTPLUS")]
    Softplus = 8,
    #[display(fmt = "GAUSSIAN")]
    Gaussian = 9,
    #[display(fmt = "IDENTITY")]
    Identity = 10,
}

impl Activation {
    /// Applies the activation to `input`.
    ///
    /// Softmax normalizes the whole vector; every other kind is elementwise.
    pub fn apply(&self, input: &Array1<f32>) -> Array1<f32> {
        use Activation::*;
        match self {
            Softmax => softmax(input),
            Tanh => input.mapv(f32::tanh),
            Relu => input.mapv(relu),
            CRelu => input.mapv(crelu),
            SCRelu => input.mapv(|x| crelu(x).powi(2)),
            SqRelu => input.mapv(|x| relu(x).powi(2)),
            Sigmoid => input.mapv(sigmoid),
            FSigmoid => input.mapv(|x| x / (1.0 + x.abs())),
            Softplus => input.mapv(|x| (1.0 + x.exp()).ln()),
            Gaussian => input.mapv(|x| (-(x * x)).exp()),
            Identity => input.clone(),
        }
    }
    /// The derivative, expressed as a function of the *activated* output.
    ///
    /// ReLU-family derivatives are zero exactly at their boundary values
    /// (0, and 1 for the clipped kinds) and nonzero otherwise; training
    /// dynamics depend on these rules as written.
    ///
    /// **Errors**
    ///
    /// Softmax has no per-element derivative and is rejected; it is only
    /// legal on the output layer, where the backward pass does not consult
    /// this method.
    pub fn derivative(&self, activated: f32) -> Result<f32> {
        use Activation::*;
        let f = activated;
        Ok(match self {
            Tanh => 1.0 - f.tanh().powi(2),
            Relu => {
                if f == 0.0 {
                    0.0
                } else {
                    1.0
                }
            }
            CRelu => {
                if f == 0.0 || f == 1.0 {
                    0.0
                } else {
                    1.0
                }
            }
            SCRelu => {
                if f == 0.0 || f == 1.0 {
                    0.0
                } else {
                    2.0 * f
                }
            }
            SqRelu => {
                if f == 0.0 {
                    0.0
                } else {
                    2.0 * f
                }
            }
            Sigmoid => sigmoid(f) * (1.0 - sigmoid(f)),
            FSigmoid => {
                if f == 0.0 {
                    1.0
                } else if f > 0.0 {
                    (1.0 + f).powi(2).recip()
                } else {
                    (1.0 - f).powi(2).recip()
                }
            }
            Softplus => sigmoid(f),
            Gaussian => -2.0 * f * (-(f * f)).exp(),
            Identity => f,
            Softmax => bail!("Unsupported activation on a hidden layer: {self}!"),
        })
    }
    pub(crate) fn from_repr(value: i16) -> Option<Self> {
        use Activation::*;
        match value {
            0 => Some(Tanh),
            1 => Some(Relu),
            2 => Some(CRelu),
            3 => Some(SCRelu),
            4 => Some(SqRelu),
            5 => Some(Sigmoid),
            6 => Some(Softmax),
            7 => Some(FSigmoid),
            8 => Some(Softplus),
            9 => Some(Gaussian),
            10 => Some(Identity),
            _ => None,
        }
    }
}

fn relu(x: f32) -> f32 {
    x.max(0.0)
}

fn crelu(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Whole-vector softmax.
///
/// Subtracts the max before exponentiating; if the exponent sum is exactly
/// zero the result is the uniform distribution instead of a division by zero.
fn softmax(values: &Array1<f32>) -> Array1<f32> {
    let max = values.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    let mut out = values.mapv(|x| (x - max).exp());
    let sum = out.sum();
    if sum == 0.0 {
        let uniform = 1.0 / out.len().max(1) as f32;
        out.fill(uniform);
    } else {
        out /= sum;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn softmax_sums_to_one() {
        let out = Activation::Softmax.apply(&array![1.0, 2.0, 3.0, -1.0]);
        assert_relative_eq!(out.sum(), 1.0, epsilon = 1e-6);
        assert!(out.iter().all(|&x| x > 0.0));
    }

    #[test]
    fn softmax_of_equal_inputs_is_uniform() {
        let out = Activation::Softmax.apply(&array![5.0, 5.0, 5.0, 5.0]);
        for &x in out.iter() {
            assert_relative_eq!(x, 0.25, epsilon = 1e-6);
        }
    }

    #[test]
    fn softmax_of_empty_input_is_empty() {
        let out = Activation::Softmax.apply(&Array1::zeros(0));
        assert!(out.is_empty());
    }

    #[test]
    fn softmax_is_stable_for_large_inputs() {
        let out = Activation::Softmax.apply(&array![1000.0, 1000.0]);
        assert_relative_eq!(out.sum(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(out[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn relu_family_boundary_derivatives() {
        assert_eq!(Activation::Relu.derivative(0.0).unwrap(), 0.0);
        assert_eq!(Activation::Relu.derivative(0.5).unwrap(), 1.0);
        assert_eq!(Activation::CRelu.derivative(0.0).unwrap(), 0.0);
        assert_eq!(Activation::CRelu.derivative(1.0).unwrap(), 0.0);
        assert_eq!(Activation::CRelu.derivative(0.5).unwrap(), 1.0);
        assert_eq!(Activation::SCRelu.derivative(1.0).unwrap(), 0.0);
        assert_eq!(Activation::SCRelu.derivative(0.25).unwrap(), 0.5);
        assert_eq!(Activation::SqRelu.derivative(0.0).unwrap(), 0.0);
        assert_eq!(Activation::SqRelu.derivative(2.0).unwrap(), 4.0);
    }

    #[test]
    fn derivatives_match_closed_forms() {
        let f = 0.3_f32;
        assert_relative_eq!(
            Activation::Tanh.derivative(f).unwrap(),
            1.0 - f.tanh().powi(2),
        );
        assert_relative_eq!(
            Activation::Sigmoid.derivative(f).unwrap(),
            sigmoid(f) * (1.0 - sigmoid(f)),
        );
        assert_relative_eq!(Activation::Softplus.derivative(f).unwrap(), sigmoid(f));
        assert_relative_eq!(
            Activation::Gaussian.derivative(f).unwrap(),
            -2.0 * f * (-(f * f)).exp(),
        );
        // The identity derivative returns the activated value itself.
        assert_relative_eq!(Activation::Identity.derivative(f).unwrap(), f);
    }

    #[test]
    fn softmax_derivative_is_a_configuration_error() {
        assert!(Activation::Softmax.derivative(0.5).is_err());
    }

    #[test]
    fn repr_round_trip() {
        for repr in 0..=10 {
            let activation = Activation::from_repr(repr).unwrap();
            assert_eq!(activation as i16, repr);
        }
        assert!(Activation::from_repr(11).is_none());
        assert!(Activation::from_repr(-1).is_none());
    }
}
