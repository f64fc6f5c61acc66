//! Squashing activations for HBNODE parameters and network blocks
//!
//! The heavy-ball node passes its learnable damping and shortcut
//! coefficients through a squash before use, and GHBNODE applies an
//! activation to the velocity channel. [`Squash`] is the closed set of
//! choices, serializable so it can live in a [`Config`](burn::config::Config).

use burn::tensor::activation;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

/// Elementwise activation applied before a value is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Squash {
    /// `f(x) = x`
    #[default]
    Identity,
    /// `f(x) = 1 / (1 + exp(-x))`, output in (0, 1)
    Sigmoid,
    /// `f(x) = ln(1 + exp(x))`, output >= 0
    Softplus,
    /// `f(x) = tanh(x)`
    Tanh,
    /// `f(x) = max(0, x)`
    Relu,
    /// `f(x) = 1.7159 * tanh(0.666 * x)`
    LeCun,
}

impl Squash {
    /// Applies the activation elementwise.
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Squash::Identity => x,
            Squash::Sigmoid => activation::sigmoid(x),
            Squash::Softplus => activation::softplus(x, 1.0),
            Squash::Tanh => x.tanh(),
            Squash::Relu => activation::relu(x),
            Squash::LeCun => LeCun::forward(x),
        }
    }

    /// Short lowercase name, as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Squash::Identity => "identity",
            Squash::Sigmoid => "sigmoid",
            Squash::Softplus => "softplus",
            Squash::Tanh => "tanh",
            Squash::Relu => "relu",
            Squash::LeCun => "lecun_tanh",
        }
    }
}

/// LeCun's scaled tanh, `1.7159 * tanh(0.666 * x)`.
///
/// Approximately the identity near the origin with output range
/// about [-1.7159, 1.7159].
pub struct LeCun;

impl LeCun {
    pub fn forward<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
        let scaled = x * 0.666f32;
        scaled.tanh() * 1.7159f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type Backend = NdArray<f32>;

    #[test]
    fn test_identity_passthrough() {
        let device = Default::default();
        let x = Tensor::<Backend, 1>::from_floats([-2.0, 0.0, 3.5], &device);
        let y = Squash::Identity.apply(x.clone());
        let diff = (y - x).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_sigmoid_at_zero() {
        let device = Default::default();
        let x = Tensor::<Backend, 1>::zeros([1], &device);
        let y = Squash::Sigmoid.apply(x).into_scalar();
        assert!((y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_softplus_large_negative_is_zero() {
        let device = Default::default();
        let x = Tensor::<Backend, 1>::full([1], -100.0, &device);
        let y = Squash::Softplus.apply(x).into_scalar();
        assert!(y >= 0.0);
        assert!(y < 1e-6);
    }

    #[test]
    fn test_lecun_matches_formula() {
        let device = Default::default();
        for &val in &[-5.0f32, -1.0, 0.0, 1.0, 5.0] {
            let x = Tensor::<Backend, 1>::full([1], val, &device);
            let y = Squash::LeCun.apply(x).into_scalar();
            let expected = 1.7159f32 * (0.666f32 * val).tanh();
            assert!((y - expected).abs() < 1e-5, "LeCun incorrect at x={}", val);
        }
    }

    #[test]
    fn test_names_are_distinct() {
        let all = [
            Squash::Identity,
            Squash::Sigmoid,
            Squash::Softplus,
            Squash::Tanh,
            Squash::Relu,
            Squash::LeCun,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                assert_ne!(a.name(), b.name());
            }
        }
    }
}
