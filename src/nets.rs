//! Network blocks used around the ODE layers
//!
//! - [`TimeInvariantMlp`]: autonomous vector field `df(t, x) = mlp(x)`
//! - [`InitialVelocity`]: lifts a state to `[batch, slots, features]` for the
//!   second-order and heavy-ball nodes
//! - [`augment_channels`]: ANODE zero augmentation
//! - [`DenseUpdate`]: dense recurrent update for [`OdeRnn`](crate::rnn::OdeRnn)

use crate::activation::Squash;
use crate::error::{HbnodeError, Result};
use crate::field::{flatten, VectorField};
use crate::rnn::RecurrentUpdate;
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Configuration for [`TimeInvariantMlp`].
#[derive(Config, Debug)]
pub struct MlpFieldConfig {
    /// Layer widths, input first; at least two entries
    pub sizes: Vec<usize>,
    /// Activation between layers (not after the last)
    #[config(default = "Squash::Tanh")]
    pub activation: Squash,
    #[config(default = true)]
    pub bias: bool,
}

impl MlpFieldConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TimeInvariantMlp<B>> {
        if self.sizes.len() < 2 {
            return Err(HbnodeError::configuration(format!(
                "an MLP needs at least input and output sizes, got {:?}",
                self.sizes
            )));
        }
        let layers = self
            .sizes
            .windows(2)
            .map(|pair| {
                LinearConfig::new(pair[0], pair[1])
                    .with_bias(self.bias)
                    .init(device)
            })
            .collect();

        Ok(TimeInvariantMlp {
            layers,
            activation: Ignored(self.activation),
        })
    }
}

/// Stack of [`Linear`] layers acting on the last axis, ignoring time.
#[derive(Module, Debug)]
pub struct TimeInvariantMlp<B: Backend> {
    layers: Vec<Linear<B>>,
    activation: Ignored<Squash>,
}

impl<B: Backend> TimeInvariantMlp<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last = self.layers.len().saturating_sub(1);
        self.layers
            .iter()
            .enumerate()
            .fold(x, |x, (i, layer)| {
                let out = layer.forward(x);
                if i < last {
                    self.activation.apply(out)
                } else {
                    out
                }
            })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl<B: Backend, const D: usize> VectorField<B, D> for TimeInvariantMlp<B> {
    fn evaluate(&mut self, _t: f64, state: Tensor<B, D>) -> Result<Tensor<B, D>> {
        Ok(self.forward(state))
    }
}

/// Configuration for [`InitialVelocity`].
#[derive(Config, Debug)]
pub struct InitialVelocityConfig {
    pub in_features: usize,
    pub out_features: usize,
    /// Number of slots, 2 for `[position, velocity]`
    #[config(default = 2)]
    pub slots: usize,
}

impl InitialVelocityConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<InitialVelocity<B>> {
        let total = self.out_features * self.slots;
        if total <= self.in_features {
            return Err(HbnodeError::configuration(format!(
                "slots * out_features ({}) must exceed in_features ({})",
                total, self.in_features
            )));
        }
        Ok(InitialVelocity {
            fill: LinearConfig::new(self.in_features, total - self.in_features).init(device),
            in_features: self.in_features,
            out_features: self.out_features,
            slots: self.slots,
        })
    }
}

/// `[batch, in] -> [batch, slots, out]`.
///
/// The input is kept verbatim in the leading entries; a linear map of the
/// input fills the remaining `slots * out - in` entries.
#[derive(Module, Debug)]
pub struct InitialVelocity<B: Backend> {
    fill: Linear<B>,
    #[module(skip)]
    in_features: usize,
    #[module(skip)]
    out_features: usize,
    #[module(skip)]
    slots: usize,
}

impl<B: Backend> InitialVelocity<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 3>> {
        let [batch, features] = x.dims();
        if features != self.in_features {
            return Err(HbnodeError::shape_mismatch(
                "initial velocity input",
                vec![batch, self.in_features],
                vec![batch, features],
            ));
        }
        let filled = self.fill.forward(x.clone());
        let out = Tensor::cat(vec![x, filled], 1);
        Ok(out.reshape([batch, self.slots, self.out_features]))
    }
}

/// Appends `extra` zero channels along axis 1.
pub fn augment_channels<B: Backend, const D: usize>(x: Tensor<B, D>, extra: usize) -> Tensor<B, D> {
    if extra == 0 {
        return x;
    }
    let mut dims = x.dims();
    dims[1] = extra;
    let zeros = Tensor::zeros(dims, &x.device());
    Tensor::cat(vec![x, zeros], 1)
}

/// Configuration for [`DenseUpdate`].
#[derive(Config, Debug)]
pub struct DenseUpdateConfig {
    pub hidden_shape: Vec<usize>,
    pub input_features: usize,
    #[config(default = "Squash::Tanh")]
    pub activation: Squash,
}

impl DenseUpdateConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DenseUpdate<B>> {
        let hidden: usize = self.hidden_shape.iter().product();
        if self.hidden_shape.is_empty() || hidden == 0 {
            return Err(HbnodeError::configuration(format!(
                "hidden shape must be non-empty with positive sizes, got {:?}",
                self.hidden_shape
            )));
        }
        Ok(DenseUpdate {
            linear: LinearConfig::new(hidden + self.input_features, hidden).init(device),
            hidden_shape: self.hidden_shape.clone(),
            input_features: self.input_features,
            activation: Ignored(self.activation),
        })
    }
}

/// Recurrent update `act(W [flatten(h) | x] + b)` reshaped to the hidden shape.
#[derive(Module, Debug)]
pub struct DenseUpdate<B: Backend> {
    linear: Linear<B>,
    #[module(skip)]
    hidden_shape: Vec<usize>,
    #[module(skip)]
    input_features: usize,
    activation: Ignored<Squash>,
}

impl<B: Backend, const D: usize> RecurrentUpdate<B, D> for DenseUpdate<B> {
    fn update(&self, hidden: Tensor<B, D>, input: Tensor<B, 2>) -> Result<Tensor<B, D>> {
        let dims = hidden.dims();
        if dims[1..] != self.hidden_shape[..] {
            return Err(HbnodeError::shape_mismatch(
                "dense update hidden state",
                self.hidden_shape.clone(),
                dims[1..].to_vec(),
            ));
        }
        let [batch, features] = input.dims();
        if batch != dims[0] || features != self.input_features {
            return Err(HbnodeError::shape_mismatch(
                "dense update input",
                vec![dims[0], self.input_features],
                vec![batch, features],
            ));
        }

        let joint = Tensor::cat(vec![flatten(hidden), input], 1);
        let out = self.activation.apply(self.linear.forward(joint));
        Ok(out.reshape(dims))
    }
}
