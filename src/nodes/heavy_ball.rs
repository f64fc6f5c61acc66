//! Learnable coefficients of the heavy-ball parametrization
//!
//! Reference: Xia et al., "Heavy Ball Neural Ordinary Differential
//! Equations", NeurIPS 2021.

use crate::activation::Squash;
use burn::module::{Ignored, Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Damping (`gamma`) and shortcut (`correction`) coefficients.
///
/// Both are stored raw and squashed before use, so any real value is a valid
/// parameter. A frozen coefficient is excluded from gradient updates.
#[derive(Module, Debug)]
pub struct HeavyBallParams<B: Backend> {
    /// Raw damping coefficient, shape `[1]`
    pub gamma: Param<Tensor<B, 1>>,
    /// Raw shortcut coefficient, shape `[1]`
    pub correction: Param<Tensor<B, 1>>,
    gamma_activation: Ignored<Squash>,
    correction_activation: Ignored<Squash>,
    #[module(skip)]
    gamma_frozen: bool,
    #[module(skip)]
    correction_frozen: bool,
}

impl<B: Backend> HeavyBallParams<B> {
    pub fn new(
        gamma_guess: f64,
        gamma_activation: Squash,
        gamma_frozen: bool,
        correction: f64,
        correction_activation: Squash,
        correction_frozen: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            gamma: Self::scalar_param(gamma_guess, gamma_frozen, device),
            correction: Self::scalar_param(correction, correction_frozen, device),
            gamma_activation: Ignored(gamma_activation),
            correction_activation: Ignored(correction_activation),
            gamma_frozen,
            correction_frozen,
        }
    }

    fn scalar_param(value: f64, frozen: bool, device: &B::Device) -> Param<Tensor<B, 1>> {
        let tensor = Tensor::<B, 1>::from_floats([value as f32], device);
        Param::from_tensor(tensor).set_require_grad(!frozen)
    }

    pub fn gamma_frozen(&self) -> bool {
        self.gamma_frozen
    }

    pub fn correction_frozen(&self) -> bool {
        self.correction_frozen
    }

    /// Effective damping `squash_gamma(gamma)`, shape `[1]`.
    pub fn damping(&self) -> Tensor<B, 1> {
        let gamma = if self.gamma_frozen {
            self.gamma.val().detach()
        } else {
            self.gamma.val()
        };
        self.gamma_activation.apply(gamma)
    }

    /// Effective shortcut `squash_nonneg(correction)`, shape `[1]`.
    pub fn shortcut(&self) -> Tensor<B, 1> {
        let correction = if self.correction_frozen {
            self.correction.val().detach()
        } else {
            self.correction.val()
        };
        self.correction_activation.apply(correction)
    }

    /// `force - damping * m + shortcut * h`
    pub fn momentum_rate<const D: usize>(
        &self,
        force: Tensor<B, D>,
        h: Tensor<B, D>,
        m: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let damping = self.damping().reshape([1usize; D]);
        let shortcut = self.shortcut().reshape([1usize; D]);
        force - m.mul(damping) + h.mul(shortcut)
    }
}
