//! Augmented-state ODE node
//!
//! One module covers the plain, second-order and heavy-ball families. The
//! variant is chosen at construction through [`OdeNodeConfig`] and dispatched
//! inside [`VectorField::evaluate`].

use super::heavy_ball::HeavyBallParams;
use crate::activation::Squash;
use crate::error::{HbnodeError, Result};
use crate::field::VectorField;
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// How the augmented state is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeKind {
    /// `dx = df(t, x)`
    #[default]
    Plain,
    /// `x = [position, velocity]`, `dx = [velocity, df(t, x)]`
    SecondOrder,
    /// `x = [h, m]`, `dh = actv(-m)`, `dm = sign * df(t, h) - gamma * m + corr * h`
    HeavyBall,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Plain => "node",
            NodeKind::SecondOrder => "sonode",
            NodeKind::HeavyBall => "hbnode",
        }
    }
}

/// Configuration for [`OdeNode`].
#[derive(Config, Debug)]
pub struct OdeNodeConfig {
    /// Node variant
    #[config(default = "NodeKind::Plain")]
    pub kind: NodeKind,
    /// Activation on the velocity channel `-m` (non-identity gives GHBNODE)
    #[config(default = "Squash::Identity")]
    pub velocity_activation: Squash,
    /// Squash applied to the raw damping coefficient
    #[config(default = "Squash::Sigmoid")]
    pub gamma_activation: Squash,
    /// Squash applied to the raw shortcut coefficient
    #[config(default = "Squash::Softplus")]
    pub correction_activation: Squash,
    /// Sign of the force term, `1.0` or `-1.0`
    #[config(default = 1.0)]
    pub sign: f64,
    /// Initial raw damping
    #[config(default = "-3.0")]
    pub gamma_guess: f64,
    #[config(default = false)]
    pub gamma_frozen: bool,
    /// Initial raw shortcut coefficient
    #[config(default = "-100.0")]
    pub correction: f64,
    #[config(default = true)]
    pub correction_frozen: bool,
}

impl OdeNodeConfig {
    /// Plain NODE: the state is integrated as-is.
    pub fn plain() -> Self {
        Self::new()
    }

    /// SONODE: `[position, velocity]` slots.
    pub fn second_order() -> Self {
        Self::new().with_kind(NodeKind::SecondOrder)
    }

    /// HBNODE with the default sigmoid damping and softplus shortcut.
    pub fn heavy_ball() -> Self {
        Self::new().with_kind(NodeKind::HeavyBall)
    }

    /// Builds the node around the rate function `df`.
    ///
    /// For [`NodeKind::HeavyBall`] `df` acts on the `h` slot only; for
    /// [`NodeKind::SecondOrder`] it sees the full state and must return a
    /// single slot.
    pub fn init<B: Backend, F: Module<B>>(&self, df: F, device: &B::Device) -> Result<OdeNode<B, F>> {
        if self.sign != 1.0 && self.sign != -1.0 {
            return Err(HbnodeError::configuration(format!(
                "sign must be 1 or -1, got {}",
                self.sign
            )));
        }
        if !self.gamma_guess.is_finite() || !self.correction.is_finite() {
            return Err(HbnodeError::configuration(
                "heavy-ball coefficients must be finite",
            ));
        }

        let heavy_ball = match self.kind {
            NodeKind::HeavyBall => Some(HeavyBallParams::new(
                self.gamma_guess,
                self.gamma_activation,
                self.gamma_frozen,
                self.correction,
                self.correction_activation,
                self.correction_frozen,
                device,
            )),
            _ => None,
        };

        Ok(OdeNode {
            df,
            heavy_ball,
            elem_t: None,
            kind: Ignored(self.kind),
            velocity_activation: Ignored(self.velocity_activation),
            sign: self.sign,
            nfe: 0,
        })
    }
}

/// ODE node with an evaluation counter and an optional per-sample time scale.
///
/// # Type Parameters
/// * `B` - The backend type
/// * `F` - Learned rate function, a module that is also a [`VectorField`]
#[derive(Module, Debug)]
pub struct OdeNode<B: Backend, F: Module<B>> {
    df: F,
    heavy_ball: Option<HeavyBallParams<B>>,
    /// Per-sample time scale, multiplied onto every derivative when set
    elem_t: Option<Tensor<B, 1>>,
    kind: Ignored<NodeKind>,
    velocity_activation: Ignored<Squash>,
    #[module(skip)]
    sign: f64,
    /// Number of function evaluations since the last [`OdeNode::reset_nfe`]
    #[module(skip)]
    nfe: usize,
}

impl<B: Backend, F: Module<B>> OdeNode<B, F> {
    pub fn kind(&self) -> NodeKind {
        *self.kind
    }

    pub fn inner(&self) -> &F {
        &self.df
    }

    pub fn inner_mut(&mut self) -> &mut F {
        &mut self.df
    }

    pub fn nfe(&self) -> usize {
        self.nfe
    }

    pub fn reset_nfe(&mut self) {
        self.nfe = 0;
    }

    /// Sets the per-sample time scale, length `batch` or 1.
    pub fn update(&mut self, elem_t: Tensor<B, 1>) {
        self.elem_t = Some(elem_t);
    }

    pub fn clear_time_scale(&mut self) {
        self.elem_t = None;
    }

    pub fn time_scale(&self) -> Option<&Tensor<B, 1>> {
        self.elem_t.as_ref()
    }

    /// Heavy-ball coefficients, `None` for the other variants.
    pub fn heavy_ball_params(&self) -> Option<&HeavyBallParams<B>> {
        self.heavy_ball.as_ref()
    }

    /// Effective damping `squash_gamma(gamma)`, heavy-ball only.
    pub fn damping(&self) -> Option<Tensor<B, 1>> {
        self.heavy_ball.as_ref().map(|p| p.damping())
    }

    /// Effective shortcut `squash_nonneg(correction)`, heavy-ball only.
    pub fn correction_coefficient(&self) -> Option<Tensor<B, 1>> {
        self.heavy_ball.as_ref().map(|p| p.shortcut())
    }

    fn second_order<const D: usize>(&mut self, t: f64, state: Tensor<B, D>) -> Result<Tensor<B, D>>
    where
        F: VectorField<B, D>,
    {
        let dims = state.dims();
        if D < 2 || dims[1] < 2 {
            return Err(HbnodeError::shape_mismatch(
                "second-order state slots",
                vec![2],
                dims.get(1).map(|&s| vec![s]).unwrap_or_default(),
            ));
        }

        let velocity = state.clone().narrow(1, 1, dims[1] - 1);
        let acceleration = self.df.evaluate(t, state)?;
        let mut expected = dims;
        expected[1] = 1;
        if acceleration.dims() != expected {
            return Err(HbnodeError::shape_mismatch(
                "second-order acceleration",
                expected.to_vec(),
                acceleration.dims().to_vec(),
            ));
        }
        Ok(Tensor::cat(vec![velocity, acceleration], 1))
    }

    fn heavy_ball<const D: usize>(&mut self, t: f64, state: Tensor<B, D>) -> Result<Tensor<B, D>>
    where
        F: VectorField<B, D>,
    {
        let dims = state.dims();
        if D < 2 || dims[1] != 2 {
            return Err(HbnodeError::shape_mismatch(
                "heavy-ball state slots",
                vec![2],
                dims.get(1).map(|&s| vec![s]).unwrap_or_default(),
            ));
        }

        let h = state.clone().narrow(1, 0, 1);
        let m = state.narrow(1, 1, 1);
        let force = self.df.evaluate(t, h.clone())?;
        if force.dims() != h.dims() {
            return Err(HbnodeError::shape_mismatch(
                "heavy-ball force",
                h.dims().to_vec(),
                force.dims().to_vec(),
            ));
        }

        let params = self
            .heavy_ball
            .as_ref()
            .ok_or_else(|| HbnodeError::configuration("heavy-ball node without coefficients"))?;
        let dh = self.velocity_activation.apply(m.clone().neg());
        let dm = params.momentum_rate(force.mul_scalar(self.sign), h, m);
        Ok(Tensor::cat(vec![dh, dm], 1))
    }

    fn scale_by_time<const D: usize>(&self, derivative: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let Some(elem_t) = &self.elem_t else {
            return Ok(derivative);
        };
        let [n] = elem_t.dims();
        let batch = derivative.dims()[0];
        if n != batch && n != 1 {
            return Err(HbnodeError::shape_mismatch(
                "time scale",
                vec![batch],
                vec![n],
            ));
        }
        let mut shape = [1usize; D];
        shape[0] = n;
        Ok(derivative.mul(elem_t.clone().reshape(shape)))
    }
}

impl<B, F, const D: usize> VectorField<B, D> for OdeNode<B, F>
where
    B: Backend,
    F: Module<B> + VectorField<B, D>,
{
    fn evaluate(&mut self, t: f64, state: Tensor<B, D>) -> Result<Tensor<B, D>> {
        self.nfe += 1;
        let derivative = match *self.kind {
            NodeKind::Plain => self.df.evaluate(t, state)?,
            NodeKind::SecondOrder => self.second_order(t, state)?,
            NodeKind::HeavyBall => self.heavy_ball(t, state)?,
        };
        self.scale_by_time(derivative)
    }
}
