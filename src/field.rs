//! Vector fields, residual functions and the flat-state wrapper
//!
//! The solver integrates flat `[batch, n]` states. [`FieldWrapper`] adapts a
//! [`VectorField`] over `[batch, *shape]` states to that layout and, when a
//! [`Residual`] is attached, appends the residual rate so the accumulator is
//! integrated by the same solver as the primary dynamics.
//!
//! ```text
//! flat state:      [ primary (prod(shape)) | residual accumulator (osize) ]
//! flat derivative: [ df(t, x)  flattened   | residual(t, x, df(t, x))     ]
//! ```

use crate::error::{HbnodeError, Result};
use burn::nn::Linear;
use burn::tensor::{backend::Backend, Tensor};

/// A `(time, state) -> derivative` function defining an ODE.
///
/// Implemented by the ODE nodes, by [`Linear`] (a time-invariant linear
/// field acting on the last axis) and by any
/// `FnMut(f64, Tensor<B, D>) -> Result<Tensor<B, D>>` closure.
pub trait VectorField<B: Backend, const D: usize> {
    /// Evaluates the derivative at time `t`.
    fn evaluate(&mut self, t: f64, state: Tensor<B, D>) -> Result<Tensor<B, D>>;
}

impl<B, T, const D: usize> VectorField<B, D> for T
where
    B: Backend,
    T: FnMut(f64, Tensor<B, D>) -> Result<Tensor<B, D>>,
{
    fn evaluate(&mut self, t: f64, state: Tensor<B, D>) -> Result<Tensor<B, D>> {
        self(t, state)
    }
}

impl<B: Backend, const D: usize> VectorField<B, D> for Linear<B> {
    fn evaluate(&mut self, _t: f64, state: Tensor<B, D>) -> Result<Tensor<B, D>> {
        Ok(self.forward(state))
    }
}

/// Auxiliary quantity integrated alongside the primary state.
///
/// The rate is computed from the primary state and its derivative and must
/// have shape `[batch, osize]`.
pub trait Residual<B: Backend, const D: usize> {
    /// Width of the residual block appended to the flat state.
    fn osize(&self) -> usize;

    /// Rate of change of the residual accumulator.
    fn evaluate(
        &self,
        t: f64,
        state: Tensor<B, D>,
        derivative: Tensor<B, D>,
    ) -> Result<Tensor<B, 2>>;
}

/// Placeholder residual type for integrators without a regularization channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoResidual;

impl<B: Backend, const D: usize> Residual<B, D> for NoResidual {
    fn osize(&self) -> usize {
        0
    }

    fn evaluate(
        &self,
        _t: f64,
        _state: Tensor<B, D>,
        _derivative: Tensor<B, D>,
    ) -> Result<Tensor<B, 2>> {
        Err(HbnodeError::configuration(
            "NoResidual is a placeholder and cannot be evaluated",
        ))
    }
}

/// Kinetic-energy regularizer: mean squared derivative per batch row.
///
/// Integrated over the trajectory this gives `∫ |f(t, x)|² / n dt`, the
/// usual penalty for keeping learned dynamics simple.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KineticEnergy;

impl<B: Backend, const D: usize> Residual<B, D> for KineticEnergy {
    fn osize(&self) -> usize {
        1
    }

    fn evaluate(
        &self,
        _t: f64,
        _state: Tensor<B, D>,
        derivative: Tensor<B, D>,
    ) -> Result<Tensor<B, 2>> {
        let flat = flatten(derivative);
        Ok(flat.clone().mul(flat).mean_dim(1))
    }
}

/// Adapts a shaped vector field to flat `[batch, n]` solver states.
pub struct FieldWrapper<'a, F, R, const D: usize> {
    field: &'a mut F,
    residual: Option<&'a R>,
    dims: [usize; D],
}

impl<'a, F, R, const D: usize> FieldWrapper<'a, F, R, D> {
    /// Wraps `field` for states of shape `[batch, *shape]`.
    pub fn new(field: &'a mut F, shape: &[usize], residual: Option<&'a R>) -> Result<Self> {
        Ok(Self {
            field,
            residual,
            dims: state_dims::<D>(shape)?,
        })
    }

    /// Number of primary (non-residual) columns of the flat state.
    pub fn primary_width(&self) -> usize {
        self.dims[1..].iter().product()
    }
}

impl<'a, B, F, R, const D: usize> VectorField<B, 2> for FieldWrapper<'a, F, R, D>
where
    B: Backend,
    F: VectorField<B, D>,
    R: Residual<B, D>,
{
    fn evaluate(&mut self, t: f64, state: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let [batch, width] = state.dims();
        let primary = self.primary_width();
        let osize = self.residual.map(|r| r.osize()).unwrap_or(0);
        if width != primary + osize {
            return Err(HbnodeError::shape_mismatch(
                "vector field wrapper",
                vec![batch, primary + osize],
                vec![batch, width],
            ));
        }

        let primary_state = if osize > 0 {
            state.narrow(1, 0, primary)
        } else {
            state
        };
        let x = unflatten(primary_state, self.dims)?;
        let dx = self.field.evaluate(t, x.clone())?;
        let expected = with_batch(self.dims, batch);
        if dx.dims() != expected {
            return Err(HbnodeError::shape_mismatch(
                "vector field output",
                expected.to_vec(),
                dx.dims().to_vec(),
            ));
        }

        match self.residual {
            None => Ok(flatten(dx)),
            Some(residual) => {
                let dr = residual.evaluate(t, x, dx.clone())?;
                if dr.dims() != [batch, osize] {
                    return Err(HbnodeError::shape_mismatch(
                        "residual output",
                        vec![batch, osize],
                        dr.dims().to_vec(),
                    ));
                }
                Ok(Tensor::cat(vec![flatten(dx), dr], 1))
            }
        }
    }
}

/// `[0, *shape]` as a rank-`D` dims template; the batch slot is filled later.
///
/// A rank-1 `[batch]` state has the empty shape and flattens to `[batch, 1]`.
pub(crate) fn state_dims<const D: usize>(shape: &[usize]) -> Result<[usize; D]> {
    if D == 0 || shape.len() + 1 != D {
        return Err(HbnodeError::configuration(format!(
            "feature shape {:?} does not describe a rank-{} batched state",
            shape, D
        )));
    }
    let mut dims = [0usize; D];
    dims[1..].copy_from_slice(shape);
    Ok(dims)
}

pub(crate) fn with_batch<const D: usize>(mut dims: [usize; D], batch: usize) -> [usize; D] {
    dims[0] = batch;
    dims
}

/// `[batch, *shape] -> [batch, prod(shape)]`
pub(crate) fn flatten<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, 2> {
    let dims = x.dims();
    let width: usize = dims[1..].iter().product();
    x.reshape([dims[0], width])
}

/// `[batch, prod(shape)] -> [batch, *shape]`
pub(crate) fn unflatten<B: Backend, const D: usize>(
    x: Tensor<B, 2>,
    dims: [usize; D],
) -> Result<Tensor<B, D>> {
    let [batch, width] = x.dims();
    let expected: usize = dims[1..].iter().product();
    if width != expected {
        return Err(HbnodeError::shape_mismatch(
            "unflatten",
            vec![batch, expected],
            vec![batch, width],
        ));
    }
    Ok(x.reshape(with_batch(dims, batch)))
}
