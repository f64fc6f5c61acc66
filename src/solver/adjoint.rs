//! Adjoint sensitivity backward pass
//!
//! Integrates the augmented system backwards over the accepted step grid of
//! an adjoint-mode solve:
//!
//! ```text
//! dz/dt = f(t, z)
//! da/dt = -a ∂f/∂z
//! dg/dt = -a ∂f/∂θ
//! ```
//!
//! Each accepted interval is covered by one classical RK4 step in reversed
//! time, restarting `z` from the stored checkpoint so the reverse state never
//! drifts from the forward one. Vector-Jacobian products come from burn's
//! autodiff; parameter contributions are summed in a
//! [`GradientsAccumulator`].

use super::AdjointTape;
use crate::error::{HbnodeError, Result};
use crate::field::VectorField;
use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, GradientsParams};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use tracing::debug;

/// Gradients produced by [`adjoint_backward`].
pub struct AdjointGradients<B: AutodiffBackend> {
    /// Loss gradient with respect to the initial state
    pub initial_state: Tensor<B::InnerBackend, 2>,
    /// Loss gradients for every parameter of the module view
    pub params: GradientsParams,
}

/// Runs the adjoint pass for one tape.
///
/// # Arguments
/// * `field` - The same vector field that produced the tape
/// * `module` - Module whose parameters `field` reads, used to collect
///   parameter gradients (a clone shares parameter ids)
/// * `tape` - Checkpoints from an adjoint-mode solve
/// * `output_grads` - Loss gradient for every evaluation time, `None` where
///   the loss does not depend on that state
pub fn adjoint_backward<B, F, M>(
    field: &mut F,
    module: &M,
    tape: &AdjointTape<B>,
    output_grads: &[Option<Tensor<B::InnerBackend, 2>>],
) -> Result<AdjointGradients<B>>
where
    B: AutodiffBackend,
    F: VectorField<B, 2>,
    M: AutodiffModule<B>,
{
    let outputs = tape.output_indices();
    if output_grads.len() != outputs.len() {
        return Err(HbnodeError::shape_mismatch(
            "adjoint output gradients",
            vec![outputs.len()],
            vec![output_grads.len()],
        ));
    }

    let checkpoints = tape.checkpoints();
    let state_dims = checkpoints[0].1.dims();
    let mut adjoint = checkpoints[0].1.clone().inner().zeros_like();
    let mut accumulator = GradientsAccumulator::<M>::new();
    let mut intervals = 0usize;

    for k in (0..checkpoints.len()).rev() {
        for (index, grad) in outputs.iter().zip(output_grads) {
            if *index != k {
                continue;
            }
            if let Some(grad) = grad {
                if grad.dims() != state_dims {
                    return Err(HbnodeError::shape_mismatch(
                        "adjoint output gradient",
                        state_dims.to_vec(),
                        grad.dims().to_vec(),
                    ));
                }
                adjoint = adjoint + grad.clone();
            }
        }
        if k == 0 {
            break;
        }

        let (t1, z1) = &checkpoints[k];
        let (t0, _) = &checkpoints[k - 1];
        if t1 <= t0 {
            continue;
        }
        adjoint = reverse_rk4_step(
            field,
            module,
            &mut accumulator,
            (*t0, *t1),
            z1.clone().inner(),
            adjoint,
        )?;
        intervals += 1;
    }

    debug!(intervals, vjps = 4 * intervals, "adjoint backward finished");

    Ok(AdjointGradients {
        initial_state: adjoint,
        params: accumulator.grads(),
    })
}

/// One RK4 step of the adjoint system from `t1` back to `t0`.
///
/// Stage seeds are pre-multiplied by their quadrature weights so each VJP
/// contributes directly to the parameter integral.
fn reverse_rk4_step<B, F, M>(
    field: &mut F,
    module: &M,
    accumulator: &mut GradientsAccumulator<M>,
    (t0, t1): (f64, f64),
    z1: Tensor<B::InnerBackend, 2>,
    a1: Tensor<B::InnerBackend, 2>,
) -> Result<Tensor<B::InnerBackend, 2>>
where
    B: AutodiffBackend,
    F: VectorField<B, 2>,
    M: AutodiffModule<B>,
{
    let h = t1 - t0;
    let t_mid = t1 - 0.5 * h;

    let seed = a1.clone().mul_scalar(h / 6.0);
    let (f1, g1) = vjp(field, module, accumulator, t1, z1.clone(), seed)?;

    let z2 = z1.clone() - f1.mul_scalar(0.5 * h);
    let a2 = a1.clone() + g1.clone().mul_scalar(3.0);
    let (f2, g2) = vjp(field, module, accumulator, t_mid, z2, a2.mul_scalar(h / 3.0))?;

    let z3 = z1.clone() - f2.mul_scalar(0.5 * h);
    let a3 = a1.clone() + g2.clone().mul_scalar(1.5);
    let (f3, g3) = vjp(field, module, accumulator, t_mid, z3, a3.mul_scalar(h / 3.0))?;

    let z4 = z1 - f3.mul_scalar(h);
    let a4 = a1.clone() + g3.clone().mul_scalar(3.0);
    let (_, g4) = vjp(field, module, accumulator, t0, z4, a4.mul_scalar(h / 6.0))?;

    Ok(a1 + g1 + g2 + g3 + g4)
}

/// Evaluates `f(t, z)` and the products `seed · ∂f/∂z`, `seed · ∂f/∂θ`.
fn vjp<B, F, M>(
    field: &mut F,
    module: &M,
    accumulator: &mut GradientsAccumulator<M>,
    t: f64,
    z: Tensor<B::InnerBackend, 2>,
    seed: Tensor<B::InnerBackend, 2>,
) -> Result<(Tensor<B::InnerBackend, 2>, Tensor<B::InnerBackend, 2>)>
where
    B: AutodiffBackend,
    F: VectorField<B, 2>,
    M: AutodiffModule<B>,
{
    let z = Tensor::<B, 2>::from_inner(z).require_grad();
    let f = field.evaluate(t, z.clone())?;
    let value = f.clone().inner();

    let grads = f.mul(Tensor::from_inner(seed)).sum().backward();
    let dz = z.grad(&grads).unwrap_or_else(|| value.zeros_like());
    accumulator.accumulate(module, GradientsParams::from_grads(grads, module));

    Ok((value, dz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{SolveMode, SolverConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};
    use burn::tensor::ElementConversion;

    type Backend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_decay_initial_state_gradient() {
        // y' = -y, L = sum(y(1)) => dL/dy0 = exp(-1)
        let device = Default::default();
        let solver = SolverConfig::new()
            .with_rtol(1e-5)
            .with_atol(1e-5)
            .with_mode(SolveMode::Adjoint)
            .init()
            .unwrap();
        let view = LinearConfig::new(1, 1).init::<Backend>(&device);
        let mut field =
            |_t: f64, y: Tensor<Backend, 2>| -> Result<Tensor<Backend, 2>> { Ok(y.neg()) };

        let y0 = Tensor::<Backend, 2>::ones([2, 3], &device);
        let solution = solver.solve(&mut field, y0, &[0.0, 1.0]).unwrap();
        let tape = solution.tape.unwrap();

        let ones = Tensor::<NdArray<f32>, 2>::ones([2, 3], &device);
        let grads = adjoint_backward::<Backend, _, Linear<Backend>>(
            &mut field,
            &view,
            &tape,
            &[None, Some(ones)],
        )
        .unwrap();

        let g = grads.initial_state.mean().into_scalar().elem::<f64>();
        assert!((g - (-1.0f64).exp()).abs() < 2e-3);
    }

    #[test]
    fn test_output_gradient_count_checked() {
        let device = Default::default();
        let solver = SolverConfig::new()
            .with_mode(SolveMode::Adjoint)
            .init()
            .unwrap();
        let view = LinearConfig::new(1, 1).init::<Backend>(&device);
        let mut field = |_t: f64, y: Tensor<Backend, 2>| -> Result<Tensor<Backend, 2>> { Ok(y) };

        let y0 = Tensor::<Backend, 2>::ones([1, 1], &device);
        let tape = solver
            .solve(&mut field, y0, &[0.0, 1.0])
            .unwrap()
            .tape
            .unwrap();
        let result = adjoint_backward(&mut field, &view, &tape, &[None]);
        assert!(matches!(result, Err(HbnodeError::ShapeMismatch { .. })));
    }
}
