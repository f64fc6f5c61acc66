//! Dormand–Prince 5(4) with adaptive step size control
//!
//! Reference: Hairer, Nørsett & Wanner, "Solving Ordinary Differential
//! Equations I", section II.4 (step size control) and II.5 (the tableau).

use super::{validate_times, AdjointTape, Solution, SolveMode, SolverConfig, Trajectory};
use crate::error::{HbnodeError, Result};
use crate::field::VectorField;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use tracing::{debug, trace, warn};

const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// Fifth-order weights, also the last row of the tableau (FSAL)
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// Difference between the fifth- and fourth-order weights
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

/// Adaptive Dormand–Prince 5(4) integrator.
#[derive(Debug, Clone)]
pub struct Dopri5 {
    config: SolverConfig,
}

struct Step<B: Backend> {
    y: Tensor<B, 2>,
    k7: Tensor<B, 2>,
    error: f64,
}

impl Dopri5 {
    pub(crate) fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Integrates `field` from `times[0]` and records the state at every time.
    ///
    /// # Arguments
    /// * `field` - Vector field over flat `[batch, n]` states
    /// * `y0` - Initial state at `times[0]`
    /// * `times` - Non-decreasing evaluation times
    ///
    /// # Returns
    /// A [`Solution`] whose trajectory has one state per evaluation time. In
    /// adjoint mode the states are detached and the tape is populated.
    pub fn solve<B, F>(&self, field: &mut F, y0: Tensor<B, 2>, times: &[f64]) -> Result<Solution<B>>
    where
        B: Backend,
        F: VectorField<B, 2>,
    {
        validate_times(times)?;
        let adjoint = self.config.mode == SolveMode::Adjoint;
        let t0 = times[0];

        let mut y = if adjoint { y0.detach() } else { y0 };
        let mut tape = adjoint.then(|| AdjointTape::new(t0, y.clone()));
        if let Some(tape) = tape.as_mut() {
            tape.mark_output();
        }
        let mut states = vec![y.clone()];

        let mut t = t0;
        let mut k1: Option<Tensor<B, 2>> = None;
        let mut h: Option<f64> = None;
        let mut attempts = 0usize;
        let mut accepted = 0usize;
        let mut rejected = 0usize;
        let mut evaluations = 0usize;

        for &t_out in &times[1..] {
            while t < t_out {
                let min_step = 16.0 * f64::EPSILON * t.abs().max(1.0);
                if t_out - t < min_step {
                    t = t_out;
                    break;
                }
                if attempts >= self.config.max_steps {
                    warn!(t, t_out, attempts, "dopri5 exhausted its step budget");
                    return Err(HbnodeError::solver_failure(format!(
                        "maximum number of steps ({}) reached at t={} before t={}",
                        self.config.max_steps, t, t_out
                    )));
                }
                attempts += 1;

                let f0 = match k1.take() {
                    Some(k) => k,
                    None => {
                        evaluations += 1;
                        self.detach_if(adjoint, field.evaluate(t, y.clone())?)
                    }
                };
                let h_try = match h {
                    Some(h) => h,
                    None => {
                        evaluations += 1;
                        self.initial_step(field, t, &y, &f0, t_out - t)?
                    }
                };

                let lands = h_try >= t_out - t;
                let step = if lands { t_out - t } else { h_try };
                if step < min_step {
                    warn!(t, step, "dopri5 step size underflow");
                    return Err(HbnodeError::solver_failure(format!(
                        "step size {:e} underflowed at t={}",
                        step, t
                    )));
                }

                let trial = self.attempt(field, t, &y, &f0, step)?;
                evaluations += 6;

                let factor = self.step_factor(trial.error);
                if trial.error <= 1.0 {
                    t = if lands { t_out } else { t + step };
                    y = self.detach_if(adjoint, trial.y);
                    k1 = Some(self.detach_if(adjoint, trial.k7));
                    if let Some(tape) = tape.as_mut() {
                        tape.push_checkpoint(t, y.clone());
                    }
                    accepted += 1;
                    h = Some(step * factor);
                } else {
                    trace!(t, step, error = trial.error, "dopri5 rejected step");
                    k1 = Some(f0);
                    rejected += 1;
                    h = Some(step * factor.min(1.0));
                }
            }

            states.push(y.clone());
            if let Some(tape) = tape.as_mut() {
                tape.mark_output();
            }
        }

        debug!(accepted, rejected, evaluations, adjoint, "dopri5 solve finished");

        Ok(Solution {
            trajectory: Trajectory::new(times.to_vec(), states),
            tape,
        })
    }

    fn detach_if<B: Backend>(&self, detach: bool, x: Tensor<B, 2>) -> Tensor<B, 2> {
        if detach {
            x.detach()
        } else {
            x
        }
    }

    fn attempt<B, F>(
        &self,
        field: &mut F,
        t: f64,
        y: &Tensor<B, 2>,
        k1: &Tensor<B, 2>,
        h: f64,
    ) -> Result<Step<B>>
    where
        B: Backend,
        F: VectorField<B, 2>,
    {
        let k2 = field.evaluate(t + C2 * h, combine(y, h, &[(A21, k1)]))?;
        let k3 = field.evaluate(t + C3 * h, combine(y, h, &[(A31, k1), (A32, &k2)]))?;
        let k4 = field.evaluate(
            t + C4 * h,
            combine(y, h, &[(A41, k1), (A42, &k2), (A43, &k3)]),
        )?;
        let k5 = field.evaluate(
            t + C5 * h,
            combine(y, h, &[(A51, k1), (A52, &k2), (A53, &k3), (A54, &k4)]),
        )?;
        let k6 = field.evaluate(
            t + h,
            combine(
                y,
                h,
                &[(A61, k1), (A62, &k2), (A63, &k3), (A64, &k4), (A65, &k5)],
            ),
        )?;
        let y_new = combine(
            y,
            h,
            &[(B1, k1), (B3, &k3), (B4, &k4), (B5, &k5), (B6, &k6)],
        );
        let k7 = field.evaluate(t + h, y_new.clone())?;

        let zero = y.zeros_like();
        let error_estimate = combine(
            &zero,
            h,
            &[(E1, k1), (E3, &k3), (E4, &k4), (E5, &k5), (E6, &k6), (E7, &k7)],
        );
        let scale = y
            .clone()
            .detach()
            .abs()
            .max_pair(y_new.clone().detach().abs())
            .mul_scalar(self.config.rtol)
            .add_scalar(self.config.atol);
        let error = rms_norm(error_estimate.detach().div(scale));

        Ok(Step {
            y: y_new,
            k7,
            error,
        })
    }

    fn step_factor(&self, error: f64) -> f64 {
        if !error.is_finite() {
            return self.config.min_factor;
        }
        if error == 0.0 {
            return self.config.max_factor;
        }
        (self.config.safety * error.powf(-0.2))
            .clamp(self.config.min_factor, self.config.max_factor)
    }

    /// Hairer's starting step: balances the first two derivative estimates.
    fn initial_step<B, F>(
        &self,
        field: &mut F,
        t0: f64,
        y0: &Tensor<B, 2>,
        f0: &Tensor<B, 2>,
        span: f64,
    ) -> Result<f64>
    where
        B: Backend,
        F: VectorField<B, 2>,
    {
        let y0 = y0.clone().detach();
        let f0 = f0.clone().detach();
        let scale = y0
            .clone()
            .abs()
            .mul_scalar(self.config.rtol)
            .add_scalar(self.config.atol);

        let d0 = rms_norm(y0.clone().div(scale.clone()));
        let d1 = rms_norm(f0.clone().div(scale.clone()));
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        let h0 = h0.min(span);

        let y1 = y0 + f0.clone().mul_scalar(h0);
        let f1 = field.evaluate(t0 + h0, y1)?.detach();
        let d2 = rms_norm((f1 - f0).div(scale)) / h0;

        let h1 = if d1.max(d2) <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(0.2)
        };

        let h = (100.0 * h0).min(h1).min(span);
        if !h.is_finite() {
            return Ok(h0);
        }
        Ok(h)
    }
}

/// `y + h * sum(c_i * k_i)`
fn combine<B: Backend>(y: &Tensor<B, 2>, h: f64, terms: &[(f64, &Tensor<B, 2>)]) -> Tensor<B, 2> {
    terms
        .iter()
        .fold(y.clone(), |acc, (c, k)| acc + (*k).clone().mul_scalar(h * c))
}

/// Root mean square over all elements.
fn rms_norm<B: Backend>(x: Tensor<B, 2>) -> f64 {
    let squared = x.clone().mul(x).mean().into_scalar().elem::<f64>();
    squared.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type Backend = NdArray<f32>;

    fn decay(_t: f64, y: Tensor<Backend, 2>) -> Result<Tensor<Backend, 2>> {
        Ok(y.neg())
    }

    #[test]
    fn test_exponential_decay() {
        let device = Default::default();
        let solver = SolverConfig::new()
            .with_rtol(1e-5)
            .with_atol(1e-5)
            .init()
            .unwrap();
        let y0 = Tensor::<Backend, 2>::ones([1, 2], &device);
        let mut field = decay;

        let solution = solver.solve(&mut field, y0, &[0.0, 0.5, 1.0]).unwrap();
        let states = solution.trajectory.states();
        assert_eq!(states.len(), 3);
        assert!(solution.tape.is_none());

        let mid = states[1].clone().into_data().to_vec::<f32>().unwrap();
        let end = states[2].clone().into_data().to_vec::<f32>().unwrap();
        assert!((mid[0] as f64 - (-0.5f64).exp()).abs() < 1e-4);
        assert!((end[1] as f64 - (-1.0f64).exp()).abs() < 1e-4);
    }

    #[test]
    fn test_zero_span_makes_no_evaluations() {
        let device = Default::default();
        let solver = SolverConfig::new().init().unwrap();
        let mut calls = 0usize;
        let mut field = |_t: f64, y: Tensor<Backend, 2>| -> Result<Tensor<Backend, 2>> {
            calls += 1;
            Ok(y)
        };

        let y0 = Tensor::<Backend, 2>::ones([1, 1], &device);
        let solution = solver.solve(&mut field, y0, &[0.3, 0.3]).unwrap();
        assert_eq!(solution.trajectory.len(), 2);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_step_budget_exhausted() {
        let device = Default::default();
        let solver = SolverConfig::new()
            .with_rtol(1e-7)
            .with_atol(1e-7)
            .with_max_steps(2)
            .init()
            .unwrap();
        let mut field = |t: f64, y: Tensor<Backend, 2>| -> Result<Tensor<Backend, 2>> {
            Ok(y.ones_like().mul_scalar((50.0 * t).cos() * 50.0))
        };
        let y0 = Tensor::<Backend, 2>::zeros([1, 1], &device);

        let err = solver.solve(&mut field, y0, &[0.0, 10.0]).unwrap_err();
        assert!(matches!(err, HbnodeError::SolverFailure(_)));
    }

    #[test]
    fn test_adjoint_mode_records_tape() {
        let device = Default::default();
        let solver = SolverConfig::new()
            .with_mode(SolveMode::Adjoint)
            .init()
            .unwrap();
        let y0 = Tensor::<Backend, 2>::ones([2, 3], &device);
        let mut field = decay;

        let solution = solver.solve(&mut field, y0, &[0.0, 0.5, 1.0]).unwrap();
        let tape = solution.tape.unwrap();
        assert!(tape.num_steps() >= 2);
        assert_eq!(tape.output_indices().len(), 3);
        assert_eq!(tape.output_indices()[0], 0);
        assert_eq!(*tape.output_indices().last().unwrap(), tape.num_steps());

        let (t_end, _) = tape.checkpoints().last().unwrap();
        assert_eq!(*t_end, 1.0);
    }
}
