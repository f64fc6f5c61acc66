//! # Adaptive ODE Solver
//!
//! Dormand–Prince 5(4) over flat `[batch, n]` burn tensors.
//!
//! ## Modes
//!
//! | Mode | Forward graph | Gradients |
//! |------|---------------|-----------|
//! | [`SolveMode::Direct`] | recorded through every stage | ordinary `backward()` |
//! | [`SolveMode::Adjoint`] | detached after every accepted step | [`adjoint_backward`] over the [`AdjointTape`] |
//!
//! Direct mode memory grows with the number of steps. Adjoint mode keeps only
//! the accepted `(time, state)` checkpoints and recomputes the dynamics
//! backwards in time.

mod adjoint;
mod dopri5;

pub use adjoint::{adjoint_backward, AdjointGradients};
pub use dopri5::Dopri5;

use crate::error::{HbnodeError, Result};
use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// How gradients flow through an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolveMode {
    /// Backpropagate through the solver's internal operations.
    #[default]
    Direct,
    /// Adjoint sensitivity method.
    Adjoint,
}

/// Configuration for [`Dopri5`].
#[derive(Config, Debug)]
pub struct SolverConfig {
    /// Relative tolerance
    #[config(default = 1e-3)]
    pub rtol: f64,
    /// Absolute tolerance
    #[config(default = 1e-3)]
    pub atol: f64,
    #[config(default = "SolveMode::Direct")]
    pub mode: SolveMode,
    /// Maximum number of attempted steps, accepted or rejected
    #[config(default = 10000)]
    pub max_steps: usize,
    #[config(default = 0.9)]
    pub safety: f64,
    /// Largest step growth per attempt
    #[config(default = 10.0)]
    pub max_factor: f64,
    /// Largest step shrink per attempt
    #[config(default = 0.2)]
    pub min_factor: f64,
}

impl SolverConfig {
    pub fn init(&self) -> Result<Dopri5> {
        if !(self.rtol >= 0.0 && self.atol >= 0.0) || self.rtol + self.atol <= 0.0 {
            return Err(HbnodeError::configuration(format!(
                "tolerances must be non-negative and not both zero, got rtol={} atol={}",
                self.rtol, self.atol
            )));
        }
        if self.max_steps == 0 {
            return Err(HbnodeError::configuration("max_steps must be positive"));
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(HbnodeError::configuration(format!(
                "safety factor must be in (0, 1], got {}",
                self.safety
            )));
        }
        if !(self.min_factor > 0.0 && self.min_factor < 1.0 && self.max_factor > 1.0) {
            return Err(HbnodeError::configuration(format!(
                "step factors must satisfy 0 < min < 1 < max, got [{}, {}]",
                self.min_factor, self.max_factor
            )));
        }
        Ok(Dopri5::new(self.clone()))
    }
}

/// States recorded at the requested evaluation times.
#[derive(Debug, Clone)]
pub struct Trajectory<B: Backend, const D: usize> {
    times: Vec<f64>,
    states: Vec<Tensor<B, D>>,
}

impl<B: Backend, const D: usize> Trajectory<B, D> {
    pub(crate) fn new(times: Vec<f64>, states: Vec<Tensor<B, D>>) -> Self {
        Self { times, states }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[Tensor<B, D>] {
        &self.states
    }

    pub fn into_states(self) -> Vec<Tensor<B, D>> {
        self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Tensor<B, D>> {
        self.states.get(index)
    }

    /// State at the final evaluation time.
    pub fn last(&self) -> Option<&Tensor<B, D>> {
        self.states.last()
    }

    pub fn into_last(mut self) -> Option<Tensor<B, D>> {
        self.states.pop()
    }

    /// Applies a fallible transform to every state.
    pub fn map<const D2: usize, G>(self, mut f: G) -> Result<Trajectory<B, D2>>
    where
        G: FnMut(Tensor<B, D>) -> Result<Tensor<B, D2>>,
    {
        let states = self
            .states
            .into_iter()
            .map(|state| f(state))
            .collect::<Result<Vec<_>>>()?;
        Ok(Trajectory::new(self.times, states))
    }

    /// Stacks the states along a new leading time axis.
    ///
    /// `D2` must be `D + 1`.
    pub fn stack<const D2: usize>(&self) -> Tensor<B, D2> {
        Tensor::stack::<D2>(self.states.clone(), 0)
    }
}

/// Accepted-step checkpoints of an adjoint-mode solve.
#[derive(Debug, Clone)]
pub struct AdjointTape<B: Backend> {
    checkpoints: Vec<(f64, Tensor<B, 2>)>,
    output_indices: Vec<usize>,
}

impl<B: Backend> AdjointTape<B> {
    pub(crate) fn new(t0: f64, y0: Tensor<B, 2>) -> Self {
        Self {
            checkpoints: vec![(t0, y0)],
            output_indices: Vec::new(),
        }
    }

    pub(crate) fn push_checkpoint(&mut self, t: f64, y: Tensor<B, 2>) {
        self.checkpoints.push((t, y));
    }

    pub(crate) fn mark_output(&mut self) {
        self.output_indices.push(self.checkpoints.len() - 1);
    }

    /// `(time, state)` at every accepted step, starting with the initial state.
    pub fn checkpoints(&self) -> &[(f64, Tensor<B, 2>)] {
        &self.checkpoints
    }

    /// Checkpoint index of every evaluation time.
    pub fn output_indices(&self) -> &[usize] {
        &self.output_indices
    }

    pub fn num_steps(&self) -> usize {
        self.checkpoints.len() - 1
    }
}

/// Result of a solve: the trajectory and, in adjoint mode, its tape.
#[derive(Debug, Clone)]
pub struct Solution<B: Backend> {
    pub trajectory: Trajectory<B, 2>,
    pub tape: Option<AdjointTape<B>>,
}

/// Checks that evaluation times are non-empty, finite and non-decreasing.
pub fn validate_times(times: &[f64]) -> Result<()> {
    if times.is_empty() {
        return Err(HbnodeError::configuration(
            "evaluation times must not be empty",
        ));
    }
    if let Some(t) = times.iter().find(|t| !t.is_finite()) {
        return Err(HbnodeError::configuration(format!(
            "evaluation times must be finite, got {}",
            t
        )));
    }
    if let Some(pair) = times.windows(2).find(|pair| pair[1] < pair[0]) {
        return Err(HbnodeError::configuration(format!(
            "evaluation times must be non-decreasing, got {} after {}",
            pair[1], pair[0]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type Backend = NdArray<f32>;

    #[test]
    fn test_default_config() {
        let config = SolverConfig::new();
        assert_eq!(config.mode, SolveMode::Direct);
        assert_eq!(config.max_steps, 10000);
        assert!(config.init().is_ok());
    }

    #[test]
    fn test_invalid_tolerance_rejected() {
        let config = SolverConfig::new().with_rtol(0.0).with_atol(0.0);
        assert!(matches!(config.init(), Err(HbnodeError::Configuration(_))));
    }

    #[test]
    fn test_validate_times() {
        assert!(validate_times(&[0.0, 0.5, 0.5, 1.0]).is_ok());
        assert!(validate_times(&[]).is_err());
        assert!(validate_times(&[0.0, f64::NAN]).is_err());
        assert!(validate_times(&[1.0, 0.0]).is_err());
    }

    #[test]
    fn test_trajectory_stack_and_last() {
        let device = Default::default();
        let states = vec![
            Tensor::<Backend, 2>::zeros([2, 3], &device),
            Tensor::<Backend, 2>::ones([2, 3], &device),
        ];
        let trajectory = Trajectory::new(vec![0.0, 1.0], states);

        assert_eq!(trajectory.len(), 2);
        assert_eq!(trajectory.stack::<3>().dims(), [2, 2, 3]);
        let last = trajectory.into_last().unwrap();
        assert_eq!(last.sum().into_scalar(), 6.0);
    }
}
