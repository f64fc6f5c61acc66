//! Integration driver
//!
//! [`NodeIntegrator`] turns an [`OdeNode`] into a continuous-depth block:
//! it flattens the initial state, appends the residual accumulator when a
//! [`Residual`] is attached, runs the adaptive solver and reshapes every
//! recorded state back. [`NodeLayer`] is the same driver reduced to the final
//! state, for use as a layer inside a network.

use crate::error::{HbnodeError, Result};
use crate::field::{
    flatten, state_dims, unflatten, FieldWrapper, NoResidual, Residual, VectorField,
};
use crate::nodes::OdeNode;
use crate::solver::{
    self, validate_times, AdjointTape, Dopri5, SolveMode, SolverConfig, Trajectory,
};
use burn::config::Config;
use burn::module::{AutodiffModule, Module};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use tracing::debug;

/// Configuration for [`NodeIntegrator`] and [`NodeLayer`].
#[derive(Config, Debug)]
pub struct IntegratorConfig {
    /// Feature shape of the state without the batch axis
    pub shape: Option<Vec<usize>>,
    /// Absolute and relative solver tolerance
    #[config(default = 1e-3)]
    pub tol: f64,
    /// Use the adjoint sensitivity method
    #[config(default = false)]
    pub adjoint: bool,
    /// Times at which the state is recorded; the first is the start time
    #[config(default = "vec![0.0, 1.0]")]
    pub evaluation_times: Vec<f64>,
    #[config(default = 10000)]
    pub max_steps: usize,
}

impl IntegratorConfig {
    /// Wraps `node` without a regularization channel.
    pub fn init<B: Backend, F: Module<B>>(
        &self,
        node: OdeNode<B, F>,
    ) -> Result<NodeIntegrator<B, F, NoResidual>> {
        self.build(node, None)
    }

    /// Wraps `node` and integrates `residual` alongside the state.
    ///
    /// A declared [`shape`](IntegratorConfig::shape) is required.
    pub fn init_with_residual<B: Backend, F: Module<B>, R>(
        &self,
        node: OdeNode<B, F>,
        residual: R,
    ) -> Result<NodeIntegrator<B, F, R>> {
        if self.shape.is_none() {
            return Err(HbnodeError::configuration(
                "a residual function requires a declared state shape",
            ));
        }
        self.build(node, Some(residual))
    }

    fn build<B: Backend, F: Module<B>, R>(
        &self,
        node: OdeNode<B, F>,
        residual: Option<R>,
    ) -> Result<NodeIntegrator<B, F, R>> {
        validate_times(&self.evaluation_times)?;
        if !(self.tol > 0.0) {
            return Err(HbnodeError::configuration(format!(
                "tolerance must be positive, got {}",
                self.tol
            )));
        }
        let mode = if self.adjoint {
            SolveMode::Adjoint
        } else {
            SolveMode::Direct
        };
        let solver = SolverConfig::new()
            .with_rtol(self.tol)
            .with_atol(self.tol)
            .with_mode(mode)
            .with_max_steps(self.max_steps)
            .init()?;

        Ok(NodeIntegrator {
            node,
            residual,
            shape: self.shape.clone(),
            times: self.evaluation_times.clone(),
            solver,
        })
    }
}

/// Output of [`NodeIntegrator::integrate`].
#[derive(Debug, Clone)]
pub struct Integration<B: Backend, const D: usize> {
    /// One `[batch, *shape]` state per evaluation time
    pub trajectory: Trajectory<B, D>,
    /// Residual accumulator at the final evaluation time, `[batch, osize]`
    pub residual: Option<Tensor<B, 2>>,
    shape: Vec<usize>,
    tape: Option<AdjointTape<B>>,
}

impl<B: Backend, const D: usize> Integration<B, D> {
    /// Whether the integration can be differentiated with
    /// [`NodeIntegrator::adjoint_backward`].
    pub fn has_tape(&self) -> bool {
        self.tape.is_some()
    }

    pub fn final_state(&self) -> Option<&Tensor<B, D>> {
        self.trajectory.last()
    }
}

/// Gradients returned by [`NodeIntegrator::adjoint_backward`].
pub struct NodeGradients<B: AutodiffBackend, const D: usize> {
    /// Loss gradient with respect to the initial state, `[batch, *shape]`
    pub initial_state: Tensor<B::InnerBackend, D>,
    /// Loss gradients of the node parameters
    pub params: GradientsParams,
}

/// Integrates an [`OdeNode`] over a fixed set of evaluation times.
///
/// # Type Parameters
/// * `B` - The backend type
/// * `F` - The node's rate function
/// * `R` - Residual function integrated alongside the state
#[derive(Debug)]
pub struct NodeIntegrator<B: Backend, F: Module<B>, R = NoResidual> {
    node: OdeNode<B, F>,
    residual: Option<R>,
    shape: Option<Vec<usize>>,
    times: Vec<f64>,
    solver: Dopri5,
}

impl<B: Backend, F: Module<B>, R> NodeIntegrator<B, F, R> {
    pub fn node(&self) -> &OdeNode<B, F> {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut OdeNode<B, F> {
        &mut self.node
    }

    pub fn into_node(self) -> OdeNode<B, F> {
        self.node
    }

    /// Replaces the node, e.g. with the result of an optimizer step.
    pub fn map_node(mut self, f: impl FnOnce(OdeNode<B, F>) -> OdeNode<B, F>) -> Self {
        self.node = f(self.node);
        self
    }

    pub fn residual(&self) -> Option<&R> {
        self.residual.as_ref()
    }

    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    pub fn evaluation_times(&self) -> &[f64] {
        &self.times
    }

    pub fn mode(&self) -> SolveMode {
        self.solver.config().mode
    }

    pub fn tol(&self) -> f64 {
        self.solver.config().atol
    }

    /// Evaluations of the node since its counter was last reset.
    pub fn nfe(&self) -> usize {
        self.node.nfe()
    }

    /// Integrates from `initial` over the configured evaluation times.
    pub fn integrate<const D: usize>(&mut self, initial: Tensor<B, D>) -> Result<Integration<B, D>>
    where
        F: VectorField<B, D>,
        R: Residual<B, D>,
    {
        let times = self.times.clone();
        self.integrate_at(initial, &times)
    }

    /// Integrates from `initial` over explicit evaluation times.
    pub fn integrate_at<const D: usize>(
        &mut self,
        initial: Tensor<B, D>,
        times: &[f64],
    ) -> Result<Integration<B, D>>
    where
        F: VectorField<B, D>,
        R: Residual<B, D>,
    {
        integrate_node(
            &mut self.node,
            self.residual.as_ref(),
            self.shape.as_deref(),
            &self.solver,
            initial,
            times,
        )
    }

    fn residual_width<const D: usize>(&self) -> usize
    where
        R: Residual<B, D>,
    {
        self.residual.as_ref().map(|r| r.osize()).unwrap_or(0)
    }
}

impl<B, F, R> NodeIntegrator<B, F, R>
where
    B: AutodiffBackend,
    F: Module<B>,
    OdeNode<B, F>: AutodiffModule<B>,
{
    /// Gradients of an adjoint-mode integration.
    ///
    /// # Arguments
    /// * `integration` - Result of [`integrate`](Self::integrate) in adjoint mode
    /// * `trajectory_grads` - Loss gradient per evaluation time, `None` where
    ///   the loss ignores that state
    /// * `residual_grad` - Loss gradient of the final residual
    pub fn adjoint_backward<const D: usize>(
        &mut self,
        integration: &Integration<B, D>,
        trajectory_grads: &[Option<Tensor<B::InnerBackend, D>>],
        residual_grad: Option<Tensor<B::InnerBackend, 2>>,
    ) -> Result<NodeGradients<B, D>>
    where
        F: VectorField<B, D>,
        R: Residual<B, D>,
    {
        let tape = integration.tape.as_ref().ok_or_else(|| {
            HbnodeError::configuration("integration was not recorded in adjoint mode")
        })?;
        let count = integration.trajectory.len();
        if trajectory_grads.len() != count {
            return Err(HbnodeError::shape_mismatch(
                "trajectory gradients",
                vec![count],
                vec![trajectory_grads.len()],
            ));
        }

        let template = state_dims::<D>(&integration.shape)?;
        let width: usize = integration.shape.iter().product();
        let osize = self.residual_width::<D>();
        let start = tape.checkpoints()[0].1.clone().inner();
        let [batch, _] = start.dims();
        let device = start.device();

        let mut flat_grads = Vec::with_capacity(count);
        for (index, grad) in trajectory_grads.iter().enumerate() {
            let primary = grad.clone().map(flatten);
            let flat = if osize == 0 {
                primary
            } else {
                let residual = residual_grad.clone().filter(|_| index + 1 == count);
                match (primary, residual) {
                    (None, None) => None,
                    (primary, residual) => {
                        let primary =
                            primary.unwrap_or_else(|| Tensor::zeros([batch, width], &device));
                        let residual =
                            residual.unwrap_or_else(|| Tensor::zeros([batch, osize], &device));
                        Some(Tensor::cat(vec![primary, residual], 1))
                    }
                }
            };
            flat_grads.push(flat);
        }

        let view = self.node.clone();
        let mut wrapper = FieldWrapper::<_, R, D>::new(
            &mut self.node,
            &integration.shape,
            self.residual.as_ref(),
        )?;
        let grads = solver::adjoint_backward(&mut wrapper, &view, tape, &flat_grads)?;

        let initial = if osize > 0 {
            grads.initial_state.narrow(1, 0, width)
        } else {
            grads.initial_state
        };
        Ok(NodeGradients {
            initial_state: unflatten(initial, template)?,
            params: grads.params,
        })
    }
}

/// Flattens, solves and reshapes back; shared by [`NodeIntegrator`] and the
/// recurrent layer.
pub(crate) fn integrate_node<B, F, R, const D: usize>(
    node: &mut OdeNode<B, F>,
    residual: Option<&R>,
    shape: Option<&[usize]>,
    solver: &Dopri5,
    initial: Tensor<B, D>,
    times: &[f64],
) -> Result<Integration<B, D>>
where
    B: Backend,
    F: Module<B> + VectorField<B, D>,
    R: Residual<B, D>,
{
    let dims = initial.dims();
    let batch = dims[0];
    let shape = match shape {
        Some(shape) if shape != &dims[1..] => {
            return Err(HbnodeError::shape_mismatch(
                "integrate",
                shape.to_vec(),
                dims[1..].to_vec(),
            ));
        }
        Some(shape) => shape.to_vec(),
        None => dims[1..].to_vec(),
    };
    let template = state_dims::<D>(&shape)?;
    let width: usize = shape.iter().product();
    let osize = residual.map(|r| r.osize()).unwrap_or(0);

    let device = initial.device();
    let mut y0 = flatten(initial);
    if osize > 0 {
        y0 = Tensor::cat(vec![y0, Tensor::zeros([batch, osize], &device)], 1);
    }

    let mut wrapper = FieldWrapper::<_, R, D>::new(node, &shape, residual)?;
    let solution = solver.solve(&mut wrapper, y0, times)?;

    let residual = match (osize, solution.trajectory.last()) {
        (0, _) | (_, None) => None,
        (_, Some(last)) => Some(last.clone().narrow(1, width, osize)),
    };
    let trajectory = solution.trajectory.map(|state| {
        let primary = if osize > 0 {
            state.narrow(1, 0, width)
        } else {
            state
        };
        unflatten(primary, template)
    })?;

    debug!(
        nfe = node.nfe(),
        times = times.len(),
        kind = node.kind().name(),
        "node integration finished"
    );

    Ok(Integration {
        trajectory,
        residual,
        shape,
        tape: solution.tape,
    })
}

/// Continuous-depth layer returning only the state at the final time.
#[derive(Debug)]
pub struct NodeLayer<B: Backend, F: Module<B>, R = NoResidual> {
    integrator: NodeIntegrator<B, F, R>,
}

impl<B: Backend, F: Module<B>, R> NodeLayer<B, F, R> {
    pub fn new(integrator: NodeIntegrator<B, F, R>) -> Self {
        Self { integrator }
    }

    pub fn integrator(&self) -> &NodeIntegrator<B, F, R> {
        &self.integrator
    }

    pub fn integrator_mut(&mut self) -> &mut NodeIntegrator<B, F, R> {
        &mut self.integrator
    }

    pub fn into_integrator(self) -> NodeIntegrator<B, F, R> {
        self.integrator
    }

    pub fn nfe(&self) -> usize {
        self.integrator.nfe()
    }

    /// Final state and, when a residual is attached, its accumulated value.
    pub fn forward<const D: usize>(
        &mut self,
        initial: Tensor<B, D>,
    ) -> Result<(Tensor<B, D>, Option<Tensor<B, 2>>)>
    where
        F: VectorField<B, D>,
        R: Residual<B, D>,
    {
        let Integration {
            trajectory,
            residual,
            ..
        } = self.integrator.integrate(initial)?;
        let last = trajectory
            .into_last()
            .ok_or_else(|| HbnodeError::solver_failure("solver returned an empty trajectory"))?;
        Ok((last, residual))
    }
}
