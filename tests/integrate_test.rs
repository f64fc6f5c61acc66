//! Integration tests for the integration driver: residual channel, solver
//! failures and direct versus adjoint gradients

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, Param};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::tensor::backend::Backend as BackendTrait;
use burn::tensor::{ElementConversion, Tensor};
use hbnode::error::HbnodeError;
use hbnode::prelude::{IntegratorConfig, KineticEnergy, NodeLayer, OdeNodeConfig, VectorField};

type Backend = NdArray<f32>;
type AdBackend = Autodiff<Backend>;

fn decay_field(device: &NdArrayDevice) -> Linear<Backend> {
    LinearConfig::new(1, 1)
        .with_bias(false)
        .with_initializer(Initializer::Constant { value: -1.0 })
        .init(device)
}

fn max_abs_diff<const D: usize>(a: Tensor<Backend, D>, b: Tensor<Backend, D>) -> f32 {
    (a - b).abs().max().into_scalar().elem::<f32>()
}

/// `dx = -rate * x` on a bare `[batch]` state.
#[derive(Module, Debug)]
struct ScalarDecay<B: BackendTrait> {
    rate: Param<Tensor<B, 1>>,
}

impl<B: BackendTrait> VectorField<B, 1> for ScalarDecay<B> {
    fn evaluate(&mut self, _t: f64, state: Tensor<B, 1>) -> hbnode::error::Result<Tensor<B, 1>> {
        Ok(state.mul(self.rate.val().neg()))
    }
}

#[test]
fn test_rank_one_state_without_declared_shape() {
    let device = Default::default();
    let field = ScalarDecay::<Backend> {
        rate: Param::from_tensor(Tensor::from_floats([1.0], &device)),
    };
    let node = OdeNodeConfig::plain()
        .init::<Backend, _>(field, &device)
        .unwrap();
    let mut integrator = IntegratorConfig::new().with_tol(1e-6).init(node).unwrap();

    let x0 = Tensor::<Backend, 1>::from_floats([1.0, -2.0, 0.5], &device);
    let out = integrator.integrate(x0.clone()).unwrap();
    let x1 = out.trajectory.into_last().unwrap();

    assert_eq!(x1.dims(), [3]);
    let expected = x0.mul_scalar((-1.0f32).exp());
    assert!(max_abs_diff(x1, expected) < 1e-4);
}

#[test]
fn test_kinetic_energy_of_linear_decay() {
    let device = Default::default();
    let node = OdeNodeConfig::plain()
        .init::<Backend, _>(decay_field(&device), &device)
        .unwrap();
    let mut layer = NodeLayer::new(
        IntegratorConfig::new()
            .with_shape(Some(vec![1]))
            .with_tol(1e-6)
            .init_with_residual(node, KineticEnergy)
            .unwrap(),
    );

    let x0 = Tensor::<Backend, 2>::from_floats([[2.0], [-1.0]], &device);
    let (x1, residual) = layer.forward(x0).unwrap();

    // x = x0 e^-t, so the energy is x0^2 (1 - e^-2) / 2
    let ratio = (1.0 - (-2.0f32).exp()) / 2.0;
    let residual = residual.unwrap().into_data().to_vec::<f32>().unwrap();
    assert!((residual[0] - 4.0 * ratio).abs() < 1e-3);
    assert!((residual[1] - ratio).abs() < 1e-3);

    let x1 = x1.into_data().to_vec::<f32>().unwrap();
    assert!((x1[0] - 2.0 * (-1.0f32).exp()).abs() < 1e-4);
}

#[test]
fn test_residual_independent_of_evaluation_times() {
    let device = Default::default();
    let integrate = |times: Vec<f64>| {
        let node = OdeNodeConfig::plain()
            .init::<Backend, _>(decay_field(&device), &device)
            .unwrap();
        let mut integrator = IntegratorConfig::new()
            .with_shape(Some(vec![1]))
            .with_tol(1e-6)
            .with_evaluation_times(times)
            .init_with_residual(node, KineticEnergy)
            .unwrap();
        let x0 = Tensor::<Backend, 2>::from_floats([[1.5]], &device);
        integrator.integrate(x0).unwrap()
    };

    let coarse = integrate(vec![0.0, 1.0]);
    let fine = integrate(vec![0.0, 0.25, 0.5, 1.0]);

    assert_eq!(fine.trajectory.len(), 4);
    let coarse_residual = coarse.residual.unwrap();
    let fine_residual = fine.residual.unwrap();
    assert!(max_abs_diff(coarse_residual, fine_residual) < 1e-4);

    let coarse_last = coarse.trajectory.into_last().unwrap();
    let fine_last = fine.trajectory.into_last().unwrap();
    assert!(max_abs_diff(coarse_last, fine_last) < 1e-4);
}

#[test]
fn test_step_budget_surfaces_solver_failure() {
    let device = Default::default();
    let node = OdeNodeConfig::plain()
        .init::<Backend, _>(decay_field(&device), &device)
        .unwrap();
    let mut integrator = IntegratorConfig::new()
        .with_tol(1e-9)
        .with_max_steps(1)
        .with_evaluation_times(vec![0.0, 10.0])
        .init(node)
        .unwrap();

    let x0 = Tensor::<Backend, 2>::ones([1, 1], &device);
    let err = integrator.integrate(x0).unwrap_err();
    assert!(matches!(err, HbnodeError::SolverFailure(_)));
}

#[test]
fn test_backward_without_tape_rejected() {
    let device = Default::default();
    let linear = LinearConfig::new(2, 2).init::<AdBackend>(&device);
    let node = OdeNodeConfig::plain()
        .init::<AdBackend, _>(linear, &device)
        .unwrap();
    let mut integrator = IntegratorConfig::new().init(node).unwrap();

    let out = integrator
        .integrate(Tensor::<AdBackend, 2>::ones([1, 2], &device))
        .unwrap();
    assert!(!out.has_tape());
    let result = integrator.adjoint_backward(&out, &[None, None], None);
    assert!(matches!(result, Err(HbnodeError::Configuration(_))));
}

#[test]
fn test_adjoint_gradients_match_direct() {
    let device = Default::default();
    let linear = LinearConfig::new(2, 2)
        .with_initializer(Initializer::Uniform {
            min: -0.5,
            max: 0.5,
        })
        .init::<AdBackend>(&device);
    let x0_values = [[0.5f32, -1.0], [1.5, 0.25]];

    // differentiate through the solver
    let node = OdeNodeConfig::plain()
        .init::<AdBackend, _>(linear.clone(), &device)
        .unwrap();
    let mut direct = IntegratorConfig::new().with_tol(1e-6).init(node).unwrap();
    let x0 = Tensor::<AdBackend, 2>::from_floats(x0_values, &device).require_grad();
    let out = direct.integrate(x0.clone()).unwrap();
    let grads = out.trajectory.into_last().unwrap().sum().backward();
    let direct_x0 = x0.grad(&grads).unwrap();
    let direct_weight = direct.node().inner().weight.grad(&grads).unwrap();

    // adjoint pass
    let node = OdeNodeConfig::plain()
        .init::<AdBackend, _>(linear, &device)
        .unwrap();
    let mut adjoint = IntegratorConfig::new()
        .with_tol(1e-6)
        .with_adjoint(true)
        .init(node)
        .unwrap();
    let x0 = Tensor::<AdBackend, 2>::from_floats(x0_values, &device);
    let out = adjoint.integrate(x0).unwrap();
    assert!(out.has_tape());

    let seed = Tensor::<Backend, 2>::ones([2, 2], &device);
    let grads = adjoint
        .adjoint_backward(&out, &[None, Some(seed)], None)
        .unwrap();
    let weight_id = adjoint.node().inner().weight.id;
    let adjoint_weight = grads.params.get::<Backend, 2>(weight_id).unwrap();

    assert!(max_abs_diff(direct_x0, grads.initial_state) < 1e-3);
    assert!(max_abs_diff(direct_weight, adjoint_weight) < 1e-3);
}

#[test]
fn test_adjoint_heavy_ball_damping_gradient() {
    let device = Default::default();
    let linear = LinearConfig::new(2, 2)
        .with_initializer(Initializer::Zeros)
        .init::<AdBackend>(&device);
    let node = OdeNodeConfig::heavy_ball()
        .init::<AdBackend, _>(linear, &device)
        .unwrap();
    let mut integrator = IntegratorConfig::new()
        .with_tol(1e-6)
        .with_adjoint(true)
        .init(node)
        .unwrap();

    let x0 = Tensor::<AdBackend, 3>::from_floats([[[0.0, 0.0], [1.0, 1.0]]], &device);
    let out = integrator.integrate(x0).unwrap();

    let seed = Tensor::<Backend, 3>::from_floats([[[1.0, 1.0], [0.0, 0.0]]], &device);
    let grads = integrator
        .adjoint_backward(&out, &[None, Some(seed)], None)
        .unwrap();

    // m decays with the damping, so h = -∫ m depends on gamma
    let gamma_id = integrator.node().heavy_ball_params().unwrap().gamma.id;
    let gamma_grad = grads.params.get::<Backend, 1>(gamma_id).unwrap();
    assert!(gamma_grad.abs().sum().into_scalar() > 0.0);
    assert_eq!(grads.initial_state.dims(), [1, 2, 2]);
}
