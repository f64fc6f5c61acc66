//! Silverbox-style System Identification with the Adjoint Method
//!
//! A forced, weakly nonlinear oscillator
//!
//! ```text
//! h' = -m
//! m' = W [h, 0.01 h^3, u(t)] - gamma m
//! ```
//!
//! is driven by a sampled input signal `u`. A reference system generates the
//! observed positions; a fresh heavy-ball node is fitted to them with adjoint
//! gradients, and the lift producing the initial velocity is trained through
//! the returned initial-state gradient.
//!
//! Run with `cargo run --example silverbox`.

use burn::backend::{Autodiff, NdArray};
use burn::module::Module;
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use hbnode::prelude::*;

type InnerBackend = NdArray<f32>;
type TrainBackend = Autodiff<InnerBackend>;

const SAMPLES: usize = 64;
const HORIZON: usize = 16;
const EPOCHS: usize = 40;
const LEARNING_RATE: f64 = 1e-2;

/// Restoring force with a cubic term and an exogenous input.
#[derive(Module, Debug)]
struct ForcedField<B: Backend> {
    fc: Linear<B>,
    signal: SampledSignal<B>,
}

impl<B: Backend> ForcedField<B> {
    fn new(signal: SampledSignal<B>, initializer: Initializer, device: &B::Device) -> Self {
        Self {
            fc: LinearConfig::new(3, 1)
                .with_bias(false)
                .with_initializer(initializer)
                .init(device),
            signal,
        }
    }
}

impl<B: Backend> VectorField<B, 3> for ForcedField<B> {
    fn evaluate(&mut self, t: f64, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [batch, _, _] = x.dims();
        let u = self.signal.at(t).reshape([1, 1, 1]).repeat_dim(0, batch);
        let cubic = x.clone().mul(x.clone()).mul(x.clone()).mul_scalar(0.01);
        Ok(self.fc.forward(Tensor::cat(vec![x, cubic, u], 2)))
    }
}

fn input_signal<B: Backend>(device: &B::Device) -> Result<SampledSignal<B>> {
    let values: Vec<f32> = (0..SAMPLES)
        .map(|k| {
            let t = k as f32;
            (0.3 * t).sin() + 0.5 * (0.11 * t + 1.0).sin()
        })
        .collect();
    let samples = Tensor::from_data(TensorData::new(values, [SAMPLES, 1]), device);
    SampledSignal::new(samples)
}

/// Positions of the reference system at `times`, as `[1, 2, 1]` with a zero
/// momentum slot.
fn observations(
    signal: SampledSignal<InnerBackend>,
    times: &[f64],
) -> Result<Vec<Tensor<InnerBackend, 3>>> {
    let device = Default::default();
    let field = ForcedField::new(signal, Initializer::Constant { value: -0.8 }, &device);
    let node = OdeNodeConfig::heavy_ball()
        .with_gamma_guess(0.0)
        .init::<InnerBackend, _>(field, &device)?;
    let mut integrator = IntegratorConfig::new()
        .with_tol(1e-5)
        .with_evaluation_times(times.to_vec())
        .init(node)?;

    let x0 = Tensor::<InnerBackend, 3>::from_floats([[[0.5], [0.0]]], &device);
    let mask = position_mask(&device);
    let out = integrator.integrate(x0)?;
    Ok(out
        .trajectory
        .into_states()
        .into_iter()
        .map(|state| state * mask.clone())
        .collect())
}

fn position_mask(device: &<InnerBackend as Backend>::Device) -> Tensor<InnerBackend, 3> {
    Tensor::from_floats([[[1.0], [0.0]]], device)
}

fn main() -> Result<()> {
    println!("=== Silverbox-style Identification (adjoint) ===\n");

    let device = Default::default();
    let times: Vec<f64> = (0..=HORIZON).map(|t| t as f64).collect();
    let targets = observations(input_signal::<InnerBackend>(&device)?, &times)?;
    let mask = position_mask(&device);

    let field = ForcedField::new(
        input_signal::<TrainBackend>(&device)?,
        Initializer::Uniform {
            min: -0.5,
            max: 0.5,
        },
        &device,
    );
    let node = OdeNodeConfig::heavy_ball().init::<TrainBackend, _>(field, &device)?;
    let mut integrator = IntegratorConfig::new()
        .with_tol(1e-4)
        .with_adjoint(true)
        .with_evaluation_times(times.clone())
        .init(node)?;
    let mut lift = InitialVelocityConfig::new(1, 1).init::<TrainBackend>(&device)?;

    let mut node_optim = AdamConfig::new().init();
    let mut lift_optim = AdamConfig::new().init();

    // observed initial position
    let y0 = Tensor::<TrainBackend, 2>::from_floats([[0.5]], &device);
    let scale = 1.0 / times.len() as f64;

    for epoch in 1..=EPOCHS {
        integrator.node_mut().reset_nfe();
        let x0 = lift.forward(y0.clone())?;
        let out = integrator.integrate(x0.clone())?;

        let mut loss = 0.0f32;
        let mut trajectory_grads = Vec::with_capacity(times.len());
        for (state, target) in out.trajectory.states().iter().zip(&targets) {
            let error = (state.clone().inner() - target.clone()) * mask.clone();
            loss += error.clone().powf_scalar(2.0).sum().into_scalar().elem::<f32>();
            trajectory_grads.push(Some(error.mul_scalar(2.0 * scale)));
        }
        loss *= scale as f32;
        let forward_nfe = integrator.nfe();

        let grads = integrator.adjoint_backward(&out, &trajectory_grads, None)?;
        let node_grads = grads.params;
        integrator = integrator.map_node(|node| node_optim.step(LEARNING_RATE, node, node_grads));

        // chain the initial-state gradient into the lift
        let seed = Tensor::<TrainBackend, 3>::from_inner(grads.initial_state);
        let lift_grads = GradientsParams::from_grads((x0 * seed).sum().backward(), &lift);
        lift = lift_optim.step(LEARNING_RATE, lift, lift_grads);

        if epoch % 5 == 0 || epoch == 1 {
            println!(
                "epoch {:>3} | mse {:.5} | forward nfe {:>4} | total nfe {:>5}",
                epoch,
                loss,
                forward_nfe,
                integrator.nfe()
            );
        }
    }

    println!("\n=== Done ===");
    Ok(())
}
