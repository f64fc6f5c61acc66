//! HBNODE Classifier - Concentric Rings
//!
//! Trains a heavy-ball neural ODE to separate points inside the unit disc
//! from points on a surrounding ring. The input is lifted to `[h, m]` slots,
//! evolved over `t in [0, 1]` and the final position slot is classified.
//!
//! Run with `cargo run --example hbnode_classifier`.

use burn::backend::{Autodiff, NdArray};
use burn::module::Module;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::{Linear, LinearConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, ElementConversion, Int, Tensor};
use hbnode::prelude::*;

type TrainBackend = Autodiff<NdArray<f32>>;

const POINTS: usize = 256;
const FEATURES: usize = 2;
const WIDTH: usize = 16;
const EPOCHS: usize = 30;
const LEARNING_RATE: f64 = 1e-2;

#[derive(Module, Debug)]
struct Classifier<B: Backend> {
    lift: InitialVelocity<B>,
    node: OdeNode<B, TimeInvariantMlp<B>>,
    readout: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    fn new(device: &B::Device) -> Result<Self> {
        let df = MlpFieldConfig::new(vec![FEATURES, WIDTH, FEATURES]).init::<B>(device)?;
        Ok(Self {
            lift: InitialVelocityConfig::new(FEATURES, FEATURES).init(device)?,
            node: OdeNodeConfig::heavy_ball().init(df, device)?,
            readout: LinearConfig::new(FEATURES, 2).init(device),
        })
    }

    /// Logits and the number of field evaluations the solve took.
    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, usize)> {
        let x0 = self.lift.forward(x)?;
        let integrator = IntegratorConfig::new().init(self.node.clone())?;
        let mut layer = NodeLayer::new(integrator);

        let (x1, _) = layer.forward(x0)?;
        let [batch, _, features] = x1.dims();
        let h = x1.narrow(1, 0, 1).reshape([batch, features]);
        Ok((self.readout.forward(h), layer.nfe()))
    }
}

/// Uniform points in `[-2.5, 2.5]^2`; class 1 outside radius 1.5.
fn rings<B: Backend>(device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 1, Int>) {
    let x = Tensor::<B, 2>::random([POINTS, FEATURES], Distribution::Uniform(-2.5, 2.5), device);
    let labels = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .greater_elem(2.25)
        .int()
        .reshape([POINTS]);
    (x, labels)
}

fn accuracy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> f32 {
    let predicted = logits.argmax(1).reshape([POINTS]);
    let correct = predicted.equal(labels).int().sum().into_scalar().elem::<f32>();
    correct / POINTS as f32
}

fn main() -> Result<()> {
    println!("=== HBNODE Classifier ===\n");

    let device = Default::default();
    let (x, labels) = rings::<TrainBackend>(&device);
    let loss_fn = CrossEntropyLossConfig::new().init(&device);

    let mut model = Classifier::<TrainBackend>::new(&device)?;
    let mut optim = AdamConfig::new().init();

    println!("Model:");
    println!("  Lift:    [batch, {}] -> [batch, 2, {}]", FEATURES, FEATURES);
    println!("  Field:   MLP {} -> {} -> {}", FEATURES, WIDTH, FEATURES);
    println!("  Readout: {} -> 2 classes", FEATURES);
    println!();

    for epoch in 1..=EPOCHS {
        let (logits, nfe) = model.forward(x.clone())?;
        let loss = loss_fn.forward(logits.clone(), labels.clone());
        let loss_value = loss.clone().into_scalar().elem::<f32>();
        let acc = accuracy(logits, labels.clone());

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optim.step(LEARNING_RATE, model, grads);

        if epoch % 5 == 0 || epoch == 1 {
            let damping = model
                .node
                .damping()
                .map(|gamma| gamma.into_scalar().elem::<f32>())
                .unwrap_or_default();
            println!(
                "epoch {:>3} | loss {:.4} | acc {:.3} | nfe {:>3} | damping {:.4}",
                epoch, loss_value, acc, nfe, damping
            );
        }
    }

    println!("\n=== Done ===");
    Ok(())
}
