//! ODE-RNN Forecast - Irregularly Sampled Sine Waves
//!
//! Sine waves with per-sample phases are observed at irregular gaps. An
//! ODE-RNN with a heavy-ball hidden state folds the observations in, then
//! forecasts the wave a few time units past the last observation.
//!
//! Run with `cargo run --example ode_rnn_forecast`.

use burn::backend::{Autodiff, NdArray};
use burn::module::Module;
use burn::nn::loss::{MseLoss, Reduction};
use burn::nn::{Linear, LinearConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use hbnode::prelude::*;

type TrainBackend = Autodiff<NdArray<f32>>;

const BATCH: usize = 8;
const STEPS: usize = 12;
const HIDDEN: usize = 8;
const EPOCHS: usize = 20;
const LEARNING_RATE: f64 = 5e-3;
const FORECAST: [f64; 4] = [0.0, 1.0, 2.0, 3.0];

type Recurrent<B> = OdeRnn<B, TimeInvariantMlp<B>, DenseUpdate<B>, Linear<B>>;

#[derive(Module, Debug)]
struct Forecaster<B: Backend> {
    rnn: Recurrent<B>,
    readout: Linear<B>,
}

impl<B: Backend> Forecaster<B> {
    fn new(device: &B::Device) -> Result<Self> {
        let df = MlpFieldConfig::new(vec![HIDDEN, 2 * HIDDEN, HIDDEN]).init::<B>(device)?;
        let ode = OdeNodeConfig::heavy_ball().init(df, device)?;
        let update = DenseUpdateConfig::new(vec![2, HIDDEN], 1).init(device)?;
        let rnn = OdeRnnConfig::new(vec![2, HIDDEN])
            .with_tol(1e-4)
            .init(ode, update, None)?;
        Ok(Self {
            rnn,
            readout: LinearConfig::new(HIDDEN, 1).init(device),
        })
    }

    /// Predicted values at the forecast times, `[forecast, batch]`.
    fn forward(&mut self, times: Tensor<B, 2>, inputs: Tensor<B, 3>) -> Result<Tensor<B, 2>> {
        let out = self.rnn.forward::<3>(times, inputs, Some(&FORECAST))?;
        let forecast = out
            .forecast
            .ok_or_else(|| HbnodeError::configuration("forecast times were not applied"))?;
        let predictions = forecast
            .into_states()
            .into_iter()
            .map(|state| {
                let h = state.narrow(1, 0, 1).reshape([BATCH, HIDDEN]);
                self.readout.forward(h).reshape([1, BATCH])
            })
            .collect();
        Ok(Tensor::cat(predictions, 0))
    }
}

/// Observation gaps, observations and forecast targets.
fn waves<B: Backend>(device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 3>, Tensor<B, 2>) {
    let mut gaps = vec![0.0f32; STEPS * BATCH];
    let mut values = vec![0.0f32; STEPS * BATCH];
    let mut targets = vec![0.0f32; FORECAST.len() * BATCH];

    for b in 0..BATCH {
        let phase = 0.7 * b as f32;
        let mut t = 0.0f32;
        for k in 0..STEPS {
            let gap = 0.5 + 0.25 * ((7 * k + 3 * b) % 5) as f32;
            t += gap;
            gaps[k * BATCH + b] = gap;
            values[k * BATCH + b] = (0.6 * t + phase).sin();
        }
        for (i, tau) in FORECAST.iter().enumerate() {
            targets[i * BATCH + b] = (0.6 * (t + *tau as f32) + phase).sin();
        }
    }

    (
        Tensor::from_data(TensorData::new(gaps, [STEPS, BATCH]), device),
        Tensor::from_data(TensorData::new(values, [STEPS, BATCH, 1]), device),
        Tensor::from_data(TensorData::new(targets, [FORECAST.len(), BATCH]), device),
    )
}

fn main() -> Result<()> {
    println!("=== ODE-RNN Forecast ===\n");

    let device = Default::default();
    let (times, inputs, targets) = waves::<TrainBackend>(&device);
    let mut model = Forecaster::<TrainBackend>::new(&device)?;
    let mut optim = AdamConfig::new().init();

    println!("Sequences: {} x {} irregular observations", BATCH, STEPS);
    println!("Hidden:    [2, {}] heavy-ball state", HIDDEN);
    println!("Forecast:  {:?}", FORECAST);
    println!();

    for epoch in 1..=EPOCHS {
        model.rnn.ode_mut().reset_nfe();
        let predictions = model.forward(times.clone(), inputs.clone())?;
        let loss = MseLoss::new().forward(predictions, targets.clone(), Reduction::Mean);
        let loss_value = loss.clone().into_scalar().elem::<f32>();
        let nfe = model.rnn.nfe();

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optim.step(LEARNING_RATE, model, grads);

        println!("epoch {:>3} | mse {:.5} | nfe {:>5}", epoch, loss_value, nfe);
    }

    println!("\n=== Done ===");
    Ok(())
}
