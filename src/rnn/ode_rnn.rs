//! ODE-RNN hybrid layer
//!
//! Alternates continuous evolution of the hidden state (one ODE segment per
//! observation, time-scaled by the observation's time stamp) with a discrete
//! recurrent update that folds the observation in.

use crate::error::{HbnodeError, Result};
use crate::field::{state_dims, with_batch, NoResidual, VectorField};
use crate::integrate::integrate_node;
use crate::nodes::OdeNode;
use crate::solver::{Dopri5, SolveMode, SolverConfig, Trajectory};
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::Linear;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use tracing::debug;

/// Discrete update of the hidden state from one observation.
pub trait RecurrentUpdate<B: Backend, const D: usize> {
    /// `hidden: [batch, *hidden_shape]`, `input: [batch, features]`
    fn update(&self, hidden: Tensor<B, D>, input: Tensor<B, 2>) -> Result<Tensor<B, D>>;
}

/// Maps the whole flattened input sequence to the initial hidden state.
pub trait InitialCondition<B: Backend> {
    /// `[batch, steps * features] -> [batch, prod(hidden_shape)]`
    fn initial_condition(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2>;
}

impl<B: Backend> InitialCondition<B> for Linear<B> {
    fn initial_condition(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(inputs)
    }
}

/// Configuration for [`OdeRnn`].
#[derive(Config, Debug)]
pub struct OdeRnnConfig {
    /// Hidden state shape without the batch axis
    pub hidden_shape: Vec<usize>,
    /// Emit the post-update states instead of the post-ODE states
    #[config(default = false)]
    pub rnn_out: bool,
    /// Emit both sequences, `[rnn, ode]`
    #[config(default = false)]
    pub both: bool,
    /// Absolute and relative tolerance of every ODE segment
    #[config(default = 1e-7)]
    pub tol: f64,
    #[config(default = 10000)]
    pub max_steps: usize,
}

impl OdeRnnConfig {
    /// Assembles the layer.
    ///
    /// # Arguments
    /// * `ode` - Node evolving the hidden state between observations
    /// * `rnn` - Recurrent update applied at every observation
    /// * `ic` - Optional initial-condition network; zeros when `None`
    pub fn init<B, F, U, I>(
        &self,
        ode: OdeNode<B, F>,
        rnn: U,
        ic: Option<I>,
    ) -> Result<OdeRnn<B, F, U, I>>
    where
        B: Backend,
        F: Module<B>,
        U: Module<B>,
        I: Module<B>,
    {
        if self.hidden_shape.is_empty() || self.hidden_shape.contains(&0) {
            return Err(HbnodeError::configuration(format!(
                "hidden shape must be non-empty with positive sizes, got {:?}",
                self.hidden_shape
            )));
        }
        let solver = SolverConfig::new()
            .with_rtol(self.tol)
            .with_atol(self.tol)
            .with_mode(SolveMode::Direct)
            .with_max_steps(self.max_steps)
            .init()?;

        Ok(OdeRnn {
            ode,
            rnn,
            ic,
            hidden_shape: self.hidden_shape.clone(),
            rnn_out: self.rnn_out,
            both: self.both,
            solver: Ignored(solver),
        })
    }
}

/// Output of [`OdeRnn::forward`].
#[derive(Debug, Clone)]
pub struct RnnOutput<B: Backend, const D: usize> {
    /// `[h_rnn, h_ode]` when both are requested, otherwise the single
    /// selected sequence; each has `steps + 1` states
    pub sequences: Vec<Vec<Tensor<B, D>>>,
    /// States at the forecast times, starting from the last produced state:
    /// `h_rnn[steps]` with `rnn_out`, otherwise `h_ode[steps]`
    pub forecast: Option<Trajectory<B, D>>,
}

impl<B: Backend, const D: usize> RnnOutput<B, D> {
    /// Every sequence stacked along a leading time axis; `D2` must be `D + 1`.
    pub fn stacked<const D2: usize>(&self) -> Vec<Tensor<B, D2>> {
        self.sequences
            .iter()
            .map(|sequence| Tensor::stack::<D2>(sequence.clone(), 0))
            .collect()
    }
}

/// Zero-valued leaves added to hidden states by [`OdeRnn::forward_retaining`].
///
/// The gradient of a probe equals the gradient of the hidden state it was
/// added to.
#[derive(Debug, Clone)]
pub struct GradProbes<B: Backend, const D: usize> {
    ode: Vec<Option<Tensor<B, D>>>,
    rnn: Vec<Option<Tensor<B, D>>>,
}

impl<B: Backend, const D: usize> GradProbes<B, D> {
    fn new(len: usize) -> Self {
        Self {
            ode: vec![None; len],
            rnn: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.ode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ode.is_empty()
    }

    pub fn ode_probe(&self, index: usize) -> Option<&Tensor<B, D>> {
        self.ode.get(index).and_then(Option::as_ref)
    }

    pub fn rnn_probe(&self, index: usize) -> Option<&Tensor<B, D>> {
        self.rnn.get(index).and_then(Option::as_ref)
    }
}

impl<B: AutodiffBackend, const D: usize> GradProbes<B, D> {
    /// Gradient of the post-ODE state at `index`.
    pub fn ode_grad(
        &self,
        index: usize,
        grads: &B::Gradients,
    ) -> Option<Tensor<B::InnerBackend, D>> {
        self.ode_probe(index).and_then(|probe| probe.grad(grads))
    }

    /// Gradient of the post-update state at `index`.
    pub fn rnn_grad(
        &self,
        index: usize,
        grads: &B::Gradients,
    ) -> Option<Tensor<B::InnerBackend, D>> {
        self.rnn_probe(index).and_then(|probe| probe.grad(grads))
    }
}

#[derive(Clone, Copy)]
enum Sequence {
    Ode,
    Rnn,
}

/// Routes hidden states through probes when enabled.
struct Retainer<B: Backend, const D: usize> {
    probes: Option<GradProbes<B, D>>,
}

impl<B: Backend, const D: usize> Retainer<B, D> {
    fn tap(&mut self, which: Sequence, index: usize, state: Tensor<B, D>) -> Tensor<B, D> {
        let Some(probes) = self.probes.as_mut() else {
            return state;
        };
        // only autodiff backends track the probe
        let probe = state.zeros_like().require_grad();
        if !probe.is_require_grad() {
            return state;
        }
        let slot = match which {
            Sequence::Ode => &mut probes.ode[index],
            Sequence::Rnn => &mut probes.rnn[index],
        };
        *slot = Some(probe.clone());
        state + probe
    }
}

/// Hybrid ODE / recurrent sequence model.
///
/// # Type Parameters
/// * `B` - The backend type
/// * `F` - Rate function of the ODE node
/// * `U` - Recurrent update module
/// * `I` - Initial-condition module
///
/// # Tensor Shapes
///
/// | Tensor | Shape |
/// |--------|-------|
/// | `times` | `[steps, batch]` |
/// | `inputs` | `[steps, batch, features]` |
/// | each emitted state | `[batch, *hidden_shape]` |
#[derive(Module, Debug)]
pub struct OdeRnn<B: Backend, F: Module<B>, U: Module<B>, I: Module<B>> {
    ode: OdeNode<B, F>,
    rnn: U,
    ic: Option<I>,
    #[module(skip)]
    hidden_shape: Vec<usize>,
    #[module(skip)]
    rnn_out: bool,
    #[module(skip)]
    both: bool,
    solver: Ignored<Dopri5>,
}

impl<B, F, U, I> OdeRnn<B, F, U, I>
where
    B: Backend,
    F: Module<B>,
    U: Module<B>,
    I: Module<B>,
{
    pub fn ode(&self) -> &OdeNode<B, F> {
        &self.ode
    }

    pub fn ode_mut(&mut self) -> &mut OdeNode<B, F> {
        &mut self.ode
    }

    pub fn rnn(&self) -> &U {
        &self.rnn
    }

    pub fn initial_condition(&self) -> Option<&I> {
        self.ic.as_ref()
    }

    pub fn hidden_shape(&self) -> &[usize] {
        &self.hidden_shape
    }

    /// Number of ODE evaluations since the node's counter was reset.
    pub fn nfe(&self) -> usize {
        self.ode.nfe()
    }

    /// Runs the sequence.
    ///
    /// # Arguments
    /// * `times` - Per-step, per-sample time scale, `[steps, batch]`
    /// * `inputs` - Observations, `[steps, batch, features]`
    /// * `multiforecast` - Times at which to forecast past the last step
    pub fn forward<const D: usize>(
        &mut self,
        times: Tensor<B, 2>,
        inputs: Tensor<B, 3>,
        multiforecast: Option<&[f64]>,
    ) -> Result<RnnOutput<B, D>>
    where
        F: VectorField<B, D>,
        U: RecurrentUpdate<B, D>,
        I: InitialCondition<B>,
    {
        let mut retainer = Retainer { probes: None };
        let result = self.run(times, inputs, multiforecast, &mut retainer);
        self.ode.clear_time_scale();
        result
    }

    /// Same as [`forward`](Self::forward), additionally routing every
    /// produced hidden state through a gradient probe. Probes are only
    /// recorded on autodiff backends.
    pub fn forward_retaining<const D: usize>(
        &mut self,
        times: Tensor<B, 2>,
        inputs: Tensor<B, 3>,
        multiforecast: Option<&[f64]>,
    ) -> Result<(RnnOutput<B, D>, GradProbes<B, D>)>
    where
        F: VectorField<B, D>,
        U: RecurrentUpdate<B, D>,
        I: InitialCondition<B>,
    {
        let [steps, _] = times.dims();
        let mut retainer = Retainer {
            probes: Some(GradProbes::new(steps + 1)),
        };
        let result = self.run(times, inputs, multiforecast, &mut retainer);
        self.ode.clear_time_scale();
        let output = result?;
        let probes = retainer
            .probes
            .unwrap_or_else(|| GradProbes::new(steps + 1));
        Ok((output, probes))
    }

    fn run<const D: usize>(
        &mut self,
        times: Tensor<B, 2>,
        inputs: Tensor<B, 3>,
        multiforecast: Option<&[f64]>,
        retainer: &mut Retainer<B, D>,
    ) -> Result<RnnOutput<B, D>>
    where
        F: VectorField<B, D>,
        U: RecurrentUpdate<B, D>,
        I: InitialCondition<B>,
    {
        let [steps, batch] = times.dims();
        let [input_steps, input_batch, features] = inputs.dims();
        if [input_steps, input_batch] != [steps, batch] {
            return Err(HbnodeError::shape_mismatch(
                "recurrent inputs",
                vec![steps, batch, features],
                vec![input_steps, input_batch, features],
            ));
        }

        let dims = with_batch(state_dims::<D>(&self.hidden_shape)?, batch);
        let device = inputs.device();
        let zeros = Tensor::<B, D>::zeros(dims, &device);
        let mut h_ode = vec![zeros.clone(); steps + 1];
        let mut h_rnn = vec![zeros; steps + 1];

        if let Some(initial) = self.initial_state(&inputs, dims)? {
            let which = if self.rnn_out {
                Sequence::Rnn
            } else {
                Sequence::Ode
            };
            let initial = retainer.tap(which, 0, initial);
            h_ode[0] = initial.clone();
            h_rnn[0] = initial;
        }

        for i in 0..steps {
            let elem_t = times.clone().narrow(0, i, 1).reshape([batch]);
            let input = inputs.clone().narrow(0, i, 1).reshape([batch, features]);
            self.ode.update(elem_t);

            if self.rnn_out {
                let evolved = self.segment(h_rnn[i].clone())?;
                h_ode[i] = retainer.tap(Sequence::Ode, i, evolved);
                let updated = self.rnn.update(h_ode[i].clone(), input)?;
                h_rnn[i + 1] = retainer.tap(Sequence::Rnn, i + 1, updated);
            } else {
                let updated = self.rnn.update(h_ode[i].clone(), input)?;
                h_rnn[i] = retainer.tap(Sequence::Rnn, i, updated);
                let evolved = self.segment(h_rnn[i].clone())?;
                h_ode[i + 1] = retainer.tap(Sequence::Ode, i + 1, evolved);
            }
        }

        let last = if self.rnn_out {
            h_rnn[steps].clone()
        } else {
            h_ode[steps].clone()
        };
        let sequences = match (self.both, self.rnn_out) {
            (true, _) => vec![h_rnn, h_ode],
            (false, true) => vec![h_rnn],
            (false, false) => vec![h_ode],
        };

        let forecast = match multiforecast {
            None => None,
            Some(forecast_times) => {
                self.ode.update(Tensor::ones([batch], &device));
                let integration = integrate_node(
                    &mut self.ode,
                    None::<&NoResidual>,
                    Some(self.hidden_shape.as_slice()),
                    &self.solver,
                    last,
                    forecast_times,
                )?;
                Some(integration.trajectory)
            }
        };

        debug!(
            steps,
            batch,
            nfe = self.ode.nfe(),
            forecast = forecast.is_some(),
            "ode-rnn forward finished"
        );

        Ok(RnnOutput {
            sequences,
            forecast,
        })
    }

    fn initial_state<const D: usize>(
        &self,
        inputs: &Tensor<B, 3>,
        dims: [usize; D],
    ) -> Result<Option<Tensor<B, D>>>
    where
        I: InitialCondition<B>,
    {
        let Some(ic) = self.ic.as_ref() else {
            return Ok(None);
        };
        let [steps, batch, features] = inputs.dims();
        let flat = inputs
            .clone()
            .swap_dims(0, 1)
            .reshape([batch, steps * features]);
        let initial = ic.initial_condition(flat);

        let width: usize = self.hidden_shape.iter().product();
        if initial.dims() != [batch, width] {
            return Err(HbnodeError::shape_mismatch(
                "initial condition",
                vec![batch, width],
                initial.dims().to_vec(),
            ));
        }
        Ok(Some(initial.reshape(dims)))
    }

    /// Evolves `hidden` over `[0, 1]` and returns the endpoint.
    fn segment<const D: usize>(&mut self, hidden: Tensor<B, D>) -> Result<Tensor<B, D>>
    where
        F: VectorField<B, D>,
    {
        let integration = integrate_node(
            &mut self.ode,
            None::<&NoResidual>,
            Some(self.hidden_shape.as_slice()),
            &self.solver,
            hidden,
            &[0.0, 1.0],
        )?;
        integration
            .trajectory
            .into_last()
            .ok_or_else(|| HbnodeError::solver_failure("solver returned an empty trajectory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::OdeNodeConfig;
    use burn::backend::NdArray;
    use burn::module::Param;
    use burn::nn::{Initializer, LinearConfig};

    type Backend = NdArray<f32>;

    /// `h + shift`, ignoring the input.
    #[derive(Module, Debug)]
    struct Shift<B: burn::tensor::backend::Backend> {
        shift: Param<Tensor<B, 1>>,
    }

    impl RecurrentUpdate<Backend, 2> for Shift<Backend> {
        fn update(
            &self,
            hidden: Tensor<Backend, 2>,
            _input: Tensor<Backend, 2>,
        ) -> Result<Tensor<Backend, 2>> {
            Ok(hidden + self.shift.val().reshape([1, 1]))
        }
    }

    type Layer = OdeRnn<Backend, Linear<Backend>, Shift<Backend>, Linear<Backend>>;

    fn zero_field_layer(rnn_out: bool, both: bool) -> Layer {
        let device = Default::default();
        let linear = LinearConfig::new(3, 3)
            .with_initializer(Initializer::Zeros)
            .init(&device);
        let ode = OdeNodeConfig::plain().init(linear, &device).unwrap();
        let shift = Shift {
            shift: Param::from_tensor(Tensor::ones([1], &device)),
        };
        OdeRnnConfig::new(vec![3])
            .with_rnn_out(rnn_out)
            .with_both(both)
            .init(ode, shift, None)
            .unwrap()
    }

    #[test]
    fn test_default_mode_sequence() {
        let device = Default::default();
        let mut layer = zero_field_layer(false, false);
        let times = Tensor::<Backend, 2>::ones([4, 2], &device);
        let inputs = Tensor::<Backend, 3>::zeros([4, 2, 5], &device);

        let out = layer.forward::<2>(times, inputs, None).unwrap();
        assert_eq!(out.sequences.len(), 1);
        let h_ode = &out.sequences[0];
        assert_eq!(h_ode.len(), 5);
        // zero field: h_ode[i + 1] = h_ode[i] + 1
        let last = h_ode[4].clone().mean().into_scalar();
        assert!((last - 4.0).abs() < 1e-5);
        assert!(layer.ode().time_scale().is_none());
    }

    #[test]
    fn test_both_mode_leaves_unset_state_zero() {
        let device = Default::default();
        let mut layer = zero_field_layer(false, true);
        let times = Tensor::<Backend, 2>::ones([3, 1], &device);
        let inputs = Tensor::<Backend, 3>::zeros([3, 1, 2], &device);

        let out = layer.forward::<2>(times, inputs, None).unwrap();
        assert_eq!(out.sequences.len(), 2);
        let h_rnn = &out.sequences[0];
        assert_eq!(h_rnn.len(), 4);
        assert_eq!(h_rnn[3].clone().abs().max().into_scalar(), 0.0);
    }

    #[test]
    fn test_mismatched_steps_rejected() {
        let device = Default::default();
        let mut layer = zero_field_layer(true, false);
        let times = Tensor::<Backend, 2>::ones([3, 2], &device);
        let inputs = Tensor::<Backend, 3>::zeros([4, 2, 1], &device);

        let err = layer.forward::<2>(times, inputs, None).unwrap_err();
        assert!(matches!(err, HbnodeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_forecast_length() {
        let device = Default::default();
        let mut layer = zero_field_layer(true, false);
        let times = Tensor::<Backend, 2>::ones([2, 2], &device);
        let inputs = Tensor::<Backend, 3>::zeros([2, 2, 1], &device);

        let out = layer
            .forward::<2>(times, inputs, Some(&[0.0, 0.5, 1.0, 2.0]))
            .unwrap();
        let forecast = out.forecast.unwrap();
        assert_eq!(forecast.len(), 4);
        // rnn_out: forecast starts from h_rnn[steps] = 2
        let start = forecast.states()[0].clone().mean().into_scalar();
        assert!((start - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_forecast_starts_from_last_update_when_both_emitted() {
        let device = Default::default();
        let mut layer = zero_field_layer(true, true);
        let times = Tensor::<Backend, 2>::ones([3, 1], &device);
        let inputs = Tensor::<Backend, 3>::zeros([3, 1, 2], &device);

        let out = layer
            .forward::<2>(times, inputs, Some(&[0.0, 1.0]))
            .unwrap();
        let h_rnn_last = out.sequences[0][3].clone().mean().into_scalar();
        assert!((h_rnn_last - 3.0).abs() < 1e-5);

        let forecast = out.forecast.unwrap();
        let start = forecast.states()[0].clone().mean().into_scalar();
        assert!((start - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_forecast_starts_from_last_evolution_by_default() {
        let device = Default::default();
        let mut layer = zero_field_layer(false, true);
        let times = Tensor::<Backend, 2>::ones([3, 1], &device);
        let inputs = Tensor::<Backend, 3>::zeros([3, 1, 2], &device);

        let out = layer
            .forward::<2>(times, inputs, Some(&[0.0, 1.0]))
            .unwrap();
        let forecast = out.forecast.unwrap();
        let start = forecast.states()[0].clone().mean().into_scalar();
        assert!((start - 3.0).abs() < 1e-5);
    }
}
