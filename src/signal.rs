//! Sampled exogenous signal
//!
//! Forced systems read an input signal at arbitrary solver times. The signal
//! is known only at integer sample indices; in between it is interpolated
//! linearly and outside the sampled range it is zero.

use crate::error::{HbnodeError, Result};
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// `[len, channels]` samples at times `0, 1, ..., len - 1`.
///
/// A constant module, so a field holding the signal can itself derive
/// [`Module`].
#[derive(Module, Debug)]
pub struct SampledSignal<B: Backend> {
    samples: Tensor<B, 2>,
}

impl<B: Backend> SampledSignal<B> {
    pub fn new(samples: Tensor<B, 2>) -> Result<Self> {
        let [len, channels] = samples.dims();
        if len == 0 || channels == 0 {
            return Err(HbnodeError::configuration(format!(
                "sampled signal needs at least one sample and one channel, got [{}, {}]",
                len, channels
            )));
        }
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channels(&self) -> usize {
        self.samples.dims()[1]
    }

    pub fn samples(&self) -> &Tensor<B, 2> {
        &self.samples
    }

    /// Signal value at time `t`, shape `[channels]`.
    pub fn at(&self, t: f64) -> Tensor<B, 1> {
        let len = self.len();
        let channels = self.channels();
        let last = (len - 1) as f64;
        if !(0.0..=last).contains(&t) {
            return Tensor::zeros([channels], &self.samples.device());
        }

        let index = t.floor() as usize;
        let delta = t - index as f64;
        let lower = self.row(index);
        if delta == 0.0 || index + 1 >= len {
            return lower;
        }
        let upper = self.row(index + 1);
        lower.clone() + (upper - lower).mul_scalar(delta)
    }

    fn row(&self, index: usize) -> Tensor<B, 1> {
        let channels = self.channels();
        self.samples.clone().narrow(0, index, 1).reshape([channels])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type Backend = NdArray<f32>;

    fn ramp() -> SampledSignal<Backend> {
        let device = Default::default();
        let samples =
            Tensor::<Backend, 2>::from_floats([[0.0, 10.0], [2.0, 20.0], [4.0, 0.0]], &device);
        SampledSignal::new(samples).unwrap()
    }

    #[test]
    fn test_exact_samples() {
        let signal = ramp();
        let value = signal.at(1.0).into_data().to_vec::<f32>().unwrap();
        assert_eq!(value, vec![2.0, 20.0]);
        let value = signal.at(2.0).into_data().to_vec::<f32>().unwrap();
        assert_eq!(value, vec![4.0, 0.0]);
    }

    #[test]
    fn test_linear_interpolation() {
        let signal = ramp();
        let value = signal.at(1.25).into_data().to_vec::<f32>().unwrap();
        assert!((value[0] - 2.5).abs() < 1e-6);
        assert!((value[1] - 15.0).abs() < 1e-5);
    }

    #[test]
    fn test_zero_outside_range() {
        let signal = ramp();
        for t in [-0.5, 2.01, 100.0] {
            let value = signal.at(t).abs().max().into_scalar();
            assert_eq!(value, 0.0);
        }
    }
}
