//! Tests for squashing activations

use burn::backend::NdArray;
use burn::tensor::Tensor;
use hbnode::activation::{LeCun, Squash};
use proptest::prelude::*;

type Backend = NdArray<f32>;

fn scalar(squash: Squash, x: f32) -> f32 {
    let device = Default::default();
    squash
        .apply(Tensor::<Backend, 1>::full([1], x, &device))
        .into_scalar()
}

#[test]
fn test_lecun_tanh_saturation() {
    let device = Default::default();

    let y_pos = LeCun::forward(Tensor::<Backend, 1>::full([1], 100.0f32, &device));
    assert!(y_pos.into_scalar() > 1.7);

    let y_neg = LeCun::forward(Tensor::<Backend, 1>::full([1], -100.0f32, &device));
    assert!(y_neg.into_scalar() < -1.7);
}

#[test]
fn test_relu_and_tanh() {
    assert_eq!(scalar(Squash::Relu, -3.0), 0.0);
    assert_eq!(scalar(Squash::Relu, 2.5), 2.5);
    assert!((scalar(Squash::Tanh, 0.5) - 0.5f32.tanh()).abs() < 1e-6);
}

#[test]
fn test_default_is_identity() {
    assert_eq!(Squash::default(), Squash::Identity);
    assert_eq!(scalar(Squash::default(), -7.25), -7.25);
}

#[test]
fn test_squash_preserves_shape() {
    let device = Default::default();
    let x = Tensor::<Backend, 3>::random(
        [2, 3, 4],
        burn::tensor::Distribution::Uniform(-2.0, 2.0),
        &device,
    );
    for squash in [Squash::Sigmoid, Squash::Softplus, Squash::LeCun] {
        assert_eq!(squash.apply(x.clone()).dims(), [2, 3, 4]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_sigmoid_in_open_unit_interval(x in -10.0f32..10.0) {
        let y = scalar(Squash::Sigmoid, x);
        prop_assert!(y > 0.0 && y < 1.0, "sigmoid({}) = {}", x, y);
    }

    #[test]
    fn prop_softplus_nonnegative(x in -50.0f32..50.0) {
        let y = scalar(Squash::Softplus, x);
        prop_assert!(y >= 0.0, "softplus({}) = {}", x, y);
    }
}
