//! Tests for the uniform quantizer

use super::*;
use crate::error::CalibrateError;
use crate::tensor::Tensor;
use approx::assert_abs_diff_eq;
use ndarray::IxDyn;
use proptest::prelude::*;

fn scalar(v: f32) -> Tensor {
    Tensor::from_elem(IxDyn(&[1]), v)
}

fn tensor(data: Vec<f32>) -> Tensor {
    let n = data.len();
    Tensor::from_shape_vec(IxDyn(&[n]), data).unwrap()
}

fn symmetric_q8(scale: f32) -> UniformQuantizer {
    let mut q = UniformQuantizer::new(QuantConfig::symmetric(8));
    q.set_params(scalar(scale), None).unwrap();
    q
}

#[test]
fn test_uninitialized_forward_fails() {
    let q = UniformQuantizer::new(QuantConfig::symmetric(8));
    let err = q.forward(&tensor(vec![1.0])).unwrap_err();
    assert!(matches!(err, CalibrateError::NotInitialized));
}

#[test]
fn test_32bit_is_identity_even_uninitialized() {
    let q = UniformQuantizer::new(QuantConfig::symmetric(32));
    let x = tensor(vec![0.123, -4.56, 1e-9, 1e9]);
    let y = q.forward(&x).unwrap();
    assert_eq!(x, y);
}

#[test]
fn test_symmetric_roundtrip() {
    let q = symmetric_q8(0.1);
    let x = tensor(vec![0.0, 0.05, -0.05, 1.0, -1.0]);
    let y = q.forward(&x).unwrap();
    // values snap to multiples of scale
    assert_abs_diff_eq!(y[[0]], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(y[[1]], 0.1, epsilon = 1e-6); // round(0.5) = 1 (ties away)
    assert_abs_diff_eq!(y[[3]], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(y[[4]], -1.0, epsilon = 1e-6);
}

#[test]
fn test_symmetric_clamping() {
    // scale 0.1 at 8 bits: representable range [-12.8, 12.7]
    let q = symmetric_q8(0.1);
    let x = tensor(vec![100.0, -100.0]);
    let y = q.forward(&x).unwrap();
    assert_abs_diff_eq!(y[[0]], 12.7, epsilon = 1e-4);
    assert_abs_diff_eq!(y[[1]], -12.8, epsilon = 1e-4);
}

#[test]
fn test_asymmetric_roundtrip() {
    let mut q = UniformQuantizer::new(QuantConfig::asymmetric(8));
    // range [0, 2.55]: scale 0.01, zero_point 0
    q.set_params(scalar(0.01), Some(scalar(0.0))).unwrap();
    let x = tensor(vec![0.0, 1.0, 2.55, 3.0, -1.0]);
    let y = q.forward(&x).unwrap();
    assert_abs_diff_eq!(y[[0]], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(y[[1]], 1.0, epsilon = 1e-4);
    assert_abs_diff_eq!(y[[2]], 2.55, epsilon = 1e-4);
    // above range clamps to top level, below range to level 0
    assert_abs_diff_eq!(y[[3]], 2.55, epsilon = 1e-4);
    assert_abs_diff_eq!(y[[4]], 0.0, epsilon = 1e-6);
}

#[test]
fn test_asymmetric_zero_point_shift() {
    let mut q = UniformQuantizer::new(QuantConfig::asymmetric(8));
    // range [-1.28, 1.27] via zero_point 128
    q.set_params(scalar(0.01), Some(scalar(128.0))).unwrap();
    let x = tensor(vec![-1.28, 0.0, 1.27]);
    let y = q.forward(&x).unwrap();
    for i in 0..3 {
        assert_abs_diff_eq!(y[[i]], x[[i]], epsilon = 1e-4);
    }
}

#[test]
fn test_set_params_arity_checks() {
    let mut sym = UniformQuantizer::new(QuantConfig::symmetric(8));
    assert!(sym.set_params(scalar(0.1), Some(scalar(0.0))).is_err());

    let mut asym = UniformQuantizer::new(QuantConfig::asymmetric(8));
    assert!(asym.set_params(scalar(0.1), None).is_err());
}

#[test]
fn test_per_channel_scale_broadcast() {
    let mut q = UniformQuantizer::new(QuantConfig::symmetric(8).per_channel());
    // two heads with very different ranges
    let scale = Tensor::from_shape_vec(IxDyn(&[1, 2, 1]), vec![0.01, 1.0]).unwrap();
    q.set_params(scale, None).unwrap();

    let x = Tensor::from_shape_vec(IxDyn(&[1, 2, 2]), vec![0.5, -0.5, 50.0, -50.0]).unwrap();
    let y = q.forward(&x).unwrap();
    assert_abs_diff_eq!(y[[0, 0, 0]], 0.5, epsilon = 1e-4);
    assert_abs_diff_eq!(y[[0, 1, 0]], 50.0, epsilon = 1e-4);
}

#[test]
fn test_ste_backward_passthrough() {
    let q = symmetric_q8(0.1);
    let grad = tensor(vec![0.3, -1.2, 7.0]);
    let out = q.ste_backward(&grad);
    assert_eq!(out, grad);
}

#[test]
fn test_training_drop_prob_zero_bypasses() {
    let mut q = symmetric_q8(0.1);
    q.init_training();
    q.set_drop_prob(0.0);
    let x = tensor(vec![0.03, 0.07, -0.04]);
    // drop_prob 0: every element keeps its float value
    let y = q.forward(&x).unwrap();
    assert_eq!(y, x);
    q.end_training();
    let y = q.forward(&x).unwrap();
    assert_ne!(y, x);
}

#[test]
fn test_n_levels() {
    assert_eq!(QuantConfig::symmetric(8).n_levels(), 128);
    assert_eq!(QuantConfig::symmetric(4).n_levels(), 8);
    assert_eq!(QuantConfig::symmetric(2).n_levels(), 2);
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(200))]

    /// Round-trip bound: |x_hat - x| <= scale inside the representable range
    #[test]
    fn prop_roundtrip_bound(
        data in prop::collection::vec(-10.0f32..10.0, 1..64),
        scale in 0.01f32..1.0,
    ) {
        let q = symmetric_q8(scale);
        let x = tensor(data.clone());
        let y = q.forward(&x).unwrap();
        let lo = -scale * 128.0;
        let hi = scale * 127.0;
        for (i, &v) in data.iter().enumerate() {
            if v >= lo && v <= hi {
                prop_assert!((y[[i]] - v).abs() <= scale + 1e-5);
            }
        }
    }

    /// Bit-width 32 is exactly the identity
    #[test]
    fn prop_32bit_identity(
        data in prop::collection::vec(-1e6f32..1e6, 1..64),
    ) {
        let q = UniformQuantizer::new(QuantConfig::symmetric(32));
        let x = tensor(data);
        let y = q.forward(&x).unwrap();
        prop_assert_eq!(x, y);
    }

    /// Dequantized output is always a clamped multiple of the scale
    #[test]
    fn prop_output_on_grid(
        data in prop::collection::vec(-100.0f32..100.0, 1..32),
        scale in 0.05f32..2.0,
    ) {
        let q = symmetric_q8(scale);
        let y = q.forward(&tensor(data)).unwrap();
        for &v in y.iter() {
            let level = v / scale;
            prop_assert!((level - level.round()).abs() < 1e-3);
            prop_assert!(level.round() >= -128.0 && level.round() <= 127.0);
        }
    }
}
