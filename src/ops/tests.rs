//! Tests for quantizable operators

use super::*;
use crate::memory::FixedBudget;
use crate::quantizer::fake_quantize_sym;
use crate::tensor::batched_matmul;
use approx::assert_abs_diff_eq;
use ndarray::IxDyn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn uniform(shape: &[usize], lo: f32, hi: f32, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let n: usize = shape.iter().product();
    Tensor::from_shape_vec(IxDyn(shape), (0..n).map(|_| rng.gen_range(lo..hi)).collect()).unwrap()
}

fn matmul_op() -> QuantOperator {
    QuantOperator::matmul(
        QuantConfig::symmetric(8),
        QuantConfig::symmetric(8),
        SearchConfig::default(),
    )
}

#[test]
fn test_matmul_raw_forward_matches_reference() {
    let mut op = matmul_op();
    let a = uniform(&[2, 2, 3, 4], -1.0, 1.0, 1);
    let b = uniform(&[2, 2, 4, 3], -1.0, 1.0, 2);
    let out = op.forward_matmul(&a, &b).unwrap();
    let expect = batched_matmul(&a, &b).unwrap();
    assert_eq!(out.shape(), expect.shape());
    for (o, e) in out.iter().zip(expect.iter()) {
        assert_abs_diff_eq!(o, e, epsilon = 1e-6);
    }
}

#[test]
fn test_linear_forward_with_bias() {
    // weight [out=2, in=3], x [1, 3]
    let w = Tensor::from_shape_vec(IxDyn(&[2, 3]), vec![1.0, 0.0, -1.0, 2.0, 1.0, 0.0]).unwrap();
    let b = Tensor::from_shape_vec(IxDyn(&[2]), vec![0.5, -0.5]).unwrap();
    let mut op = QuantOperator::linear(
        w,
        Some(b),
        QuantConfig::symmetric(8),
        QuantConfig::symmetric(8),
        SearchConfig::default(),
    )
    .unwrap();
    let x = Tensor::from_shape_vec(IxDyn(&[1, 3]), vec![1.0, 2.0, 3.0]).unwrap();
    let y = op.forward(&x).unwrap();
    assert_eq!(y.shape(), &[1, 2]);
    // [1*1 + 2*0 + 3*(-1) + 0.5, 1*2 + 2*1 + 3*0 - 0.5]
    assert_abs_diff_eq!(y[[0, 0]], -1.5, epsilon = 1e-6);
    assert_abs_diff_eq!(y[[0, 1]], 3.5, epsilon = 1e-6);
}

#[test]
fn test_conv2d_identity_kernel() {
    let w = Tensor::from_elem(IxDyn(&[1, 1, 1, 1]), 1.0);
    let mut op = QuantOperator::conv2d(
        w,
        None,
        (1, 1),
        (0, 0),
        QuantConfig::symmetric(8),
        QuantConfig::symmetric(8),
        SearchConfig::default(),
    )
    .unwrap();
    let x = uniform(&[2, 1, 4, 4], -1.0, 1.0, 3);
    let y = op.forward(&x).unwrap();
    assert_eq!(y.shape(), x.shape());
    for (o, e) in y.iter().zip(x.iter()) {
        assert_abs_diff_eq!(o, e, epsilon = 1e-6);
    }
}

#[test]
fn test_conv2d_padding_and_stride() {
    // 3x3 all-ones kernel with padding 1 sums the 3x3 neighborhood
    let w = Tensor::from_elem(IxDyn(&[1, 1, 3, 3]), 1.0);
    let mut op = QuantOperator::conv2d(
        w,
        None,
        (1, 1),
        (1, 1),
        QuantConfig::symmetric(8),
        QuantConfig::symmetric(8),
        SearchConfig::default(),
    )
    .unwrap();
    let x = Tensor::from_elem(IxDyn(&[1, 1, 3, 3]), 1.0);
    let y = op.forward(&x).unwrap();
    assert_eq!(y.shape(), &[1, 1, 3, 3]);
    // corner sees a 2x2 window, center the full 3x3
    assert_abs_diff_eq!(y[[0, 0, 0, 0]], 4.0, epsilon = 1e-6);
    assert_abs_diff_eq!(y[[0, 0, 1, 1]], 9.0, epsilon = 1e-6);
    assert_abs_diff_eq!(y[[0, 0, 0, 1]], 6.0, epsilon = 1e-6);
}

#[test]
fn test_weight_rank_validation() {
    let w3 = Tensor::zeros(IxDyn(&[2, 3, 4]));
    assert!(QuantOperator::linear(
        w3.clone(),
        None,
        QuantConfig::symmetric(8),
        QuantConfig::symmetric(8),
        SearchConfig::default(),
    )
    .is_err());
    assert!(QuantOperator::conv2d(
        w3,
        None,
        (1, 1),
        (0, 0),
        QuantConfig::symmetric(8),
        QuantConfig::symmetric(8),
        SearchConfig::default(),
    )
    .is_err());
}

#[test]
fn test_arity_mismatch_rejected() {
    let mut mm = matmul_op();
    let x = uniform(&[2, 2, 3, 4], -1.0, 1.0, 4);
    assert!(matches!(
        mm.forward(&x),
        Err(CalibrateError::InvalidConfig(_))
    ));

    let w = Tensor::zeros(IxDyn(&[2, 4]));
    let mut lin = QuantOperator::linear(
        w,
        None,
        QuantConfig::symmetric(8),
        QuantConfig::symmetric(8),
        SearchConfig::default(),
    )
    .unwrap();
    assert!(matches!(
        lin.forward_matmul(&x, &x),
        Err(CalibrateError::InvalidConfig(_))
    ));
}

#[test]
fn test_capture_lifecycle() {
    let mut op = matmul_op();
    op.begin_capture();
    for seed in 0..2u64 {
        let a = uniform(&[2, 2, 3, 4], -1.0, 1.0, seed);
        let b = uniform(&[2, 2, 4, 3], -1.0, 1.0, seed + 10);
        let out = op.forward_matmul(&a, &b).unwrap();
        op.record_gradient(Tensor::ones(out.raw_dim()));
    }
    op.end_capture().unwrap();

    let record = op.record().unwrap();
    assert_eq!(record.inputs.len(), 2);
    assert_eq!(record.calib_size(), 4);
    assert_eq!(record.inputs[0].shape(), &[4, 2, 3, 4]);
    assert_eq!(record.inputs[1].shape(), &[4, 2, 4, 3]);
    assert_eq!(record.output.shape(), &[4, 2, 3, 3]);
    assert!(record.gradient.is_some());
}

#[test]
fn test_capture_without_gradient() {
    let w = Tensor::from_shape_vec(IxDyn(&[2, 3]), vec![1.0; 6]).unwrap();
    let mut op = QuantOperator::linear(
        w,
        None,
        QuantConfig::symmetric(8),
        QuantConfig::symmetric(8),
        SearchConfig::default(),
    )
    .unwrap();
    op.begin_capture();
    let x = uniform(&[4, 3], -1.0, 1.0, 5);
    op.forward(&x).unwrap();
    op.end_capture().unwrap();
    let record = op.record().unwrap();
    assert_eq!(record.inputs.len(), 1);
    assert!(record.gradient.is_none());
}

#[test]
fn test_partial_gradient_capture_rejected() {
    // a gradient recorded for fewer batches than the inputs must fail at
    // capture end, not deep inside the search
    let mut op = matmul_op();
    op.begin_capture();
    for seed in 0..2u64 {
        let a = uniform(&[2, 2, 3, 4], -1.0, 1.0, seed + 20);
        let b = uniform(&[2, 2, 4, 3], -1.0, 1.0, seed + 30);
        let out = op.forward_matmul(&a, &b).unwrap();
        if seed == 0 {
            op.record_gradient(Tensor::ones(out.raw_dim()));
        }
    }
    let err = op.end_capture().unwrap_err();
    assert!(matches!(err, CalibrateError::ShapeMismatch(_)));
    assert!(op.record().is_none());
}

#[test]
fn test_end_capture_without_begin() {
    let mut op = matmul_op();
    assert!(matches!(
        op.end_capture(),
        Err(CalibrateError::MissingCapture)
    ));
}

#[test]
fn test_abort_capture_discards_batches() {
    let mut op = matmul_op();
    op.begin_capture();
    let a = uniform(&[1, 2, 3, 4], -1.0, 1.0, 6);
    let b = uniform(&[1, 2, 4, 3], -1.0, 1.0, 7);
    op.forward_matmul(&a, &b).unwrap();
    op.abort_capture();
    assert!(op.end_capture().is_err());
    assert!(op.record().is_none());
}

#[test]
fn test_quant_forward_gated_on_calibration() {
    let mut op = matmul_op();
    op.set_mode(Mode::QuantForward);
    let a = uniform(&[1, 2, 3, 4], -1.0, 1.0, 8);
    let b = uniform(&[1, 2, 4, 3], -1.0, 1.0, 9);
    assert!(matches!(
        op.forward_matmul(&a, &b),
        Err(CalibrateError::NotCalibrated)
    ));
}

#[test]
fn test_probe_modes_shift_output() {
    let mut op = matmul_op();
    let a = uniform(&[1, 2, 3, 4], -1.0, 1.0, 10);
    let b = uniform(&[1, 2, 4, 3], -1.0, 1.0, 11);
    let raw = op.forward_matmul(&a, &b).unwrap();

    op.set_mode(Mode::ProbeUp);
    let up = op.forward_matmul(&a, &b).unwrap();
    op.set_mode(Mode::ProbeDown);
    let down = op.forward_matmul(&a, &b).unwrap();
    // f32 rounding at the output's magnitude costs up to an ulp
    for ((r, u), d) in raw.iter().zip(up.iter()).zip(down.iter()) {
        assert_abs_diff_eq!(u - r, PROBE_EPS, epsilon = 5e-7);
        assert_abs_diff_eq!(r - d, PROBE_EPS, epsilon = 5e-7);
    }
}

#[test]
fn test_quant_forward_uses_quantizers() {
    let mut op = matmul_op();
    let scale = Tensor::from_elem(IxDyn(&[1]), 0.01);
    op.input_quantizer.set_params(scale.clone(), None).unwrap();
    op.weight_quantizer.set_params(scale.clone(), None).unwrap();
    op.calibrated = true;
    op.set_mode(Mode::QuantForward);

    let a = uniform(&[1, 2, 3, 4], -1.0, 1.0, 12);
    let b = uniform(&[1, 2, 4, 3], -1.0, 1.0, 13);
    let out = op.forward_matmul(&a, &b).unwrap();

    let aq = fake_quantize_sym(&a, &scale, 128).unwrap();
    let bq = fake_quantize_sym(&b, &scale, 128).unwrap();
    let expect = batched_matmul(&aq, &bq).unwrap();
    for (o, e) in out.iter().zip(expect.iter()) {
        assert_abs_diff_eq!(o, e, epsilon = 1e-6);
    }
}

#[test]
fn test_full_precision_quant_forward_is_identity() {
    let mut op = QuantOperator::matmul(
        QuantConfig::symmetric(32),
        QuantConfig::symmetric(32),
        SearchConfig::default(),
    );
    op.calibrated = true;
    op.set_mode(Mode::QuantForward);
    let a = uniform(&[1, 2, 3, 4], -1.0, 1.0, 14);
    let b = uniform(&[1, 2, 4, 3], -1.0, 1.0, 15);
    let out = op.forward_matmul(&a, &b).unwrap();
    let raw = batched_matmul(&a, &b).unwrap();
    for (o, e) in out.iter().zip(raw.iter()) {
        assert_abs_diff_eq!(o, e, epsilon = 1e-7);
    }
}

#[test]
fn test_search_requires_capture() {
    let mut op = matmul_op();
    assert!(matches!(
        op.hyperparameter_searching(&FixedBudget::generous()),
        Err(CalibrateError::MissingCapture)
    ));
}

#[test]
fn test_accessors() {
    let op = matmul_op();
    assert_eq!(op.mode(), Mode::Raw);
    assert!(!op.calibrated());
    assert!(op.kind().is_binary());
    assert_eq!(op.metric(), crate::similarity::Metric::Mse);
    assert_eq!(op.search_config().eq_n, 100);
}
