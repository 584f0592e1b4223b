//! Float forward computations for the quantizable operator kinds
//!
//! These are the simulation targets the search controller re-runs with
//! quantized operands: batched matmul, linear, and im2col conv2d.

use ndarray::{Ix2, IxDyn};

use crate::error::{CalibrateError, Result};
use crate::tensor::{batched_matmul, Tensor};

use super::OpKind;

/// Run one operator kind on explicit operands.
///
/// For unary kinds `b` is the (possibly quantized) weight standing in for
/// the owned one; the bias is applied unquantized.
pub(crate) fn op_forward(kind: &OpKind, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    match kind {
        OpKind::MatMul => batched_matmul(a, b),
        OpKind::Linear { bias, .. } => linear_forward(a, b, bias.as_ref()),
        OpKind::Conv2d {
            bias,
            stride,
            padding,
            ..
        } => conv2d_forward(a, b, bias.as_ref(), *stride, *padding),
    }
}

/// `y = x @ w^T + bias` over the trailing feature axis of `x`
pub(crate) fn linear_forward(x: &Tensor, w: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let w2 = w
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| CalibrateError::ShapeMismatch("linear weight must be 2-D".to_string()))?;
    let (out_f, in_f) = (w2.nrows(), w2.ncols());
    if x.ndim() < 1 || x.shape()[x.ndim() - 1] != in_f {
        return Err(CalibrateError::ShapeMismatch(format!(
            "linear input {:?} does not match weight {:?}",
            x.shape(),
            w.shape()
        )));
    }
    let rows = x.len() / in_f;
    let x2 = x
        .as_standard_layout()
        .to_owned()
        .into_shape((rows, in_f))
        .map_err(|e| CalibrateError::ShapeMismatch(format!("linear input reshape: {e}")))?;
    let mut y2 = x2.dot(&w2.t());
    if let Some(b) = bias {
        if b.len() != out_f {
            return Err(CalibrateError::ShapeMismatch(format!(
                "linear bias has {} elements, expected {out_f}",
                b.len()
            )));
        }
        let b1 = b
            .view()
            .into_shape(out_f)
            .map_err(|e| CalibrateError::ShapeMismatch(format!("bias reshape: {e}")))?;
        y2 += &b1;
    }
    let mut out_shape = x.shape()[..x.ndim() - 1].to_vec();
    out_shape.push(out_f);
    y2.into_shape(IxDyn(&out_shape))
        .map_err(|e| CalibrateError::ShapeMismatch(format!("linear output reshape: {e}")))
}

/// Zero-padded strided 2-D convolution via im2col.
///
/// `x` is `[n, ic, h, w]`, `w` is `[oc, ic, kh, kw]`; output is
/// `[n, oc, oh, ow]`.
pub(crate) fn conv2d_forward(
    x: &Tensor,
    w: &Tensor,
    bias: Option<&Tensor>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Tensor> {
    if x.ndim() != 4 || w.ndim() != 4 {
        return Err(CalibrateError::ShapeMismatch(format!(
            "conv2d expects 4-D input and weight, got {:?} and {:?}",
            x.shape(),
            w.shape()
        )));
    }
    let (n, ic, h, wd) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let (oc, wic, kh, kw) = (w.shape()[0], w.shape()[1], w.shape()[2], w.shape()[3]);
    let (sh, sw) = stride;
    let (ph, pw) = padding;
    if wic != ic || sh == 0 || sw == 0 || h + 2 * ph < kh || wd + 2 * pw < kw {
        return Err(CalibrateError::ShapeMismatch(format!(
            "conv2d geometry invalid: input {:?}, weight {:?}, stride {stride:?}, padding {padding:?}",
            x.shape(),
            w.shape()
        )));
    }
    let oh = (h + 2 * ph - kh) / sh + 1;
    let ow = (wd + 2 * pw - kw) / sw + 1;

    let patch = ic * kh * kw;
    let mut cols = ndarray::Array2::<f32>::zeros((n * oh * ow, patch));
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                let row = (b * oh + oy) * ow + ox;
                let mut col = 0usize;
                for c in 0..ic {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = oy * sh + ky;
                            let ix = ox * sw + kx;
                            // padded coordinates; out-of-range reads are zero
                            if iy >= ph && ix >= pw && iy - ph < h && ix - pw < wd {
                                cols[[row, col]] = x[[b, c, iy - ph, ix - pw]];
                            }
                            col += 1;
                        }
                    }
                }
            }
        }
    }

    let wm = w
        .as_standard_layout()
        .to_owned()
        .into_shape((oc, patch))
        .map_err(|e| CalibrateError::ShapeMismatch(format!("conv weight reshape: {e}")))?;
    let mut y2 = cols.dot(&wm.t()); // [n*oh*ow, oc]
    if let Some(b) = bias {
        if b.len() != oc {
            return Err(CalibrateError::ShapeMismatch(format!(
                "conv bias has {} elements, expected {oc}",
                b.len()
            )));
        }
        let b1 = b
            .view()
            .into_shape(oc)
            .map_err(|e| CalibrateError::ShapeMismatch(format!("bias reshape: {e}")))?;
        y2 += &b1;
    }

    let mut out = Tensor::zeros(IxDyn(&[n, oc, oh, ow]));
    for b in 0..n {
        for c in 0..oc {
            for oy in 0..oh {
                for ox in 0..ow {
                    out[[b, c, oy, ox]] = y2[[(b * oh + oy) * ow + ox, c]];
                }
            }
        }
    }
    Ok(out)
}
