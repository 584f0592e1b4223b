//! Tensor helpers shared across the calibration engine
//!
//! The engine works on dynamically-dimensioned `f32` arrays. This module
//! holds the shape plumbing the numeric components lean on: broadcasting,
//! batched matrix multiplication, batch concatenation, and interpolated
//! quantiles.

use ndarray::{concatenate, ArrayD, ArrayView2, ArrayViewD, Axis, Ix2, IxDyn};

use crate::error::{CalibrateError, Result};

/// Dynamically-dimensioned float tensor
pub type Tensor = ArrayD<f32>;

/// Broadcast `t` to `shape`, failing with a shape error instead of panicking
pub fn broadcast_view<'a>(t: &'a Tensor, shape: &[usize]) -> Result<ArrayViewD<'a, f32>> {
    t.broadcast(IxDyn(shape)).ok_or_else(|| {
        CalibrateError::ShapeMismatch(format!(
            "cannot broadcast {:?} to {:?}",
            t.shape(),
            shape
        ))
    })
}

/// Concatenate per-batch tensors along the leading (sample) axis
pub fn concat_batches(parts: &[Tensor]) -> Result<Tensor> {
    if parts.is_empty() {
        return Err(CalibrateError::MissingCapture);
    }
    let views: Vec<ArrayViewD<'_, f32>> = parts.iter().map(ArrayD::view).collect();
    concatenate(Axis(0), &views)
        .map_err(|e| CalibrateError::ShapeMismatch(format!("batch concat failed: {e}")))
}

fn view2<'a>(t: &'a Tensor, idx: &[usize]) -> Result<ArrayView2<'a, f32>> {
    let mut v = t.view();
    for &i in idx {
        v = v.index_axis_move(Axis(0), i);
    }
    v.into_dimensionality::<Ix2>()
        .map_err(|e| CalibrateError::ShapeMismatch(format!("expected matrix view: {e}")))
}

fn unflatten(mut flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut idx = vec![0usize; dims.len()];
    for (i, &d) in dims.iter().enumerate().rev() {
        idx[i] = flat % d;
        flat /= d;
    }
    idx
}

/// Batched matrix multiplication over the trailing two axes.
///
/// `a` has shape `[..., m, k]`, `b` has shape `[..., k, n]`; leading axes of
/// `b` must either match `a`'s or be 1 (they are broadcast). `b` may also
/// have fewer leading axes than `a` (missing axes broadcast).
pub fn batched_matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(CalibrateError::ShapeMismatch(
            "matmul operands must have at least 2 dims".to_string(),
        ));
    }
    let (m, ka) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let (kb, n) = (b.shape()[b.ndim() - 2], b.shape()[b.ndim() - 1]);
    if ka != kb {
        return Err(CalibrateError::ShapeMismatch(format!(
            "matmul inner dims disagree: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let lead_a = &a.shape()[..a.ndim() - 2];
    let lead_b = &b.shape()[..b.ndim() - 2];
    if lead_b.len() > lead_a.len() {
        return Err(CalibrateError::ShapeMismatch(format!(
            "rhs has more batch dims than lhs: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let offset = lead_a.len() - lead_b.len();
    for (i, &db) in lead_b.iter().enumerate() {
        let da = lead_a[offset + i];
        if db != da && db != 1 {
            return Err(CalibrateError::ShapeMismatch(format!(
                "batch dims do not broadcast: {:?} vs {:?}",
                a.shape(),
                b.shape()
            )));
        }
    }

    let mut out_shape = lead_a.to_vec();
    out_shape.push(m);
    out_shape.push(n);
    let mut out = Tensor::zeros(IxDyn(&out_shape));

    let batch: usize = lead_a.iter().product();
    for flat in 0..batch {
        let idx = unflatten(flat, lead_a);
        let b_idx: Vec<usize> = lead_b
            .iter()
            .enumerate()
            .map(|(i, &db)| if db == 1 { 0 } else { idx[offset + i] })
            .collect();
        let a2 = view2(a, &idx)?;
        let b2 = view2(b, &b_idx)?;
        let prod = a2.dot(&b2);

        let mut ov = out.view_mut();
        for &i in &idx {
            ov = ov.index_axis_move(Axis(0), i);
        }
        let mut ov2 = ov
            .into_dimensionality::<Ix2>()
            .map_err(|e| CalibrateError::ShapeMismatch(format!("output view: {e}")))?;
        ov2.assign(&prod);
    }
    Ok(out)
}

/// Interpolated quantile of already-sorted data (linear between order
/// statistics, matching the usual `quantile` definition)
pub fn quantile_sorted(sorted: &[f32], q: f64) -> f32 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let w = (pos - lo as f64) as f32;
        sorted[lo] * (1.0 - w) + sorted[hi] * w
    }
}
