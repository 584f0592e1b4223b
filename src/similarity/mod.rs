//! Similarity scoring between float reference and quantized simulation
//!
//! Computes an elementwise score tensor where higher (less negative) means
//! the simulated output is closer to the float reference. Reduction to a
//! ranking is the search controller's job.


use std::fmt;
use std::str::FromStr;

use ndarray::IxDyn;
use serde::{Deserialize, Serialize};

use crate::error::{CalibrateError, Result};
use crate::tensor::Tensor;

/// Similarity metric for ranking quantization candidates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Negative absolute error
    Mae,
    /// Negative squared error
    Mse,
    /// Squared error weighted by the normalized gradient magnitude
    Hessian,
    /// Absolute error weighted by the raw gradient magnitude
    Jacobian,
    /// Squared error weighted by the normalized gradient magnitude (linear
    /// weighting rather than squared)
    HessianNew,
}

impl Metric {
    /// Whether this metric needs a captured output gradient
    pub fn needs_gradient(self) -> bool {
        matches!(self, Metric::Hessian | Metric::Jacobian | Metric::HessianNew)
    }

    /// Canonical string name
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Mae => "mae",
            Metric::Mse => "mse",
            Metric::Hessian => "hessian",
            Metric::Jacobian => "jacobian",
            Metric::HessianNew => "hessian_new",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = CalibrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mae" => Ok(Metric::Mae),
            "mse" => Ok(Metric::Mse),
            "hessian" => Ok(Metric::Hessian),
            "jacobian" => Ok(Metric::Jacobian),
            "hessian_new" => Ok(Metric::HessianNew),
            other => Err(CalibrateError::UnsupportedMetric(other.to_string())),
        }
    }
}

/// Gradient scaled to unit mean-square magnitude: `|g| * sqrt(n / sum(g^2))`
fn normalized_gradient(grad: &Tensor) -> Tensor {
    let sum_sq: f32 = grad.iter().map(|g| g * g).sum();
    let norm = if sum_sq > 0.0 {
        (grad.len() as f32 / sum_sq).sqrt()
    } else {
        0.0
    };
    grad.mapv(|g| g.abs() * norm)
}

/// Score a simulated tensor against the float reference.
///
/// Returns the elementwise similarity tensor; gradient metrics require a
/// gradient with the same element count as `raw` (it is reshaped to match).
pub fn similarity(
    raw: &Tensor,
    sim: &Tensor,
    metric: Metric,
    grad: Option<&Tensor>,
) -> Result<Tensor> {
    if raw.shape() != sim.shape() {
        return Err(CalibrateError::ShapeMismatch(format!(
            "similarity operands disagree: {:?} vs {:?}",
            raw.shape(),
            sim.shape()
        )));
    }

    match metric {
        Metric::Mae => Ok(diff_map(raw, sim, |d| -d.abs())),
        Metric::Mse => Ok(diff_map(raw, sim, |d| -(d * d))),
        Metric::Hessian | Metric::Jacobian | Metric::HessianNew => {
            let grad = grad.ok_or(CalibrateError::MissingGradient(metric.as_str()))?;
            if grad.len() != raw.len() {
                return Err(CalibrateError::ShapeMismatch(format!(
                    "gradient has {} elements, reference has {}",
                    grad.len(),
                    raw.len()
                )));
            }
            let grad = grad
                .to_owned()
                .as_standard_layout()
                .to_owned()
                .into_shape(IxDyn(raw.shape()))
                .map_err(|e| CalibrateError::ShapeMismatch(format!("gradient reshape: {e}")))?;

            let mut out = Tensor::zeros(raw.raw_dim());
            match metric {
                Metric::Hessian => {
                    let g = normalized_gradient(&grad);
                    ndarray::Zip::from(&mut out)
                        .and(raw)
                        .and(sim)
                        .and(&g)
                        .for_each(|o, &r, &s, &g| {
                            let w = g * (r - s);
                            *o = -(w * w);
                        });
                }
                Metric::Jacobian => {
                    ndarray::Zip::from(&mut out)
                        .and(raw)
                        .and(sim)
                        .and(&grad)
                        .for_each(|o, &r, &s, &g| *o = -(g.abs() * (r - s).abs()));
                }
                Metric::HessianNew => {
                    let g = normalized_gradient(&grad);
                    ndarray::Zip::from(&mut out)
                        .and(raw)
                        .and(sim)
                        .and(&g)
                        .for_each(|o, &r, &s, &g| {
                            let d = r - s;
                            *o = -(g * d * d);
                        });
                }
                _ => unreachable!(),
            }
            Ok(out)
        }
    }
}

fn diff_map(raw: &Tensor, sim: &Tensor, f: impl Fn(f32) -> f32) -> Tensor {
    let mut out = Tensor::zeros(raw.raw_dim());
    ndarray::Zip::from(&mut out)
        .and(raw)
        .and(sim)
        .for_each(|o, &r, &s| *o = f(r - s));
    out
}
