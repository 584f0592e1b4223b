//! Uniform quantizer with symmetric and asymmetric variants

use ndarray::IxDyn;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CalibrateError, Result};
use crate::tensor::{broadcast_view, Tensor};

/// Static configuration of a uniform quantizer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Bit width; 32 means full precision (identity mapping)
    pub n_bits: u32,
    /// Symmetric quantization has no zero-point
    pub symmetric: bool,
    /// One scale per channel/head slice instead of one per tensor
    pub channel_wise: bool,
}

impl QuantConfig {
    /// Symmetric per-tensor quantizer at the given bit width
    pub fn symmetric(n_bits: u32) -> Self {
        Self {
            n_bits,
            symmetric: true,
            channel_wise: false,
        }
    }

    /// Asymmetric per-tensor quantizer at the given bit width
    pub fn asymmetric(n_bits: u32) -> Self {
        Self {
            n_bits,
            symmetric: false,
            channel_wise: false,
        }
    }

    /// Enable per-channel (head-wise) granularity
    pub fn per_channel(mut self) -> Self {
        self.channel_wise = true;
        self
    }

    /// Half the level count: `2^(bits-1)`
    pub fn n_levels(&self) -> i64 {
        1i64 << (self.n_bits - 1)
    }
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self::symmetric(8)
    }
}

/// Uniform affine quantizer.
///
/// Created uninitialized; the search controller populates `scale` (and
/// `zero_point` for the asymmetric variant) exactly once, after which the
/// parameters are read-only during inference.
#[derive(Clone, Debug)]
pub struct UniformQuantizer {
    /// Static configuration
    pub config: QuantConfig,
    /// Scale tensor, broadcastable against the quantized operand
    scale: Tensor,
    /// Zero-point tensor, present iff asymmetric
    zero_point: Option<Tensor>,
    /// Whether parameters have been populated
    inited: bool,
    /// Fraction of elements quantized in training mode (1.0 = all)
    drop_prob: f32,
    /// Training sub-mode for QAT reuse; never set during PTQ search
    training: bool,
}

impl UniformQuantizer {
    /// Create an uninitialized quantizer
    pub fn new(config: QuantConfig) -> Self {
        Self {
            config,
            scale: Tensor::zeros(IxDyn(&[1])),
            zero_point: None,
            inited: false,
            drop_prob: 1.0,
            training: false,
        }
    }

    /// Whether parameters have been populated
    pub fn inited(&self) -> bool {
        self.inited
    }

    /// Scale tensor (zeros until initialized)
    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    /// Zero-point tensor, present iff asymmetric and initialized
    pub fn zero_point(&self) -> Option<&Tensor> {
        self.zero_point.as_ref()
    }

    /// Populate scale/zero-point. Zero-point must be present exactly for
    /// the asymmetric variant, with the same shape as the scale.
    pub fn set_params(&mut self, scale: Tensor, zero_point: Option<Tensor>) -> Result<()> {
        if self.config.symmetric != zero_point.is_none() {
            return Err(CalibrateError::ShapeMismatch(
                "zero_point must be present exactly for asymmetric quantizers".to_string(),
            ));
        }
        if let Some(zp) = &zero_point {
            if zp.shape() != scale.shape() {
                return Err(CalibrateError::ShapeMismatch(format!(
                    "zero_point shape {:?} != scale shape {:?}",
                    zp.shape(),
                    scale.shape()
                )));
            }
        }
        self.scale = scale;
        self.zero_point = zero_point;
        self.inited = true;
        Ok(())
    }

    /// Enter the QAT training sub-mode (stochastic bypass active)
    pub fn init_training(&mut self) {
        self.training = true;
    }

    /// Leave the QAT training sub-mode
    pub fn end_training(&mut self) {
        self.training = false;
    }

    /// Set the fraction of elements that are quantized in training mode
    pub fn set_drop_prob(&mut self, drop_prob: f32) {
        self.drop_prob = drop_prob.clamp(0.0, 1.0);
    }

    /// Quantize→dequantize round trip.
    ///
    /// 32-bit is the identity; otherwise fails with `NotInitialized` until
    /// the search controller has populated the parameters.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.config.n_bits == 32 {
            return Ok(x.clone());
        }
        if !self.inited {
            return Err(CalibrateError::NotInitialized);
        }
        let n_levels = self.config.n_levels();
        let dequant = match &self.zero_point {
            None => fake_quantize_sym(x, &self.scale, n_levels)?,
            Some(zp) => fake_quantize_asym(x, &self.scale, zp, n_levels)?,
        };
        if self.training && self.drop_prob < 1.0 {
            let mut rng = rand::thread_rng();
            let mut out = dequant;
            ndarray::Zip::from(&mut out).and(x).for_each(|d, &orig| {
                if rng.gen::<f32>() >= self.drop_prob {
                    *d = orig;
                }
            });
            return Ok(out);
        }
        Ok(dequant)
    }

    /// Straight-through estimator: the round's gradient is the identity.
    /// Only relevant when QAT fine-tuning reuses this module.
    pub fn ste_backward(&self, grad_output: &Tensor) -> Tensor {
        grad_output.clone()
    }
}

/// Symmetric round trip: `clamp(round(x/s), -L, L-1) * s`
pub fn fake_quantize_sym(x: &Tensor, scale: &Tensor, n_levels: i64) -> Result<Tensor> {
    let s = broadcast_view(scale, x.shape())?;
    let lo = -(n_levels as f32);
    let hi = (n_levels - 1) as f32;
    let mut out = Tensor::zeros(x.raw_dim());
    ndarray::Zip::from(&mut out)
        .and(x)
        .and(&s)
        .for_each(|o, &v, &sc| {
            let q = (v / sc).round().clamp(lo, hi);
            *o = q * sc;
        });
    Ok(out)
}

/// Asymmetric round trip:
/// `(clamp(round(x/s) + round(zp), 0, 2L-1) - round(zp)) * s`
pub fn fake_quantize_asym(
    x: &Tensor,
    scale: &Tensor,
    zero_point: &Tensor,
    n_levels: i64,
) -> Result<Tensor> {
    let s = broadcast_view(scale, x.shape())?;
    let z = broadcast_view(zero_point, x.shape())?;
    let hi = (2 * n_levels - 1) as f32;
    let mut out = Tensor::zeros(x.raw_dim());
    ndarray::Zip::from(&mut out)
        .and(x)
        .and(&s)
        .and(&z)
        .for_each(|o, &v, &sc, &zp| {
            let zr = zp.round();
            let q = ((v / sc).round() + zr).clamp(0.0, hi);
            *o = (q - zr) * sc;
        });
    Ok(out)
}
