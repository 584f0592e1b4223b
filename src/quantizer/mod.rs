//! Uniform affine quantization
//!
//! The quantize→dequantize round trip used both for quantized inference and
//! for re-simulating operator outputs during calibration search. The search
//! controller owns parameter selection; this module owns the numeric
//! transform and the initialization gate.

mod uniform;

#[cfg(test)]
mod tests;

pub use uniform::{fake_quantize_asym, fake_quantize_sym, QuantConfig, UniformQuantizer};
