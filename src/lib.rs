//! Calibrar: post-training quantization calibration
//!
//! Searches per-operator quantization parameters (clipping range, scale,
//! zero-point) for transformer-style models by replaying a calibration set
//! and ranking candidate ranges against the float reference output:
//! - Uniform affine quantizers, symmetric and asymmetric, per-tensor or
//!   per-channel/head
//! - Percentile candidate grids with memory-adaptive quantile computation
//! - Similarity metrics: MAE, MSE, and gradient-weighted variants
//! - Coordinate-descent search over clipping thresholds, per operand side
//! - Whole-model orchestration with capture replay and a single global
//!   flip into quantized inference

pub mod calibrate;
pub mod candidates;
pub mod error;
pub mod memory;
pub mod ops;
pub mod quantizer;
pub mod search;
pub mod similarity;
pub mod tensor;

pub use calibrate::{CalibrationModel, Calibrator};
pub use candidates::{
    percentile_candidates, percentile_levels, scale_candidates, CandidateGrid, PercentileConfig,
};
pub use error::{CalibrateError, Result};
pub use memory::{FixedBudget, MemoryBudget, MemoryInfo, UnavailableBudget};
pub use ops::{CalibrationRecord, Mode, OpKind, QuantOperator};
pub use quantizer::{fake_quantize_asym, fake_quantize_sym, QuantConfig, UniformQuantizer};
pub use search::SearchConfig;
pub use similarity::{similarity, Metric};
pub use tensor::Tensor;
