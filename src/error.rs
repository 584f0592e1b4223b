//! Calibration error types

use thiserror::Error;

/// Errors produced by the calibration engine
#[derive(Debug, Error)]
pub enum CalibrateError {
    #[error("unsupported similarity metric: {0}")]
    UnsupportedMetric(String),

    #[error("metric {0} requires a captured gradient")]
    MissingGradient(&'static str),

    #[error("operator must be calibrated before quantized forward")]
    NotCalibrated,

    #[error("quantizer invoked before scale initialization")]
    NotInitialized,

    #[error("no captured calibration data for operator")]
    MissingCapture,

    #[error("memory capability unavailable: {0}")]
    Environment(String),

    #[error("quantile workspace still exceeds memory budget after {attempts} batching retries")]
    ResourceExhausted { attempts: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for calibration operations
pub type Result<T> = std::result::Result<T, CalibrateError>;
