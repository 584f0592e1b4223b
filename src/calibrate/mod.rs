//! Whole-model calibration orchestration
//!
//! Drives the per-operator capture/search loop over a user-provided model:
//! a float warm pass, then for each quantizable operator a replay of the
//! calibration set with capture enabled, the hyperparameter search, and an
//! optional model-side reparameterization. Once every operator is
//! calibrated the whole model is flipped into quantized inference.

mod orchestrator;


pub use orchestrator::{CalibrationModel, Calibrator};
