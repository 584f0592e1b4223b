//! Coordinate-descent hyperparameter search
//!
//! The per-operator calibration search: percentile candidate grids are
//! swept for each quantized side (activation/weight, or matmul A/B) while
//! the other side is held at its current best, and the winner by summed
//! similarity is written back into the side's quantizer. Refinement rounds
//! re-sweep one percentile endpoint at a time, a two-phase coordinate
//! descent per side per round.

mod controller;


pub(crate) use controller::run_search;

use serde::{Deserialize, Serialize};

use crate::candidates::PercentileConfig;
use crate::similarity::Metric;

/// Hyperparameter search configuration for one operator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Similarity metric ranking candidates
    pub metric: Metric,
    /// Number of candidates swept per search pass (the grid holds one
    /// extra full-range entry used only for refinement gathers)
    pub eq_n: usize,
    /// Refinement rounds after the initial pass
    pub search_round: usize,
    /// Calibration samples streamed per chunk
    pub calib_batch_size: usize,
    /// Percentile sweep shape
    pub percentile: PercentileConfig,
    /// Assumed bytes per element of a materialized candidate operand
    pub input_bytes: usize,
    /// Assumed bytes per element of an accumulated output
    pub accum_bytes: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Mse,
            eq_n: 100,
            search_round: 1,
            calib_batch_size: 32,
            percentile: PercentileConfig::default(),
            input_bytes: 4,
            accum_bytes: 8,
        }
    }
}

impl SearchConfig {
    /// Default search under the given metric
    pub fn with_metric(metric: Metric) -> Self {
        Self {
            metric,
            ..Self::default()
        }
    }
}
