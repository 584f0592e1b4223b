//! Percentile candidate grids
//!
//! Builds the discretized search space of clipping thresholds for one
//! operand: `eq_n + 1` `(upper, lower)` percentile pairs from the observed
//! activation distribution, convertible to `(scale, zero_point)` pairs.
//! Quantile computation is memory-adaptive: if the workspace for one call
//! would exceed the device budget, the data is regrouped into smaller
//! mini-batches whose per-chunk quantiles are averaged.

mod grid;


pub use grid::{
    percentile_candidates, percentile_levels, scale_candidates, CandidateGrid, PercentileConfig,
};
