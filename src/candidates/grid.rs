//! Candidate grid construction from percentile statistics

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{CalibrateError, Result};
use crate::memory::MemoryBudget;
use crate::tensor::{quantile_sorted, Tensor};

/// Floor for scale candidates; keeps every candidate strictly positive
/// even for degenerate distributions.
const MIN_SCALE: f32 = 1e-8;

/// Bound on mini-batch doublings before the quantile computation gives up
const MAX_BATCHING_RETRIES: usize = 32;

/// Percentile sweep parameters.
///
/// Levels are `l + (r-l) * (i/(eq_n-1))^k`; with `k < 1` the sweep is
/// denser near the upper end of the range (less of the tail clipped).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PercentileConfig {
    /// Lowest percentile level swept
    pub lower: f64,
    /// Highest non-degenerate percentile level swept
    pub upper: f64,
    /// Density exponent `k`
    pub exponent: f64,
}

impl Default for PercentileConfig {
    fn default() -> Self {
        Self {
            lower: 0.999,
            upper: 0.99999,
            exponent: 0.1,
        }
    }
}

/// The `eq_n + 1` percentile levels for a sweep; the final entry is an
/// exact `1.0` (full range)
pub fn percentile_levels(cfg: &PercentileConfig, eq_n: usize) -> Result<Vec<f64>> {
    if eq_n < 2 {
        return Err(CalibrateError::InvalidConfig(format!(
            "eq_n must be at least 2, got {eq_n}"
        )));
    }
    if !(cfg.lower < cfg.upper && cfg.upper <= 1.0) {
        return Err(CalibrateError::InvalidConfig(format!(
            "percentile range must satisfy lower < upper <= 1.0, got [{}, {}]",
            cfg.lower, cfg.upper
        )));
    }
    let mut levels: Vec<f64> = (0..eq_n)
        .map(|i| cfg.lower + (cfg.upper - cfg.lower) * (i as f64 / (eq_n - 1) as f64).powf(cfg.exponent))
        .collect();
    levels.push(1.0);
    Ok(levels)
}

/// Candidate `(upper, lower)` percentile pairs, one column per channel
/// group (a single column when per-tensor). Row `i` holds the pair for the
/// `i`-th percentile level; the second-to-last row is the seed.
#[derive(Clone, Debug)]
pub struct CandidateGrid {
    /// Upper cutoffs, shape `[eq_n + 1, groups]`
    pub uppers: Array2<f32>,
    /// Lower cutoffs, same shape
    pub lowers: Array2<f32>,
}

impl CandidateGrid {
    /// Number of grid rows (`eq_n + 1`)
    pub fn rows(&self) -> usize {
        self.uppers.nrows()
    }

    /// Number of channel groups (1 when per-tensor)
    pub fn groups(&self) -> usize {
        self.uppers.ncols()
    }

    /// Index of the seed row (max-percentile non-degenerate entry)
    pub fn seed_index(&self) -> usize {
        self.rows() - 2
    }

    /// Derived grid for a refinement phase: per group, pin the upper
    /// cutoff at `best[g]` while the lower cutoff sweeps the full grid.
    pub fn hold_upper_at(&self, best: &[usize]) -> CandidateGrid {
        let mut uppers = self.uppers.clone();
        for (g, &b) in best.iter().enumerate() {
            let pinned = self.uppers[[b, g]];
            uppers.column_mut(g).fill(pinned);
        }
        CandidateGrid {
            uppers,
            lowers: self.lowers.clone(),
        }
    }

    /// Derived grid for the opposite refinement phase: pin the lower
    /// cutoff at `best[g]`, sweep the upper cutoff.
    pub fn hold_lower_at(&self, best: &[usize]) -> CandidateGrid {
        let mut lowers = self.lowers.clone();
        for (g, &b) in best.iter().enumerate() {
            let pinned = self.lowers[[b, g]];
            lowers.column_mut(g).fill(pinned);
        }
        CandidateGrid {
            uppers: self.uppers.clone(),
            lowers,
        }
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

/// Pick a mini-batch grouping factor so one quantile call's workspace
/// (one sorted chunk copy, 4 bytes per element) fits the budget slice.
fn probe_mini_batch(group_len: usize, budget: &dyn MemoryBudget) -> Result<usize> {
    let slice = budget.query()?.budget_slice();
    let mut mini_batch = 1usize;
    for _ in 0..=MAX_BATCHING_RETRIES {
        let chunk_len = ceil_div(group_len, mini_batch).max(1);
        if (chunk_len as u64) * 4 <= slice {
            return Ok(mini_batch);
        }
        mini_batch *= 2;
    }
    Err(CalibrateError::ResourceExhausted {
        attempts: MAX_BATCHING_RETRIES,
    })
}

/// Mean of per-chunk interpolated quantiles at each level.
///
/// Each chunk is sorted independently; averaging chunk quantiles trades a
/// little statistical fidelity for a bounded workspace.
fn chunked_quantiles(data: &[f32], mini_batch: usize, levels: &[f64]) -> (Vec<f32>, Vec<f32>) {
    let chunk_len = ceil_div(data.len(), mini_batch).max(1);
    let mut uppers = vec![0.0f32; levels.len()];
    let mut lowers = vec![0.0f32; levels.len()];
    let mut chunks = 0usize;
    for chunk in data.chunks(chunk_len) {
        let mut sorted = chunk.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        for (i, &p) in levels.iter().enumerate() {
            uppers[i] += quantile_sorted(&sorted, p);
            lowers[i] += quantile_sorted(&sorted, 1.0 - p);
        }
        chunks += 1;
    }
    let inv = 1.0 / chunks as f32;
    for i in 0..levels.len() {
        uppers[i] *= inv;
        lowers[i] *= inv;
    }
    (uppers, lowers)
}

/// Build the candidate grid for one operand.
///
/// With `channel_axis` set, quantiles are computed per slice along that
/// axis (one column per head/channel); otherwise over the whole tensor.
pub fn percentile_candidates(
    x: &Tensor,
    eq_n: usize,
    cfg: &PercentileConfig,
    channel_axis: Option<usize>,
    budget: &dyn MemoryBudget,
) -> Result<CandidateGrid> {
    if x.is_empty() {
        return Err(CalibrateError::ShapeMismatch(
            "cannot compute percentile candidates of an empty tensor".to_string(),
        ));
    }
    let levels = percentile_levels(cfg, eq_n)?;

    let group_data: Vec<Vec<f32>> = match channel_axis {
        None => vec![x.iter().copied().collect()],
        Some(ax) => {
            if ax >= x.ndim() {
                return Err(CalibrateError::ShapeMismatch(format!(
                    "channel axis {ax} out of range for shape {:?}",
                    x.shape()
                )));
            }
            (0..x.shape()[ax])
                .map(|g| x.index_axis(Axis(ax), g).iter().copied().collect())
                .collect()
        }
    };

    let group_len = group_data.iter().map(Vec::len).max().unwrap_or(1);
    let mini_batch = probe_mini_batch(group_len, budget)?;

    let groups = group_data.len();
    let mut uppers = Array2::<f32>::zeros((levels.len(), groups));
    let mut lowers = Array2::<f32>::zeros((levels.len(), groups));
    for (g, data) in group_data.iter().enumerate() {
        let (u, l) = chunked_quantiles(data, mini_batch, &levels);
        for i in 0..levels.len() {
            uppers[[i, g]] = u[i];
            lowers[[i, g]] = l[i];
        }
    }
    Ok(CandidateGrid { uppers, lowers })
}

/// Convert a percentile grid into per-candidate quantizer parameters.
///
/// Asymmetric: `scale = (upper - lower) / (2L - 1)`,
/// `zero_point = round(-lower / scale)`. Symmetric: the scale covers the
/// larger absolute cutoff, `scale = max(upper, -lower) / (L - 1)`, and no
/// zero-point is produced.
pub fn scale_candidates(
    grid: &CandidateGrid,
    n_levels: i64,
    symmetric: bool,
) -> (Array2<f32>, Option<Array2<f32>>) {
    let shape = (grid.rows(), grid.groups());
    let mut scales = Array2::<f32>::zeros(shape);
    if symmetric {
        let denom = (n_levels - 1) as f32;
        for ((i, g), s) in scales.indexed_iter_mut() {
            let bound = grid.uppers[[i, g]].max(-grid.lowers[[i, g]]);
            *s = (bound / denom).max(MIN_SCALE);
        }
        (scales, None)
    } else {
        let denom = (2 * n_levels - 1) as f32;
        let mut zps = Array2::<f32>::zeros(shape);
        for i in 0..shape.0 {
            for g in 0..shape.1 {
                let scale = ((grid.uppers[[i, g]] - grid.lowers[[i, g]]) / denom).max(MIN_SCALE);
                scales[[i, g]] = scale;
                zps[[i, g]] = (-grid.lowers[[i, g]] / scale).round();
            }
        }
        (scales, Some(zps))
    }
}
