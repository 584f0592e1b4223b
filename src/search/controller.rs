//! Per-operator search controller

use ndarray::{Array1, Array2, Axis, IxDyn, Slice};

use crate::candidates::{percentile_candidates, scale_candidates, CandidateGrid};
use crate::error::{CalibrateError, Result};
use crate::memory::MemoryBudget;
use crate::ops::{op_forward, CalibrationRecord, OpKind, QuantOperator};
use crate::quantizer::{fake_quantize_asym, fake_quantize_sym, UniformQuantizer};
use crate::similarity::similarity;
use crate::tensor::Tensor;

use super::SearchConfig;

/// Which operand side is being searched
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    /// First operand: activation, or matmul `A`
    A,
    /// Second operand: weight, or matmul `B`
    B,
}

/// Shape bookkeeping for one searchable side
struct SideMeta {
    /// Channel axis in the operand tensor, when per-channel
    channel_axis: Option<usize>,
    /// Matching per-group axis in the operator output
    out_group_axis: Option<usize>,
    /// Broadcastable shape the side's scale/zero-point tensors take
    param_shape: Vec<usize>,
    /// Number of channel groups (1 when per-tensor)
    groups: usize,
}

fn side_meta(
    kind: &OpKind,
    record: &CalibrationRecord,
    side: Side,
    channel_wise: bool,
) -> SideMeta {
    let per_tensor = |nd: usize| SideMeta {
        channel_axis: None,
        out_group_axis: None,
        param_shape: vec![1; nd.max(1)],
        groups: 1,
    };
    match (kind, side) {
        // matmul operands share the layout [batch, heads, rows, cols];
        // head-wise granularity lives on axis 1 of operand and output
        (OpKind::MatMul, _) => {
            let operand = match side {
                Side::A => &record.inputs[0],
                Side::B => &record.inputs[1],
            };
            let nd = operand.ndim();
            if channel_wise && nd >= 2 {
                let heads = operand.shape()[1];
                let mut shape = vec![1; nd];
                shape[1] = heads;
                SideMeta {
                    channel_axis: Some(1),
                    out_group_axis: Some(1),
                    param_shape: shape,
                    groups: heads,
                }
            } else {
                per_tensor(nd)
            }
        }
        // activations of unary operators are quantized per-tensor
        (OpKind::Linear { .. }, Side::A) | (OpKind::Conv2d { .. }, Side::A) => {
            per_tensor(record.inputs[0].ndim())
        }
        (OpKind::Linear { weight, .. }, Side::B) => {
            if channel_wise {
                let out_f = weight.shape()[0];
                SideMeta {
                    channel_axis: Some(0),
                    out_group_axis: Some(record.output.ndim() - 1),
                    param_shape: vec![out_f, 1],
                    groups: out_f,
                }
            } else {
                per_tensor(weight.ndim())
            }
        }
        (OpKind::Conv2d { weight, .. }, Side::B) => {
            if channel_wise {
                let out_c = weight.shape()[0];
                SideMeta {
                    channel_axis: Some(0),
                    out_group_axis: Some(1),
                    param_shape: vec![out_c, 1, 1, 1],
                    groups: out_c,
                }
            } else {
                per_tensor(weight.ndim())
            }
        }
    }
}

fn side_data<'a>(kind: &'a OpKind, record: &'a CalibrationRecord, side: Side) -> &'a Tensor {
    match side {
        Side::A => &record.inputs[0],
        Side::B => match kind {
            OpKind::MatMul => &record.inputs[1],
            OpKind::Linear { weight, .. } | OpKind::Conv2d { weight, .. } => weight,
        },
    }
}

/// Whether this side's data is stacked along the calibration sample axis
fn side_is_batched(kind: &OpKind, side: Side) -> bool {
    side == Side::A || kind.is_binary()
}

fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

/// How many candidates can be evaluated per group without exceeding the
/// budget slice, rounded down to an exact-divisor grouping of `eq_n`
fn candidate_parallelism(
    cfg: &SearchConfig,
    record: &CalibrationRecord,
    b_numel: usize,
    budget_slice: u64,
) -> usize {
    let calib_size = record.calib_size();
    let out_batch =
        record.output.len() / calib_size.max(1) * calib_size.min(cfg.calib_batch_size);
    let bytes = cfg.input_bytes * (record.inputs[0].len() + b_numel) + cfg.accum_bytes * out_batch;
    let parallel = ((budget_slice as usize / 4) / bytes.max(1)).max(1);
    ceil_div(cfg.eq_n, ceil_div(cfg.eq_n, parallel))
}

/// Materialize the scale/zero-point tensors for one chosen row per group
fn params_from_rows(
    scales: &Array2<f32>,
    zps: Option<&Array2<f32>>,
    rows: &[usize],
    shape: &[usize],
) -> Result<(Tensor, Option<Tensor>)> {
    let pick = |m: &Array2<f32>| -> Result<Tensor> {
        let vals: Vec<f32> = rows.iter().enumerate().map(|(g, &r)| m[[r, g]]).collect();
        Tensor::from_shape_vec(IxDyn(shape), vals)
            .map_err(|e| CalibrateError::ShapeMismatch(format!("candidate param shape: {e}")))
    };
    let scale = pick(scales)?;
    let zp = zps.map(pick).transpose()?;
    Ok((scale, zp))
}

/// Sum over calibration samples of the per-(head|scalar) mean similarity
fn reduce_similarity(sim: &Tensor, out_group_axis: Option<usize>, batch_len: usize) -> Array1<f32> {
    match out_group_axis {
        None => {
            let total: f32 = sim.sum();
            Array1::from_elem(1, total * batch_len as f32 / sim.len().max(1) as f32)
        }
        Some(ax) => {
            let groups = sim.shape()[ax];
            let per_cell = (sim.len() / (batch_len.max(1) * groups)).max(1) as f32;
            let mut out = Array1::<f32>::zeros(groups);
            for g in 0..groups {
                out[g] = sim.index_axis(Axis(ax), g).sum() / per_cell;
            }
            out
        }
    }
}

/// One full candidate sweep for one side: streams the calibration set in
/// chunks, scores every candidate against the float reference with the
/// other side held at its current quantization, and writes the winning
/// scale/zero-point per group into the searched quantizer.
#[allow(clippy::too_many_arguments)]
fn search_best_side(
    kind: &OpKind,
    record: &CalibrationRecord,
    cfg: &SearchConfig,
    parallel_eq_n: usize,
    side: Side,
    meta: &SideMeta,
    scales: &Array2<f32>,
    zps: Option<&Array2<f32>>,
    searched: &mut UniformQuantizer,
    other: &UniformQuantizer,
) -> Result<Vec<usize>> {
    let eq_n = cfg.eq_n;
    let groups = meta.groups;
    let calib_size = record.calib_size();
    let n_levels = searched.config.n_levels();
    let symmetric = searched.config.symmetric;
    if !symmetric && zps.is_none() {
        return Err(CalibrateError::InvalidConfig(
            "asymmetric search requires zero-point candidates".to_string(),
        ));
    }

    let searched_full = side_data(kind, record, side);
    let fixed_full = side_data(kind, record, side.opposite());
    let searched_batched = side_is_batched(kind, side);
    let fixed_batched = side_is_batched(kind, side.opposite());

    let mut totals = Array2::<f32>::zeros((eq_n, groups));
    let mut b_st = 0usize;
    while b_st < calib_size {
        let b_ed = (b_st + cfg.calib_batch_size).min(calib_size);
        let batch_len = b_ed - b_st;

        let chunk_of = |t: &Tensor, batched: bool| -> Tensor {
            if batched {
                t.slice_axis(Axis(0), Slice::from(b_st..b_ed)).to_owned()
            } else {
                t.clone()
            }
        };
        let searched_chunk = chunk_of(searched_full, searched_batched);
        let fixed_chunk = other.forward(&chunk_of(fixed_full, fixed_batched))?;
        let raw_out = record
            .output
            .slice_axis(Axis(0), Slice::from(b_st..b_ed))
            .to_owned();
        let grad = record
            .gradient
            .as_ref()
            .map(|g| g.slice_axis(Axis(0), Slice::from(b_st..b_ed)).to_owned());

        // one group of quantized candidate operands is materialized at a
        // time; the group size is what the memory budget bounds
        let mut p_st = 0usize;
        while p_st < eq_n {
            let p_ed = (p_st + parallel_eq_n).min(eq_n);
            let mut group = Vec::with_capacity(p_ed - p_st);
            for j in p_st..p_ed {
                let row: Vec<usize> = vec![j; groups];
                let (scale_j, zp_j) = params_from_rows(scales, zps, &row, &meta.param_shape)?;
                let quantized = match (symmetric, zp_j.as_ref()) {
                    (true, _) => fake_quantize_sym(&searched_chunk, &scale_j, n_levels)?,
                    (false, Some(zp)) => {
                        fake_quantize_asym(&searched_chunk, &scale_j, zp, n_levels)?
                    }
                    (false, None) => {
                        return Err(CalibrateError::InvalidConfig(
                            "asymmetric search requires zero-point candidates".to_string(),
                        ))
                    }
                };
                group.push(quantized);
            }
            for (offset, sim_operand) in group.iter().enumerate() {
                let j = p_st + offset;
                let out_sim = match side {
                    Side::A => op_forward(kind, sim_operand, &fixed_chunk)?,
                    Side::B => op_forward(kind, &fixed_chunk, sim_operand)?,
                };
                let score = similarity(&raw_out, &out_sim, cfg.metric, grad.as_ref())?;
                let reduced = reduce_similarity(&score, meta.out_group_axis, batch_len);
                let mut row_totals = totals.row_mut(j);
                row_totals += &reduced;
            }
            p_st = p_ed;
        }
        b_st = b_ed;
    }

    // argmax per group; ties take the lowest index
    let mut best = vec![0usize; groups];
    for g in 0..groups {
        for i in 1..eq_n {
            if totals[[i, g]] > totals[[best[g], g]] {
                best[g] = i;
            }
        }
    }

    let (scale, zp) = params_from_rows(scales, zps, &best, &meta.param_shape)?;
    searched.set_params(scale, zp)?;
    Ok(best)
}

impl Side {
    fn opposite(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

/// Full coordinate-descent search for one operator.
///
/// Consumes the operator's calibration record; on success the quantizers
/// hold the winning parameters and `calibrated` is latched.
pub(crate) fn run_search(op: &mut QuantOperator, budget: &dyn MemoryBudget) -> Result<()> {
    let record = op.take_record().ok_or(CalibrateError::MissingCapture)?;
    if record.inputs.is_empty() || (op.kind.is_binary() && record.inputs.len() != 2) {
        return Err(CalibrateError::MissingCapture);
    }
    let cfg = op.search.clone();
    let QuantOperator {
        ref kind,
        ref mut input_quantizer,
        ref mut weight_quantizer,
        ..
    } = *op;

    let slice = budget.query()?.budget_slice();
    let b_numel = side_data(kind, &record, Side::B).len();
    let parallel_eq_n = candidate_parallelism(&cfg, &record, b_numel, slice);

    let a_active = input_quantizer.config.n_bits < 32;
    let b_active = weight_quantizer.config.n_bits < 32;

    let a_meta = side_meta(kind, &record, Side::A, input_quantizer.config.channel_wise);
    let b_meta = side_meta(kind, &record, Side::B, weight_quantizer.config.channel_wise);
    let a_grid = percentile_candidates(
        side_data(kind, &record, Side::A),
        cfg.eq_n,
        &cfg.percentile,
        a_meta.channel_axis,
        budget,
    )?;
    let b_grid = percentile_candidates(
        side_data(kind, &record, Side::B),
        cfg.eq_n,
        &cfg.percentile,
        b_meta.channel_axis,
        budget,
    )?;

    // seed both sides from the max-percentile non-degenerate entry so the
    // fixed side of the very first sweep is already initialized
    let seed_side = |grid: &CandidateGrid,
                     meta: &SideMeta,
                     q: &mut UniformQuantizer|
     -> Result<(Array2<f32>, Option<Array2<f32>>)> {
        let (scales, zps) = scale_candidates(grid, q.config.n_levels(), q.config.symmetric);
        let seed_rows = vec![grid.seed_index(); meta.groups];
        let (scale, zp) = params_from_rows(&scales, zps.as_ref(), &seed_rows, &meta.param_shape)?;
        q.set_params(scale, zp)?;
        Ok((scales, zps))
    };

    let (mut a_scales, mut a_zps) = seed_side(&a_grid, &a_meta, input_quantizer)?;
    let (mut b_scales, mut b_zps) = seed_side(&b_grid, &b_meta, weight_quantizer)?;

    let mut a_best = if a_active {
        search_best_side(
            kind,
            &record,
            &cfg,
            parallel_eq_n,
            Side::A,
            &a_meta,
            &a_scales,
            a_zps.as_ref(),
            input_quantizer,
            weight_quantizer,
        )?
    } else {
        vec![a_grid.seed_index(); a_meta.groups]
    };
    let mut b_best = if b_active {
        search_best_side(
            kind,
            &record,
            &cfg,
            parallel_eq_n,
            Side::B,
            &b_meta,
            &b_scales,
            b_zps.as_ref(),
            weight_quantizer,
            input_quantizer,
        )?
    } else {
        vec![b_grid.seed_index(); b_meta.groups]
    };

    for _ in 0..cfg.search_round {
        if a_active {
            for phase in 0..2 {
                let derived = if phase == 0 {
                    a_grid.hold_upper_at(&a_best)
                } else {
                    a_grid.hold_lower_at(&a_best)
                };
                let (s, z) = scale_candidates(
                    &derived,
                    input_quantizer.config.n_levels(),
                    input_quantizer.config.symmetric,
                );
                a_scales = s;
                a_zps = z;
                a_best = search_best_side(
                    kind,
                    &record,
                    &cfg,
                    parallel_eq_n,
                    Side::A,
                    &a_meta,
                    &a_scales,
                    a_zps.as_ref(),
                    input_quantizer,
                    weight_quantizer,
                )?;
            }
        }
        if b_active {
            for phase in 0..2 {
                let derived = if phase == 0 {
                    b_grid.hold_upper_at(&b_best)
                } else {
                    b_grid.hold_lower_at(&b_best)
                };
                let (s, z) = scale_candidates(
                    &derived,
                    weight_quantizer.config.n_levels(),
                    weight_quantizer.config.symmetric,
                );
                b_scales = s;
                b_zps = z;
                b_best = search_best_side(
                    kind,
                    &record,
                    &cfg,
                    parallel_eq_n,
                    Side::B,
                    &b_meta,
                    &b_scales,
                    b_zps.as_ref(),
                    weight_quantizer,
                    input_quantizer,
                )?;
            }
        }
    }

    op.calibrated = true;
    // record is owned locally and dropped here, releasing the raw tensors
    drop(record);
    Ok(())
}
