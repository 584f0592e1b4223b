//! Quantizable operators
//!
//! A [`QuantOperator`] wraps one matmul, linear, or conv2d site in a model.
//! It is a small state machine: it starts in `Raw` mode (float compute,
//! optionally recording its operands for calibration), is searched once by
//! the calibration controller, and is then flipped into `QuantForward` mode
//! where both operands pass through their quantizers. The perturbation
//! probe modes nudge the raw output by a fixed epsilon for sensitivity
//! probing.

mod forward;

#[cfg(test)]
mod tests;

pub(crate) use forward::op_forward;

use serde::{Deserialize, Serialize};

use crate::error::{CalibrateError, Result};
use crate::memory::MemoryBudget;
use crate::quantizer::{QuantConfig, UniformQuantizer};
use crate::search::{self, SearchConfig};
use crate::similarity::Metric;
use crate::tensor::{concat_batches, Tensor};

/// Perturbation epsilon for the probe modes
const PROBE_EPS: f32 = 1e-6;

/// Operator execution mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Float computation (and capture, while calibration records it)
    Raw,
    /// Quantize both operands before computing; requires calibration
    QuantForward,
    /// Raw output shifted up by a fixed epsilon
    ProbeUp,
    /// Raw output shifted down by a fixed epsilon
    ProbeDown,
}

/// The operator variants the search engine can calibrate.
///
/// Unary kinds own their weight (and optional bias); the binary matmul
/// takes both operands at call time.
#[derive(Clone, Debug)]
pub enum OpKind {
    /// Batched matrix multiplication `A @ B`
    MatMul,
    /// `x @ w^T + bias`, weight `[out, in]`
    Linear {
        weight: Tensor,
        bias: Option<Tensor>,
    },
    /// Zero-padded strided convolution, weight `[oc, ic, kh, kw]`
    Conv2d {
        weight: Tensor,
        bias: Option<Tensor>,
        stride: (usize, usize),
        padding: (usize, usize),
    },
}

impl OpKind {
    /// The owned weight tensor, absent for matmul
    pub(crate) fn weight(&self) -> Option<&Tensor> {
        match self {
            OpKind::MatMul => None,
            OpKind::Linear { weight, .. } | OpKind::Conv2d { weight, .. } => Some(weight),
        }
    }

    /// Whether both operands arrive at call time
    pub fn is_binary(&self) -> bool {
        matches!(self, OpKind::MatMul)
    }
}

/// Raw tensors captured for one operator over the full calibration set.
///
/// All tensors are stacked along the leading sample axis. The record is
/// consumed (dropped) by the search controller when calibration of the
/// operator completes.
#[derive(Clone, Debug)]
pub struct CalibrationRecord {
    /// One tensor for unary operators, two for matmul
    pub inputs: Vec<Tensor>,
    /// Float reference output
    pub output: Tensor,
    /// Output gradient, present when a gradient metric requested it
    pub gradient: Option<Tensor>,
}

impl CalibrationRecord {
    /// Number of calibration samples (leading axis length)
    pub fn calib_size(&self) -> usize {
        self.inputs[0].shape()[0]
    }
}

/// Per-batch capture accumulators, concatenated at capture end
#[derive(Clone, Debug, Default)]
struct CaptureBuffers {
    active: bool,
    inputs: Vec<Vec<Tensor>>,
    outputs: Vec<Tensor>,
    gradients: Vec<Tensor>,
}

/// One quantizable operator site
#[derive(Clone, Debug)]
pub struct QuantOperator {
    pub(crate) kind: OpKind,
    mode: Mode,
    pub(crate) calibrated: bool,
    pub(crate) search: SearchConfig,
    /// Quantizer for the first operand (activation / matmul `A`)
    pub input_quantizer: UniformQuantizer,
    /// Quantizer for the second operand (weight / matmul `B`)
    pub weight_quantizer: UniformQuantizer,
    pub(crate) record: Option<CalibrationRecord>,
    capture: CaptureBuffers,
}

impl QuantOperator {
    fn new(kind: OpKind, a: QuantConfig, b: QuantConfig, search: SearchConfig) -> Self {
        Self {
            kind,
            mode: Mode::Raw,
            calibrated: false,
            search,
            input_quantizer: UniformQuantizer::new(a),
            weight_quantizer: UniformQuantizer::new(b),
            record: None,
            capture: CaptureBuffers::default(),
        }
    }

    /// Batched matmul operator
    pub fn matmul(a: QuantConfig, b: QuantConfig, search: SearchConfig) -> Self {
        Self::new(OpKind::MatMul, a, b, search)
    }

    /// Linear operator with weight `[out, in]`
    pub fn linear(
        weight: Tensor,
        bias: Option<Tensor>,
        activation: QuantConfig,
        weight_q: QuantConfig,
        search: SearchConfig,
    ) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(CalibrateError::ShapeMismatch(format!(
                "linear weight must be 2-D, got {:?}",
                weight.shape()
            )));
        }
        Ok(Self::new(
            OpKind::Linear { weight, bias },
            activation,
            weight_q,
            search,
        ))
    }

    /// Conv2d operator with weight `[oc, ic, kh, kw]`
    pub fn conv2d(
        weight: Tensor,
        bias: Option<Tensor>,
        stride: (usize, usize),
        padding: (usize, usize),
        activation: QuantConfig,
        weight_q: QuantConfig,
        search: SearchConfig,
    ) -> Result<Self> {
        if weight.ndim() != 4 {
            return Err(CalibrateError::ShapeMismatch(format!(
                "conv2d weight must be 4-D, got {:?}",
                weight.shape()
            )));
        }
        Ok(Self::new(
            OpKind::Conv2d {
                weight,
                bias,
                stride,
                padding,
            },
            activation,
            weight_q,
            search,
        ))
    }

    /// Current execution mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch execution mode. The `calibrated` gate still applies: routing
    /// an uncalibrated operator into `QuantForward` makes its next forward
    /// fail rather than silently returning float results.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Whether hyperparameter search has completed (one-way latch)
    pub fn calibrated(&self) -> bool {
        self.calibrated
    }

    /// The similarity metric this operator is searched under
    pub fn metric(&self) -> Metric {
        self.search.metric
    }

    /// Search configuration
    pub fn search_config(&self) -> &SearchConfig {
        &self.search
    }

    /// Operator kind
    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    /// Captured calibration record, if a capture pass has completed and
    /// search has not yet consumed it
    pub fn record(&self) -> Option<&CalibrationRecord> {
        self.record.as_ref()
    }

    pub(crate) fn take_record(&mut self) -> Option<CalibrationRecord> {
        self.record.take()
    }

    /// Begin recording operands/outputs of `Raw` forwards
    pub fn begin_capture(&mut self) {
        let arity = if self.kind.is_binary() { 2 } else { 1 };
        self.capture = CaptureBuffers {
            active: true,
            inputs: vec![Vec::new(); arity],
            outputs: Vec::new(),
            gradients: Vec::new(),
        };
    }

    /// Stop recording and concatenate per-batch buffers into the record
    pub fn end_capture(&mut self) -> Result<()> {
        if !self.capture.active {
            return Err(CalibrateError::MissingCapture);
        }
        let bufs = std::mem::take(&mut self.capture);
        let inputs = bufs
            .inputs
            .iter()
            .map(|lane| concat_batches(lane))
            .collect::<Result<Vec<_>>>()?;
        let output = concat_batches(&bufs.outputs)?;
        let gradient = if bufs.gradients.is_empty() {
            None
        } else {
            Some(concat_batches(&bufs.gradients)?)
        };
        // every captured tensor must cover the same calibration samples
        let n = inputs[0].shape()[0];
        if inputs.iter().any(|t| t.shape()[0] != n) || output.shape()[0] != n {
            return Err(CalibrateError::ShapeMismatch(format!(
                "captured output covers {} samples, inputs cover {n}",
                output.shape()[0]
            )));
        }
        if let Some(g) = &gradient {
            if g.shape()[0] != n {
                return Err(CalibrateError::ShapeMismatch(format!(
                    "captured gradient covers {} samples, inputs cover {n}",
                    g.shape()[0]
                )));
            }
        }
        self.record = Some(CalibrationRecord {
            inputs,
            output,
            gradient,
        });
        Ok(())
    }

    /// Drop any partial capture without producing a record
    pub fn abort_capture(&mut self) {
        self.capture = CaptureBuffers::default();
    }

    /// Append one batch's output gradient while capturing
    pub fn record_gradient(&mut self, grad: Tensor) {
        if self.capture.active {
            self.capture.gradients.push(grad);
        }
    }

    /// Forward for unary operators (linear / conv2d)
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let weight = self.kind.weight().ok_or_else(|| {
            CalibrateError::InvalidConfig(
                "matmul operator requires two operands; use forward_matmul".to_string(),
            )
        })?;
        match self.mode {
            Mode::Raw => {
                let out = op_forward(&self.kind, x, weight)?;
                if self.capture.active {
                    self.capture.inputs[0].push(x.clone());
                    self.capture.outputs.push(out.clone());
                }
                Ok(out)
            }
            Mode::QuantForward => {
                if !self.calibrated {
                    return Err(CalibrateError::NotCalibrated);
                }
                let xq = self.input_quantizer.forward(x)?;
                let wq = self.weight_quantizer.forward(weight)?;
                op_forward(&self.kind, &xq, &wq)
            }
            Mode::ProbeUp => Ok(op_forward(&self.kind, x, weight)? + PROBE_EPS),
            Mode::ProbeDown => Ok(op_forward(&self.kind, x, weight)? - PROBE_EPS),
        }
    }

    /// Forward for the binary matmul operator
    pub fn forward_matmul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        if !self.kind.is_binary() {
            return Err(CalibrateError::InvalidConfig(
                "unary operator takes a single operand; use forward".to_string(),
            ));
        }
        match self.mode {
            Mode::Raw => {
                let out = op_forward(&self.kind, a, b)?;
                if self.capture.active {
                    self.capture.inputs[0].push(a.clone());
                    self.capture.inputs[1].push(b.clone());
                    self.capture.outputs.push(out.clone());
                }
                Ok(out)
            }
            Mode::QuantForward => {
                if !self.calibrated {
                    return Err(CalibrateError::NotCalibrated);
                }
                let aq = self.input_quantizer.forward(a)?;
                let bq = self.weight_quantizer.forward(b)?;
                op_forward(&self.kind, &aq, &bq)
            }
            Mode::ProbeUp => Ok(op_forward(&self.kind, a, b)? + PROBE_EPS),
            Mode::ProbeDown => Ok(op_forward(&self.kind, a, b)? - PROBE_EPS),
        }
    }

    /// Run the coordinate-descent hyperparameter search over the captured
    /// calibration record, writing the winning parameters into the
    /// quantizers and latching `calibrated`. Consumes the record.
    pub fn hyperparameter_searching(&mut self, budget: &dyn MemoryBudget) -> Result<()> {
        search::run_search(self, budget)
    }
}
