//! The model-level calibration loop

use crate::error::{CalibrateError, Result};
use crate::memory::MemoryBudget;
use crate::ops::{Mode, QuantOperator};
use crate::tensor::Tensor;

/// A model hosting quantizable operators.
///
/// The engine never sees the model's structure; it addresses operators by
/// name and replays the calibration set through the model's own forward.
/// Implementations route each batch through their operators (calling
/// [`QuantOperator::forward`] / [`QuantOperator::forward_matmul`] at the
/// quantizable sites) and, when gradients are needed, push the output
/// gradient of each site via [`QuantOperator::record_gradient`] during
/// `backward`.
pub trait CalibrationModel {
    /// Names of the quantizable operators, in calibration order
    fn operator_names(&self) -> Vec<String>;

    /// Run `f` against the named operator; `None` if the name is unknown
    fn with_operator<R, F>(&mut self, name: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut QuantOperator) -> R;

    /// Run one calibration batch through the model
    fn forward(&mut self, batch: &Tensor) -> Result<Tensor>;

    /// Backpropagate the task loss for one batch, recording output
    /// gradients at each capturing operator. Only needed for gradient
    /// metrics; the default refuses.
    fn backward(&mut self, batch: &Tensor) -> Result<()> {
        let _ = batch;
        Err(CalibrateError::Environment(
            "model does not provide gradients; use a gradient-free metric".to_string(),
        ))
    }

    /// Hook invoked after an operator has been searched, for model-side
    /// reparameterization (e.g. folding clipping into adjacent layers)
    fn reparam(&mut self, name: &str) -> Result<()> {
        let _ = name;
        Ok(())
    }
}

/// Whole-model calibration driver
pub struct Calibrator<B: MemoryBudget> {
    budget: B,
}

impl<B: MemoryBudget> Calibrator<B> {
    /// Calibrator sizing its working sets against the given memory budget
    pub fn new(budget: B) -> Self {
        Self { budget }
    }

    /// Calibrate every operator of `model` over `batches`, then flip the
    /// model into quantized inference.
    ///
    /// Operators are processed one at a time so only a single operator's
    /// raw capture is ever held in memory. An error mid-capture aborts the
    /// partial capture before propagating.
    pub fn calibrate<M: CalibrationModel>(&self, model: &mut M, batches: &[Tensor]) -> Result<()> {
        if batches.is_empty() {
            return Err(CalibrateError::InvalidConfig(
                "calibration set is empty".to_string(),
            ));
        }
        let names = model.operator_names();
        for name in &names {
            self.ensure_raw(model, name)?;
        }

        // float warm pass over the whole set before any capture
        for batch in batches {
            model.forward(batch)?;
        }

        for name in &names {
            let already = self
                .with_op(model, name, |op| op.calibrated())?;
            if already {
                continue;
            }
            let needs_grad = self.with_op(model, name, |op| {
                op.begin_capture();
                op.metric().needs_gradient()
            })?;

            if let Err(e) = replay(model, batches, needs_grad) {
                self.with_op(model, name, |op| op.abort_capture())?;
                return Err(e);
            }

            self.with_op(model, name, |op| op.end_capture())??;
            self.with_op(model, name, |op| op.hyperparameter_searching(&self.budget))??;
            model.reparam(name)?;
        }

        // flip the whole model at once; partially-quantized inference is
        // never observable from outside
        for name in &names {
            self.with_op(model, name, |op| op.set_mode(Mode::QuantForward))?;
        }
        Ok(())
    }

    fn ensure_raw<M: CalibrationModel>(&self, model: &mut M, name: &str) -> Result<()> {
        self.with_op(model, name, |op| op.set_mode(Mode::Raw))
    }

    fn with_op<M: CalibrationModel, R, F>(&self, model: &mut M, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut QuantOperator) -> R,
    {
        model.with_operator(name, f).ok_or_else(|| {
            CalibrateError::InvalidConfig(format!("model does not expose operator `{name}`"))
        })
    }
}

fn replay<M: CalibrationModel>(model: &mut M, batches: &[Tensor], needs_grad: bool) -> Result<()> {
    for batch in batches {
        model.forward(batch)?;
        if needs_grad {
            model.backward(batch)?;
        }
    }
    Ok(())
}
