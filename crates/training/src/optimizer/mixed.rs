use candle_core::{DType, Tensor};
use model::NamedParameter;

use super::{AdamW, AdamWConfig, GradientScaler, GradientScalerState, OptimizerState};
use crate::{
    distributed::{all_reduce_scalar, all_reduce_tensors, ProcessGrid, ReduceOp},
    error::to_runtime_error,
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Gradients were accumulated; the accumulation boundary is not reached.
    Accumulating,
    Applied,
    /// Overflow detected; parameters are untouched.
    Skipped,
}

/// Loss-scaled optimizer driving [`AdamW`] from fp32 master gradients.
///
/// With `accumulation_steps > 1` the optimizer owns the whole gradient
/// lifecycle: it divides each micro-step loss by the accumulation count,
/// keeps summing gradients, and only at the boundary reduces them over the
/// data-parallel group, unscales, clips and applies.
pub struct MixedPrecisionOptimizer {
    params: Vec<NamedParameter>,
    adam: AdamW,
    scaler: GradientScaler,
    grid: ProcessGrid,
    accumulation_steps: usize,
    clip_grad: f64,
    micro_steps: usize,
    grads: Vec<Option<Tensor>>,
    master_grads: Vec<Option<Tensor>>,
    masters_ready: bool,
    overflow: bool,
}

impl MixedPrecisionOptimizer {
    pub fn new(
        params: Vec<NamedParameter>,
        config: AdamWConfig,
        scaler: GradientScaler,
        grid: ProcessGrid,
        accumulation_steps: usize,
        clip_grad: f64,
    ) -> Result<Self, TrainingError> {
        let adam = AdamW::new(&params, config)?;
        let count = params.len();
        Ok(Self {
            params,
            adam,
            scaler,
            grid,
            accumulation_steps: accumulation_steps.max(1),
            clip_grad,
            micro_steps: 0,
            grads: vec![None; count],
            master_grads: vec![None; count],
            masters_ready: false,
            overflow: false,
        })
    }

    pub fn is_delegated(&self) -> bool {
        self.accumulation_steps > 1
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn loss_scale(&self) -> f32 {
        self.scaler.loss_scale()
    }

    pub fn uses_loss_scaling(&self) -> bool {
        self.scaler.is_enabled()
    }

    pub fn learning_rate(&self) -> f64 {
        self.adam.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.adam.set_learning_rate(lr);
    }

    pub fn parameters(&self) -> &[NamedParameter] {
        &self.params
    }

    pub fn zero_grad(&mut self) {
        self.grads.iter_mut().for_each(|grad| *grad = None);
        self.master_grads.iter_mut().for_each(|grad| *grad = None);
        self.micro_steps = 0;
        self.masters_ready = false;
    }

    /// Back-propagates the scaled loss and adds the result to the held
    /// gradients. Gradients stay scaled until [`Self::update_master_grads`].
    pub fn backward(&mut self, loss: &Tensor) -> Result<(), TrainingError> {
        let mut factor = self.scaler.loss_scale() as f64;
        if self.is_delegated() {
            factor /= self.accumulation_steps as f64;
        }
        let scaled = loss.affine(factor, 0.0).map_err(to_runtime_error)?;
        let store = scaled.backward().map_err(to_runtime_error)?;

        for (param, slot) in self.params.iter().zip(self.grads.iter_mut()) {
            let Some(grad) = store.get(param.var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            *slot = Some(match slot.take() {
                Some(held) => held.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            });
        }
        self.micro_steps += 1;
        self.masters_ready = false;
        Ok(())
    }

    /// Averages the held gradients over the data-parallel group.
    pub fn reduce_gradients(&mut self) -> Result<(), TrainingError> {
        let group = self.grid.data_parallel();
        if group.size() == 1 {
            return Ok(());
        }
        let present: Vec<usize> = (0..self.grads.len())
            .filter(|&index| self.grads[index].is_some())
            .collect();
        let tensors: Vec<Tensor> = present
            .iter()
            .filter_map(|&index| self.grads[index].clone())
            .collect();
        let reduced = all_reduce_tensors(group, &tensors, ReduceOp::Sum)?;
        let scale = 1.0 / group.size() as f64;
        for (index, tensor) in present.into_iter().zip(reduced) {
            self.grads[index] = Some(tensor.affine(scale, 0.0).map_err(to_runtime_error)?);
        }
        self.masters_ready = false;
        Ok(())
    }

    /// Unscales the held gradients into fp32 master gradients and checks
    /// them for overflow; the flag is agreed on with a MAX over the
    /// model-parallel group.
    pub fn update_master_grads(&mut self) -> Result<(), TrainingError> {
        let inverse = 1.0 / self.scaler.loss_scale() as f64;
        for (grad, master) in self.grads.iter().zip(self.master_grads.iter_mut()) {
            *master = match grad {
                Some(grad) if inverse != 1.0 => {
                    Some(grad.affine(inverse, 0.0).map_err(to_runtime_error)?)
                }
                Some(grad) => Some(grad.clone()),
                None => None,
            };
        }

        let local = self
            .scaler
            .has_overflow(self.master_grads.iter().flatten())?;
        let agreed = all_reduce_scalar(
            self.grid.model_parallel(),
            if local { 1.0 } else { 0.0 },
            ReduceOp::Max,
        )?;
        self.overflow = agreed > 0.0;
        self.masters_ready = true;
        Ok(())
    }

    /// Rescales the master gradients so their global norm is at most
    /// `max_norm`. Returns the norm before clipping, or `-1` on overflow.
    ///
    /// Parameters replicated across the model-parallel group contribute only
    /// on model-parallel rank 0; the squared sum is then all-reduced over the
    /// group.
    pub fn clip_master_grads(&mut self, max_norm: f64) -> Result<f64, TrainingError> {
        if !self.masters_ready {
            self.update_master_grads()?;
        }
        if self.overflow {
            return Ok(-1.0);
        }

        let owns_replicated = self.grid.model_parallel_rank() == 0;
        let mut local = 0f64;
        for (param, master) in self.params.iter().zip(&self.master_grads) {
            let Some(master) = master else {
                continue;
            };
            if param.model_parallel || owns_replicated {
                let sq = master
                    .sqr()
                    .and_then(|t| t.sum_all())
                    .and_then(|t| t.to_vec0::<f32>())
                    .map_err(to_runtime_error)?;
                local += sq as f64;
            }
        }
        let total = all_reduce_scalar(self.grid.model_parallel(), local as f32, ReduceOp::Sum)?;
        let norm = (total as f64).sqrt();

        let coef = max_norm / (norm + 1e-6);
        if coef < 1.0 {
            for master in self.master_grads.iter_mut().flatten() {
                *master = master.affine(coef, 0.0).map_err(to_runtime_error)?;
            }
        }
        Ok(norm)
    }

    /// Applies the update, or reports why it did not.
    pub fn step(&mut self) -> Result<StepOutcome, TrainingError> {
        if self.is_delegated() {
            if self.micro_steps < self.accumulation_steps {
                return Ok(StepOutcome::Accumulating);
            }
            self.reduce_gradients()?;
            self.update_master_grads()?;
            if self.clip_grad > 0.0 {
                self.clip_master_grads(self.clip_grad)?;
            }
        } else if !self.masters_ready {
            self.update_master_grads()?;
        }

        let outcome = if self.overflow {
            self.scaler.update(true);
            log::info!(
                "gradient overflow, skipping step; loss scale is now {}",
                self.scaler.loss_scale()
            );
            StepOutcome::Skipped
        } else {
            self.adam.apply(&self.master_grads)?;
            self.scaler.update(false);
            StepOutcome::Applied
        };
        self.zero_grad();
        Ok(outcome)
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        self.adam.state()
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.adam.load_state(state)
    }

    pub fn scaler_state(&self) -> GradientScalerState {
        self.scaler.state()
    }

    pub fn load_scaler_state(&mut self, state: GradientScalerState) -> Result<(), TrainingError> {
        self.scaler.load_state(state)
    }
}
