//! Doubles shared by the unit tests.

use std::{
    cell::RefCell,
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
};

use candle_core::{Device, Result as CandleResult, Tensor, Var};
use model::{LanguageModel, ModelOutput, NamedParameter};

use crate::{
    data::BlockingDataLoader,
    error::to_runtime_error,
    forward::{ForwardOutput, ForwardStep, LmMode},
    TrainingError,
};

/// One-parameter model; the forward scales its weight by the token values.
pub struct ScalarModel {
    weight: Var,
    training: AtomicBool,
    device: Device,
}

impl ScalarModel {
    pub fn new(value: f32) -> Self {
        Self {
            weight: Var::from_slice(&[value], 1, &Device::Cpu).unwrap(),
            training: AtomicBool::new(true),
            device: Device::Cpu,
        }
    }

    pub fn value(&self) -> f32 {
        self.weight.as_tensor().to_vec1::<f32>().unwrap()[0]
    }
}

impl LanguageModel for ScalarModel {
    fn forward(
        &self,
        tokens: &Tensor,
        _position_ids: &Tensor,
        _attention_mask: &Tensor,
        _mems: &[Tensor],
    ) -> CandleResult<ModelOutput> {
        let logits = tokens
            .to_dtype(candle_core::DType::F32)?
            .broadcast_mul(self.weight.as_tensor())?;
        Ok(ModelOutput {
            logits,
            mems: Vec::new(),
        })
    }

    fn parameters(&self) -> Vec<NamedParameter> {
        vec![NamedParameter::new("scalar.weight", self.weight.clone())]
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::SeqCst);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::SeqCst)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn innermost(&self) -> &dyn LanguageModel {
        self
    }
}

/// Forward step replaying `(factor, mode)` pairs; the loss is the model's
/// first parameter times `factor`. Records whether the model was in training
/// mode on every call.
pub struct ScriptedStep {
    script: RefCell<VecDeque<(f64, LmMode)>>,
    seen_training: RefCell<Vec<bool>>,
    fail_after: Option<usize>,
}

impl ScriptedStep {
    pub fn new(script: Vec<(f64, LmMode)>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            seen_training: RefCell::new(Vec::new()),
            fail_after: None,
        }
    }

    /// Errors once `calls` forwards have succeeded.
    pub fn failing_after(mut self, calls: usize) -> Self {
        self.fail_after = Some(calls);
        self
    }

    pub fn remaining(&self) -> usize {
        self.script.borrow().len()
    }

    pub fn seen_training(&self) -> Vec<bool> {
        self.seen_training.borrow().clone()
    }
}

impl ForwardStep for ScriptedStep {
    fn forward(
        &self,
        _loader: Option<&mut BlockingDataLoader>,
        model: &dyn LanguageModel,
        _mems: &[Tensor],
    ) -> Result<Option<ForwardOutput>, TrainingError> {
        self.seen_training.borrow_mut().push(model.is_training());
        if self.fail_after == Some(self.seen_training.borrow().len() - 1) {
            return Err(TrainingError::runtime("scripted failure"));
        }
        let Some((factor, mode)) = self.script.borrow_mut().pop_front() else {
            return Ok(None);
        };
        let weight = model.parameters()[0].var.as_tensor().clone();
        let scaled = weight.affine(factor, 0.0).map_err(to_runtime_error)?;
        let loss = scaled.sum_all().map_err(to_runtime_error)?;
        let value = loss.to_vec0::<f32>().map_err(to_runtime_error)?;
        Ok(Some(ForwardOutput {
            loss,
            value,
            mems: vec![scaled],
            mode,
        }))
    }
}
