use candle_core::{DType, Device, Tensor};
use model::LanguageModel;

use crate::{
    data::{
        broadcast_data, get_batch, BatchContext, BlockingDataLoader, ATTENTION_MASK, LABEL,
        POSITION_ID, TEXT,
    },
    distributed::ProcessGrid,
    error::to_runtime_error,
    loss::masked_cross_entropy,
    TrainingError,
};

/// Execution mode tag used to bucket evaluation losses.
///
/// Derived from the batch width alone: a batch no longer than
/// `seq_length + 1` counts as causal. Batches of both kinds that share a
/// width are indistinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmMode {
    Causal,
    FullContext,
}

impl LmMode {
    pub fn classify(sequence_length: usize, seq_length: usize) -> Self {
        if sequence_length <= seq_length + 1 {
            LmMode::Causal
        } else {
            LmMode::FullContext
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LmMode::Causal => "gpt",
            LmMode::FullContext => "bert",
        }
    }
}

#[derive(Debug)]
pub struct ForwardOutput {
    /// Scalar loss attached to the autograd graph.
    pub loss: Tensor,
    pub value: f32,
    pub mems: Vec<Tensor>,
    pub mode: LmMode,
}

/// One batch through the model. `None` means the data source is exhausted.
pub trait ForwardStep: Send {
    fn forward(
        &self,
        loader: Option<&mut BlockingDataLoader>,
        model: &dyn LanguageModel,
        mems: &[Tensor],
    ) -> Result<Option<ForwardOutput>, TrainingError>;
}

/// Language-modeling forward: batch, model, masked token cross entropy.
pub struct LanguageModelingStep {
    context: BatchContext,
    grid: ProcessGrid,
    seq_length: usize,
}

impl LanguageModelingStep {
    pub fn new(context: BatchContext, grid: ProcessGrid, seq_length: usize) -> Self {
        Self {
            context,
            grid,
            seq_length,
        }
    }
}

impl ForwardStep for LanguageModelingStep {
    fn forward(
        &self,
        loader: Option<&mut BlockingDataLoader>,
        model: &dyn LanguageModel,
        mems: &[Tensor],
    ) -> Result<Option<ForwardOutput>, TrainingError> {
        let Some(batch) = get_batch(loader, &self.context, &self.grid)? else {
            return Ok(None);
        };
        let mode = LmMode::classify(batch.sequence_length()?, self.seq_length);

        let output = model
            .forward(
                &batch.tokens,
                &batch.position_ids,
                &batch.attention_mask,
                mems,
            )
            .map_err(to_runtime_error)?;
        let loss = masked_cross_entropy(&output.logits, &batch.labels, &batch.loss_mask)?;

        Ok(Some(ForwardOutput {
            loss: loss.loss,
            value: loss.value,
            mems: output.mems,
            mode,
        }))
    }
}

/// Forward for the multiple-choice head.
///
/// Batches carry `text`, `position_id` and `attention_mask` (choice padding)
/// as `[batch, choices, seq]` plus a `label` of `[batch]` choice indices.
pub struct MultipleChoiceStep {
    grid: ProcessGrid,
    device: Device,
    seq_length: usize,
}

impl MultipleChoiceStep {
    pub const KEYS: [&'static str; 4] = [TEXT, LABEL, ATTENTION_MASK, POSITION_ID];

    pub fn new(grid: ProcessGrid, device: Device, seq_length: usize) -> Self {
        Self {
            grid,
            device,
            seq_length,
        }
    }
}

impl ForwardStep for MultipleChoiceStep {
    fn forward(
        &self,
        loader: Option<&mut BlockingDataLoader>,
        model: &dyn LanguageModel,
        mems: &[Tensor],
    ) -> Result<Option<ForwardOutput>, TrainingError> {
        let raw = match (self.grid.is_data_source(), loader) {
            (true, Some(loader)) => loader.next_batch()?,
            (true, None) => {
                return Err(TrainingError::runtime("data-source rank has no data loader"))
            }
            (false, _) => None,
        };
        let Some(data) = broadcast_data(&Self::KEYS, raw.as_ref(), &self.grid, &self.device)?
        else {
            return Ok(None);
        };

        let tokens = data.require(TEXT)?;
        let labels = data.require(LABEL)?;
        let padding = data
            .require(ATTENTION_MASK)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        let seq = tokens
            .dims()
            .last()
            .copied()
            .ok_or_else(|| TrainingError::runtime("choice tokens have no sequence dimension"))?;
        let mode = LmMode::classify(seq, self.seq_length);

        let output = model
            .forward(tokens, data.require(POSITION_ID)?, &padding, mems)
            .map_err(to_runtime_error)?;
        let loss_mask = Tensor::ones(labels.dims(), DType::F32, &self.device)
            .map_err(to_runtime_error)?;
        let loss = masked_cross_entropy(&output.logits, labels, &loss_mask)?;

        Ok(Some(ForwardOutput {
            loss: loss.loss,
            value: loss.value,
            mems: output.mems,
            mode,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_threshold_is_inclusive() {
        assert_eq!(LmMode::classify(5, 4), LmMode::Causal);
        assert_eq!(LmMode::classify(6, 4), LmMode::FullContext);
        assert_eq!(LmMode::Causal.as_str(), "gpt");
        assert_eq!(LmMode::FullContext.as_str(), "bert");
    }
}
