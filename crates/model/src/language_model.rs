use candle_core::{Device, Result, Tensor, Var};

/// Output of one forward call: logits plus the refreshed per-layer memory.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub logits: Tensor,
    pub mems: Vec<Tensor>,
}

/// Trainable tensor exposed to optimizers and checkpoints.
#[derive(Debug, Clone)]
pub struct NamedParameter {
    pub name: String,
    pub var: Var,
    /// Set when the tensor is a shard owned by one model-parallel rank.
    pub model_parallel: bool,
}

impl NamedParameter {
    pub fn new(name: impl Into<String>, var: Var) -> Self {
        Self {
            name: name.into(),
            var,
            model_parallel: false,
        }
    }

    pub fn sharded(mut self) -> Self {
        self.model_parallel = true;
        self
    }
}

/// Contract the training driver relies on.
///
/// `mems` is an ordered list of cached hidden states, one per layer. An empty
/// slice means no memory is carried into the call.
pub trait LanguageModel: Send {
    fn forward(
        &self,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: &Tensor,
        mems: &[Tensor],
    ) -> Result<ModelOutput>;

    fn parameters(&self) -> Vec<NamedParameter>;

    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    fn device(&self) -> &Device;

    /// Innermost parameter-bearing model behind any number of wrappers.
    fn innermost(&self) -> &dyn LanguageModel;
}

/// Models whose final hidden states can feed a task head.
pub trait Encoder: LanguageModel {
    /// Same inputs as [`LanguageModel::forward`] but `logits` holds the
    /// normalized hidden states `[batch, seq, hidden]`.
    fn encode(
        &self,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: &Tensor,
        mems: &[Tensor],
    ) -> Result<ModelOutput>;

    fn hidden_size(&self) -> usize;
}
