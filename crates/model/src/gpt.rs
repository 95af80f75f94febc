use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use candle_nn::{Embedding, Module};

use crate::{
    block::{maybe_dropout, NormParams, TransformerBlock},
    config::ModelConfig,
    init::ParamFactory,
    language_model::{Encoder, LanguageModel, ModelOutput, NamedParameter},
};

/// GPT-2 style transformer with tied input/output embeddings, optional
/// Transformer-XL memory and a block-position channel for block LM.
pub struct GptModel {
    config: ModelConfig,
    word_embeddings: Var,
    position_embeddings: Var,
    block_position_embeddings: Option<Var>,
    word_lookup: Embedding,
    position_lookup: Embedding,
    block_position_lookup: Option<Embedding>,
    blocks: Vec<TransformerBlock>,
    final_norm: NormParams,
    training: AtomicBool,
}

impl GptModel {
    /// Builds the model and its layers according to `config`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut factory =
            ParamFactory::new(config.init_seed, config.dtype, config.device.clone());

        let hidden = config.hidden_dim;
        let word_embeddings = factory.normal((config.vocab_size, hidden), config.init_std)?;
        let position_embeddings =
            factory.normal((config.max_position_embeddings, hidden), config.init_std)?;
        let block_position_embeddings = if config.block_position_encoding {
            Some(factory.normal((config.max_position_embeddings, hidden), config.init_std)?)
        } else {
            None
        };

        let mut blocks = Vec::with_capacity(config.n_layers);
        for layer in 0..config.n_layers {
            blocks.push(TransformerBlock::new(layer, &config, &mut factory)?);
        }
        let final_norm = NormParams::new(&factory, hidden, config.layernorm_epsilon)?;

        let checkpointing = config.activation_checkpointing;
        if checkpointing.enabled {
            log::info!(
                "activation checkpointing requested: {} layer(s) per chunk, rng seed {}",
                checkpointing.num_layers,
                checkpointing.seed
            );
        }

        Ok(Self {
            word_lookup: Embedding::new(word_embeddings.as_tensor().clone(), hidden),
            position_lookup: Embedding::new(position_embeddings.as_tensor().clone(), hidden),
            block_position_lookup: block_position_embeddings
                .as_ref()
                .map(|var| Embedding::new(var.as_tensor().clone(), hidden)),
            config,
            word_embeddings,
            position_embeddings,
            block_position_embeddings,
            blocks,
            final_norm,
            training: AtomicBool::new(true),
        })
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Layer groups that would be recomputed together under activation checkpointing.
    pub fn checkpoint_chunks(&self) -> Vec<std::ops::Range<usize>> {
        let checkpointing = self.config.activation_checkpointing;
        let chunk = if checkpointing.enabled {
            checkpointing.num_layers.max(1)
        } else {
            self.blocks.len()
        };
        (0..self.blocks.len())
            .step_by(chunk)
            .map(|start| start..(start + chunk).min(self.blocks.len()))
            .collect()
    }

    fn embed(&self, tokens: &Tensor, position_ids: &Tensor) -> Result<Tensor> {
        let words = self.word_lookup.forward(tokens)?;
        let embedded = match position_ids.rank() {
            2 => (words + self.position_lookup.forward(position_ids)?)?,
            3 => {
                let content = position_ids.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
                let block = position_ids.narrow(1, 1, 1)?.squeeze(1)?.contiguous()?;
                let with_positions = (words + self.position_lookup.forward(&content)?)?;
                match &self.block_position_lookup {
                    Some(lookup) => (with_positions + lookup.forward(&block)?)?,
                    None => {
                        return Err(Error::Msg(
                            "two-channel position ids require block_position_encoding".into(),
                        ))
                    }
                }
            }
            rank => {
                return Err(Error::Msg(format!(
                    "position ids must be [batch, seq] or [batch, 2, seq], got rank {rank}"
                )))
            }
        };
        maybe_dropout(
            &embedded,
            self.config.embedding_dropout_p,
            self.is_training(),
        )
    }

    /// Resolves the attention mask into a multiplicative `[n, 1, seq, mem + seq]` tensor.
    fn resolve_mask(
        &self,
        attention_mask: &Tensor,
        batch: usize,
        seq: usize,
        mem_len: usize,
    ) -> Result<Tensor> {
        match attention_mask.rank() {
            1 => build_block_mask(attention_mask, batch, seq, mem_len, &self.config.device),
            4 => {
                let keys = attention_mask.dim(3)?;
                let needed = seq + mem_len;
                if attention_mask.dim(2)? != seq && attention_mask.dim(2)? != 1 {
                    return Err(Error::Msg(format!(
                        "attention mask query dimension {} does not match sequence length {}",
                        attention_mask.dim(2)?,
                        seq
                    )));
                }
                if keys < needed {
                    return Err(Error::Msg(format!(
                        "attention mask covers {keys} keys but {needed} are required"
                    )));
                }
                attention_mask.narrow(3, keys - needed, needed)
            }
            rank => Err(Error::Msg(format!(
                "attention mask must be a separator vector or a rank-4 tensor, got rank {rank}"
            ))),
        }
    }

    fn update_mems(&self, inputs: &[Tensor], mems: &[Tensor]) -> Result<Vec<Tensor>> {
        let limit = self.config.mem_length;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut updated = Vec::with_capacity(inputs.len());
        for (layer, input) in inputs.iter().enumerate() {
            let joined = match mems.get(layer) {
                Some(mem) => Tensor::cat(&[mem, input], 1)?,
                None => input.clone(),
            };
            let len = joined.dim(1)?;
            let keep = len.min(limit);
            updated.push(joined.narrow(1, len - keep, keep)?.detach());
        }
        Ok(updated)
    }

    fn transformer(
        &self,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: &Tensor,
        mems: &[Tensor],
    ) -> Result<ModelOutput> {
        let (batch, seq) = tokens.dims2()?;
        if !mems.is_empty() && mems.len() != self.blocks.len() {
            return Err(Error::Msg(format!(
                "expected {} memory tensors, got {}",
                self.blocks.len(),
                mems.len()
            )));
        }
        let mem_len = match mems.first() {
            Some(mem) => mem.dim(1)?,
            None => 0,
        };

        let mask = self.resolve_mask(attention_mask, batch, seq, mem_len)?;
        let training = self.is_training();

        let mut hidden = self.embed(tokens, position_ids)?;
        let mut layer_inputs = Vec::with_capacity(self.blocks.len());
        for (layer, block) in self.blocks.iter().enumerate() {
            layer_inputs.push(hidden.clone());
            hidden = block.forward(&hidden, &mask, mems.get(layer), training)?;
        }

        let hidden = self.final_norm.forward(&hidden)?;
        let mems = self.update_mems(&layer_inputs, mems)?;
        Ok(ModelOutput {
            logits: hidden,
            mems,
        })
    }
}

/// Block-LM mask: every query sees the memory and the bidirectional prefix
/// `[0, sep)`, the remainder is causal.
pub fn build_block_mask(
    separators: &Tensor,
    batch: usize,
    seq: usize,
    mem_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let separators = separators.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    if separators.len() != batch {
        return Err(Error::Msg(format!(
            "block mask expects {} separators, got {}",
            batch,
            separators.len()
        )));
    }
    let keys = mem_len + seq;
    let mut data = vec![0f32; batch * seq * keys];
    for (b, &sep) in separators.iter().enumerate() {
        let sep = sep.max(0) as usize;
        for q in 0..seq {
            let row = (b * seq + q) * keys;
            for k in 0..keys {
                let visible = k < mem_len || {
                    let j = k - mem_len;
                    j <= q || j < sep
                };
                if visible {
                    data[row + k] = 1.0;
                }
            }
        }
    }
    Tensor::from_vec(data, (batch, 1, seq, keys), device)
}

impl LanguageModel for GptModel {
    fn forward(
        &self,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: &Tensor,
        mems: &[Tensor],
    ) -> Result<ModelOutput> {
        let ModelOutput { logits: hidden, mems } =
            self.transformer(tokens, position_ids, attention_mask, mems)?;
        let logits = hidden.broadcast_matmul(&self.word_embeddings.as_tensor().t()?)?;
        Ok(ModelOutput { logits, mems })
    }

    fn parameters(&self) -> Vec<NamedParameter> {
        let mut params = vec![
            NamedParameter::new("word_embeddings.weight", self.word_embeddings.clone()),
            NamedParameter::new("position_embeddings.weight", self.position_embeddings.clone()),
        ];
        if let Some(block) = &self.block_position_embeddings {
            params.push(NamedParameter::new(
                "block_position_embeddings.weight",
                block.clone(),
            ));
        }
        for block in &self.blocks {
            block.collect(&mut params);
        }
        self.final_norm.collect("final_layernorm", &mut params);
        params
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn device(&self) -> &Device {
        &self.config.device
    }

    fn innermost(&self) -> &dyn LanguageModel {
        self
    }
}

impl Encoder for GptModel {
    fn encode(
        &self,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: &Tensor,
        mems: &[Tensor],
    ) -> Result<ModelOutput> {
        self.transformer(tokens, position_ids, attention_mask, mems)
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_dim
    }
}
