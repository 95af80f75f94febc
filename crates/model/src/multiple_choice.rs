use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{
    block::{maybe_dropout, LinearParams},
    init::ParamFactory,
    language_model::{Encoder, LanguageModel, ModelOutput, NamedParameter},
};

/// Multiple-choice head: mean-pools each choice's hidden states over its
/// padding mask, applies `tanh(pool)`, dropout, and scores it with a linear head.
///
/// Inputs carry a choice dimension: tokens `[batch, choices, seq]`, position
/// ids `[batch, choices, seq]` or `[batch, choices, 2, seq]`, and a 0/1
/// padding mask `[batch, choices, seq]`. Logits come back as `[batch, choices]`.
pub struct MultipleChoice<E: Encoder> {
    encoder: E,
    pool: LinearParams,
    head: LinearParams,
    dropout_p: Option<f32>,
}

impl<E: Encoder> MultipleChoice<E> {
    pub fn new(encoder: E, init_std: f64, seed: u64, dropout_p: Option<f32>) -> Result<Self> {
        let hidden = encoder.hidden_size();
        let dtype = encoder
            .parameters()
            .first()
            .map(|param| param.var.as_tensor().dtype())
            .unwrap_or(DType::F32);
        let mut factory = ParamFactory::new(seed, dtype, encoder.device().clone());
        let pool = LinearParams::new(&mut factory, hidden, hidden, init_std)?;
        let head = LinearParams::new(&mut factory, hidden, 1, init_std)?;
        Ok(Self {
            encoder,
            pool,
            head,
            dropout_p,
        })
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }
}

impl<E: Encoder> LanguageModel for MultipleChoice<E> {
    fn forward(
        &self,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: &Tensor,
        mems: &[Tensor],
    ) -> Result<ModelOutput> {
        let (batch, choices, seq) = tokens.dims3()?;
        if attention_mask.dims() != tokens.dims() {
            return Err(Error::Msg(format!(
                "choice padding mask {:?} must match tokens {:?}",
                attention_mask.dims(),
                tokens.dims()
            )));
        }
        let flat = batch * choices;
        let tokens = tokens.reshape((flat, seq))?;
        let position_ids = match position_ids.rank() {
            3 => position_ids.reshape((flat, seq))?,
            4 => position_ids.reshape((flat, 2, seq))?,
            rank => {
                return Err(Error::Msg(format!(
                    "choice position ids must have rank 3 or 4, got {rank}"
                )))
            }
        };
        let padding = attention_mask.reshape((flat, seq))?.to_dtype(DType::F32)?;
        let extended = padding.reshape((flat, 1, 1, seq))?;

        let ModelOutput { logits: hidden, mems } =
            self.encoder
                .encode(&tokens, &position_ids, &extended, mems)?;

        let weights = padding.to_dtype(hidden.dtype())?.unsqueeze(D::Minus1)?;
        let summed = hidden.broadcast_mul(&weights)?.sum(1)?;
        let counts = weights.sum(1)?;
        let pooled = summed.broadcast_div(&counts)?;
        let pooled = self.pool.forward(&pooled)?.tanh()?;
        let pooled = maybe_dropout(&pooled, self.dropout_p, self.is_training())?;
        let logits = self.head.forward(&pooled)?.reshape((batch, choices))?;
        Ok(ModelOutput { logits, mems })
    }

    fn parameters(&self) -> Vec<NamedParameter> {
        let mut params = self.encoder.parameters();
        self.pool.collect("multichoice.pool_layer", &mut params);
        self.head.collect("multichoice.head", &mut params);
        params
    }

    fn set_training(&self, training: bool) {
        self.encoder.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.encoder.is_training()
    }

    fn device(&self) -> &Device {
        self.encoder.device()
    }

    fn innermost(&self) -> &dyn LanguageModel {
        self
    }
}
