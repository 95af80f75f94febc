use std::fmt;

use candle_core::{Result, Tensor, Var, D};
use candle_nn::{ops, LayerNorm, Linear, Module};

use crate::{config::ModelConfig, init::ParamFactory, language_model::NamedParameter};

/// Additive bias applied where the multiplicative mask is zero.
const MASKED_SCORE: f64 = -10_000.0;

pub(crate) struct LinearParams {
    weight: Var,
    bias: Var,
    layer: Linear,
}

impl LinearParams {
    pub(crate) fn new(
        factory: &mut ParamFactory,
        in_dim: usize,
        out_dim: usize,
        std: f64,
    ) -> Result<Self> {
        let weight = factory.normal((out_dim, in_dim), std)?;
        let bias = factory.zeros(out_dim)?;
        let layer = Linear::new(weight.as_tensor().clone(), Some(bias.as_tensor().clone()));
        Ok(Self {
            weight,
            bias,
            layer,
        })
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.layer.forward(xs)
    }

    pub(crate) fn collect(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter::new(format!("{prefix}.weight"), self.weight.clone()));
        out.push(NamedParameter::new(format!("{prefix}.bias"), self.bias.clone()));
    }
}

pub(crate) struct NormParams {
    weight: Var,
    bias: Var,
    layer: LayerNorm,
}

impl NormParams {
    pub(crate) fn new(factory: &ParamFactory, hidden: usize, eps: f64) -> Result<Self> {
        let weight = factory.ones(hidden)?;
        let bias = factory.zeros(hidden)?;
        let layer = LayerNorm::new(weight.as_tensor().clone(), bias.as_tensor().clone(), eps);
        Ok(Self {
            weight,
            bias,
            layer,
        })
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.layer.forward(xs)
    }

    pub(crate) fn collect(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter::new(format!("{prefix}.weight"), self.weight.clone()));
        out.push(NamedParameter::new(format!("{prefix}.bias"), self.bias.clone()));
    }
}

pub(crate) fn maybe_dropout(xs: &Tensor, p: Option<f32>, training: bool) -> Result<Tensor> {
    match p {
        Some(p) if training && p > 0.0 => ops::dropout(xs, p),
        _ => Ok(xs.clone()),
    }
}

/// Pre-norm transformer layer whose keys and values also cover the cached memory.
pub struct TransformerBlock {
    index: usize,
    heads: usize,
    head_dim: usize,
    input_norm: NormParams,
    query: LinearParams,
    key_value: LinearParams,
    dense: LinearParams,
    post_attention_norm: NormParams,
    fc_in: LinearParams,
    fc_out: LinearParams,
    attn_dropout_p: Option<f32>,
    residual_dropout_p: Option<f32>,
}

impl fmt::Debug for TransformerBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerBlock")
            .field("index", &self.index)
            .field("heads", &self.heads)
            .field("head_dim", &self.head_dim)
            .finish()
    }
}

impl TransformerBlock {
    pub(crate) fn new(index: usize, config: &ModelConfig, factory: &mut ParamFactory) -> Result<Self> {
        let hidden = config.hidden_dim;
        let std = config.init_std;
        let scaled_std = std / (2.0 * config.n_layers as f64).sqrt();
        let eps = config.layernorm_epsilon;

        Ok(Self {
            index,
            heads: config.n_heads,
            head_dim: config.head_dim(),
            input_norm: NormParams::new(factory, hidden, eps)?,
            query: LinearParams::new(factory, hidden, hidden, std)?,
            key_value: LinearParams::new(factory, hidden, 2 * hidden, std)?,
            dense: LinearParams::new(factory, hidden, hidden, scaled_std)?,
            post_attention_norm: NormParams::new(factory, hidden, eps)?,
            fc_in: LinearParams::new(factory, hidden, config.intermediate_dim(), std)?,
            fc_out: LinearParams::new(factory, config.intermediate_dim(), hidden, scaled_std)?,
            attn_dropout_p: config.attn_dropout_p,
            residual_dropout_p: config.residual_dropout_p,
        })
    }

    /// `hidden` is `[batch, seq, hidden]`, `mask` is a multiplicative
    /// `[n, 1, seq, mem + seq]` tensor and `mem` the cached `[batch, mem, hidden]`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: &Tensor,
        mem: Option<&Tensor>,
        training: bool,
    ) -> Result<Tensor> {
        let (batch, seq, width) = hidden.dims3()?;

        let normed = self.input_norm.forward(hidden)?;
        let context = match mem {
            Some(mem) => {
                let full = Tensor::cat(&[mem, hidden], 1)?;
                self.input_norm.forward(&full)?
            }
            None => normed.clone(),
        };
        let keys_len = context.dim(1)?;

        let query = self
            .query
            .forward(&normed)?
            .reshape((batch, seq, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let key_value = self.key_value.forward(&context)?;
        let key = key_value
            .narrow(D::Minus1, 0, width)?
            .reshape((batch, keys_len, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let value = key_value
            .narrow(D::Minus1, width, width)?
            .reshape((batch, keys_len, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = query
            .matmul(&key.t()?.contiguous()?)?
            .affine(scale, 0.0)?;

        let mask = mask.to_dtype(scores.dtype())?;
        let bias = mask.affine(-MASKED_SCORE, MASKED_SCORE)?;
        let scores = scores.broadcast_mul(&mask)?.broadcast_add(&bias)?;
        let probs = ops::softmax(&scores, D::Minus1)?;
        let probs = maybe_dropout(&probs, self.attn_dropout_p, training)?;

        let attended = probs
            .matmul(&value)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, width))?;
        let attended = self.dense.forward(&attended)?;
        let attended = maybe_dropout(&attended, self.residual_dropout_p, training)?;
        let hidden = (hidden + attended)?;

        let normed = self.post_attention_norm.forward(&hidden)?;
        let mlp = self.fc_in.forward(&normed)?.gelu()?;
        let mlp = self.fc_out.forward(&mlp)?;
        let mlp = maybe_dropout(&mlp, self.residual_dropout_p, training)?;
        hidden + mlp
    }

    pub(crate) fn collect(&self, out: &mut Vec<NamedParameter>) {
        let prefix = format!("layers.{}", self.index);
        self.input_norm
            .collect(&format!("{prefix}.input_layernorm"), out);
        self.query.collect(&format!("{prefix}.attention.query"), out);
        self.key_value
            .collect(&format!("{prefix}.attention.key_value"), out);
        self.dense.collect(&format!("{prefix}.attention.dense"), out);
        self.post_attention_norm
            .collect(&format!("{prefix}.post_attention_layernorm"), out);
        self.fc_in.collect(&format!("{prefix}.mlp.dense_h_to_4h"), out);
        self.fc_out.collect(&format!("{prefix}.mlp.dense_4h_to_h"), out);
    }
}
