use candle_core::{DType, Device, Error, Result};

/// High-level configuration for assembling the GPT-style transformer.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub ff_ratio: f32,
    pub max_position_embeddings: usize,
    /// Number of cached positions kept per layer; zero disables memory.
    pub mem_length: usize,
    /// Adds a second positional table indexed by the block-position channel.
    pub block_position_encoding: bool,
    pub layernorm_epsilon: f64,
    pub init_std: f64,
    pub init_seed: u64,
    pub dtype: DType,
    pub device: Device,
    pub embedding_dropout_p: Option<f32>,
    pub attn_dropout_p: Option<f32>,
    pub residual_dropout_p: Option<f32>,
    pub activation_checkpointing: ActivationCheckpointing,
}

/// Activation checkpointing request forwarded from the process bootstrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivationCheckpointing {
    pub enabled: bool,
    pub num_layers: usize,
    pub seed: u64,
}

impl ModelConfig {
    /// Small fp32 CPU configuration used as a starting point by callers and tests.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            ff_ratio: 4.0,
            max_position_embeddings: 32,
            mem_length: 0,
            block_position_encoding: false,
            layernorm_epsilon: 1e-5,
            init_std: 0.02,
            init_seed: 1234,
            dtype: DType::F32,
            device: Device::Cpu,
            embedding_dropout_p: None,
            attn_dropout_p: None,
            residual_dropout_p: None,
            activation_checkpointing: ActivationCheckpointing::default(),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.n_heads.max(1)
    }

    pub fn intermediate_dim(&self) -> usize {
        ((self.hidden_dim as f32) * self.ff_ratio).round() as usize
    }

    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if self.n_heads == 0 {
            return Err(Error::Msg("n_heads must be greater than zero".into()));
        }
        if self.hidden_dim % self.n_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_dim ({}) must be divisible by n_heads ({})",
                self.hidden_dim, self.n_heads
            )));
        }
        if self.ff_ratio <= 0.0 || self.intermediate_dim() == 0 {
            return Err(Error::Msg("ff_ratio must be positive".into()));
        }
        if self.max_position_embeddings == 0 {
            return Err(Error::Msg(
                "max_position_embeddings must be greater than zero".into(),
            ));
        }
        if self.init_std <= 0.0 {
            return Err(Error::Msg("init_std must be positive".into()));
        }
        for (label, value) in [
            ("embedding_dropout_p", self.embedding_dropout_p),
            ("attn_dropout_p", self.attn_dropout_p),
            ("residual_dropout_p", self.residual_dropout_p),
        ] {
            if let Some(p) = value {
                if !(0.0..1.0).contains(&p) {
                    return Err(Error::Msg(format!("{label} must be in [0, 1)")));
                }
            }
        }
        if self.activation_checkpointing.enabled && self.activation_checkpointing.num_layers == 0 {
            return Err(Error::Msg(
                "activation checkpointing requires num_layers greater than zero".into(),
            ));
        }
        Ok(())
    }
}
