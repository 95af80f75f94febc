use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub use crate::error::TrainingError;
use crate::scheduler::DecayStyle;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub precision: PrecisionConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Checks every option and reports all problems at once.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        let model = &self.model;
        let data = &self.data;

        if model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }
        if model.num_layers == 0 {
            errors.push("model.num_layers must be greater than 0".to_string());
        }
        if model.num_attention_heads == 0 || model.hidden_size % model.num_attention_heads != 0 {
            errors.push(
                "model.hidden_size must be divisible by model.num_attention_heads".to_string(),
            );
        }
        if model.vocab_size == 0 && data.tokenizer_json.is_none() {
            errors.push(
                "model.vocab_size must be set when data.tokenizer_json is not provided".to_string(),
            );
        }
        for (label, value) in [
            ("model.hidden_dropout", model.hidden_dropout),
            ("model.attention_dropout", model.attention_dropout),
        ] {
            if !(0.0..1.0).contains(&value) {
                errors.push(format!("{label} must be in [0, 1)"));
            }
        }
        if model.checkpoint_activations && model.checkpoint_num_layers == 0 {
            errors.push("model.checkpoint_num_layers must be greater than 0".to_string());
        }

        if data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if data.seq_length == 0 {
            errors.push("data.seq_length must be greater than 0".to_string());
        }
        if data.seq_length > model.max_position_embeddings {
            errors.push(format!(
                "data.seq_length ({}) cannot exceed model.max_position_embeddings ({})",
                data.seq_length, model.max_position_embeddings
            ));
        }
        if data.transformer_xl && data.block_lm {
            errors.push("data.transformer_xl and data.block_lm are mutually exclusive".to_string());
        }
        if data.transformer_xl && data.mem_length == 0 {
            errors.push("data.transformer_xl requires data.mem_length > 0".to_string());
        }
        if (data.reset_position_ids || data.reset_attention_mask) && data.eod_token.is_none() {
            errors.push(
                "data.eod_token is required when resetting positions or attention at document boundaries"
                    .to_string(),
            );
        }

        let optimizer = &self.optimizer;
        if optimizer.lr <= 0.0 {
            errors.push("optimizer.lr must be greater than 0".to_string());
        }
        if optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < optimizer.beta1 && optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < optimizer.beta2 && optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if optimizer.clip_grad < 0.0 {
            errors.push("optimizer.clip_grad must be >= 0".to_string());
        }

        let scheduler = &self.scheduler;
        if !(0.0..=1.0).contains(&scheduler.warmup) {
            errors.push("scheduler.warmup must be a fraction in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&scheduler.lr_decay_ratio) {
            errors.push("scheduler.lr_decay_ratio must be in [0, 1]".to_string());
        }
        if let Some(0) = scheduler.lr_decay_iters {
            errors.push("scheduler.lr_decay_iters must be greater than 0".to_string());
        }

        let precision = &self.precision;
        if precision.loss_scale_window == 0 {
            errors.push("precision.loss_scale_window must be greater than 0".to_string());
        }
        if precision.min_scale <= 0.0 {
            errors.push("precision.min_scale must be greater than 0".to_string());
        }
        if precision.hysteresis == 0 {
            errors.push("precision.hysteresis must be greater than 0".to_string());
        }
        if let Some(scale) = precision.loss_scale {
            if scale <= 0.0 {
                errors.push("precision.loss_scale must be greater than 0".to_string());
            }
        }

        let distributed = &self.distributed;
        if distributed.world_size == 0 || distributed.model_parallel_size == 0 {
            errors.push("distributed sizes must be greater than 0".to_string());
        } else if distributed.world_size % distributed.model_parallel_size != 0 {
            errors.push(format!(
                "distributed.world_size ({}) must be divisible by distributed.model_parallel_size ({})",
                distributed.world_size, distributed.model_parallel_size
            ));
        }

        if self.checkpoint.experiment_name.trim().is_empty() {
            errors.push("checkpoint.experiment_name must not be empty".to_string());
        }

        let runtime = &self.runtime;
        if runtime.log_interval == 0 {
            errors.push("runtime.log_interval must be greater than 0".to_string());
        }
        if runtime.gradient_accumulation_steps == 0 {
            errors.push("runtime.gradient_accumulation_steps must be greater than 0".to_string());
        }
        if runtime.eval_interval > 0 && runtime.eval_iters == 0 {
            errors.push("runtime.eval_iters must be greater than 0 when evaluating".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.checkpoint.apply_base_path(base);
        if let Some(dir) = self.runtime.summary_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }

    /// Sets one option by dotted path, e.g. `runtime.train_iters`. The value
    /// is read as JSON when it parses and as a plain string otherwise.
    pub fn with_override(self, path: &str, raw: &str) -> Result<Self, TrainingError> {
        let mut tree = serde_json::to_value(&self)?;
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();
        let Some((last, sections)) = segments.split_last() else {
            return Err(TrainingError::ConfigFormat("empty override path".to_string()));
        };
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(TrainingError::ConfigFormat(format!(
                "invalid override path `{path}`"
            )));
        }

        let mut cursor = &mut tree;
        for section in sections {
            cursor = cursor
                .get_mut(*section)
                .filter(|value| value.is_object())
                .ok_or_else(|| {
                    TrainingError::ConfigFormat(format!(
                        "override `{path}`: no section named `{section}`"
                    ))
                })?;
        }
        let table = cursor.as_object_mut().ok_or_else(|| {
            TrainingError::ConfigFormat(format!("override `{path}` does not name an option"))
        })?;
        if !table.contains_key(*last) {
            return Err(TrainingError::ConfigFormat(format!(
                "override `{path}`: unknown option `{last}`"
            )));
        }
        let value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| serde_json::Value::String(raw.trim().to_string()));
        table.insert(last.to_string(), value);

        Ok(serde_json::from_value(tree)?)
    }

    /// Mode the batch pipeline runs in, derived from the data flags.
    pub fn lm_variant(&self) -> LmVariant {
        if self.data.block_lm {
            LmVariant::Block
        } else if self.data.transformer_xl {
            LmVariant::Memory
        } else {
            LmVariant::Causal
        }
    }
}

/// Batch layout selected by the data flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmVariant {
    Causal,
    Memory,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// `None` builds a plain language model; `multiple_choice` adds the choice head.
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default)]
    pub intermediate_size: Option<usize>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_dropout")]
    pub hidden_dropout: f32,
    #[serde(default = "default_dropout")]
    pub attention_dropout: f32,
    #[serde(default = "default_layernorm_epsilon")]
    pub layernorm_epsilon: f64,
    #[serde(default = "default_init_std")]
    pub init_std: f64,
    #[serde(default)]
    pub checkpoint_activations: bool,
    #[serde(default = "default_checkpoint_num_layers")]
    pub checkpoint_num_layers: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_type: None,
            vocab_size: 0,
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            num_attention_heads: default_num_attention_heads(),
            intermediate_size: None,
            max_position_embeddings: default_max_position_embeddings(),
            hidden_dropout: default_dropout(),
            attention_dropout: default_dropout(),
            layernorm_epsilon: default_layernorm_epsilon(),
            init_std: default_init_std(),
            checkpoint_activations: false,
            checkpoint_num_layers: default_checkpoint_num_layers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub train_data: Vec<PathBuf>,
    #[serde(default)]
    pub valid_data: Vec<PathBuf>,
    #[serde(default)]
    pub test_data: Vec<PathBuf>,
    #[serde(default)]
    pub tokenizer_json: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seq_length")]
    pub seq_length: usize,
    #[serde(default)]
    pub mem_length: usize,
    #[serde(default)]
    pub eod_token: Option<u32>,
    #[serde(default)]
    pub reset_position_ids: bool,
    #[serde(default)]
    pub reset_attention_mask: bool,
    #[serde(default)]
    pub transformer_xl: bool,
    #[serde(default)]
    pub block_lm: bool,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default)]
    pub resume_dataloader: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_data: Vec::new(),
            valid_data: Vec::new(),
            test_data: Vec::new(),
            tokenizer_json: None,
            batch_size: default_batch_size(),
            seq_length: default_seq_length(),
            mem_length: 0,
            eod_token: None,
            reset_position_ids: false,
            reset_attention_mask: false,
            transformer_xl: false,
            block_lm: false,
            shuffle: true,
            resume_dataloader: false,
        }
    }
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in self
            .train_data
            .iter_mut()
            .chain(self.valid_data.iter_mut())
            .chain(self.test_data.iter_mut())
        {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.tokenizer_json.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    /// Global gradient-norm ceiling; zero disables clipping.
    #[serde(default = "default_clip_grad")]
    pub clip_grad: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            clip_grad: default_clip_grad(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Fraction of the decay horizon spent warming up.
    #[serde(default = "default_warmup")]
    pub warmup: f64,
    #[serde(default)]
    pub lr_decay_iters: Option<usize>,
    #[serde(default)]
    pub lr_decay_style: DecayStyle,
    #[serde(default = "default_lr_decay_ratio")]
    pub lr_decay_ratio: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warmup: default_warmup(),
            lr_decay_iters: None,
            lr_decay_style: DecayStyle::default(),
            lr_decay_ratio: default_lr_decay_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionConfig {
    #[serde(default)]
    pub fp16: bool,
    /// Static loss scale, used when `dynamic_loss_scale` is off.
    #[serde(default)]
    pub loss_scale: Option<f32>,
    #[serde(default = "default_true")]
    pub dynamic_loss_scale: bool,
    #[serde(default = "default_initial_scale_power")]
    pub initial_scale_power: u32,
    #[serde(default = "default_loss_scale_window")]
    pub loss_scale_window: usize,
    #[serde(default = "default_min_scale")]
    pub min_scale: f32,
    #[serde(default = "default_hysteresis")]
    pub hysteresis: usize,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            fp16: false,
            loss_scale: None,
            dynamic_loss_scale: true,
            initial_scale_power: default_initial_scale_power(),
            loss_scale_window: default_loss_scale_window(),
            min_scale: default_min_scale(),
            hysteresis: default_hysteresis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default = "default_one")]
    pub world_size: usize,
    #[serde(default = "default_one")]
    pub model_parallel_size: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            model_parallel_size: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Root under which `<experiment>/iter_XXXXXXX` directories are written.
    #[serde(default)]
    pub save: Option<PathBuf>,
    /// Experiment directory to resume from.
    #[serde(default)]
    pub load: Option<PathBuf>,
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
    #[serde(default)]
    pub no_load_optim: bool,
    #[serde(default)]
    pub no_load_lr_scheduler: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save: None,
            load: None,
            experiment_name: default_experiment_name(),
            save_interval: default_save_interval(),
            no_load_optim: false,
            no_load_lr_scheduler: false,
        }
    }
}

impl CheckpointConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [self.save.as_mut(), self.load.as_mut()].into_iter().flatten() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_train_iters")]
    pub train_iters: usize,
    #[serde(default = "default_eval_iters")]
    pub eval_iters: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Zero disables periodic validation.
    #[serde(default = "default_eval_interval")]
    pub eval_interval: usize,
    #[serde(default = "default_one")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub carry_mems_across_steps: bool,
    #[serde(default)]
    pub summary_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            train_iters: default_train_iters(),
            eval_iters: default_eval_iters(),
            log_interval: default_log_interval(),
            eval_interval: default_eval_interval(),
            gradient_accumulation_steps: 1,
            seed: default_seed(),
            carry_mems_across_steps: false,
            summary_dir: None,
            enable_stdout: true,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_hidden_size() -> usize {
    256
}

fn default_num_layers() -> usize {
    4
}

fn default_num_attention_heads() -> usize {
    4
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_dropout() -> f32 {
    0.1
}

fn default_layernorm_epsilon() -> f64 {
    1e-5
}

fn default_init_std() -> f64 {
    0.02
}

fn default_checkpoint_num_layers() -> usize {
    1
}

fn default_batch_size() -> usize {
    4
}

fn default_seq_length() -> usize {
    512
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_clip_grad() -> f64 {
    1.0
}

fn default_warmup() -> f64 {
    0.01
}

fn default_lr_decay_ratio() -> f64 {
    0.1
}

fn default_initial_scale_power() -> u32 {
    32
}

fn default_loss_scale_window() -> usize {
    1000
}

fn default_min_scale() -> f32 {
    1.0
}

fn default_hysteresis() -> usize {
    2
}

fn default_experiment_name() -> String {
    "blocklm".to_string()
}

fn default_save_interval() -> usize {
    5000
}

fn default_train_iters() -> usize {
    1000
}

fn default_eval_iters() -> usize {
    100
}

fn default_log_interval() -> usize {
    100
}

fn default_eval_interval() -> usize {
    1000
}

fn default_seed() -> u64 {
    1234
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_reach_nested_options() {
        let config = TrainingConfig::default()
            .with_override("runtime.train_iters", "42")
            .unwrap()
            .with_override("precision.fp16", "true")
            .unwrap()
            .with_override("checkpoint.save", "/tmp/runs")
            .unwrap()
            .with_override("scheduler.lr_decay_style", "cosine")
            .unwrap();
        assert_eq!(config.runtime.train_iters, 42);
        assert!(config.precision.fp16);
        assert_eq!(config.checkpoint.save, Some(PathBuf::from("/tmp/runs")));
        assert_eq!(config.scheduler.lr_decay_style, DecayStyle::Cosine);
    }

    #[test]
    fn overrides_reject_unknown_options() {
        let err = TrainingConfig::default()
            .with_override("runtime.trian_iters", "3")
            .unwrap_err();
        assert!(matches!(err, TrainingError::ConfigFormat(_)));
        assert!(TrainingConfig::default()
            .with_override("nothing.train_iters", "3")
            .is_err());
        assert!(TrainingConfig::default()
            .with_override("runtime.train_iters", "many")
            .is_err());
    }

    #[test]
    fn collects_every_validation_error() {
        let mut config = TrainingConfig::default();
        config.model.vocab_size = 32;
        config.data.batch_size = 0;
        config.runtime.log_interval = 0;
        config.distributed.world_size = 3;
        config.distributed.model_parallel_size = 2;

        match config.validate() {
            Err(TrainingError::Validation(errors)) => {
                assert_eq!(errors.len(), 3, "{errors:?}");
            }
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn parses_toml_with_defaults() {
        let config: TrainingConfig = toml::from_str(
            r#"
            [model]
            vocab_size = 64
            [data]
            seq_length = 128
            transformer_xl = true
            mem_length = 32
            [runtime]
            train_iters = 10
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.lm_variant(), LmVariant::Memory);
        assert_eq!(config.runtime.log_interval, 100);
        assert_eq!(config.precision.hysteresis, 2);
    }

    #[test]
    fn document_resets_need_an_eod_token() {
        let mut config = TrainingConfig::default();
        config.model.vocab_size = 32;
        config.data.reset_position_ids = true;
        assert!(matches!(config.validate(), Err(TrainingError::Validation(_))));
    }
}
