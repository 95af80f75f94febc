use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use chrono::{DateTime, Local};
use model::{
    ActivationCheckpointing, GptModel, HalfPrecision, LanguageModel, ModelConfig, MultipleChoice,
};

use crate::{
    config::{CheckpointConfig, LmVariant, TrainingConfig},
    data::BatchContext,
    distributed::ProcessGrid,
    error::to_runtime_error,
    forward::{ForwardStep, LanguageModelingStep, MultipleChoiceStep},
    masking::{MaskMode, MaskingPolicy},
    TrainingError,
};

pub const MULTIPLE_CHOICE: &str = "multiple_choice";
const MODEL_PARALLEL_SEED_OFFSET: u64 = 2718;

/// Seeds for one rank. `base` drives weight init and data order and is
/// shared by every rank; `model_parallel` drives per-shard randomness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSeeds {
    pub base: u64,
    pub model_parallel: u64,
}

/// Derives the per-rank seeds and seeds the device generator where the
/// backend supports it.
pub fn set_random_seed(seed: u64, grid: &ProcessGrid, device: &Device) -> ProcessSeeds {
    let seeds = ProcessSeeds {
        base: seed,
        model_parallel: seed + MODEL_PARALLEL_SEED_OFFSET + grid.model_parallel_rank() as u64,
    };
    if let Err(err) = device.set_seed(seeds.model_parallel) {
        log::debug!("device generator not seeded: {err}");
    }
    seeds
}

/// Where this run saves to and resumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub experiment: String,
    /// `<save>/<experiment>` when checkpointing is enabled.
    pub save_root: Option<PathBuf>,
    pub load_root: Option<PathBuf>,
}

impl RunLayout {
    /// A resumed run keeps the name of the directory it loads from; a fresh
    /// one gets `experiment_name` plus a `%m-%d-%H-%M` stamp.
    ///
    /// Resolve once per job and hand the result to every rank so the stamp
    /// agrees.
    pub fn resolve(checkpoint: &CheckpointConfig, now: DateTime<Local>) -> Self {
        let loaded_name = checkpoint
            .load
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned());
        let experiment = loaded_name.unwrap_or_else(|| {
            format!("{}{}", checkpoint.experiment_name, now.format("%m-%d-%H-%M"))
        });
        Self {
            save_root: checkpoint.save.as_ref().map(|save| save.join(&experiment)),
            load_root: checkpoint.load.clone(),
            experiment,
        }
    }
}

/// Which phases have data, as decided on the data-source rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataAvailability {
    pub do_train: bool,
    pub do_valid: bool,
    pub do_test: bool,
}

impl DataAvailability {
    fn encode(self) -> Vec<i64> {
        vec![self.do_train as i64, self.do_valid as i64, self.do_test as i64]
    }
}

/// Broadcasts the data-source rank's flags to its model-parallel group.
/// `local` is ignored on the other ranks.
pub fn broadcast_data_availability(
    local: DataAvailability,
    grid: &ProcessGrid,
) -> Result<DataAvailability, TrainingError> {
    let mut flags = if grid.is_data_source() {
        local.encode()
    } else {
        vec![0; 3]
    };
    grid.model_parallel().broadcast(&mut flags, 0)?;
    match flags.as_slice() {
        [train, valid, test] => Ok(DataAvailability {
            do_train: *train != 0,
            do_valid: *valid != 0,
            do_test: *test != 0,
        }),
        other => Err(TrainingError::collective(format!(
            "data availability broadcast delivered {} flags",
            other.len()
        ))),
    }
}

/// Rejects configurations the driver cannot honour before anything is
/// allocated.
pub fn check_supported(
    config: &TrainingConfig,
    has_block_source: bool,
) -> Result<(), TrainingError> {
    check_model_type(config)?;
    if config.lm_variant() == LmVariant::Block && !has_block_source {
        return Err(TrainingError::unsupported(
            "block LM training needs a data source that builds block masks",
        ));
    }
    Ok(())
}

fn check_model_type(config: &TrainingConfig) -> Result<(), TrainingError> {
    match config.model.model_type.as_deref() {
        None | Some(MULTIPLE_CHOICE) => Ok(()),
        Some(kind) => Err(TrainingError::unsupported(format!(
            "model_type `{kind}` is not implemented"
        ))),
    }
}

/// Model configuration for this run.
pub fn model_config(
    config: &TrainingConfig,
    vocab_size: usize,
    seeds: ProcessSeeds,
    device: &Device,
) -> ModelConfig {
    let settings = &config.model;
    let dropout = |p: f32| (p > 0.0).then_some(p);
    let ff_ratio = settings
        .intermediate_size
        .map(|size| size as f32 / settings.hidden_size.max(1) as f32)
        .unwrap_or(4.0);
    ModelConfig {
        vocab_size,
        hidden_dim: settings.hidden_size,
        n_layers: settings.num_layers,
        n_heads: settings.num_attention_heads,
        ff_ratio,
        max_position_embeddings: settings.max_position_embeddings,
        mem_length: memory_length(config),
        block_position_encoding: config.lm_variant() == LmVariant::Block,
        layernorm_epsilon: settings.layernorm_epsilon,
        init_std: settings.init_std,
        init_seed: seeds.base,
        dtype: if config.precision.fp16 {
            DType::F16
        } else {
            DType::F32
        },
        device: device.clone(),
        embedding_dropout_p: dropout(settings.hidden_dropout),
        attn_dropout_p: dropout(settings.attention_dropout),
        residual_dropout_p: dropout(settings.hidden_dropout),
        activation_checkpointing: ActivationCheckpointing {
            enabled: settings.checkpoint_activations,
            num_layers: settings.checkpoint_num_layers,
            seed: seeds.model_parallel,
        },
    }
}

/// Builds the model named by `model.model_type`, wrapped for fp16 when
/// requested.
pub fn build_model(
    config: &TrainingConfig,
    vocab_size: usize,
    seeds: ProcessSeeds,
    device: &Device,
) -> Result<Box<dyn LanguageModel>, TrainingError> {
    check_model_type(config)?;
    let model_config = model_config(config, vocab_size, seeds, device);
    let encoder = GptModel::new(model_config).map_err(|err| {
        TrainingError::initialization(format!("failed to build model: {err}"))
    })?;

    let model: Box<dyn LanguageModel> = match config.model.model_type.as_deref() {
        Some(MULTIPLE_CHOICE) => {
            let dropout = (config.model.hidden_dropout > 0.0).then_some(config.model.hidden_dropout);
            let head = MultipleChoice::new(encoder, config.model.init_std, seeds.base, dropout)
                .map_err(to_runtime_error)?;
            wrap_precision(head, config.precision.fp16)
        }
        _ => wrap_precision(encoder, config.precision.fp16),
    };

    let count: usize = model
        .parameters()
        .iter()
        .map(|param| param.var.as_tensor().elem_count())
        .sum();
    log::info!("number of parameters: {count}");
    Ok(model)
}

fn wrap_precision<M: LanguageModel + 'static>(model: M, fp16: bool) -> Box<dyn LanguageModel> {
    if fp16 {
        Box::new(HalfPrecision::new(model))
    } else {
        Box::new(model)
    }
}

/// Cached hidden states attended to per layer; zero outside memory mode.
fn memory_length(config: &TrainingConfig) -> usize {
    match config.lm_variant() {
        LmVariant::Memory => config.data.mem_length,
        _ => 0,
    }
}

/// Longest token sequence a batch may carry, memory included.
pub fn max_sequence_length(config: &TrainingConfig) -> usize {
    config.model.max_position_embeddings + memory_length(config)
}

/// Masking policy implied by the data flags.
pub fn masking_policy(config: &TrainingConfig) -> MaskingPolicy {
    let data = &config.data;
    let mode = match config.lm_variant() {
        LmVariant::Memory => MaskMode::Memory {
            mem_length: data.mem_length,
        },
        _ => MaskMode::Causal,
    };
    MaskingPolicy {
        mode,
        eod_token: data.eod_token.map(i64::from),
        reset_position_ids: data.reset_position_ids,
        reset_attention_mask: data.reset_attention_mask,
    }
}

/// Forward step matching `model.model_type`.
pub fn build_forward_step(
    config: &TrainingConfig,
    grid: &ProcessGrid,
    device: &Device,
) -> Box<dyn ForwardStep> {
    let seq_length = config.data.seq_length;
    match config.model.model_type.as_deref() {
        Some(MULTIPLE_CHOICE) => Box::new(MultipleChoiceStep::new(
            grid.clone(),
            device.clone(),
            seq_length,
        )),
        _ => {
            let context = BatchContext {
                variant: config.lm_variant(),
                policy: masking_policy(config),
                max_sequence: max_sequence_length(config),
                device: device.clone(),
            };
            Box::new(LanguageModelingStep::new(context, grid.clone(), seq_length))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCluster;
    use chrono::TimeZone;

    fn tiny_config() -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.model.hidden_size = 16;
        config.model.num_layers = 1;
        config.model.num_attention_heads = 2;
        config.model.max_position_embeddings = 16;
        config.model.hidden_dropout = 0.0;
        config.model.attention_dropout = 0.0;
        config.data.seq_length = 8;
        config
    }

    const SEEDS: ProcessSeeds = ProcessSeeds {
        base: 7,
        model_parallel: 7,
    };

    #[test]
    fn memory_length_only_extends_memory_mode() {
        let mut config = tiny_config();
        config.data.mem_length = 4;
        assert_eq!(max_sequence_length(&config), 16);
        assert_eq!(model_config(&config, 8, SEEDS, &Device::Cpu).mem_length, 0);

        config.data.transformer_xl = true;
        assert_eq!(max_sequence_length(&config), 20);
        assert_eq!(model_config(&config, 8, SEEDS, &Device::Cpu).mem_length, 4);
    }

    #[test]
    fn fresh_runs_get_a_timestamped_name() {
        let mut checkpoint = CheckpointConfig::default();
        checkpoint.experiment_name = "gpt-".to_string();
        checkpoint.save = Some(PathBuf::from("/runs"));
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 0).unwrap();

        let layout = RunLayout::resolve(&checkpoint, now);
        assert_eq!(layout.experiment, "gpt-03-07-09-05");
        assert_eq!(layout.save_root, Some(PathBuf::from("/runs/gpt-03-07-09-05")));
        assert_eq!(layout.load_root, None);
    }

    #[test]
    fn resumed_runs_keep_the_loaded_name() {
        let mut checkpoint = CheckpointConfig::default();
        checkpoint.load = Some(PathBuf::from("/runs/blocklm-01-02-03-04/"));
        checkpoint.save = Some(PathBuf::from("/runs"));
        let layout = RunLayout::resolve(&checkpoint, Local::now());
        assert_eq!(layout.experiment, "blocklm-01-02-03-04");
        assert_eq!(
            layout.save_root,
            Some(PathBuf::from("/runs/blocklm-01-02-03-04"))
        );
    }

    #[test]
    fn model_parallel_streams_are_offset_by_rank() {
        let grids = LocalCluster::new(2, 2).unwrap();
        let seeds: Vec<_> = grids
            .iter()
            .map(|grid| set_random_seed(10, grid, &Device::Cpu))
            .collect();
        assert_eq!(seeds[0].base, 10);
        assert_eq!(seeds[0].model_parallel, 10 + 2718);
        assert_eq!(seeds[1].model_parallel, 10 + 2719);
    }

    #[test]
    fn unknown_model_type_is_unsupported() {
        let mut config = tiny_config();
        config.model.model_type = Some("seq2seq".to_string());
        let seeds = set_random_seed(1, &ProcessGrid::single(), &Device::Cpu);
        let err = build_model(&config, 32, seeds, &Device::Cpu).err().unwrap();
        assert!(matches!(err, TrainingError::Unsupported(_)));
    }

    #[test]
    fn block_lm_without_block_source_is_unsupported() {
        let mut config = tiny_config();
        config.data.block_lm = true;
        assert!(matches!(
            check_supported(&config, false),
            Err(TrainingError::Unsupported(_))
        ));
        assert!(check_supported(&config, true).is_ok());
    }

    #[test]
    fn checkpointing_settings_reach_the_model() {
        let mut config = tiny_config();
        config.model.checkpoint_activations = true;
        config.model.checkpoint_num_layers = 2;
        let seeds = ProcessSeeds {
            base: 5,
            model_parallel: 2723,
        };
        let model_config = model_config(&config, 32, seeds, &Device::Cpu);
        assert!(model_config.activation_checkpointing.enabled);
        assert_eq!(model_config.activation_checkpointing.num_layers, 2);
        assert_eq!(model_config.activation_checkpointing.seed, 2723);
        assert_eq!(model_config.init_seed, 5);
    }

    #[test]
    fn multiple_choice_model_builds() {
        let mut config = tiny_config();
        config.model.model_type = Some(MULTIPLE_CHOICE.to_string());
        let seeds = set_random_seed(1, &ProcessGrid::single(), &Device::Cpu);
        let model = build_model(&config, 32, seeds, &Device::Cpu).unwrap();
        assert!(model.parameters().len() > 0);
    }

    #[test]
    fn availability_follows_the_data_source() {
        let flags = LocalCluster::launch(2, 2, |grid| {
            let local = if grid.is_data_source() {
                DataAvailability {
                    do_train: true,
                    do_valid: false,
                    do_test: true,
                }
            } else {
                DataAvailability::default()
            };
            broadcast_data_availability(local, &grid)
        })
        .unwrap();
        assert_eq!(flags[0], flags[1]);
        assert!(flags[1].do_train && !flags[1].do_valid && flags[1].do_test);
    }
}
