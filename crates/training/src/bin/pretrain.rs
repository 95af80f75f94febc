use std::{path::PathBuf, str::FromStr};

use candle_core::Device;
use chrono::Local;
use clap::Parser;
use tokenizers::Tokenizer;
use training::{
    bootstrap::MULTIPLE_CHOICE,
    build_forward_step, build_model, check_supported,
    data::{tokenize_documents, PackedSequenceLoader},
    set_random_seed, BlockingDataLoader, DataSources, LocalCluster, Pretrainer, ProcessGrid,
    RunLayout, RunSummary, TrainingConfig, TrainingError,
};

/// Separator tokens tried, in order, when `data.eod_token` is unset.
const EOD_CANDIDATES: [&str; 3] = ["<|endoftext|>", "</s>", "[SEP]"];

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("pretraining failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed language model pretraining", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to the run configuration")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a configuration value using a dot-separated path"
    )]
    overrides: Vec<OverrideArg>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Tokenized corpora, shared read-only by every rank.
struct Corpora {
    train: Vec<Vec<u32>>,
    valid: Vec<Vec<u32>>,
    test: Vec<Vec<u32>>,
    eod_token: u32,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    for arg in &args.overrides {
        config = config.with_override(&arg.path, &arg.value)?;
    }
    config.validate()?;

    check_supported(&config, false)?;
    if config.model.model_type.as_deref() == Some(MULTIPLE_CHOICE) {
        return Err(TrainingError::unsupported(
            "multiple-choice training needs a task data source; the CLI only packs raw text",
        ));
    }

    let tokenizer_path = config.data.tokenizer_json.clone().ok_or_else(|| {
        TrainingError::initialization("data.tokenizer_json is required to read the corpora")
    })?;
    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to load tokenizer {}: {err}",
            tokenizer_path.display()
        ))
    })?;
    if config.model.vocab_size == 0 {
        config.model.vocab_size = tokenizer.get_vocab_size(true);
    }
    let eod_token = match config.data.eod_token {
        Some(token) => token,
        None => EOD_CANDIDATES
            .iter()
            .find_map(|candidate| tokenizer.token_to_id(candidate))
            .ok_or_else(|| {
                TrainingError::initialization(
                    "data.eod_token is unset and the tokenizer has no end-of-document token",
                )
            })?,
    };
    config.data.eod_token = Some(eod_token);

    let corpora = Corpora {
        train: tokenize_documents(&config.data.train_data, &tokenizer)?,
        valid: tokenize_documents(&config.data.valid_data, &tokenizer)?,
        test: tokenize_documents(&config.data.test_data, &tokenizer)?,
        eod_token,
    };
    log::info!(
        "tokenized {} train, {} valid and {} test documents (vocab {}, eod {})",
        corpora.train.len(),
        corpora.valid.len(),
        corpora.test.len(),
        config.model.vocab_size,
        eod_token
    );

    let layout = RunLayout::resolve(&config.checkpoint, Local::now());
    let distributed = &config.distributed;
    let summaries = if distributed.world_size > 1 {
        LocalCluster::launch(
            distributed.world_size,
            distributed.model_parallel_size,
            |grid| run_rank(&config, &layout, &corpora, grid),
        )?
    } else {
        vec![run_rank(&config, &layout, &corpora, ProcessGrid::single())?]
    };

    if let Some(summary) = summaries.first() {
        log::info!(
            "finished at iteration {} ({} skipped)",
            summary.iteration,
            summary.skipped_iterations
        );
    }
    Ok(())
}

fn run_rank(
    config: &TrainingConfig,
    layout: &RunLayout,
    corpora: &Corpora,
    grid: ProcessGrid,
) -> Result<RunSummary, TrainingError> {
    let device = Device::Cpu;
    let seeds = set_random_seed(config.runtime.seed, &grid, &device);
    let model = build_model(config, config.model.vocab_size, seeds, &device)?;
    let forward = build_forward_step(config, &grid, &device);

    let data = if grid.is_data_source() {
        let shard = Shard {
            rank: grid.data_parallel_rank(),
            size: grid.data_parallel_size(),
        };
        DataSources {
            train: packed_loader(config, corpora, &corpora.train, shard, seeds.base, &device)?,
            valid: packed_loader(config, corpora, &corpora.valid, shard, seeds.base, &device)?,
            test: packed_loader(config, corpora, &corpora.test, shard, seeds.base, &device)?,
        }
    } else {
        DataSources::default()
    };

    Pretrainer::new(
        config.clone(),
        layout.clone(),
        grid,
        model,
        forward,
        data,
    )?
    .run()
}

#[derive(Debug, Clone, Copy)]
struct Shard {
    rank: usize,
    size: usize,
}

/// Loader over this data-parallel rank's share of `documents`, or `None`
/// when the split is empty.
fn packed_loader(
    config: &TrainingConfig,
    corpora: &Corpora,
    documents: &[Vec<u32>],
    shard: Shard,
    seed: u64,
    device: &Device,
) -> Result<Option<BlockingDataLoader>, TrainingError> {
    if documents.is_empty() {
        return Ok(None);
    }
    let local: Vec<Vec<u32>> = documents
        .iter()
        .skip(shard.rank)
        .step_by(shard.size.max(1))
        .cloned()
        .collect();
    let data = &config.data;
    let loader = PackedSequenceLoader::new(
        local,
        corpora.eod_token,
        data.batch_size,
        data.seq_length,
        config.lm_variant(),
        data.mem_length,
        data.shuffle,
        seed + shard.rank as u64,
    )?
    .with_device(device.clone());
    Ok(Some(BlockingDataLoader::new(loader)))
}
