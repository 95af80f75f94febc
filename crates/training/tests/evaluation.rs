use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use training::{
    build_forward_step, build_model,
    data::{broadcast_data, batch_keys, LOSS_MASK, TEXT},
    set_random_seed, BlockingDataLoader, Evaluator, InMemoryDataLoader, LmVariant, LocalCluster,
    ProcessGrid, RawBatch, TrainingConfig,
};

const VOCAB: usize = 12;
const SEQ: usize = 4;

fn config() -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.model.vocab_size = VOCAB;
    config.model.hidden_size = 8;
    config.model.num_layers = 1;
    config.model.num_attention_heads = 2;
    config.model.max_position_embeddings = 16;
    config.model.hidden_dropout = 0.1;
    config.model.attention_dropout = 0.1;
    config.data.seq_length = SEQ;
    config
}

fn text_batch(width: usize) -> RawBatch {
    let device = Device::Cpu;
    let values: Vec<i64> = (0..width as i64).map(|i| 1 + i % (VOCAB as i64 - 1)).collect();
    RawBatch::new()
        .with(TEXT, Tensor::from_vec(values, (1, width), &device).unwrap())
        .with(LOSS_MASK, Tensor::ones((1, width), DType::I64, &device).unwrap())
}

#[test]
fn evaluation_buckets_batches_by_width() -> Result<()> {
    let config = config();
    let grid = ProcessGrid::single();
    let device = Device::Cpu;
    let seeds = set_random_seed(config.runtime.seed, &grid, &device);
    let model = build_model(&config, VOCAB, seeds, &device)?;
    let forward = build_forward_step(&config, &grid, &device);

    // Two batches that fit seq_length + 1, one longer batch.
    let mut loader = BlockingDataLoader::new(InMemoryDataLoader::new(vec![
        text_batch(SEQ + 1),
        text_batch(SEQ + 6),
        text_batch(SEQ + 1),
    ]));
    let evaluator = Evaluator {
        forward: forward.as_ref(),
        model: model.as_ref(),
        grid: &grid,
        eval_iters: 3,
        log_interval: 1,
    };
    let summary = evaluator.evaluate(Some(&mut loader))?;

    assert_eq!(summary.gpt_iters, 2);
    assert_eq!(summary.mask_iters, 1);
    let expected = (2.0 * summary.gpt_loss + summary.bert_loss) / 3.0;
    assert!((summary.loss - expected).abs() < 1e-6);
    assert!(model.is_training());
    Ok(())
}

#[test]
fn evaluation_is_deterministic_with_dropout_configured() -> Result<()> {
    let config = config();
    let grid = ProcessGrid::single();
    let device = Device::Cpu;
    let seeds = set_random_seed(config.runtime.seed, &grid, &device);
    let model = build_model(&config, VOCAB, seeds, &device)?;
    let forward = build_forward_step(&config, &grid, &device);
    let evaluator = Evaluator {
        forward: forward.as_ref(),
        model: model.as_ref(),
        grid: &grid,
        eval_iters: 1,
        log_interval: 0,
    };

    let mut losses = Vec::new();
    for _ in 0..2 {
        let mut loader =
            BlockingDataLoader::new(InMemoryDataLoader::new(vec![text_batch(SEQ + 1)]));
        losses.push(evaluator.evaluate(Some(&mut loader))?.loss);
    }
    assert_eq!(losses[0], losses[1]);
    Ok(())
}

#[test]
fn evaluation_stops_early_when_data_runs_out() -> Result<()> {
    let config = config();
    let grid = ProcessGrid::single();
    let device = Device::Cpu;
    let seeds = set_random_seed(config.runtime.seed, &grid, &device);
    let model = build_model(&config, VOCAB, seeds, &device)?;
    let forward = build_forward_step(&config, &grid, &device);
    let mut loader = BlockingDataLoader::new(InMemoryDataLoader::new(vec![text_batch(SEQ + 1)]));
    let evaluator = Evaluator {
        forward: forward.as_ref(),
        model: model.as_ref(),
        grid: &grid,
        eval_iters: 5,
        log_interval: 0,
    };

    let summary = evaluator.evaluate(Some(&mut loader))?;
    assert_eq!(summary.gpt_iters, 1);
    assert!((summary.loss - summary.gpt_loss).abs() < 1e-9);
    Ok(())
}

#[test]
fn model_parallel_peers_receive_the_source_batch() -> Result<()> {
    let keys = batch_keys(LmVariant::Causal);
    let received = LocalCluster::launch(4, 2, |grid| {
        let local = grid
            .is_data_source()
            .then(|| text_batch(3 + grid.data_parallel_rank()));
        let batch = broadcast_data(keys, local.as_ref(), &grid, &Device::Cpu)?;
        let text = batch
            .as_ref()
            .and_then(|batch| batch.get(TEXT))
            .map(|tensor| tensor.dims().to_vec());
        Ok((grid.data_parallel_rank(), text))
    })?;

    for (dp_rank, dims) in received {
        assert_eq!(dims, Some(vec![1, 3 + dp_rank]));
    }

    let exhausted = LocalCluster::launch(2, 2, |grid| {
        broadcast_data(keys, None, &grid, &Device::Cpu).map(|batch| batch.is_none())
    })?;
    assert_eq!(exhausted, vec![true, true]);
    Ok(())
}
