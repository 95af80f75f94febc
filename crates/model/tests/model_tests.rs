use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{build_block_mask, GptModel, LanguageModel, ModelConfig};

fn causal_mask(seq: usize, keys: usize) -> Result<Tensor> {
    let offset = keys - seq;
    let mut data = vec![0f32; seq * keys];
    for q in 0..seq {
        for k in 0..=(q + offset) {
            data[q * keys + k] = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (1, 1, seq, keys), &Device::Cpu)?)
}

fn positions(batch: usize, seq: usize) -> Result<Tensor> {
    Ok(Tensor::arange(0i64, seq as i64, &Device::Cpu)?
        .unsqueeze(0)?
        .broadcast_as((batch, seq))?
        .contiguous()?)
}

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = GptModel::new(ModelConfig::tiny(16))?;
    let tokens = Tensor::from_slice(&[0i64, 1, 2, 3, 4, 5], (2, 3), &Device::Cpu)?;

    let output = model.forward(&tokens, &positions(2, 3)?, &causal_mask(3, 3)?, &[])?;

    assert_eq!(output.logits.dims(), &[2, 3, 16]);
    assert_eq!(output.logits.dtype(), DType::F32);
    assert!(output.mems.is_empty());
    Ok(())
}

#[test]
fn causal_mask_hides_future_tokens() -> Result<()> {
    let model = GptModel::new(ModelConfig::tiny(16))?;
    model.set_training(false);
    let first = Tensor::from_slice(&[1i64, 2, 3, 4], (1, 4), &Device::Cpu)?;
    let second = Tensor::from_slice(&[1i64, 2, 9, 9], (1, 4), &Device::Cpu)?;
    let mask = causal_mask(4, 4)?;

    let a = model.forward(&first, &positions(1, 4)?, &mask, &[])?.logits;
    let b = model.forward(&second, &positions(1, 4)?, &mask, &[])?.logits;

    let prefix_a = a.narrow(1, 0, 2)?.flatten_all()?.to_vec1::<f32>()?;
    let prefix_b = b.narrow(1, 0, 2)?.flatten_all()?.to_vec1::<f32>()?;
    for (x, y) in prefix_a.iter().zip(prefix_b.iter()) {
        assert!((x - y).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn memory_is_returned_per_layer_and_capped() -> Result<()> {
    let mut config = ModelConfig::tiny(16);
    config.mem_length = 3;
    let model = GptModel::new(config)?;
    let tokens = Tensor::from_slice(&[0i64, 1, 2, 3, 4, 5, 6, 7], (2, 4), &Device::Cpu)?;

    let first = model.forward(&tokens, &positions(2, 4)?, &causal_mask(4, 7)?, &[])?;
    assert_eq!(first.mems.len(), 2);
    assert_eq!(first.mems[0].dims(), &[2, 3, 16]);

    let second = model.forward(&tokens, &positions(2, 4)?, &causal_mask(4, 7)?, &first.mems)?;
    assert_eq!(second.logits.dims(), &[2, 4, 16]);
    assert_eq!(second.mems[1].dims(), &[2, 3, 16]);
    Ok(())
}

#[test]
fn block_mask_exposes_prefix_bidirectionally() -> Result<()> {
    let separators = Tensor::from_slice(&[2i64], 1, &Device::Cpu)?;
    let mask = build_block_mask(&separators, 1, 4, 0, &Device::Cpu)?;
    let rows = mask.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;

    assert_eq!(rows[0], vec![1.0, 1.0, 0.0, 0.0]);
    assert_eq!(rows[2], vec![1.0, 1.0, 1.0, 0.0]);
    assert_eq!(rows[3], vec![1.0, 1.0, 1.0, 1.0]);
    Ok(())
}

#[test]
fn block_positions_use_second_channel() -> Result<()> {
    let mut config = ModelConfig::tiny(16);
    config.block_position_encoding = true;
    let model = GptModel::new(config)?;
    let tokens = Tensor::from_slice(&[3i64, 4, 5, 6], (1, 4), &Device::Cpu)?;
    let position_ids = Tensor::from_slice(&[0i64, 1, 2, 2, 0, 0, 1, 2], (1, 2, 4), &Device::Cpu)?;
    let separators = Tensor::from_slice(&[3i64], 1, &Device::Cpu)?;

    let output = model.forward(&tokens, &position_ids, &separators, &[])?;

    assert_eq!(output.logits.dims(), &[1, 4, 16]);
    Ok(())
}

#[test]
fn parameters_are_named_and_unsharded() -> Result<()> {
    let model = GptModel::new(ModelConfig::tiny(16))?;
    let params = model.parameters();

    assert!(params.iter().any(|p| p.name == "word_embeddings.weight"));
    assert!(params.iter().any(|p| p.name == "layers.1.mlp.dense_4h_to_h.bias"));
    assert!(params.iter().all(|p| !p.model_parallel));
    Ok(())
}

#[test]
fn activation_checkpoint_chunks_cover_all_layers() -> Result<()> {
    let mut config = ModelConfig::tiny(16);
    config.n_layers = 5;
    config.activation_checkpointing.enabled = true;
    config.activation_checkpointing.num_layers = 2;
    let model = GptModel::new(config)?;

    assert_eq!(model.checkpoint_chunks(), vec![0..2, 2..4, 4..5]);
    Ok(())
}
