use candle_core::{DType, Device, Tensor};

use super::{
    BlockingDataLoader, RawBatch, Result, ATTENTION_MASK, LOSS_MASK, POSITION_ID, TARGET, TEXT,
};
use crate::{
    config::LmVariant,
    distributed::ProcessGrid,
    error::to_runtime_error,
    masking::{get_masks_and_position_ids, MaskingPolicy},
    TrainingError,
};

const HEADER_DATA: i64 = 1;
const HEADER_EXHAUSTED: i64 = 0;
const HEADER_MISSING_KEY: i64 = -1;

/// Keys a data source must provide for each batch layout.
pub fn batch_keys(variant: LmVariant) -> &'static [&'static str] {
    match variant {
        LmVariant::Causal => &[TEXT, LOSS_MASK],
        LmVariant::Memory => &[TEXT, LOSS_MASK, TARGET, ATTENTION_MASK],
        LmVariant::Block => &[TEXT, LOSS_MASK, TARGET, ATTENTION_MASK, POSITION_ID],
    }
}

/// Ships the data-source rank's batch to the rest of its model-parallel group.
///
/// The source sends a header first (`flag`, then `ndim, dims...` per key)
/// followed by every key's values flattened in key order. Peers pass `None`
/// for `batch`. Returns `None` on every rank once the source is exhausted.
pub fn broadcast_data(
    keys: &[&str],
    batch: Option<&RawBatch>,
    grid: &ProcessGrid,
    device: &Device,
) -> Result<Option<RawBatch>> {
    let group = grid.model_parallel();
    let is_source = grid.is_data_source();

    let mut header = Vec::new();
    let mut missing = None;
    if is_source {
        match batch {
            None => header.push(HEADER_EXHAUSTED),
            Some(batch) => match keys.iter().find(|key| batch.get(key).is_none()) {
                Some(key) => {
                    header.push(HEADER_MISSING_KEY);
                    missing = Some(key.to_string());
                }
                None => {
                    header.push(HEADER_DATA);
                    for key in keys {
                        let dims = batch.require(key)?.dims();
                        header.push(dims.len() as i64);
                        header.extend(dims.iter().map(|&d| d as i64));
                    }
                }
            },
        }
    }

    if group.size() > 1 {
        group.broadcast(&mut header, 0)?;
    }

    match header.first().copied() {
        Some(HEADER_DATA) => {}
        Some(HEADER_EXHAUSTED) => return Ok(None),
        Some(HEADER_MISSING_KEY) => {
            return Err(TrainingError::runtime(format!(
                "data source batch is missing key '{}'",
                missing.unwrap_or_else(|| "<unknown>".to_string())
            )))
        }
        other => {
            return Err(TrainingError::collective(format!(
                "malformed batch header flag {other:?}"
            )))
        }
    }

    let shapes = parse_shapes(&header[1..], keys.len())?;

    let mut values = Vec::new();
    if is_source {
        if let Some(batch) = batch {
            for key in keys {
                let flat = batch
                    .require(key)?
                    .to_dtype(DType::I64)
                    .and_then(|t| t.flatten_all())
                    .and_then(|t| t.to_vec1::<i64>())
                    .map_err(to_runtime_error)?;
                values.extend(flat);
            }
        }
    }
    if group.size() > 1 {
        group.broadcast(&mut values, 0)?;
    }

    let expected: usize = shapes.iter().map(|dims| dims.iter().product::<usize>()).sum();
    if values.len() != expected {
        return Err(TrainingError::collective(format!(
            "batch payload holds {} values, header describes {expected}",
            values.len()
        )));
    }

    let mut out = RawBatch::new();
    let mut offset = 0;
    for (key, dims) in keys.iter().zip(shapes) {
        let count: usize = dims.iter().product();
        let tensor = Tensor::from_vec(values[offset..offset + count].to_vec(), dims, device)
            .map_err(to_runtime_error)?;
        offset += count;
        out.insert(*key, tensor);
    }
    Ok(Some(out))
}

fn parse_shapes(header: &[i64], keys: usize) -> Result<Vec<Vec<usize>>> {
    let mut shapes = Vec::with_capacity(keys);
    let mut cursor = 0;
    for _ in 0..keys {
        let ndim = *header
            .get(cursor)
            .ok_or_else(|| TrainingError::collective("truncated batch header"))?
            as usize;
        cursor += 1;
        let dims = header
            .get(cursor..cursor + ndim)
            .ok_or_else(|| TrainingError::collective("truncated batch header"))?;
        shapes.push(dims.iter().map(|&d| d as usize).collect());
        cursor += ndim;
    }
    Ok(shapes)
}

/// Inputs of one forward call.
#[derive(Debug, Clone)]
pub struct Batch {
    pub tokens: Tensor,
    pub labels: Tensor,
    /// `[batch, seq]` f32.
    pub loss_mask: Tensor,
    /// Multiplicative `[n, 1, seq, keys]` mask, or `[batch]` separator
    /// indices in block mode.
    pub attention_mask: Tensor,
    pub position_ids: Tensor,
}

impl Batch {
    pub fn sequence_length(&self) -> Result<usize> {
        self.tokens
            .dims()
            .last()
            .copied()
            .ok_or_else(|| TrainingError::runtime("token tensor has no sequence dimension"))
    }
}

/// What [`get_batch`] needs to know about the run.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub variant: LmVariant,
    pub policy: MaskingPolicy,
    /// `max_position_embeddings + mem_length`.
    pub max_sequence: usize,
    pub device: Device,
}

/// Reads (on the data-source rank), broadcasts and unpacks the next batch.
pub fn get_batch(
    loader: Option<&mut BlockingDataLoader>,
    context: &BatchContext,
    grid: &ProcessGrid,
) -> Result<Option<Batch>> {
    let raw = match (grid.is_data_source(), loader) {
        (true, Some(loader)) => loader.next_batch()?,
        (true, None) => {
            return Err(TrainingError::runtime(
                "data-source rank has no data loader",
            ))
        }
        (false, _) => None,
    };
    let keys = batch_keys(context.variant);
    let Some(data) = broadcast_data(keys, raw.as_ref(), grid, &context.device)? else {
        return Ok(None);
    };

    let loss_mask = data
        .require(LOSS_MASK)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?;

    let batch = match context.variant {
        LmVariant::Causal => {
            let text = data.require(TEXT)?;
            let width = text.dim(1).map_err(to_runtime_error)?;
            if width < 2 {
                return Err(TrainingError::runtime(
                    "causal batches need at least two tokens per row",
                ));
            }
            let tokens = text.narrow(1, 0, width - 1).and_then(|t| t.contiguous());
            let labels = text.narrow(1, 1, width - 1).and_then(|t| t.contiguous());
            let loss_mask = loss_mask.narrow(1, 1, width - 1).and_then(|t| t.contiguous());
            let (tokens, labels, loss_mask) = (
                tokens.map_err(to_runtime_error)?,
                labels.map_err(to_runtime_error)?,
                loss_mask.map_err(to_runtime_error)?,
            );
            let masks = get_masks_and_position_ids(&tokens, &context.policy, Some(&loss_mask), None)?;
            Batch {
                tokens,
                labels,
                loss_mask: masks.loss_mask,
                attention_mask: masks.attention_mask,
                position_ids: masks.position_ids,
            }
        }
        LmVariant::Memory => {
            let tokens = data.require(TEXT)?.clone();
            let attention_mask = data
                .require(ATTENTION_MASK)?
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let masks = get_masks_and_position_ids(
                &tokens,
                &context.policy,
                Some(&loss_mask),
                Some(&attention_mask),
            )?;
            Batch {
                tokens,
                labels: data.require(TARGET)?.clone(),
                loss_mask: masks.loss_mask,
                attention_mask: masks.attention_mask,
                position_ids: masks.position_ids,
            }
        }
        LmVariant::Block => Batch {
            tokens: data.require(TEXT)?.clone(),
            labels: data.require(TARGET)?.clone(),
            loss_mask,
            attention_mask: data.require(ATTENTION_MASK)?.clone(),
            position_ids: data.require(POSITION_ID)?.clone(),
        },
    };

    let seq = batch.sequence_length()?;
    if seq > context.max_sequence {
        return Err(TrainingError::runtime(format!(
            "batch sequence length {seq} exceeds max_position_embeddings + mem_length ({})",
            context.max_sequence
        )));
    }
    Ok(Some(batch))
}
