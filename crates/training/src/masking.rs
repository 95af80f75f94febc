//! Attention masks, loss masks and position ids derived from a token batch.
//!
//! Masks are built on the host and uploaded once per batch. Every mask is
//! multiplicative: `1.0` keeps a query/key pair, `0.0` removes it.

use candle_core::{DType, Tensor};

use crate::{error::to_runtime_error, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskMode {
    /// Lower-triangular attention over the current sequence.
    Causal,
    /// Keys are `[mems | current]`; each query sees itself and the
    /// `mem_length` positions before it.
    Memory { mem_length: usize },
}

impl MaskMode {
    pub fn mem_length(&self) -> usize {
        match self {
            MaskMode::Causal => 0,
            MaskMode::Memory { mem_length } => *mem_length,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaskingPolicy {
    pub mode: MaskMode,
    pub eod_token: Option<i64>,
    pub reset_position_ids: bool,
    pub reset_attention_mask: bool,
}

impl MaskingPolicy {
    pub fn causal() -> Self {
        Self {
            mode: MaskMode::Causal,
            eod_token: None,
            reset_position_ids: false,
            reset_attention_mask: false,
        }
    }

    pub fn with_document_resets(
        mut self,
        eod_token: i64,
        reset_position_ids: bool,
        reset_attention_mask: bool,
    ) -> Self {
        self.eod_token = Some(eod_token);
        self.reset_position_ids = reset_position_ids;
        self.reset_attention_mask = reset_attention_mask;
        self
    }
}

/// `(attention_mask, loss_mask, position_ids)` for one batch.
#[derive(Debug, Clone)]
pub struct BatchMasks {
    /// `[n, 1, seq, seq + mem_length]` f32, `n` is 1 when shared.
    pub attention_mask: Tensor,
    /// `[batch, seq]` f32.
    pub loss_mask: Tensor,
    /// `[batch, seq]` i64.
    pub position_ids: Tensor,
}

pub fn get_masks_and_position_ids(
    tokens: &Tensor,
    policy: &MaskingPolicy,
    loss_mask: Option<&Tensor>,
    attention_mask: Option<&Tensor>,
) -> Result<BatchMasks, TrainingError> {
    let device = tokens.device();
    let tokens = tokens
        .to_dtype(DType::I64)
        .and_then(|t| t.to_vec2::<i64>())
        .map_err(to_runtime_error)?;
    let batch = tokens.len();
    let seq = tokens.first().map(Vec::len).unwrap_or(0);
    if batch == 0 || seq == 0 {
        return Err(TrainingError::runtime("cannot mask an empty token batch"));
    }
    let mem = policy.mode.mem_length();
    let keys = seq + mem;

    let mut loss = match loss_mask {
        Some(mask) => {
            if mask.dims() != [batch, seq] {
                return Err(TrainingError::runtime(format!(
                    "loss mask {:?} does not match tokens [{batch}, {seq}]",
                    mask.dims()
                )));
            }
            mask.to_dtype(DType::F32)
                .and_then(|t| t.flatten_all())
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(to_runtime_error)?
        }
        None => vec![1.0; batch * seq],
    };

    let given = attention_mask
        .map(|mask| given_mask(mask, batch, seq, keys))
        .transpose()?;
    let per_example = policy.reset_attention_mask || given.as_ref().map_or(false, |g| g.1 == batch);
    let rows = if per_example { batch } else { 1 };

    let band = band_mask(seq, mem);
    let mut attention = Vec::with_capacity(rows * seq * keys);
    for row in 0..rows {
        match given.as_ref() {
            Some((values, count)) => {
                let source = if *count == 1 { 0 } else { row };
                let offset = source * seq * keys;
                attention.extend(
                    band.iter()
                        .zip(&values[offset..offset + seq * keys])
                        .map(|(b, g)| b * g),
                );
            }
            None => attention.extend_from_slice(&band),
        }
    }

    let mut positions: Vec<i64> = (0..batch).flat_map(|_| 0..seq as i64).collect();

    if let Some(eod) = policy.eod_token {
        for (b, row_tokens) in tokens.iter().enumerate() {
            let mut prev_index = 0usize;
            for (i, _) in row_tokens.iter().enumerate().filter(|&(_, &t)| t == eod) {
                loss[b * seq + i] = 0.0;

                if policy.reset_attention_mask {
                    let block = &mut attention[b * seq * keys..(b + 1) * seq * keys];
                    for query in (i + 1)..seq {
                        for key in 0..=(i + mem) {
                            block[query * keys + key] = 0.0;
                        }
                    }
                }

                if policy.reset_position_ids {
                    let shift = (i + 1 - prev_index) as i64;
                    for pos in &mut positions[b * seq + i + 1..(b + 1) * seq] {
                        *pos -= shift;
                    }
                    prev_index = i + 1;
                }
            }
        }
    }

    Ok(BatchMasks {
        attention_mask: Tensor::from_vec(attention, (rows, 1, seq, keys), device)
            .map_err(to_runtime_error)?,
        loss_mask: Tensor::from_vec(loss, (batch, seq), device).map_err(to_runtime_error)?,
        position_ids: Tensor::from_vec(positions, (batch, seq), device)
            .map_err(to_runtime_error)?,
    })
}

fn band_mask(seq: usize, mem: usize) -> Vec<f32> {
    let keys = seq + mem;
    let mut values = vec![0f32; seq * keys];
    for query in 0..seq {
        // Key `k` holds relative position `k - mem`.
        let first = if mem == 0 { 0 } else { query };
        for key in first..=(query + mem) {
            values[query * keys + key] = 1.0;
        }
    }
    values
}

fn given_mask(
    mask: &Tensor,
    batch: usize,
    seq: usize,
    keys: usize,
) -> Result<(Vec<f32>, usize), TrainingError> {
    let count = match mask.dims() {
        [s, k] if *s == seq && *k == keys => 1,
        [n, s, k] if *s == seq && *k == keys => *n,
        [n, 1, s, k] if *s == seq && *k == keys => *n,
        dims => {
            return Err(TrainingError::runtime(format!(
                "attention mask {dims:?} does not cover [{seq}, {keys}]"
            )))
        }
    };
    if count != 1 && count != batch {
        return Err(TrainingError::runtime(format!(
            "attention mask leading dimension {count} must be 1 or the batch size {batch}"
        )));
    }
    let values = mask
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    Ok((values, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const EOD: i64 = 99;

    fn tokens(rows: &[&[i64]]) -> Tensor {
        let seq = rows[0].len();
        let flat: Vec<i64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), seq), &Device::Cpu).unwrap()
    }

    fn mask_rows(mask: &Tensor, example: usize) -> Vec<Vec<f32>> {
        mask.get(example)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap()
    }

    #[test]
    fn causal_mask_is_lower_triangular_and_shared() {
        let masks =
            get_masks_and_position_ids(&tokens(&[&[1, 2, 3, 4], &[5, 6, 7, 8]]), &MaskingPolicy::causal(), None, None)
                .unwrap();
        assert_eq!(masks.attention_mask.dims(), &[1, 1, 4, 4]);
        let rows = mask_rows(&masks.attention_mask, 0);
        for (i, row) in rows.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                assert_eq!(value, if j <= i { 1.0 } else { 0.0 });
            }
        }
        assert_eq!(
            masks.position_ids.to_vec2::<i64>().unwrap(),
            vec![vec![0, 1, 2, 3], vec![0, 1, 2, 3]]
        );
    }

    #[test]
    fn memory_band_limits_lookback() {
        let policy = MaskingPolicy {
            mode: MaskMode::Memory { mem_length: 2 },
            ..MaskingPolicy::causal()
        };
        let masks = get_masks_and_position_ids(&tokens(&[&[1, 2, 3, 4]]), &policy, None, None).unwrap();
        assert_eq!(masks.attention_mask.dims(), &[1, 1, 4, 6]);
        let rows = mask_rows(&masks.attention_mask, 0);
        for (i, row) in rows.iter().enumerate() {
            for (key, &value) in row.iter().enumerate() {
                let j = key as i64 - 2;
                let allowed = j >= i as i64 - 2 && j <= i as i64;
                assert_eq!(value, if allowed { 1.0 } else { 0.0 }, "query {i} key {key}");
            }
        }
    }

    #[test]
    fn given_attention_mask_multiplies_the_band() {
        let given = Tensor::from_vec(
            vec![1f32, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
            (3, 3),
            &Device::Cpu,
        )
        .unwrap();
        let masks = get_masks_and_position_ids(
            &tokens(&[&[1, 2, 3]]),
            &MaskingPolicy::causal(),
            None,
            Some(&given),
        )
        .unwrap();
        let rows = mask_rows(&masks.attention_mask, 0);
        assert_eq!(rows[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(rows[2], vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn document_boundary_scenario() {
        let policy = MaskingPolicy::causal().with_document_resets(EOD, true, true);
        let masks = get_masks_and_position_ids(&tokens(&[&[10, 11, EOD, 12]]), &policy, None, None).unwrap();

        assert_eq!(masks.position_ids.to_vec2::<i64>().unwrap(), vec![vec![0, 1, 2, 0]]);
        assert_eq!(masks.loss_mask.to_vec2::<f32>().unwrap(), vec![vec![1.0, 1.0, 0.0, 1.0]]);
        let rows = mask_rows(&masks.attention_mask, 0);
        assert_eq!(rows[3], vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(rows[2], vec![1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn positions_restart_after_each_boundary() {
        let policy = MaskingPolicy::causal().with_document_resets(EOD, true, false);
        let row: &[i64] = &[1, EOD, 2, 3, 4, EOD, 5, 6];
        let masks = get_masks_and_position_ids(&tokens(&[row]), &policy, None, None).unwrap();
        assert_eq!(
            masks.position_ids.to_vec2::<i64>().unwrap(),
            vec![vec![0, 1, 0, 1, 2, 3, 0, 1]]
        );
        assert_eq!(masks.attention_mask.dims(), &[1, 1, 8, 8]);
    }

    #[test]
    fn attention_reset_keeps_each_document_triangular() {
        let policy = MaskingPolicy::causal().with_document_resets(EOD, false, true);
        let masks = get_masks_and_position_ids(
            &tokens(&[&[1, 2, EOD, 3, 4], &[1, 2, 3, 4, 5]]),
            &policy,
            None,
            None,
        )
        .unwrap();
        assert_eq!(masks.attention_mask.dims(), &[2, 1, 5, 5]);

        let first = mask_rows(&masks.attention_mask, 0);
        for row in &first[3..] {
            assert!(row[..3].iter().all(|&v| v == 0.0));
        }
        for (i, row) in first[..3].iter().enumerate() {
            for (j, &value) in row[..3].iter().enumerate() {
                assert_eq!(value, if j <= i { 1.0 } else { 0.0 });
            }
        }
        let second = mask_rows(&masks.attention_mask, 1);
        assert_eq!(second[4], vec![1.0; 5]);
        assert_eq!(
            masks.position_ids.to_vec2::<i64>().unwrap()[0],
            vec![0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn attention_reset_hides_memory_columns() {
        let policy = MaskingPolicy {
            mode: MaskMode::Memory { mem_length: 2 },
            ..MaskingPolicy::causal().with_document_resets(EOD, false, true)
        };
        let masks = get_masks_and_position_ids(&tokens(&[&[EOD, 1, 2]]), &policy, None, None).unwrap();
        let rows = mask_rows(&masks.attention_mask, 0);
        assert_eq!(rows[1], vec![0.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn supplied_loss_mask_is_kept() {
        let policy = MaskingPolicy::causal().with_document_resets(EOD, false, false);
        let loss = Tensor::from_vec(vec![0f32, 1.0, 1.0], (1, 3), &Device::Cpu).unwrap();
        let masks = get_masks_and_position_ids(&tokens(&[&[1, EOD, 2]]), &policy, Some(&loss), None).unwrap();
        assert_eq!(masks.loss_mask.to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0, 1.0]]);
    }
}
