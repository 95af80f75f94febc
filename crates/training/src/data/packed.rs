use std::{fs, path::Path};

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokenizers::Tokenizer;

use super::{DataLoader, RawBatch, Result, ATTENTION_MASK, LOSS_MASK, TARGET, TEXT};
use crate::{config::LmVariant, error::to_runtime_error, TrainingError};

/// Reads every non-empty line of `paths` as one document.
pub fn tokenize_documents(paths: &[impl AsRef<Path>], tokenizer: &Tokenizer) -> Result<Vec<Vec<u32>>> {
    let mut documents = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            TrainingError::initialization(format!("failed to read {}: {err}", path.display()))
        })?;
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let encoding = tokenizer
                .encode(line, false)
                .map_err(|err| TrainingError::runtime(format!("tokenization failed: {err}")))?;
            if !encoding.get_ids().is_empty() {
                documents.push(encoding.get_ids().to_vec());
            }
        }
    }
    Ok(documents)
}

/// Packs EOD-terminated documents into fixed-length rows.
///
/// The shuffled token stream is split into `batch_size` contiguous lanes so
/// row `b` of consecutive batches continues the same text, which memory mode
/// relies on. When a lane runs dry the next epoch is shuffled with
/// `seed + epoch`.
pub struct PackedSequenceLoader {
    documents: Vec<Vec<u32>>,
    eod_token: u32,
    batch_size: usize,
    seq_length: usize,
    variant: LmVariant,
    mem_length: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
    lanes: Vec<Vec<u32>>,
    cursor: usize,
    device: Device,
}

impl PackedSequenceLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        documents: Vec<Vec<u32>>,
        eod_token: u32,
        batch_size: usize,
        seq_length: usize,
        variant: LmVariant,
        mem_length: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if variant == LmVariant::Block {
            return Err(TrainingError::unsupported(
                "block LM batches require an external block-mask data source",
            ));
        }
        if batch_size == 0 || seq_length == 0 {
            return Err(TrainingError::initialization(
                "packed loader needs a positive batch size and sequence length",
            ));
        }
        let total: usize = documents.iter().map(|doc| doc.len() + 1).sum();
        if total < batch_size * (seq_length + 1) {
            return Err(TrainingError::initialization(format!(
                "corpus holds {total} tokens, fewer than one batch of {batch_size} x {}",
                seq_length + 1
            )));
        }

        let mut loader = Self {
            documents,
            eod_token,
            batch_size,
            seq_length,
            variant,
            mem_length,
            shuffle,
            seed,
            epoch: 0,
            lanes: Vec::new(),
            cursor: 0,
            device: Device::Cpu,
        };
        loader.prepare_epoch();
        Ok(loader)
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    fn prepare_epoch(&mut self) {
        let mut order: Vec<usize> = (0..self.documents.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }
        let mut stream = Vec::new();
        for index in order {
            stream.extend_from_slice(&self.documents[index]);
            stream.push(self.eod_token);
        }
        let lane_len = stream.len() / self.batch_size;
        self.lanes = stream
            .chunks_exact(lane_len)
            .take(self.batch_size)
            .map(<[u32]>::to_vec)
            .collect();
        self.cursor = 0;
        log::debug!(
            "packed epoch {} ready: {} documents, {} tokens per lane",
            self.epoch,
            self.documents.len(),
            lane_len
        );
        self.epoch += 1;
    }

    fn build_batch(&mut self) -> Result<RawBatch> {
        let width = self.seq_length + 1;
        if self.cursor + width > self.lanes[0].len() {
            self.prepare_epoch();
        }
        let start = self.cursor;
        // Rows overlap by one token so targets continue into the next batch.
        self.cursor += self.seq_length;

        let rows: Vec<i64> = self
            .lanes
            .iter()
            .flat_map(|lane| lane[start..start + width].iter().map(|&t| t as i64))
            .collect();
        let (batch, seq) = (self.batch_size, self.seq_length);
        let text = Tensor::from_vec(rows, (batch, width), &self.device).map_err(to_runtime_error)?;

        let raw = match self.variant {
            LmVariant::Causal => RawBatch::new().with(TEXT, text).with(
                LOSS_MASK,
                Tensor::ones((batch, width), candle_core::DType::I64, &self.device)
                    .map_err(to_runtime_error)?,
            ),
            _ => {
                let tokens = text.narrow(1, 0, seq).and_then(|t| t.contiguous());
                let target = text.narrow(1, 1, seq).and_then(|t| t.contiguous());
                RawBatch::new()
                    .with(TEXT, tokens.map_err(to_runtime_error)?)
                    .with(TARGET, target.map_err(to_runtime_error)?)
                    .with(
                        LOSS_MASK,
                        Tensor::ones((batch, seq), candle_core::DType::I64, &self.device)
                            .map_err(to_runtime_error)?,
                    )
                    .with(
                        ATTENTION_MASK,
                        Tensor::ones(
                            (1, seq, seq + self.mem_length),
                            candle_core::DType::I64,
                            &self.device,
                        )
                        .map_err(to_runtime_error)?,
                    )
            }
        };
        Ok(raw)
    }
}

impl DataLoader for PackedSequenceLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<RawBatch>>> {
        Box::pin(async move { self.build_batch().map(Some) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BlockingDataLoader;

    fn documents() -> Vec<Vec<u32>> {
        (0..8).map(|d| vec![d * 10 + 1, d * 10 + 2, d * 10 + 3]).collect()
    }

    #[test]
    fn causal_rows_carry_one_extra_token() {
        let loader =
            PackedSequenceLoader::new(documents(), 0, 2, 4, LmVariant::Causal, 0, false, 1).unwrap();
        let mut loader = BlockingDataLoader::new(loader);
        let batch = loader.next_batch().unwrap().unwrap();
        let text = batch.require(TEXT).unwrap().to_vec2::<i64>().unwrap();
        assert_eq!(text[0], vec![1, 2, 3, 0, 11]);
        assert_eq!(batch.require(LOSS_MASK).unwrap().dims(), &[2, 5]);

        let next = loader.next_batch().unwrap().unwrap();
        let text = next.require(TEXT).unwrap().to_vec2::<i64>().unwrap();
        assert_eq!(text[0][0], 11);
    }

    #[test]
    fn memory_rows_carry_targets_and_masks() {
        let loader =
            PackedSequenceLoader::new(documents(), 0, 2, 4, LmVariant::Memory, 3, true, 7).unwrap();
        let mut loader = BlockingDataLoader::new(loader);
        let batch = loader.next_batch().unwrap().unwrap();
        let text = batch.require(TEXT).unwrap().to_vec2::<i64>().unwrap();
        let target = batch.require(TARGET).unwrap().to_vec2::<i64>().unwrap();
        assert_eq!(text[0][1..], target[0][..3]);
        assert_eq!(batch.require(ATTENTION_MASK).unwrap().dims(), &[1, 4, 7]);
    }

    #[test]
    fn runs_across_epochs() {
        let loader =
            PackedSequenceLoader::new(documents(), 0, 2, 4, LmVariant::Causal, 0, true, 3).unwrap();
        let mut loader = BlockingDataLoader::new(loader);
        for _ in 0..20 {
            assert!(loader.next_batch().unwrap().is_some());
        }
    }

    #[test]
    fn block_layout_needs_an_external_source() {
        let err = PackedSequenceLoader::new(documents(), 0, 2, 4, LmVariant::Block, 0, false, 1)
            .err()
            .unwrap();
        assert!(matches!(err, TrainingError::Unsupported(_)));
    }
}
