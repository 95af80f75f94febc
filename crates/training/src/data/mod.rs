use std::collections::BTreeMap;

use candle_core::Tensor;
use futures::future::BoxFuture;

use crate::TrainingError;

pub mod batch;
pub mod packed;

pub use batch::{batch_keys, broadcast_data, get_batch, Batch, BatchContext};
pub use packed::{tokenize_documents, PackedSequenceLoader};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

pub const TEXT: &str = "text";
pub const LOSS_MASK: &str = "loss_mask";
pub const TARGET: &str = "target";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const POSITION_ID: &str = "position_id";
pub const LABEL: &str = "label";

/// Named integer tensors produced by a data source.
#[derive(Debug, Clone, Default)]
pub struct RawBatch {
    fields: BTreeMap<String, Tensor>,
}

impl RawBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(key, tensor);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.fields.insert(key.into(), tensor);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.fields.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&Tensor> {
        self.get(key)
            .ok_or_else(|| TrainingError::runtime(format!("batch is missing '{key}'")))
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<RawBatch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader {
    inner: Box<dyn DataLoader>,
    consumed: usize,
}

impl BlockingDataLoader {
    pub fn new(inner: impl DataLoader + 'static) -> Self {
        Self::from_boxed(Box::new(inner))
    }

    pub fn from_boxed(inner: Box<dyn DataLoader>) -> Self {
        Self { inner, consumed: 0 }
    }

    pub fn next_batch(&mut self) -> Result<Option<RawBatch>> {
        let batch = futures::executor::block_on(self.inner.next_batch())?;
        if batch.is_some() {
            self.consumed += 1;
        }
        Ok(batch)
    }

    /// Discards `count` batches; used to fast-forward a resumed run.
    pub fn skip(&mut self, count: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < count {
            if self.next_batch()?.is_none() {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

/// Loader over batches already held in memory, optionally repeating them.
pub struct InMemoryDataLoader {
    batches: Vec<RawBatch>,
    cursor: usize,
    repeat: bool,
}

impl InMemoryDataLoader {
    pub fn new(batches: Vec<RawBatch>) -> Self {
        Self {
            batches,
            cursor: 0,
            repeat: false,
        }
    }

    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }
}

impl DataLoader for InMemoryDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<RawBatch>>> {
        Box::pin(async move {
            if self.cursor >= self.batches.len() {
                if !self.repeat || self.batches.is_empty() {
                    return Ok(None);
                }
                self.cursor = 0;
            }
            let batch = self.batches[self.cursor].clone();
            self.cursor += 1;
            Ok(Some(batch))
        })
    }
}
