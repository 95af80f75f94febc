use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{metrics::EvaluationSummary, TrainingError};

/// Destination for named scalars keyed by iteration.
pub trait ScalarSink: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<(), TrainingError>;

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Progress lines and evaluation banners for the coordinating rank.
///
/// Non-coordinator ranks get a silent reporter so call sites need no rank
/// checks of their own.
pub struct Reporter {
    enable_stdout: bool,
    sink: Option<Box<dyn ScalarSink>>,
}

impl Reporter {
    pub fn new(enable_stdout: bool, sink: Option<Box<dyn ScalarSink>>) -> Self {
        Self {
            enable_stdout,
            sink,
        }
    }

    pub fn silent() -> Self {
        Self::new(false, None)
    }

    pub fn report_iteration(&mut self, report: &IterationReport) {
        if self.enable_stdout {
            println!("{}", report.format_line());
        }
        let step = report.iteration;
        self.emit("Train/lr", report.learning_rate, step);
        self.emit("Train/train_loss", report.loss, step);
        self.emit("Train/elapsed_time", report.elapsed_ms, step);
    }

    pub fn report_evaluation(&mut self, prefix: &str, summary: &EvaluationSummary, step: usize) {
        if self.enable_stdout {
            println!("{}", "-".repeat(100));
            println!("{}", evaluation_banner(prefix, summary));
        }
        self.emit("Train/valid_ppl", summary.perplexity, step);
        self.emit("Train/valid_loss", summary.loss, step);
        if summary.gpt_loss != 0.0 {
            self.emit("Train/valid_gpt_loss", summary.gpt_loss, step);
        }
        if summary.bert_loss != 0.0 {
            self.emit("Train/valid_bert_loss", summary.bert_loss, step);
        }
    }

    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.flush() {
                log::warn!("failed to flush scalar sink: {err}");
            }
        }
    }

    fn emit(&mut self, tag: &str, value: f64, step: usize) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.add_scalar(tag, value, step) {
                log::warn!("failed to record {tag}: {err}");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub train_iters: usize,
    pub elapsed_ms: f64,
    pub learning_rate: f64,
    pub loss: f64,
    /// Present when fp16 loss scaling is active.
    pub loss_scale: Option<f32>,
}

impl IterationReport {
    pub fn format_line(&self) -> String {
        let mut line = format!(" iteration {:8}/{:8} |", self.iteration, self.train_iters);
        line += &format!(" elapsed time per iteration (ms): {:.1} |", self.elapsed_ms);
        line += &format!(" learning rate {} |", scientific(self.learning_rate, 3));
        line += &format!(" lm loss {} |", scientific(self.loss, 6));
        if let Some(scale) = self.loss_scale {
            line += &format!(" loss scale {scale:.1} |");
        }
        line
    }
}

/// Evaluation result framed by dashes one longer than the text.
pub fn evaluation_banner(prefix: &str, summary: &EvaluationSummary) -> String {
    let mut text = format!(" validation loss at {prefix}");
    text += &format!(" | LM loss: {}", scientific(summary.loss, 6));
    text += &format!(" | LM PPL: {}", scientific(summary.perplexity, 6));
    if summary.gpt_loss != 0.0 && summary.bert_loss != 0.0 {
        text += &format!(" | GPT loss: {}", scientific(summary.gpt_loss, 6));
        text += &format!(" | BERT loss: {}", scientific(summary.bert_loss, 6));
    }
    let rule = "-".repeat(text.len() + 1);
    format!("{rule}\n{text}\n{rule}")
}

/// Scientific notation with a signed, two-digit exponent (`1.000E-04`).
pub fn scientific(value: f64, precision: usize) -> String {
    let raw = format!("{value:.precision$E}");
    match raw.split_once('E') {
        Some((mantissa, exponent)) => match exponent.parse::<i32>() {
            Ok(exp) => {
                let sign = if exp < 0 { '-' } else { '+' };
                format!("{mantissa}E{sign}{:02}", exp.abs())
            }
            Err(_) => raw,
        },
        None => raw,
    }
}

/// Sink keeping every scalar in memory; clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<(String, f64, usize)>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<(String, f64, usize)> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn values(&self, tag: &str) -> Vec<(usize, f64)> {
        self.records()
            .into_iter()
            .filter(|(name, _, _)| name == tag)
            .map(|(_, value, step)| (step, value))
            .collect()
    }
}

impl ScalarSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<(), TrainingError> {
        self.records
            .lock()
            .map_err(|_| TrainingError::runtime("scalar record lock poisoned"))?
            .push((tag.to_string(), value, step));
        Ok(())
    }
}

/// TensorBoard event file writer.
pub struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            ScalarSink::flush(self)?;
        }
        Ok(())
    }
}

impl ScalarSink for TensorBoardWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step: step as i64,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = ScalarSink::flush(self);
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
