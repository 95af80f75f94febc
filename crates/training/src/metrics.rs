use std::time::{Duration, Instant};

use crate::{forward::LmMode, loss::perplexity};

/// Wall-clock time since the last reset.
#[derive(Debug)]
pub struct IntervalTimer {
    started: Instant,
}

impl IntervalTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Elapsed time and a fresh start.
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.started);
        self.started = now;
        elapsed
    }
}

/// Evaluation losses bucketed by [`LmMode`].
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    total_loss: f64,
    gpt_loss: f64,
    bert_loss: f64,
    gpt_iters: usize,
    mask_iters: usize,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, mode: LmMode) {
        self.total_loss += loss;
        match mode {
            LmMode::Causal => {
                self.gpt_loss += loss;
                self.gpt_iters += 1;
            }
            LmMode::FullContext => {
                self.bert_loss += loss;
                self.mask_iters += 1;
            }
        }
    }

    /// The overall loss is averaged over `eval_iters`; each bucket over its
    /// own count, with an empty bucket reported as zero.
    pub fn finalize(self, eval_iters: usize) -> EvaluationSummary {
        let average = |sum: f64, count: usize| if count > 0 { sum / count as f64 } else { 0.0 };
        let loss = average(self.total_loss, eval_iters);
        EvaluationSummary {
            loss,
            perplexity: perplexity(loss),
            gpt_loss: average(self.gpt_loss, self.gpt_iters),
            bert_loss: average(self.bert_loss, self.mask_iters),
            gpt_iters: self.gpt_iters,
            mask_iters: self.mask_iters,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub loss: f64,
    pub perplexity: f64,
    pub gpt_loss: f64,
    pub bert_loss: f64,
    pub gpt_iters: usize,
    pub mask_iters: usize,
}
