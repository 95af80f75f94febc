use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    /// Advances one iteration and returns the new learning rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    /// Iterations taken so far.
    fn steps(&self) -> usize;
    fn snapshot(&self) -> SchedulerState;
    fn load_snapshot(&mut self, state: SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayStyle {
    #[default]
    Linear,
    Cosine,
    Exponential,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub start_lr: f64,
    pub warmup_iter: f64,
    pub end_iter: usize,
    pub num_iters: usize,
    pub decay_style: DecayStyle,
    pub decay_ratio: f64,
}

/// Linear warmup followed by a decay toward `start_lr * decay_ratio`.
///
/// During warmup (`num_iters <= warmup_iter`) the rate is
/// `start_lr * num_iters / warmup_iter`. Past warmup, progress is
/// `(num_iters - warmup_iter) / end_iter`, clamped to 1.
#[derive(Debug, Clone)]
pub struct AnnealingLr {
    start_lr: f64,
    warmup_iter: f64,
    end_iter: usize,
    num_iters: usize,
    decay_style: DecayStyle,
    decay_ratio: f64,
}

impl AnnealingLr {
    pub fn new(
        start_lr: f64,
        warmup_iter: f64,
        end_iter: usize,
        decay_style: DecayStyle,
        decay_ratio: f64,
    ) -> Result<Self, TrainingError> {
        if start_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if !(0.0..=1.0).contains(&decay_ratio) {
            return Err(TrainingError::initialization(
                "scheduler decay ratio must be in [0, 1]",
            ));
        }
        Ok(Self {
            start_lr,
            warmup_iter: warmup_iter.max(0.0),
            end_iter: end_iter.max(1),
            num_iters: 0,
            decay_style,
            decay_ratio,
        })
    }

    /// Decay horizon is `lr_decay_iters`, falling back to `train_iters`;
    /// warmup covers `warmup` of that horizon.
    pub fn from_config(
        optimizer: &config::OptimizerConfig,
        scheduler: &config::SchedulerConfig,
        train_iters: usize,
    ) -> Result<Self, TrainingError> {
        let horizon = scheduler.lr_decay_iters.unwrap_or(train_iters).max(1);
        Self::new(
            optimizer.lr,
            scheduler.warmup * horizon as f64,
            horizon,
            scheduler.lr_decay_style,
            scheduler.lr_decay_ratio,
        )
    }

    fn compute_lr(&self) -> f64 {
        let iters = self.num_iters as f64;
        if self.warmup_iter > 0.0 && iters <= self.warmup_iter {
            return self.start_lr * iters / self.warmup_iter;
        }
        let progress = ((iters - self.warmup_iter) / self.end_iter as f64).clamp(0.0, 1.0);
        let end_lr = self.start_lr * self.decay_ratio;
        match self.decay_style {
            DecayStyle::Linear => self.start_lr - (self.start_lr - end_lr) * progress,
            DecayStyle::Cosine => {
                end_lr + (self.start_lr - end_lr) * 0.5 * (1.0 + f64::cos(PI * progress))
            }
            DecayStyle::Exponential => self.start_lr * self.decay_ratio.powf(progress),
            DecayStyle::Constant => self.start_lr,
        }
    }
}

impl LRScheduler for AnnealingLr {
    fn step(&mut self) -> f64 {
        self.num_iters = self.num_iters.saturating_add(1);
        self.compute_lr()
    }

    fn learning_rate(&self) -> f64 {
        self.compute_lr()
    }

    fn steps(&self) -> usize {
        self.num_iters
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            start_lr: self.start_lr,
            warmup_iter: self.warmup_iter,
            end_iter: self.end_iter,
            num_iters: self.num_iters,
            decay_style: self.decay_style,
            decay_ratio: self.decay_ratio,
        }
    }

    fn load_snapshot(&mut self, state: SchedulerState) -> Result<(), TrainingError> {
        if state.end_iter == 0 {
            return Err(TrainingError::checkpoint(
                "scheduler state has a zero decay horizon",
            ));
        }
        self.start_lr = state.start_lr;
        self.warmup_iter = state.warmup_iter;
        self.end_iter = state.end_iter;
        self.num_iters = state.num_iters;
        self.decay_style = state.decay_style;
        self.decay_ratio = state.decay_ratio;
        Ok(())
    }
}
