use candle_core::Tensor;
use model::LanguageModel;

use crate::{
    data::BlockingDataLoader,
    distributed::{all_reduce_scalar, ProcessGrid, ReduceOp},
    forward::ForwardStep,
    logging::Reporter,
    metrics::{EvaluationMetrics, EvaluationSummary},
    TrainingError,
};

/// Puts the model in eval mode; back in training mode on drop, however
/// evaluation ends.
struct EvalModeGuard<'a> {
    model: &'a dyn LanguageModel,
}

impl<'a> EvalModeGuard<'a> {
    fn enter(model: &'a dyn LanguageModel) -> Self {
        model.set_training(false);
        Self { model }
    }
}

impl Drop for EvalModeGuard<'_> {
    fn drop(&mut self) {
        self.model.set_training(true);
    }
}

pub struct Evaluator<'a> {
    pub forward: &'a dyn ForwardStep,
    pub model: &'a dyn LanguageModel,
    pub grid: &'a ProcessGrid,
    pub eval_iters: usize,
    pub log_interval: usize,
}

impl Evaluator<'_> {
    /// Runs `eval_iters` forward-only passes, threading the memory from one
    /// pass into the next. Each pass loss is averaged over the data-parallel
    /// group before it is bucketed.
    pub fn evaluate(
        &self,
        mut loader: Option<&mut BlockingDataLoader>,
    ) -> Result<EvaluationSummary, TrainingError> {
        let _mode = EvalModeGuard::enter(self.model);
        let group = self.grid.data_parallel();
        let mut metrics = EvaluationMetrics::default();
        let mut mems: Vec<Tensor> = Vec::new();
        let mut passes = 0usize;

        for iteration in 1..=self.eval_iters {
            if self.log_interval > 0 && iteration % self.log_interval == 0 {
                log::debug!("evaluating iter {iteration}/{}", self.eval_iters);
            }
            let Some(output) = self
                .forward
                .forward(loader.as_deref_mut(), self.model, &mems)?
            else {
                log::warn!(
                    "evaluation data ran out after {passes} of {} passes",
                    self.eval_iters
                );
                break;
            };
            let loss = all_reduce_scalar(group, output.value, ReduceOp::Sum)? / group.size() as f32;
            metrics.update(loss as f64, output.mode);
            mems = output.mems.iter().map(Tensor::detach).collect();
            passes += 1;
        }

        Ok(metrics.finalize(passes))
    }

    /// Evaluates and reports the result under `prefix` at `step`.
    pub fn evaluate_and_report(
        &self,
        prefix: &str,
        loader: Option<&mut BlockingDataLoader>,
        reporter: &mut Reporter,
        step: usize,
    ) -> Result<EvaluationSummary, TrainingError> {
        let summary = self.evaluate(loader)?;
        reporter.report_evaluation(prefix, &summary, step);
        Ok(summary)
    }
}
