use candle_core::Tensor;
use model::LanguageModel;

use crate::{
    data::BlockingDataLoader,
    distributed::{all_reduce_scalar, ProcessGrid, ReduceOp},
    forward::{ForwardOutput, ForwardStep},
    optimizer::{MixedPrecisionOptimizer, StepOutcome},
    scheduler::LRScheduler,
    TrainingError,
};

/// Back-propagates one micro-step and returns the loss averaged over the
/// data-parallel group.
///
/// Without delegated accumulation this also reduces the gradients, unscales
/// them into the master copies and clips them, so the following
/// [`MixedPrecisionOptimizer::step`] only has to apply.
pub fn backward_step(
    optimizer: &mut MixedPrecisionOptimizer,
    output: &ForwardOutput,
    grid: &ProcessGrid,
    clip_grad: f64,
) -> Result<f32, TrainingError> {
    let delegated = optimizer.is_delegated();
    if !delegated {
        optimizer.zero_grad();
    }
    optimizer.backward(&output.loss)?;

    let group = grid.data_parallel();
    let reduced = all_reduce_scalar(group, output.value, ReduceOp::Sum)? / group.size() as f32;

    if !delegated {
        optimizer.reduce_gradients()?;
        optimizer.update_master_grads()?;
        if clip_grad > 0.0 {
            optimizer.clip_master_grads(clip_grad)?;
        }
    }
    Ok(reduced)
}

#[derive(Debug)]
pub struct TrainStepOutput {
    /// Reduced loss averaged over the micro-steps of this iteration.
    pub loss: f64,
    pub skipped: bool,
    pub micro_steps: usize,
    /// Detached memory produced by the last micro-step.
    pub mems: Vec<Tensor>,
}

/// Everything one optimizer iteration touches.
pub struct StepContext<'a> {
    pub forward: &'a dyn ForwardStep,
    pub model: &'a dyn LanguageModel,
    pub optimizer: &'a mut MixedPrecisionOptimizer,
    pub scheduler: &'a mut dyn LRScheduler,
    pub grid: &'a ProcessGrid,
    pub clip_grad: f64,
}

/// Runs micro-steps until the optimizer applies or skips an update.
///
/// The scheduler advances only after an applied update; a skipped step
/// leaves it untouched. Returns `None` when the data source runs dry before
/// the first micro-step.
pub fn train_step(
    context: StepContext<'_>,
    mut loader: Option<&mut BlockingDataLoader>,
    mems: &[Tensor],
) -> Result<Option<TrainStepOutput>, TrainingError> {
    let StepContext {
        forward,
        model,
        optimizer,
        scheduler,
        grid,
        clip_grad,
    } = context;

    let mut mems = mems.to_vec();
    let mut total = 0f64;
    let mut micro_steps = 0usize;
    loop {
        let Some(output) = forward.forward(loader.as_deref_mut(), model, &mems)? else {
            if micro_steps == 0 {
                return Ok(None);
            }
            return Err(TrainingError::runtime(format!(
                "data source exhausted after {micro_steps} micro-steps of an accumulation window"
            )));
        };
        total += backward_step(optimizer, &output, grid, clip_grad)? as f64;
        micro_steps += 1;
        mems = output.mems.iter().map(Tensor::detach).collect();

        match optimizer.step()? {
            StepOutcome::Accumulating => continue,
            StepOutcome::Applied => {
                let lr = scheduler.step();
                optimizer.set_learning_rate(lr);
                return Ok(Some(TrainStepOutput {
                    loss: total / micro_steps as f64,
                    skipped: false,
                    micro_steps,
                    mems,
                }));
            }
            StepOutcome::Skipped => {
                return Ok(Some(TrainStepOutput {
                    loss: total / micro_steps as f64,
                    skipped: true,
                    micro_steps,
                    mems,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        forward::LmMode,
        optimizer::{AdamWConfig, GradientScaler, LossScaleConfig},
        scheduler::{AnnealingLr, DecayStyle},
        test_support::{ScalarModel, ScriptedStep},
    };

    fn adam() -> AdamWConfig {
        AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    fn optimizer(model: &ScalarModel, scaler: GradientScaler, accumulation: usize) -> MixedPrecisionOptimizer {
        MixedPrecisionOptimizer::new(
            model.parameters(),
            adam(),
            scaler,
            ProcessGrid::single(),
            accumulation,
            1.0,
        )
        .unwrap()
    }

    fn scheduler() -> AnnealingLr {
        AnnealingLr::new(0.1, 0.0, 100, DecayStyle::Linear, 0.1).unwrap()
    }

    #[test]
    fn applied_step_advances_the_scheduler() {
        let model = ScalarModel::new(1.0);
        let mut opt = optimizer(&model, GradientScaler::disabled(), 1);
        let mut lr = scheduler();
        let step = ScriptedStep::new(vec![(2.0, LmMode::Causal)]);
        let grid = ProcessGrid::single();

        let output = train_step(
            StepContext {
                forward: &step,
                model: &model,
                optimizer: &mut opt,
                scheduler: &mut lr,
                grid: &grid,
                clip_grad: 1.0,
            },
            None,
            &[],
        )
        .unwrap()
        .unwrap();

        assert!(!output.skipped);
        assert_eq!(output.loss, 2.0);
        assert_eq!(lr.steps(), 1);
        assert_eq!(opt.learning_rate(), lr.learning_rate());
        assert!(model.value() < 1.0);
    }

    #[test]
    fn overflow_holds_the_scheduler() {
        let model = ScalarModel::new(1.0);
        let scaler = GradientScaler::dynamic(LossScaleConfig {
            hysteresis: 1,
            ..LossScaleConfig::default()
        });
        let mut opt = optimizer(&model, scaler, 1);
        let mut lr = scheduler();
        let step = ScriptedStep::new(vec![(1e30, LmMode::Causal)]);
        let grid = ProcessGrid::single();

        let output = train_step(
            StepContext {
                forward: &step,
                model: &model,
                optimizer: &mut opt,
                scheduler: &mut lr,
                grid: &grid,
                clip_grad: 1.0,
            },
            None,
            &[],
        )
        .unwrap()
        .unwrap();

        assert!(output.skipped);
        assert_eq!(lr.steps(), 0);
        assert_eq!(model.value(), 1.0);
    }

    #[test]
    fn accumulation_runs_until_the_boundary() {
        let model = ScalarModel::new(1.0);
        let mut opt = optimizer(&model, GradientScaler::disabled(), 3);
        let mut lr = scheduler();
        let step = ScriptedStep::new(vec![
            (1.0, LmMode::Causal),
            (2.0, LmMode::Causal),
            (3.0, LmMode::Causal),
        ]);
        let grid = ProcessGrid::single();

        let output = train_step(
            StepContext {
                forward: &step,
                model: &model,
                optimizer: &mut opt,
                scheduler: &mut lr,
                grid: &grid,
                clip_grad: 0.0,
            },
            None,
            &[],
        )
        .unwrap()
        .unwrap();

        assert_eq!(output.micro_steps, 3);
        assert_eq!(output.loss, 2.0);
        assert_eq!(lr.steps(), 1);
        assert_eq!(step.remaining(), 0);
    }

    #[test]
    fn exhausted_source_ends_training() {
        let model = ScalarModel::new(1.0);
        let mut opt = optimizer(&model, GradientScaler::disabled(), 1);
        let mut lr = scheduler();
        let step = ScriptedStep::new(Vec::new());
        let grid = ProcessGrid::single();

        let output = train_step(
            StepContext {
                forward: &step,
                model: &model,
                optimizer: &mut opt,
                scheduler: &mut lr,
                grid: &grid,
                clip_grad: 1.0,
            },
            None,
            &[],
        )
        .unwrap();
        assert!(output.is_none());
    }

    #[test]
    fn mems_come_back_detached() {
        let model = ScalarModel::new(1.0);
        let mut opt = optimizer(&model, GradientScaler::disabled(), 1);
        let mut lr = scheduler();
        let step = ScriptedStep::new(vec![(1.0, LmMode::Causal)]);
        let grid = ProcessGrid::single();

        let output = train_step(
            StepContext {
                forward: &step,
                model: &model,
                optimizer: &mut opt,
                scheduler: &mut lr,
                grid: &grid,
                clip_grad: 1.0,
            },
            None,
            &[],
        )
        .unwrap()
        .unwrap();
        assert_eq!(output.mems.len(), 1);
        assert!(!output.mems[0].is_variable());
    }
}
