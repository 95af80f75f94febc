use std::path::PathBuf;

use candle_core::Tensor;
use model::LanguageModel;

use crate::{
    bootstrap::{broadcast_data_availability, DataAvailability, RunLayout},
    checkpoint::{load_checkpoint, save_checkpoint, LoadRequest, SaveRequest},
    data::BlockingDataLoader,
    distributed::ProcessGrid,
    evaluation::Evaluator,
    forward::ForwardStep,
    logging::{IterationReport, Reporter, ScalarSink, TensorBoardWriter},
    metrics::{EvaluationSummary, IntervalTimer},
    optimizer::{AdamWConfig, GradientScaler, MixedPrecisionOptimizer},
    scheduler::{AnnealingLr, LRScheduler},
    step::{train_step, StepContext},
    TrainingConfig, TrainingError,
};

/// Loop counters persisted across iterations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    pub iteration: usize,
    pub skipped_iterations: usize,
    /// Sum of iteration losses since the last progress report.
    pub total_lm_loss: f64,
}

/// Per-phase loaders. Only the data-source rank of each model-parallel
/// group holds loaders; the other ranks pass `None` everywhere.
#[derive(Default)]
pub struct DataSources {
    pub train: Option<BlockingDataLoader>,
    pub valid: Option<BlockingDataLoader>,
    pub test: Option<BlockingDataLoader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Split {
    Valid,
    Test,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub iteration: usize,
    pub skipped_iterations: usize,
    pub final_validation: Option<EvaluationSummary>,
    pub test: Option<EvaluationSummary>,
}

/// Drives pretraining for one rank of the process grid.
pub struct Pretrainer {
    config: TrainingConfig,
    layout: RunLayout,
    grid: ProcessGrid,
    model: Box<dyn LanguageModel>,
    forward: Box<dyn ForwardStep>,
    optimizer: MixedPrecisionOptimizer,
    scheduler: Box<dyn LRScheduler>,
    reporter: Reporter,
    data: DataSources,
    availability: DataAvailability,
    state: TrainingState,
    last_saved: Option<usize>,
}

impl Pretrainer {
    /// Every rank of the grid must construct its trainer; the data
    /// availability flags are agreed on here.
    pub fn new(
        config: TrainingConfig,
        layout: RunLayout,
        grid: ProcessGrid,
        model: Box<dyn LanguageModel>,
        forward: Box<dyn ForwardStep>,
        data: DataSources,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let runtime = &config.runtime;

        let scheduler = AnnealingLr::from_config(
            &config.optimizer,
            &config.scheduler,
            runtime.train_iters,
        )?;
        let mut optimizer = MixedPrecisionOptimizer::new(
            model.parameters(),
            AdamWConfig::from(&config.optimizer),
            GradientScaler::from_config(&config.precision),
            grid.clone(),
            runtime.gradient_accumulation_steps,
            config.optimizer.clip_grad,
        )?;
        // The first update runs at the warmup rate.
        optimizer.set_learning_rate(scheduler.learning_rate());
        let scheduler: Box<dyn LRScheduler> = Box::new(scheduler);

        let local = DataAvailability {
            do_train: data.train.is_some() && runtime.train_iters > 0,
            do_valid: data.valid.is_some() && runtime.eval_iters > 0,
            do_test: data.test.is_some() && runtime.eval_iters > 0,
        };
        let availability = broadcast_data_availability(local, &grid)?;

        let reporter = Self::default_reporter(&config, &grid)?;
        log::info!(
            "rank {} ready: experiment {}, train={} valid={} test={}",
            grid.rank(),
            layout.experiment,
            availability.do_train,
            availability.do_valid,
            availability.do_test
        );

        Ok(Self {
            config,
            layout,
            grid,
            model,
            forward,
            optimizer,
            scheduler,
            reporter,
            data,
            availability,
            state: TrainingState::default(),
            last_saved: None,
        })
    }

    /// Replaces the reporter; non-coordinator ranks keep a silent one.
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        if self.grid.is_coordinator() {
            self.reporter = reporter;
        }
        self
    }

    fn default_reporter(config: &TrainingConfig, grid: &ProcessGrid) -> Result<Reporter, TrainingError> {
        if !grid.is_coordinator() {
            return Ok(Reporter::silent());
        }
        let sink = match config.runtime.summary_dir.as_deref() {
            Some(dir) => {
                let writer = TensorBoardWriter::create(dir, config.runtime.log_interval)?;
                Some(Box::new(writer) as Box<dyn ScalarSink>)
            }
            None => None,
        };
        Ok(Reporter::new(config.runtime.enable_stdout, sink))
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &dyn LanguageModel {
        self.model.as_ref()
    }

    pub fn optimizer(&self) -> &MixedPrecisionOptimizer {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &dyn LRScheduler {
        self.scheduler.as_ref()
    }

    pub fn availability(&self) -> DataAvailability {
        self.availability
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Loads, trains, then runs the end-of-training validation and test
    /// passes.
    pub fn run(&mut self) -> Result<RunSummary, TrainingError> {
        self.resume()?;
        if self.availability.do_train {
            self.train()?;
        }
        let final_validation = if self.availability.do_valid {
            Some(self.evaluate("the end of training for val data", Split::Valid)?)
        } else {
            None
        };
        let test = if self.availability.do_test {
            Some(self.evaluate("the end of training for test data", Split::Test)?)
        } else {
            None
        };
        self.reporter.flush();
        Ok(RunSummary {
            iteration: self.state.iteration,
            skipped_iterations: self.state.skipped_iterations,
            final_validation,
            test,
        })
    }

    /// Restores the checkpoint under `checkpoint.load`, if configured, and
    /// fast-forwards the loaders when `resume_dataloader` is set.
    pub fn resume(&mut self) -> Result<usize, TrainingError> {
        let Some(root) = self.layout.load_root.clone() else {
            return Ok(self.state.iteration);
        };
        let loaded = load_checkpoint(LoadRequest {
            root: &root,
            grid: &self.grid,
            model: self.model.as_ref(),
            optimizer: &mut self.optimizer,
            scheduler: self.scheduler.as_mut(),
            load_optimizer: !self.config.checkpoint.no_load_optim,
            load_scheduler: !self.config.checkpoint.no_load_lr_scheduler,
        })?;
        let Some(iteration) = loaded else {
            return Ok(self.state.iteration);
        };
        self.state.iteration = iteration;
        self.last_saved = Some(iteration);

        if self.config.data.resume_dataloader {
            self.fast_forward_loaders(iteration)?;
        }
        Ok(iteration)
    }

    fn fast_forward_loaders(&mut self, iteration: usize) -> Result<(), TrainingError> {
        let runtime = &self.config.runtime;
        if let Some(loader) = self.data.train.as_mut() {
            let wanted = iteration * runtime.gradient_accumulation_steps;
            let skipped = loader.skip(wanted)?;
            log::info!("resumed train loader after {skipped} batches");
        }
        if let Some(loader) = self.data.valid.as_mut() {
            if runtime.eval_interval > 0 {
                let wanted = (iteration / runtime.eval_interval) * runtime.eval_iters;
                let skipped = loader.skip(wanted)?;
                log::info!("resumed validation loader after {skipped} batches");
            }
        }
        Ok(())
    }

    /// Runs until `train_iters`. Returns the iteration reached.
    pub fn train(&mut self) -> Result<usize, TrainingError> {
        let runtime = self.config.runtime.clone();
        let save_enabled = self.layout.save_root.is_some();
        let start_iteration = self.state.iteration;
        let mut timer = IntervalTimer::start();
        let mut mems: Vec<Tensor> = Vec::new();
        self.model.set_training(true);

        while self.state.iteration < runtime.train_iters {
            if !runtime.carry_mems_across_steps {
                mems.clear();
            }
            let output = train_step(
                StepContext {
                    forward: self.forward.as_ref(),
                    model: self.model.as_ref(),
                    optimizer: &mut self.optimizer,
                    scheduler: self.scheduler.as_mut(),
                    grid: &self.grid,
                    clip_grad: self.config.optimizer.clip_grad,
                },
                self.data.train.as_mut(),
                &mems,
            )?;
            let Some(output) = output else {
                log::warn!(
                    "training data exhausted at iteration {}",
                    self.state.iteration
                );
                break;
            };
            if runtime.carry_mems_across_steps {
                mems = output.mems;
            }

            self.state.iteration += 1;
            if output.skipped {
                self.state.skipped_iterations += 1;
            }
            self.state.total_lm_loss += output.loss;
            let iteration = self.state.iteration;

            if iteration % runtime.log_interval == 0 {
                let elapsed = timer.lap().as_secs_f64() * 1000.0;
                let report = IterationReport {
                    iteration,
                    train_iters: runtime.train_iters,
                    elapsed_ms: elapsed / runtime.log_interval as f64,
                    learning_rate: self.optimizer.learning_rate(),
                    loss: self.state.total_lm_loss / runtime.log_interval as f64,
                    loss_scale: self
                        .optimizer
                        .uses_loss_scaling()
                        .then(|| self.optimizer.loss_scale()),
                };
                self.reporter.report_iteration(&report);
                self.state.total_lm_loss = 0.0;
            }

            let save_interval = self.config.checkpoint.save_interval;
            if save_enabled && save_interval > 0 && iteration % save_interval == 0 {
                self.save()?;
            }

            if runtime.eval_interval > 0
                && iteration % runtime.eval_interval == 0
                && self.availability.do_valid
            {
                self.evaluate(&format!("iteration {iteration}"), Split::Valid)?;
            }
        }

        if save_enabled
            && self.state.iteration > start_iteration
            && self.last_saved != Some(self.state.iteration)
        {
            self.save()?;
        }
        if self.state.skipped_iterations > 0 {
            log::info!(
                "{} of {} iterations skipped on gradient overflow",
                self.state.skipped_iterations,
                self.state.iteration
            );
        }
        Ok(self.state.iteration)
    }

    /// Writes the full training state at the current iteration.
    pub fn save(&mut self) -> Result<Option<PathBuf>, TrainingError> {
        let Some(root) = self.layout.save_root.as_deref() else {
            return Ok(None);
        };
        let directory = save_checkpoint(SaveRequest {
            root,
            iteration: self.state.iteration,
            grid: &self.grid,
            model: self.model.as_ref(),
            optimizer: &self.optimizer,
            scheduler: self.scheduler.as_ref(),
        })?;
        self.last_saved = Some(self.state.iteration);
        Ok(Some(directory))
    }

    fn evaluate(
        &mut self,
        prefix: &str,
        split: Split,
    ) -> Result<EvaluationSummary, TrainingError> {
        let evaluator = Evaluator {
            forward: self.forward.as_ref(),
            model: self.model.as_ref(),
            grid: &self.grid,
            eval_iters: self.config.runtime.eval_iters,
            log_interval: self.config.runtime.log_interval,
        };
        let loader = match split {
            Split::Valid => self.data.valid.as_mut(),
            Split::Test => self.data.test.as_mut(),
        };
        evaluator.evaluate_and_report(prefix, loader, &mut self.reporter, self.state.iteration)
    }
}
