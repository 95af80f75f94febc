pub mod bootstrap;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod evaluation;
pub mod forward;
pub mod logging;
pub mod loss;
pub mod masking;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod step;
pub mod trainer;

#[cfg(test)]
mod test_support;

pub use bootstrap::{
    broadcast_data_availability, build_forward_step, build_model, check_supported,
    set_random_seed, DataAvailability, ProcessSeeds, RunLayout,
};
pub use config::{LmVariant, TrainingConfig};
pub use data::{BlockingDataLoader, DataLoader, InMemoryDataLoader, RawBatch};
pub use distributed::{Communicator, LocalCluster, ProcessGrid, ReduceOp, SingleProcess};
pub use error::TrainingError;
pub use evaluation::Evaluator;
pub use forward::{ForwardOutput, ForwardStep, LanguageModelingStep, LmMode, MultipleChoiceStep};
pub use logging::{MemorySink, Reporter, ScalarSink, TensorBoardWriter};
pub use masking::{get_masks_and_position_ids, BatchMasks, MaskMode, MaskingPolicy};
pub use metrics::EvaluationSummary;
pub use optimizer::{MixedPrecisionOptimizer, StepOutcome};
pub use scheduler::{AnnealingLr, DecayStyle, LRScheduler};
pub use step::{backward_step, train_step, StepContext, TrainStepOutput};
pub use trainer::{DataSources, Pretrainer, RunSummary, TrainingState};
