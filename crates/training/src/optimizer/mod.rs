pub mod adamw;
pub mod mixed;
pub mod scaler;

pub use adamw::{AdamW, AdamWConfig, OptimizerState, ParameterState};
pub use mixed::{MixedPrecisionOptimizer, StepOutcome};
pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};
