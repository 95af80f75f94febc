use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::PrecisionConfig, error::to_runtime_error, TrainingError};

#[derive(Debug, Clone, PartialEq)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub scale_factor: f32,
    pub scale_window: usize,
    pub min_scale: f32,
    /// Overflows tolerated before the scale is actually lowered.
    pub hysteresis: usize,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(32),
            scale_factor: 2.0,
            scale_window: 1000,
            min_scale: 1.0,
            hysteresis: 2,
        }
    }
}

impl From<&PrecisionConfig> for LossScaleConfig {
    fn from(value: &PrecisionConfig) -> Self {
        Self {
            initial_scale: 2f32.powi(value.initial_scale_power as i32),
            scale_window: value.loss_scale_window,
            min_scale: value.min_scale,
            hysteresis: value.hysteresis,
            ..Self::default()
        }
    }
}

/// Loss scaling for fp16 training.
///
/// A static scaler never reports overflow. The dynamic scaler lowers the
/// scale after `hysteresis` overflows and raises it every `scale_window`
/// clean iterations since the last overflow.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Static(f32),
    Dynamic(DynamicState),
}

#[derive(Debug, Clone)]
struct DynamicState {
    config: LossScaleConfig,
    cur_scale: f32,
    cur_iter: i64,
    last_overflow_iter: i64,
    cur_hysteresis: usize,
}

impl GradientScaler {
    pub fn disabled() -> Self {
        Self {
            state: ScalerState::Disabled,
        }
    }

    pub fn fixed(scale: f32) -> Self {
        Self {
            state: ScalerState::Static(scale),
        }
    }

    pub fn dynamic(config: LossScaleConfig) -> Self {
        let config = sanitize_config(config);
        Self {
            state: ScalerState::Dynamic(DynamicState {
                cur_scale: config.initial_scale,
                cur_iter: 0,
                last_overflow_iter: -1,
                cur_hysteresis: config.hysteresis,
                config,
            }),
        }
    }

    pub fn from_config(precision: &PrecisionConfig) -> Self {
        if !precision.fp16 {
            Self::disabled()
        } else if precision.dynamic_loss_scale {
            Self::dynamic(LossScaleConfig::from(precision))
        } else {
            Self::fixed(precision.loss_scale.unwrap_or(1.0))
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, ScalerState::Disabled)
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.state, ScalerState::Dynamic(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Static(scale) => *scale,
            ScalerState::Dynamic(state) => state.cur_scale,
        }
    }

    /// Whether any gradient is non-finite. Only a dynamic scaler looks.
    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        if !self.is_dynamic() {
            return Ok(false);
        }
        for tensor in tensors {
            if contains_non_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn update(&mut self, overflow: bool) {
        let ScalerState::Dynamic(state) = &mut self.state else {
            return;
        };
        if overflow {
            if state.config.hysteresis == 1 || state.cur_hysteresis == 1 {
                state.cur_scale =
                    (state.cur_scale / state.config.scale_factor).max(state.config.min_scale);
            } else {
                state.cur_hysteresis -= 1;
            }
            state.last_overflow_iter = state.cur_iter;
        } else if (state.cur_iter - state.last_overflow_iter) % state.config.scale_window as i64
            == 0
        {
            state.cur_hysteresis = state.config.hysteresis;
            state.cur_scale *= state.config.scale_factor;
        }
        state.cur_iter += 1;
    }

    pub fn state(&self) -> GradientScalerState {
        match &self.state {
            ScalerState::Disabled => GradientScalerState::Disabled,
            ScalerState::Static(scale) => GradientScalerState::Static { scale: *scale },
            ScalerState::Dynamic(state) => GradientScalerState::Dynamic {
                cur_scale: state.cur_scale,
                cur_iter: state.cur_iter,
                last_overflow_iter: state.last_overflow_iter,
                cur_hysteresis: state.cur_hysteresis,
            },
        }
    }

    pub fn load_state(&mut self, saved: GradientScalerState) -> Result<(), TrainingError> {
        match (&mut self.state, saved) {
            (ScalerState::Disabled, GradientScalerState::Disabled) => Ok(()),
            (ScalerState::Static(scale), GradientScalerState::Static { scale: saved }) => {
                *scale = saved;
                Ok(())
            }
            (
                ScalerState::Dynamic(state),
                GradientScalerState::Dynamic {
                    cur_scale,
                    cur_iter,
                    last_overflow_iter,
                    cur_hysteresis,
                },
            ) => {
                state.cur_scale = cur_scale;
                state.cur_iter = cur_iter;
                state.last_overflow_iter = last_overflow_iter;
                state.cur_hysteresis = cur_hysteresis;
                Ok(())
            }
            (_, saved) => Err(TrainingError::checkpoint(format!(
                "loss scaler state {saved:?} does not match the configured precision"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GradientScalerState {
    Disabled,
    Static {
        scale: f32,
    },
    Dynamic {
        cur_scale: f32,
        cur_iter: i64,
        last_overflow_iter: i64,
        cur_hysteresis: usize,
    },
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.abs())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.scale_factor < 1.0 {
        config.scale_factor = 2.0;
    }
    if config.scale_window == 0 {
        config.scale_window = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.hysteresis == 0 {
        config.hysteresis = 1;
    }
    config.initial_scale = config.initial_scale.max(config.min_scale);
    config
}
