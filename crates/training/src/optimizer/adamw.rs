use std::collections::HashMap;

use candle_core::{DType, Tensor, Var};
use model::NamedParameter;
use serde::{Deserialize, Serialize};

use crate::{config, error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

/// Name fragments that place a parameter in the no-decay group.
pub const NO_DECAY_PATTERNS: [&str; 2] = ["bias", "layernorm"];

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.lr,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

/// AdamW with decoupled weight decay and fp32 master copies of
/// reduced-precision parameters.
#[derive(Debug)]
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl AdamW {
    pub fn new(parameters: &[NamedParameter], config: AdamWConfig) -> Result<Self, TrainingError> {
        if parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(parameters.len());
        for parameter in parameters {
            let tensor = parameter.var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    parameter.name
                )));
            }
            let device = tensor.device();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(tensor.dims(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(tensor.dims(), DType::F32, device).map_err(to_runtime_error)?;

            let master = if dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name: parameter.name.clone(),
                param: parameter.var.clone(),
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay: applies_weight_decay(&parameter.name),
            });
        }

        let decayed = params.iter().filter(|slot| slot.apply_weight_decay).count();
        log::debug!(
            "optimizer groups: {} with weight decay, {} without",
            decayed,
            params.len() - decayed
        );

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// Applies one update from fp32 gradients indexed like the parameter list.
    /// Slots without a gradient are left untouched.
    pub fn apply(&mut self, grads: &[Option<Tensor>]) -> Result<(), TrainingError> {
        if grads.len() != self.params.len() {
            return Err(TrainingError::runtime(format!(
                "optimizer expected {} gradients, got {}",
                self.params.len(),
                grads.len()
            )));
        }
        if grads.iter().all(Option::is_none) {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (slot, grad) in self.params.iter_mut().zip(grads) {
            let Some(grad) = grad else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - cfg.beta1, 0.0)?))
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?))
                .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = new_m
                .affine(scale_m, 0.0)
                .and_then(|m| m.div(&denom))
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            slot.write(&next)?;
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = shape.iter().product();
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                master: match &slot.master {
                    Some(master) => Some(flatten_to_vec(master.as_tensor(), numel)?),
                    None => None,
                },
            });
        }

        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::checkpoint(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            if dims != saved.shape {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected: usize = dims.iter().product();
            if expected != saved.first_moment.len() || expected != saved.second_moment.len() {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.first_moment = Tensor::from_vec(saved.first_moment, dims.as_slice(), &device)
                .map_err(to_runtime_error)?;
            slot.second_moment = Tensor::from_vec(saved.second_moment, dims.as_slice(), &device)
                .map_err(to_runtime_error)?;

            match (slot.master.is_some(), saved.master) {
                (true, Some(values)) => {
                    if values.len() != expected {
                        return Err(TrainingError::checkpoint(format!(
                            "optimizer master weights size mismatch for '{}'",
                            slot.name
                        )));
                    }
                    let tensor = Tensor::from_vec(values, dims.as_slice(), &device)
                        .map_err(to_runtime_error)?;
                    slot.write(&tensor)?;
                }
                (false, None) => {}
                (true, None) => {
                    return Err(TrainingError::checkpoint(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )))
                }
                (false, Some(_)) => {
                    return Err(TrainingError::checkpoint(format!(
                        "optimizer state contains master weights for '{}' but the parameter is fp32",
                        slot.name
                    )))
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainingError::checkpoint(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        self.step = state.step;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }
}

impl ParameterSlot {
    fn write(&self, next: &Tensor) -> Result<(), TrainingError> {
        if let Some(master) = self.master.as_ref() {
            master.set(next).map_err(to_runtime_error)?;
        }
        let cast = if self.dtype == DType::F32 {
            next.clone()
        } else {
            next.to_dtype(self.dtype).map_err(to_runtime_error)?
        };
        self.param.set(&cast).map_err(to_runtime_error)
    }
}

pub fn applies_weight_decay(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    !NO_DECAY_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}
