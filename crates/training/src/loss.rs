use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{error::to_runtime_error, TrainingError};

/// Token cross entropy reduced as `sum(loss * mask) / sum(mask)`.
///
/// `logits` is `[..., vocab]`, `labels` and `loss_mask` cover the leading
/// dimensions. A mask summing to zero is [`TrainingError::EmptyLossMask`].
pub fn masked_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    loss_mask: &Tensor,
) -> Result<LossOutput, TrainingError> {
    let dims = logits.dims();
    if dims.len() < 2 {
        return Err(TrainingError::runtime(
            "cross entropy expects logits with at least two dimensions",
        ));
    }
    let vocab_size = dims[dims.len() - 1];
    let token_dims = &dims[..dims.len() - 1];
    if labels.dims() != token_dims {
        return Err(TrainingError::runtime(format!(
            "labels {:?} do not match logits {:?}",
            labels.dims(),
            dims
        )));
    }
    if loss_mask.dims() != token_dims {
        return Err(TrainingError::runtime(format!(
            "loss mask {:?} does not match logits {:?}",
            loss_mask.dims(),
            dims
        )));
    }
    let token_count: usize = token_dims.iter().product();

    let mask = loss_mask
        .to_dtype(DType::F32)
        .and_then(|m| m.reshape(token_count))
        .map_err(to_runtime_error)?;
    let mask_sum = mask
        .sum_all()
        .and_then(|s| s.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    if mask_sum == 0.0 {
        return Err(TrainingError::EmptyLossMask);
    }

    let logits_flat = logits
        .to_dtype(DType::F32)
        .and_then(|l| l.reshape((token_count, vocab_size)))
        .map_err(to_runtime_error)?;
    let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

    let targets = labels
        .to_device(logits.device())
        .and_then(|t| t.to_dtype(DType::U32))
        .and_then(|t| t.reshape((token_count, 1)))
        .map_err(to_runtime_error)?;
    let losses = log_probs
        .gather(&targets, 1)
        .and_then(|l| l.squeeze(1))
        .and_then(|l| l.neg())
        .map_err(to_runtime_error)?;

    let loss = (&losses * &mask)
        .and_then(|l| l.sum_all())
        .and_then(|l| l.affine(1.0 / mask_sum as f64, 0.0))
        .map_err(to_runtime_error)?;
    let value = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

    Ok(LossOutput {
        loss,
        value,
    })
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar loss still attached to the autograd graph.
    pub loss: Tensor,
    pub value: f32,
}

/// `exp(min(20, loss))`.
pub fn perplexity(loss: f64) -> f64 {
    loss.min(20.0).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn averages_over_the_mask_not_the_element_count() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[2f32, 0.0], [0.0, 2.0], [5.0, -5.0]]], &device).unwrap();
        let labels = Tensor::new(&[[0i64, 0, 1]], &device).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &device).unwrap();

        let out = masked_cross_entropy(&logits, &labels, &mask).unwrap();

        let easy = (1.0 + (-2f32).exp()).ln();
        let hard = (1.0 + 2f32.exp()).ln();
        assert!((out.value - (easy + hard) / 2.0).abs() < 1e-5);
    }

    #[test]
    fn empty_mask_is_an_error() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let labels = Tensor::zeros((1, 2), DType::I64, &device).unwrap();
        let mask = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
        assert!(matches!(
            masked_cross_entropy(&logits, &labels, &mask),
            Err(TrainingError::EmptyLossMask)
        ));
    }

    #[test]
    fn scores_choice_logits() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0f32, 0.0, 0.0, 0.0]], &device).unwrap();
        let labels = Tensor::new(&[2i64], &device).unwrap();
        let mask = Tensor::ones(1, DType::F32, &device).unwrap();
        let out = masked_cross_entropy(&logits, &labels, &mask).unwrap();
        assert!((out.value - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn perplexity_is_capped() {
        assert_eq!(perplexity(50.0), 20f64.exp());
        assert!((perplexity(0.0) - 1.0).abs() < 1e-12);
    }
}
