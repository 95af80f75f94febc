use candle_core::{DType, Device, Result, Tensor};

use crate::language_model::{LanguageModel, ModelOutput, NamedParameter};

/// Runs a reduced-precision model and hands fp32 logits back to the loss.
pub struct HalfPrecision<M: LanguageModel> {
    inner: M,
}

impl<M: LanguageModel> HalfPrecision<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: LanguageModel> LanguageModel for HalfPrecision<M> {
    fn forward(
        &self,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: &Tensor,
        mems: &[Tensor],
    ) -> Result<ModelOutput> {
        let output = self
            .inner
            .forward(tokens, position_ids, attention_mask, mems)?;
        Ok(ModelOutput {
            logits: output.logits.to_dtype(DType::F32)?,
            mems: output.mems,
        })
    }

    fn parameters(&self) -> Vec<NamedParameter> {
        self.inner.parameters()
    }

    fn set_training(&self, training: bool) {
        self.inner.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.inner.is_training()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn innermost(&self) -> &dyn LanguageModel {
        self.inner.innermost()
    }
}

impl<M: LanguageModel + ?Sized> LanguageModel for Box<M> {
    fn forward(
        &self,
        tokens: &Tensor,
        position_ids: &Tensor,
        attention_mask: &Tensor,
        mems: &[Tensor],
    ) -> Result<ModelOutput> {
        (**self).forward(tokens, position_ids, attention_mask, mems)
    }

    fn parameters(&self) -> Vec<NamedParameter> {
        (**self).parameters()
    }

    fn set_training(&self, training: bool) {
        (**self).set_training(training);
    }

    fn is_training(&self) -> bool {
        (**self).is_training()
    }

    fn device(&self) -> &Device {
        (**self).device()
    }

    fn innermost(&self) -> &dyn LanguageModel {
        (**self).innermost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ModelConfig, gpt::GptModel};

    #[test]
    fn unwraps_to_the_parameter_bearing_model() -> Result<()> {
        let wrapped = HalfPrecision::new(HalfPrecision::new(GptModel::new(ModelConfig::tiny(8))?));
        let inner = wrapped.innermost();
        assert_eq!(inner.parameters().len(), wrapped.parameters().len());
        assert!(std::ptr::eq(
            inner as *const dyn LanguageModel as *const u8,
            wrapped.inner.inner.innermost() as *const dyn LanguageModel as *const u8
        ));
        Ok(())
    }
}
