use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Deterministic parameter factory; replicas seeded alike start identical.
pub(crate) struct ParamFactory {
    rng: StdRng,
    dtype: DType,
    device: Device,
}

impl ParamFactory {
    pub(crate) fn new(seed: u64, dtype: DType, device: Device) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dtype,
            device,
        }
    }

    pub(crate) fn normal(&mut self, shape: (usize, usize), std: f64) -> Result<Var> {
        let dist = Normal::new(0.0f32, std as f32)
            .map_err(|err| Error::Msg(format!("invalid init std {std}: {err}")))?;
        let count = shape.0 * shape.1;
        let values: Vec<f32> = (0..count).map(|_| dist.sample(&mut self.rng)).collect();
        let tensor = Tensor::from_vec(values, shape, &self.device)?.to_dtype(self.dtype)?;
        Var::from_tensor(&tensor)
    }

    pub(crate) fn zeros(&self, len: usize) -> Result<Var> {
        Var::zeros(len, self.dtype, &self.device)
    }

    pub(crate) fn ones(&self, len: usize) -> Result<Var> {
        Var::ones(len, self.dtype, &self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_yields_identical_weights() -> Result<()> {
        let mut a = ParamFactory::new(7, DType::F32, Device::Cpu);
        let mut b = ParamFactory::new(7, DType::F32, Device::Cpu);
        let wa = a.normal((4, 3), 0.02)?.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        let wb = b.normal((4, 3), 0.02)?.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(wa, wb);
        Ok(())
    }
}
