//! Straight-through estimator as an explicit dual-path value.

use candle_core::{Result, Tensor};

/// A quantized value paired with the continuous value it replaces.
///
/// The forward path carries the quantized value; the backward path routes
/// gradients to the continuous value as if quantization were the identity.
#[derive(Debug, Clone)]
pub struct StraightThrough {
    continuous: Tensor,
    quantized: Tensor,
}

impl StraightThrough {
    pub fn new(continuous: Tensor, quantized: Tensor) -> Self {
        Self {
            continuous,
            quantized,
        }
    }

    /// `continuous + detach(quantized - continuous)`
    pub fn into_tensor(self) -> Result<Tensor> {
        let offset = (&self.quantized - &self.continuous)?.detach();
        self.continuous + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn test_forward_pass_sees_quantized_value() -> Result<()> {
        let device = Device::Cpu;
        let continuous = Tensor::new(&[0.3f32, -1.2, 2.6], &device)?;
        let quantized = Tensor::new(&[0.0f32, -1.0, 3.0], &device)?;

        let out = StraightThrough::new(continuous, quantized).into_tensor()?;
        let values = out.to_vec1::<f32>()?;
        for (got, want) in values.iter().zip([0.0f32, -1.0, 3.0]) {
            assert!((got - want).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_gradient_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let continuous = Var::new(&[0.3f32, -1.2, 2.6], &device)?;
        let quantized = Tensor::new(&[0.0f32, -1.0, 3.0], &device)?;

        let out = StraightThrough::new(continuous.as_tensor().clone(), quantized).into_tensor()?;
        let grads = out.affine(2.0, 0.)?.sum_all()?.backward()?;
        let grad = grads
            .get(continuous.as_tensor())
            .expect("gradient for continuous input");
        assert_eq!(grad.to_vec1::<f32>()?, vec![2.0, 2.0, 2.0]);
        Ok(())
    }
}
