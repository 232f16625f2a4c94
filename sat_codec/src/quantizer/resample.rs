//! Per-stage temporal resampling.
//!
//! A stage with resolution factor `s` quantizes one vector per window of `s`
//! embedding timesteps. Going down averages each window (the trailing window
//! is padded by replicating the last timestep); going up holds each vector
//! over its window. An optional `phi` convolution refines the upsampled
//! contribution at full resolution.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder, conv1d};

/// Blend between the upsampled contribution and its `phi` refinement.
const PHI_RESIDUAL_RATIO: f64 = 0.5;

/// Learned refinement applied after upsampling.
///
/// `out = (1 - r) * x + r * conv(x)`, with a same-length convolution.
#[derive(Debug, Clone)]
struct Phi {
    conv: Conv1d,
}

impl Phi {
    fn new(channels: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv1dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        let conv = conv1d(channels, channels, kernel_size, config, vb)?;
        Ok(Self { conv })
    }
}

impl Module for Phi {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.contiguous()?;
        let refined = self.conv.forward(&xs)?;
        xs.affine(1.0 - PHI_RESIDUAL_RATIO, 0.)? + refined.affine(PHI_RESIDUAL_RATIO, 0.)?
    }
}

/// Up/down-sampling operator owned by one codebook stage.
#[derive(Debug, Clone)]
pub struct StageResampler {
    factor: usize,
    phi: Option<Phi>,
}

impl StageResampler {
    /// Create a resampler.
    ///
    /// # Arguments
    /// * `factor` - Timesteps per quantized vector (1 = full resolution)
    /// * `channels` - Embedding dimension the `phi` kernel operates on
    /// * `phi_kernel` - Kernel size of the refinement convolution, if any
    /// * `vb` - Variable builder scoped to the stage
    pub fn new(
        factor: usize,
        channels: usize,
        phi_kernel: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if factor == 0 {
            candle_core::bail!("resampling factor must be positive");
        }
        let phi = match phi_kernel {
            Some(kernel_size) => Some(Phi::new(channels, kernel_size, vb.pp("phi"))?),
            None => None,
        };
        Ok(Self { factor, phi })
    }

    /// Resampler without a refinement kernel.
    pub fn identity_phi(factor: usize) -> Self {
        Self {
            factor: factor.max(1),
            phi: None,
        }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn has_phi(&self) -> bool {
        self.phi.is_some()
    }

    /// Number of quantized vectors covering `len` timesteps.
    pub fn working_len(&self, len: usize) -> usize {
        len.div_ceil(self.factor)
    }

    /// (batch, dim, T) -> (batch, dim, ceil(T / factor))
    pub fn downsample(&self, xs: &Tensor) -> Result<Tensor> {
        if self.factor == 1 {
            return Ok(xs.clone());
        }
        let (b, d, t) = xs.dims3()?;
        let tk = self.working_len(t);
        let padded = xs.pad_with_same(2, 0, tk * self.factor - t)?;
        padded
            .contiguous()?
            .reshape((b, d, tk, self.factor))?
            .mean(3)
    }

    /// (batch, dim, Tk) -> (batch, dim, len), followed by `phi` if present.
    pub fn upsample(&self, xs: &Tensor, len: usize) -> Result<Tensor> {
        let up = if self.factor == 1 {
            xs.clone()
        } else {
            let (b, d, tk) = xs.dims3()?;
            xs.unsqueeze(3)?
                .broadcast_as((b, d, tk, self.factor))?
                .contiguous()?
                .reshape((b, d, tk * self.factor))?
                .narrow(2, 0, len)?
        };
        match &self.phi {
            Some(phi) => phi.forward(&up),
            None => Ok(up),
        }
    }

    /// Hold each stage code over its window: (batch, Tk) -> (batch, len).
    pub fn expand_codes(&self, codes: &Tensor, len: usize) -> Result<Tensor> {
        if self.factor == 1 {
            return Ok(codes.clone());
        }
        let (b, tk) = codes.dims2()?;
        codes
            .unsqueeze(2)?
            .broadcast_as((b, tk, self.factor))?
            .contiguous()?
            .reshape((b, tk * self.factor))?
            .narrow(1, 0, len)
    }

    /// Inverse of `expand_codes`: (batch, T) -> (batch, ceil(T / factor)).
    pub fn gather_codes(&self, codes: &Tensor) -> Result<Tensor> {
        let codes = codes.contiguous()?;
        if self.factor == 1 {
            return Ok(codes);
        }
        let t = codes.dim(1)?;
        let positions: Vec<u32> = (0..self.working_len(t))
            .map(|i| (i * self.factor) as u32)
            .collect();
        let positions = Tensor::new(positions.as_slice(), codes.device())?;
        codes.index_select(&positions, 1)
    }
}
