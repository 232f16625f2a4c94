//! One quantization level: codebook, projections and resampler.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear_no_bias};

use crate::quantizer::codebook::EuclideanCodebook;
use crate::quantizer::resample::StageResampler;

/// A single stage of the multi-scale quantizer.
///
/// Residuals arrive as (batch, dimension, T). The stage moves them to its own
/// temporal resolution, projects into the codebook space when `latent_dim`
/// differs from `dimension`, and searches the codebook.
#[derive(Debug, Clone)]
pub struct CodebookStage {
    codebook: EuclideanCodebook,
    project_in: Option<Linear>,
    project_out: Option<Linear>,
    resampler: StageResampler,
}

impl CodebookStage {
    pub fn new(
        dimension: usize,
        latent_dim: usize,
        bins: usize,
        scale: usize,
        phi_kernel: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let codebook = EuclideanCodebook::new(latent_dim, bins, vb.pp("codebook"))?;

        let (project_in, project_out) = if latent_dim != dimension {
            let p_in = linear_no_bias(dimension, latent_dim, vb.pp("project_in"))?;
            let p_out = linear_no_bias(latent_dim, dimension, vb.pp("project_out"))?;
            (Some(p_in), Some(p_out))
        } else {
            (None, None)
        };

        let resampler = StageResampler::new(scale, dimension, phi_kernel, vb)?;

        Ok(Self {
            codebook,
            project_in,
            project_out,
            resampler,
        })
    }

    /// Assemble a stage from already-built parts.
    pub fn from_parts(
        codebook: EuclideanCodebook,
        project_in: Option<Linear>,
        project_out: Option<Linear>,
        resampler: StageResampler,
    ) -> Self {
        Self {
            codebook,
            project_in,
            project_out,
            resampler,
        }
    }

    pub fn bins(&self) -> usize {
        self.codebook.bins()
    }

    pub fn scale(&self) -> usize {
        self.resampler.factor()
    }

    pub fn codebook(&self) -> &EuclideanCodebook {
        &self.codebook
    }

    pub fn resampler(&self) -> &StageResampler {
        &self.resampler
    }

    /// Quantize a full-resolution residual.
    ///
    /// Input: (batch, dimension, T)
    /// Output: (batch, ceil(T / scale)) codes at the stage resolution
    pub fn encode(&self, residual: &Tensor) -> Result<Tensor> {
        let xs = self.resampler.downsample(residual)?;
        let xs = xs.transpose(1, 2)?.contiguous()?;
        let xs = match &self.project_in {
            Some(proj) => proj.forward(&xs)?,
            None => xs,
        };
        self.codebook.encode(&xs)
    }

    /// Full-resolution contribution of stage-resolution codes.
    ///
    /// Input: (batch, Tk) codes
    /// Output: (batch, dimension, len)
    pub fn reconstruct(&self, codes: &Tensor, len: usize) -> Result<Tensor> {
        let quantized = self.codebook.decode(codes)?;
        let quantized = match &self.project_out {
            Some(proj) => proj.forward(&quantized)?,
            None => quantized,
        };
        let quantized = quantized.transpose(1, 2)?;
        self.resampler.upsample(&quantized, len)
    }

    /// Stage-resolution codes held across their windows: (batch, Tk) -> (batch, len).
    pub fn expand_codes(&self, codes: &Tensor, len: usize) -> Result<Tensor> {
        self.resampler.expand_codes(codes, len)
    }

    /// Recover stage-resolution codes from a dense row: (batch, T) -> (batch, Tk).
    pub fn gather_codes(&self, codes: &Tensor) -> Result<Tensor> {
        self.resampler.gather_codes(codes)
    }
}
