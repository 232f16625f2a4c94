//! Multi-scale residual vector quantizer.
//!
//! Each stage quantizes what the previous stages left unexplained, at its own
//! temporal resolution:
//!
//! ```text
//! residual_0 = embedding
//! code_k     = argmin ‖down_k(residual_k) − e‖     over stage k's codebook
//! contrib_k  = phi_k(up_k(e[code_k]))
//! residual_k+1 = residual_k − contrib_k
//! ```
//!
//! Decoding sums `contrib_k` for any prefix of the stages, so one encoding can
//! be consumed at several bitrates.

use std::collections::HashSet;

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::VarBuilder;

use crate::bandwidth::stages_for_bandwidth;
use crate::config::CodecConfig;
use crate::error::{CodecError, Result, ensure_finite};
use crate::quantizer::stage::CodebookStage;
use crate::quantizer::straight_through::StraightThrough;

/// Output of the training-mode forward pass.
#[derive(Debug, Clone)]
pub struct QuantizedResult {
    /// Quantized embedding (batch, dimension, T), straight-through w.r.t. the input
    pub quantized: Tensor,
    /// Codes (batch, num_stages, T)
    pub codes: Tensor,
    /// Number of stages used
    pub num_stages: usize,
    /// Scalar codebook + commitment penalty summed over stages
    pub penalty: Tensor,
}

/// Ordered stack of codebook stages.
#[derive(Debug, Clone)]
pub struct MultiScaleResidualQuantizer {
    stages: Vec<CodebookStage>,
    dimension: usize,
    bins: usize,
    commitment_weight: f64,
}

impl MultiScaleResidualQuantizer {
    /// Build all stages from `config`.
    ///
    /// Stage `k` is read from `vq.layers.{k}` under `vb`.
    pub fn new(config: &CodecConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let stages = config
            .multi_scale
            .iter()
            .enumerate()
            .map(|(i, &scale)| {
                CodebookStage::new(
                    config.dimension,
                    config.latent_dim,
                    config.bins,
                    scale,
                    config.phi_kernel,
                    vb.pp(format!("vq.layers.{}", i)),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        tracing::debug!(
            stages = stages.len(),
            bins = config.bins,
            multi_scale = ?config.multi_scale,
            "Built multi-scale quantizer"
        );

        Ok(Self {
            stages,
            dimension: config.dimension,
            bins: config.bins,
            commitment_weight: config.commitment_weight,
        })
    }

    /// Assemble a quantizer from pre-built stages.
    pub fn from_stages(
        stages: Vec<CodebookStage>,
        dimension: usize,
        commitment_weight: f64,
    ) -> Result<Self> {
        let bins = stages
            .first()
            .map(|s| s.bins())
            .ok_or_else(|| CodecError::Config("quantizer needs at least one stage".to_string()))?;
        if !bins.is_power_of_two() {
            return Err(CodecError::Config(format!(
                "quantizer bins must be a power of 2, got {bins}"
            )));
        }
        if stages.iter().any(|s| s.bins() != bins) {
            return Err(CodecError::Config(
                "all stages must share the same number of bins".to_string(),
            ));
        }
        Ok(Self {
            stages,
            dimension,
            bins,
            commitment_weight,
        })
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn bits_per_stage(&self) -> u32 {
        self.bins.trailing_zeros()
    }

    pub fn stages(&self) -> &[CodebookStage] {
        &self.stages
    }

    /// Stage count for a bandwidth in kbps; `None` uses every stage.
    pub fn stages_for_bandwidth(&self, bandwidth: Option<f64>, frame_rate: usize) -> usize {
        match bandwidth {
            Some(bw) => {
                stages_for_bandwidth(bw, frame_rate, self.bits_per_stage(), self.num_stages())
            }
            None => self.num_stages(),
        }
    }

    fn check_embedding(&self, xs: &Tensor) -> Result<usize> {
        let (_, dim, t) = xs.dims3()?;
        if dim != self.dimension {
            return Err(CodecError::Shape(format!(
                "embedding dimension {dim} does not match quantizer dimension {}",
                self.dimension
            )));
        }
        ensure_finite(xs, "embedding")?;
        Ok(t)
    }

    fn check_num_stages(&self, num_stages: usize) -> Result<()> {
        if num_stages == 0 || num_stages > self.num_stages() {
            return Err(CodecError::Shape(format!(
                "requested {num_stages} stages, quantizer has {}",
                self.num_stages()
            )));
        }
        Ok(())
    }

    /// Encode an embedding with the first `num_stages` stages.
    ///
    /// Input: (batch, dimension, T)
    /// Output: (batch, num_stages, T) U32 codes
    pub fn encode(&self, xs: &Tensor, num_stages: usize) -> Result<Tensor> {
        let t = self.check_embedding(xs)?;
        self.check_num_stages(num_stages)?;

        let mut codes = Vec::with_capacity(num_stages);
        let mut residual = xs.clone();

        for stage in &self.stages[..num_stages] {
            let indices = stage.encode(&residual)?;
            let contribution = stage.reconstruct(&indices, t)?;
            residual = (&residual - &contribution)?;
            codes.push(stage.expand_codes(&indices, t)?);
        }

        tracing::debug!(num_stages, timesteps = t, "Encoded embedding");
        Ok(Tensor::stack(&codes, 1)?)
    }

    fn check_codes(&self, codes: &Tensor) -> Result<(Tensor, usize, usize)> {
        let (_, n_q, t) = codes.dims3()?;
        if n_q > self.num_stages() {
            return Err(CodecError::Shape(format!(
                "codes carry {n_q} stages, quantizer has {}",
                self.num_stages()
            )));
        }
        let codes = codes.to_dtype(DType::U32)?;
        if codes.elem_count() > 0 {
            let max = codes.flatten_all()?.max(0)?.to_scalar::<u32>()?;
            if max as usize >= self.bins {
                return Err(CodecError::Shape(format!(
                    "code {max} out of range for {} bins",
                    self.bins
                )));
            }
        }
        Ok((codes, n_q, t))
    }

    /// Decode codes from all the stages they carry.
    ///
    /// Input: (batch, n_q, T)
    /// Output: (batch, dimension, T)
    pub fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        let n_q = codes.dim(1)?;
        self.decode_stages(codes, n_q)
    }

    /// Decode using only the first `up_to_stage` stages of `codes`.
    pub fn decode_stages(&self, codes: &Tensor, up_to_stage: usize) -> Result<Tensor> {
        let (codes, n_q, t) = self.check_codes(codes)?;
        if up_to_stage == 0 || up_to_stage > n_q {
            return Err(CodecError::Shape(format!(
                "cannot decode {up_to_stage} stages from codes carrying {n_q}"
            )));
        }

        let mut quantized: Option<Tensor> = None;
        for (idx, stage) in self.stages.iter().enumerate().take(up_to_stage) {
            let contribution = self.stage_contribution(stage, &codes, idx, t)?;
            quantized = Some(match quantized {
                Some(q) => (q + contribution)?,
                None => contribution,
            });
        }
        quantized.ok_or_else(|| CodecError::Shape("no stages decoded".to_string()))
    }

    /// Progressive reconstructions using 1, 2, ..., n_q stages.
    pub fn decode_each_scale(&self, codes: &Tensor) -> Result<Vec<Tensor>> {
        let (codes, n_q, t) = self.check_codes(codes)?;

        let mut outputs = Vec::with_capacity(n_q);
        let mut quantized: Option<Tensor> = None;
        for (idx, stage) in self.stages.iter().enumerate().take(n_q) {
            let contribution = self.stage_contribution(stage, &codes, idx, t)?;
            let current = match quantized {
                Some(q) => (q + contribution)?,
                None => contribution,
            };
            outputs.push(current.clone());
            quantized = Some(current);
        }
        Ok(outputs)
    }

    fn stage_contribution(
        &self,
        stage: &CodebookStage,
        codes: &Tensor,
        idx: usize,
        len: usize,
    ) -> Result<Tensor> {
        let dense = codes.i((.., idx))?;
        let indices = stage.gather_codes(&dense)?;
        Ok(stage.reconstruct(&indices, len)?)
    }

    /// Training-mode forward pass.
    ///
    /// Runs the same stage loop as `encode` while accumulating, per stage, a
    /// codebook term `mse(contrib, sg(residual))` and a commitment term
    /// `mse(sg(contrib), residual)`. The returned embedding carries the
    /// quantized value forward and the identity gradient backward.
    pub fn forward(&self, xs: &Tensor, num_stages: usize) -> Result<QuantizedResult> {
        let t = self.check_embedding(xs)?;
        self.check_num_stages(num_stages)?;

        let mut codes = Vec::with_capacity(num_stages);
        let mut residual = xs.clone();
        let mut quantized = xs.zeros_like()?;
        let mut penalty = Tensor::zeros((), xs.dtype(), xs.device())?;

        for stage in &self.stages[..num_stages] {
            let indices = stage.encode(&residual.detach())?.detach();
            let contribution = stage.reconstruct(&indices, t)?;

            let codebook_loss = mse(&contribution, &residual.detach())?;
            let commitment_loss = mse(&contribution.detach(), &residual)?;
            penalty = ((penalty + codebook_loss)?
                + commitment_loss.affine(self.commitment_weight, 0.)?)?;

            quantized = (quantized + &contribution)?;
            residual = (&residual - contribution.detach())?;
            codes.push(stage.expand_codes(&indices, t)?);
        }

        let quantized = StraightThrough::new(xs.clone(), quantized).into_tensor()?;

        Ok(QuantizedResult {
            quantized,
            codes: Tensor::stack(&codes, 1)?,
            num_stages,
            penalty,
        })
    }

    /// Distinct bins each stage selects in `codes`.
    pub fn used_bins(&self, codes: &Tensor) -> Result<Vec<HashSet<u32>>> {
        let (codes, n_q, _) = self.check_codes(codes)?;
        let mut used = Vec::with_capacity(n_q);
        for (idx, stage) in self.stages.iter().enumerate().take(n_q) {
            let indices = stage.gather_codes(&codes.i((.., idx))?)?;
            used.push(indices.flatten_all()?.to_vec1::<u32>()?.into_iter().collect());
        }
        Ok(used)
    }

    /// Fraction of each stage's bins that appear in `codes`.
    pub fn codebook_usage(&self, codes: &Tensor) -> Result<Vec<f32>> {
        Ok(self
            .used_bins(codes)?
            .iter()
            .map(|bins| bins.len() as f32 / self.bins as f32)
            .collect())
    }
}

fn mse(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    (a - b)?.sqr()?.mean_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    use crate::quantizer::codebook::EuclideanCodebook;
    use crate::quantizer::resample::StageResampler;

    fn stage_from_table(table: Tensor, scale: usize) -> CodebookStage {
        let codebook = EuclideanCodebook::from_table(table).unwrap();
        CodebookStage::from_parts(codebook, None, None, StageResampler::identity_phi(scale))
    }

    /// Two full-resolution stages over 1-d embeddings.
    fn scalar_quantizer(device: &Device) -> MultiScaleResidualQuantizer {
        let coarse = Tensor::new(&[[0f32], [1.], [2.], [-1.]], device).unwrap();
        let fine = Tensor::new(&[[0f32], [0.25], [-0.25], [0.5]], device).unwrap();
        MultiScaleResidualQuantizer::from_stages(
            vec![stage_from_table(coarse, 1), stage_from_table(fine, 1)],
            1,
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn test_encode_quantizes_residuals() -> Result<()> {
        let device = Device::Cpu;
        let quantizer = scalar_quantizer(&device);

        let xs = Tensor::new(&[[[1.3f32, -0.8, 2.45]]], &device)?;
        let codes = quantizer.encode(&xs, 2)?;

        assert_eq!(codes.dims(), &[1, 2, 3]);
        // 1.3 -> 1 + 0.25, -0.8 -> -1 + 0.25, 2.45 -> 2 + 0.5
        assert_eq!(codes.to_vec3::<u32>()?, vec![vec![vec![1, 3, 2], vec![1, 1, 3]]]);

        let decoded = quantizer.decode(&codes)?.to_vec3::<f32>()?;
        for (got, want) in decoded[0][0].iter().zip([1.25f32, -0.75, 2.5]) {
            assert!((got - want).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_decode_prefix_uses_fewer_stages() -> Result<()> {
        let device = Device::Cpu;
        let quantizer = scalar_quantizer(&device);

        let xs = Tensor::new(&[[[1.3f32, -0.8, 2.45]]], &device)?;
        let codes = quantizer.encode(&xs, 2)?;
        let coarse = quantizer.decode_stages(&codes, 1)?;
        assert_eq!(coarse.to_vec3::<f32>()?, vec![vec![vec![1., -1., 2.]]]);
        Ok(())
    }

    #[test]
    fn test_decode_each_scale_ends_with_full_decode() -> Result<()> {
        let device = Device::Cpu;
        let quantizer = scalar_quantizer(&device);

        let xs = Tensor::new(&[[[0.3f32, 1.9, -1.1, 0.6]]], &device)?;
        let codes = quantizer.encode(&xs, 2)?;
        let scales = quantizer.decode_each_scale(&codes)?;
        assert_eq!(scales.len(), 2);
        assert_eq!(
            scales[1].to_vec3::<f32>()?,
            quantizer.decode(&codes)?.to_vec3::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_coarse_stage_codes_are_held() -> Result<()> {
        let device = Device::Cpu;
        let coarse = Tensor::new(&[[0f32], [1.], [-1.], [8.]], &device)?;
        let fine = Tensor::new(&[[0f32], [0.5], [-0.5], [8.]], &device)?;
        let quantizer = MultiScaleResidualQuantizer::from_stages(
            vec![stage_from_table(coarse, 2), stage_from_table(fine, 1)],
            1,
            1.0,
        )?;

        // window means: (0.9 + 1.1) / 2 = 1, (-1.4 - 0.6) / 2 = -1, 0.1
        let xs = Tensor::new(&[[[0.9f32, 1.1, -1.4, -0.6, 0.1]]], &device)?;
        let codes = quantizer.encode(&xs, 2)?.to_vec3::<u32>()?;
        assert_eq!(codes[0][0], vec![1, 1, 2, 2, 0]);
        // fine residuals: -0.1, 0.1, -0.4, 0.4, 0.1
        assert_eq!(codes[0][1], vec![0, 0, 2, 1, 0]);
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_dimension_and_nan() -> Result<()> {
        let device = Device::Cpu;
        let quantizer = scalar_quantizer(&device);

        let wrong_dim = Tensor::zeros((1, 2, 4), DType::F32, &device)?;
        assert!(matches!(
            quantizer.encode(&wrong_dim, 1),
            Err(CodecError::Shape(_))
        ));

        let nan = Tensor::new(&[[[0.5f32, f32::NAN]]], &device)?;
        assert!(matches!(
            quantizer.encode(&nan, 1),
            Err(CodecError::NonFinite(_))
        ));
        Ok(())
    }

    #[test]
    fn test_rejects_out_of_range_codes() -> Result<()> {
        let device = Device::Cpu;
        let quantizer = scalar_quantizer(&device);
        let codes = Tensor::new(&[[[0u32, 4]]], &device)?;
        assert!(matches!(quantizer.decode(&codes), Err(CodecError::Shape(_))));
        Ok(())
    }

    #[test]
    fn test_non_power_of_two_stages_rejected() -> Result<()> {
        let device = Device::Cpu;
        let table = Tensor::new(&[[0f32], [1.], [2.]], &device)?;
        let result =
            MultiScaleResidualQuantizer::from_stages(vec![stage_from_table(table, 1)], 1, 1.0);
        assert!(matches!(result, Err(CodecError::Config(_))));
        Ok(())
    }

    #[test]
    fn test_training_forward_penalty_and_gradients() -> Result<()> {
        let device = Device::Cpu;
        let config = CodecConfig {
            dimension: 6,
            latent_dim: 3,
            bins: 16,
            multi_scale: vec![2, 1, 1],
            phi_kernel: Some(3),
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let quantizer = MultiScaleResidualQuantizer::new(&config, vb)?;

        let xs = Tensor::randn(0f32, 1., (2, 6, 9), &device)?;
        let result = quantizer.forward(&xs, 3)?;

        assert_eq!(result.quantized.dims(), &[2, 6, 9]);
        assert_eq!(result.codes.dims(), &[2, 3, 9]);
        let penalty = result.penalty.to_scalar::<f32>()?;
        assert!(penalty.is_finite() && penalty >= 0.0);

        // the forward value matches inference decoding
        let decoded = quantizer.decode(&result.codes)?;
        let diff = (result.quantized - decoded)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);

        // codebook tables receive gradients through the penalty
        let grads = result.penalty.backward()?;
        let trained = varmap
            .all_vars()
            .iter()
            .filter(|v| grads.get(v.as_tensor()).is_some())
            .count();
        assert!(trained > 0);
        Ok(())
    }

    #[test]
    fn test_codebook_usage() -> Result<()> {
        let device = Device::Cpu;
        let quantizer = scalar_quantizer(&device);
        let codes = Tensor::new(&[[[0u32, 1, 1, 2], [3, 3, 3, 3]]], &device)?;
        let usage = quantizer.codebook_usage(&codes)?;
        assert_eq!(usage, vec![0.75, 0.25]);
        Ok(())
    }
}
