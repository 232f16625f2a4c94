//! End-to-end codec pipeline.
//!
//! `SatCodec` ties the pieces together:
//!
//! ```text
//! waveform ─► Segmenter ─► frames ─► LoudnessNormalizer ─► FeatureTransform::encode
//!          ─► MultiScaleResidualQuantizer (stage count from the target bandwidth)
//!          ─► codes ─► decode ─► FeatureTransform::decode ─► denormalize
//!          ─► overlap_add ─► waveform
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sat_codec::model::loader::CodecLoader;
//! use candle_core::{Device, Tensor, DType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = CodecLoader::from_local_dir("/path/to/codec")?;
//! let mut codec = loader.load_codec(&Device::Cpu)?;
//! codec.set_target_bandwidth(6.0)?;
//!
//! let wav = Tensor::zeros((1, 1, 24000), DType::F32, &Device::Cpu)?;
//! let frames = codec.encode(&wav)?;
//! let decoded = codec.decode(&frames)?;
//! # Ok(())
//! # }
//! ```

pub mod loader;

use std::collections::HashSet;

use candle_core::Tensor;
use rand::Rng;

use crate::audio::{Frame, LoudnessNormalizer, Segmenter, WaveformShape, check_waveform, overlap_add};
use crate::bandwidth::broadcast::Broadcast;
use crate::bandwidth::{BandwidthSelector, BandwidthSpec};
use crate::config::CodecConfig;
use crate::error::{CodecError, Result};
use crate::quantizer::MultiScaleResidualQuantizer;
use crate::transform::FeatureTransform;

/// Codes for one frame plus the scale needed to restore its loudness.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// (batch, num_stages, T) U32
    pub codes: Tensor,
    /// (batch, 1), present when normalization is enabled
    pub scale: Option<Tensor>,
}

/// Result of a training step through the codec.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// Reconstructed waveform, trimmed to the input length
    pub output: Tensor,
    /// Quantizer penalty summed over frames
    pub penalty: Tensor,
    /// Bandwidth (kbps) drawn for this batch
    pub bandwidth: f64,
    /// Stages active at that bandwidth
    pub num_stages: usize,
}

/// Audio codec: framing, normalization, transform and multi-scale RVQ.
pub struct SatCodec<T: FeatureTransform> {
    config: CodecConfig,
    quantizer: MultiScaleResidualQuantizer,
    transform: T,
    segmenter: Segmenter,
    normalizer: LoudnessNormalizer,
    selector: BandwidthSelector,
    bandwidth: Option<f64>,
}

impl<T: FeatureTransform> SatCodec<T> {
    /// Assemble a codec, checking that every part agrees with `config`.
    pub fn new(
        config: CodecConfig,
        quantizer: MultiScaleResidualQuantizer,
        transform: T,
    ) -> Result<Self> {
        config.validate()?;

        if transform.dimension() != config.dimension || quantizer.dimension() != config.dimension
        {
            return Err(CodecError::Config(format!(
                "dimension mismatch: config {}, transform {}, quantizer {}",
                config.dimension,
                transform.dimension(),
                quantizer.dimension()
            )));
        }
        if transform.hop_length() != config.hop_length() {
            return Err(CodecError::Config(format!(
                "transform hop {} does not match product of ratios {}",
                transform.hop_length(),
                config.hop_length()
            )));
        }
        if quantizer.num_stages() != config.num_stages() || quantizer.bins() != config.bins {
            return Err(CodecError::Config(format!(
                "quantizer has {} stages of {} bins, config expects {} of {}",
                quantizer.num_stages(),
                quantizer.bins(),
                config.num_stages(),
                config.bins
            )));
        }

        let segmenter = Segmenter::from_config(&config)?;
        let normalizer = LoudnessNormalizer::new(config.normalize);
        let selector = BandwidthSelector::new(BandwidthSpec::new(config.target_bandwidths.clone())?);

        tracing::debug!(
            name = %config.name,
            frame_rate = config.frame_rate(),
            stages = config.num_stages(),
            segment = ?segmenter.segment_length(),
            "Assembled codec"
        );

        Ok(Self {
            config,
            quantizer,
            transform,
            segmenter,
            normalizer,
            selector,
            bandwidth: None,
        })
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn quantizer(&self) -> &MultiScaleResidualQuantizer {
        &self.quantizer
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    pub fn bandwidths(&self) -> &BandwidthSpec {
        self.selector.spec()
    }

    pub fn frame_rate(&self) -> usize {
        self.config.frame_rate()
    }

    pub fn target_bandwidth(&self) -> Option<f64> {
        self.bandwidth
    }

    /// Select the inference bitrate (kbps).
    ///
    /// Only values from `target_bandwidths` are accepted.
    pub fn set_target_bandwidth(&mut self, bandwidth: f64) -> Result<()> {
        let bandwidth = self.selector.spec().validate(bandwidth)?;
        self.bandwidth = Some(bandwidth);
        tracing::debug!(bandwidth, stages = self.num_active_stages(), "Set target bandwidth");
        Ok(())
    }

    /// Stages used at the current target bandwidth; all of them when unset.
    pub fn num_active_stages(&self) -> usize {
        self.quantizer
            .stages_for_bandwidth(self.bandwidth, self.frame_rate())
    }

    fn check_input(&self, wav: &Tensor) -> Result<WaveformShape> {
        let shape = check_waveform(wav)?;
        if shape.channels != self.config.channels {
            return Err(CodecError::Shape(format!(
                "codec expects {} channels, got {}",
                self.config.channels, shape.channels
            )));
        }
        Ok(shape)
    }

    // =====================================================================
    // Frame helpers
    // =====================================================================

    /// Normalize a frame and run the analysis transform on it.
    fn analyze(&self, frame: &Frame) -> Result<(Tensor, Option<Tensor>)> {
        let (normalized, scale) = self.normalizer.normalize(&frame.samples)?;
        let target = self.segmenter.segment_length().unwrap_or(frame.length);
        let padded = frame.with_samples(normalized).padded(target)?;
        let embedding = self.transform.encode(&padded)?;
        Ok((embedding, scale))
    }

    /// Synthesize a frame from an embedding and restore its loudness.
    fn synthesize(&self, embedding: &Tensor, scale: Option<&Tensor>) -> Result<Tensor> {
        let wav = self.transform.decode(embedding)?;
        let wav = match self.segmenter.segment_length() {
            // the transform rounds up to whole hops
            Some(len) if wav.dim(2)? > len => wav.narrow(2, 0, len)?,
            _ => wav,
        };
        self.normalizer.denormalize(&wav, scale)
    }

    fn stitch(&self, frames: &[Tensor]) -> Result<Tensor> {
        let stride = match (self.segmenter.stride(), frames.first()) {
            (Some(stride), _) => stride,
            (None, Some(frame)) => frame.dim(2)?,
            (None, None) => 1,
        };
        overlap_add(frames, stride)
    }

    // =====================================================================
    // Inference
    // =====================================================================

    /// Encode a (batch, channels, length) waveform into per-frame codes.
    pub fn encode(&self, wav: &Tensor) -> Result<Vec<EncodedFrame>> {
        let shape = self.check_input(wav)?;
        let num_stages = self.num_active_stages();

        let frames = self
            .segmenter
            .split(wav)?
            .iter()
            .map(|frame| {
                let (embedding, scale) = self.analyze(frame)?;
                let codes = self.quantizer.encode(&embedding, num_stages)?;
                Ok(EncodedFrame { codes, scale })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            length = shape.length,
            frames = frames.len(),
            num_stages,
            "Encoded waveform"
        );
        Ok(frames)
    }

    /// Decode frames back to a waveform.
    ///
    /// The result covers every frame, so it can be longer than the encoded
    /// input; `forward` trims it.
    pub fn decode(&self, frames: &[EncodedFrame]) -> Result<Tensor> {
        if frames.is_empty() {
            return Err(CodecError::Shape("no frames to decode".to_string()));
        }
        let decoded = frames
            .iter()
            .map(|frame| {
                let embedding = self.quantizer.decode(&frame.codes)?;
                self.synthesize(&embedding, frame.scale.as_ref())
            })
            .collect::<Result<Vec<_>>>()?;
        self.stitch(&decoded)
    }

    /// Encode then decode, trimmed to the input length.
    pub fn forward(&self, wav: &Tensor) -> Result<Tensor> {
        let shape = self.check_input(wav)?;
        let frames = self.encode(wav)?;
        let out = self.decode(&frames)?;
        Ok(out.narrow(2, 0, shape.length)?)
    }

    /// One reconstruction per stage prefix: using 1, 2, …, n active stages.
    pub fn reconstruct_each_scale(&self, wav: &Tensor) -> Result<Vec<Tensor>> {
        let shape = self.check_input(wav)?;
        let frames = self.encode(wav)?;

        // per_scale[k][f]: frame f decoded with k + 1 stages
        let mut per_scale: Vec<Vec<Tensor>> = Vec::new();
        for frame in &frames {
            let scales = self.quantizer.decode_each_scale(&frame.codes)?;
            if per_scale.is_empty() {
                per_scale = vec![Vec::with_capacity(frames.len()); scales.len()];
            }
            for (k, embedding) in scales.iter().enumerate() {
                per_scale[k].push(self.synthesize(embedding, frame.scale.as_ref())?);
            }
        }

        per_scale
            .iter()
            .map(|decoded| Ok(self.stitch(decoded)?.narrow(2, 0, shape.length)?))
            .collect()
    }

    /// Fraction of each stage's bins used across all `frames`.
    pub fn codebook_usage(&self, frames: &[EncodedFrame]) -> Result<Vec<f32>> {
        let mut used: Vec<HashSet<u32>> = Vec::new();
        for frame in frames {
            for (k, bins) in self.quantizer.used_bins(&frame.codes)?.into_iter().enumerate() {
                match used.get_mut(k) {
                    Some(set) => set.extend(bins),
                    None => used.push(bins),
                }
            }
        }
        let total = self.quantizer.bins() as f32;
        Ok(used.iter().map(|set| set.len() as f32 / total).collect())
    }

    // =====================================================================
    // Training
    // =====================================================================

    /// Training pass with a bandwidth drawn for this batch.
    ///
    /// The root worker of `group` draws the bandwidth from `rng` and every
    /// worker receives it, so all replicas use the same stage count. The
    /// output carries gradients to the transform through the
    /// straight-through quantizer.
    pub fn forward_train<R, B>(&self, wav: &Tensor, rng: &mut R, group: &B) -> Result<TrainOutput>
    where
        R: Rng + ?Sized,
        B: Broadcast + ?Sized,
    {
        let shape = self.check_input(wav)?;
        let bandwidth = self.selector.select_for_batch(rng, group)?;
        let num_stages = self
            .quantizer
            .stages_for_bandwidth(Some(bandwidth), self.frame_rate());

        let mut penalty = Tensor::zeros((), wav.dtype(), wav.device())?;
        let mut decoded = Vec::new();
        for frame in self.segmenter.split(wav)? {
            let (embedding, scale) = self.analyze(&frame)?;
            let result = self.quantizer.forward(&embedding, num_stages)?;
            penalty = (penalty + result.penalty.to_dtype(wav.dtype())?)?;
            decoded.push(self.synthesize(&result.quantized, scale.as_ref())?);
        }

        let output = self.stitch(&decoded)?.narrow(2, 0, shape.length)?;
        tracing::debug!(bandwidth, num_stages, "Training step");
        Ok(TrainOutput {
            output,
            penalty,
            bandwidth,
            num_stages,
        })
    }
}
