//! Waveform ↔ embedding transforms around the quantizer.
//!
//! The quantizer only sees `(batch, dimension, T)` embeddings; how they are
//! produced from audio is pluggable through [`FeatureTransform`].

use candle_core::Tensor;

use crate::error::{CodecError, Result};

/// Learned or fixed analysis/synthesis pair.
pub trait FeatureTransform: Send + Sync {
    /// (batch, channels, length) → (batch, dimension, ceil(length / hop_length))
    fn encode(&self, frame: &Tensor) -> Result<Tensor>;

    /// (batch, dimension, T) → (batch, channels, T · hop_length)
    fn decode(&self, embedding: &Tensor) -> Result<Tensor>;

    /// Embedding channels produced by `encode`.
    fn dimension(&self) -> usize;

    /// Samples per embedding timestep.
    fn hop_length(&self) -> usize;
}

/// Parameter-free transform folding `hop` consecutive samples of every
/// channel into one embedding vector.
///
/// `decode(encode(x))` returns `x` zero-padded to a multiple of `hop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramewiseProjection {
    channels: usize,
    hop: usize,
}

impl FramewiseProjection {
    pub fn new(channels: usize, hop: usize) -> Result<Self> {
        if !(1..=2).contains(&channels) {
            return Err(CodecError::Channels(channels));
        }
        if hop == 0 {
            return Err(CodecError::Config("hop length must be positive".into()));
        }
        Ok(Self { channels, hop })
    }
}

impl FeatureTransform for FramewiseProjection {
    fn encode(&self, frame: &Tensor) -> Result<Tensor> {
        let (b, c, len) = frame.dims3()?;
        if c != self.channels {
            return Err(CodecError::Shape(format!(
                "transform expects {} channels, got {c}",
                self.channels
            )));
        }
        let t = len.div_ceil(self.hop);
        let xs = frame.pad_with_zeros(2, 0, t * self.hop - len)?;
        // (b, c, t, hop) -> (b, c, hop, t) -> (b, c·hop, t)
        let xs = xs
            .reshape((b, c, t, self.hop))?
            .transpose(2, 3)?
            .contiguous()?
            .reshape((b, c * self.hop, t))?;
        Ok(xs)
    }

    fn decode(&self, embedding: &Tensor) -> Result<Tensor> {
        let (b, d, t) = embedding.dims3()?;
        if d != self.dimension() {
            return Err(CodecError::Shape(format!(
                "transform expects dimension {}, got {d}",
                self.dimension()
            )));
        }
        let xs = embedding
            .reshape((b, self.channels, self.hop, t))?
            .transpose(2, 3)?
            .contiguous()?
            .reshape((b, self.channels, t * self.hop))?;
        Ok(xs)
    }

    fn dimension(&self) -> usize {
        self.channels * self.hop
    }

    fn hop_length(&self) -> usize {
        self.hop
    }
}
