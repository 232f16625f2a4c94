//! Fixed-duration framing of long waveforms.
//!
//! Frames start at `0, stride, 2·stride, …` and stop at the first frame that
//! reaches the end of the signal, so the union of frames always covers the
//! whole waveform. The last frame may be shorter than `segment_length`; it is
//! zero-padded only when handed to the feature transform.

use std::ops::Range;

use candle_core::Tensor;

use crate::config::CodecConfig;
use crate::error::{CodecError, Result};

/// A contiguous slice of a waveform.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Start sample in the source waveform
    pub offset: usize,
    /// Number of valid samples
    pub length: usize,
    /// (batch, channels, length)
    pub samples: Tensor,
}

impl Frame {
    /// Same position, different samples (e.g. after normalization).
    pub fn with_samples(&self, samples: Tensor) -> Self {
        Self {
            offset: self.offset,
            length: self.length,
            samples,
        }
    }

    /// Samples right-padded with zeros to `len`.
    pub fn padded(&self, len: usize) -> candle_core::Result<Tensor> {
        if len <= self.length {
            return Ok(self.samples.clone());
        }
        self.samples.pad_with_zeros(2, 0, len - self.length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segmenter {
    segment_length: Option<usize>,
    stride: usize,
}

impl Segmenter {
    /// `segment_length = None` yields a single frame spanning the input.
    pub fn new(segment_length: Option<usize>, stride: usize) -> Result<Self> {
        if let Some(len) = segment_length {
            if len == 0 {
                return Err(CodecError::Config("segment length must be positive".into()));
            }
            if stride == 0 || stride > len {
                return Err(CodecError::Config(format!(
                    "segment stride {stride} must be in [1, {len}]"
                )));
            }
        }
        Ok(Self {
            segment_length,
            stride,
        })
    }

    pub fn from_config(config: &CodecConfig) -> Result<Self> {
        match config.segment_length() {
            Some(len) => Self::new(Some(len), config.segment_stride().unwrap_or(len)),
            None => Self::new(None, 1),
        }
    }

    pub fn segment_length(&self) -> Option<usize> {
        self.segment_length
    }

    /// Hop between frame starts; `None` when the input is not segmented.
    pub fn stride(&self) -> Option<usize> {
        self.segment_length.map(|_| self.stride)
    }

    /// Sample ranges of the frames for a signal of `length` samples.
    pub fn plan(&self, length: usize) -> Vec<Range<usize>> {
        let Some(segment_length) = self.segment_length else {
            return vec![0..length];
        };

        let mut ranges = Vec::with_capacity(length.div_ceil(self.stride));
        let mut start = 0;
        loop {
            let end = (start + segment_length).min(length);
            ranges.push(start..end);
            if start + segment_length >= length {
                break;
            }
            start += self.stride;
        }
        ranges
    }

    /// Slice `wav` (batch, channels, length) into frames.
    pub fn split(&self, wav: &Tensor) -> Result<Vec<Frame>> {
        let (_, _, length) = wav.dims3()?;
        let frames = self
            .plan(length)
            .into_iter()
            .map(|range| {
                Ok(Frame {
                    offset: range.start,
                    length: range.len(),
                    samples: wav.narrow(2, range.start, range.len())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(length, frames = frames.len(), "Segmented waveform");
        Ok(frames)
    }
}
