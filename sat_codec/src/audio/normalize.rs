//! Per-frame loudness normalization.

use candle_core::{D, Tensor};

use crate::error::{CodecError, Result};

/// Added to the RMS so silent frames keep a positive scale.
pub const SCALE_EPSILON: f64 = 1e-8;

/// Scales each frame to unit RMS before encoding and restores it after decoding.
///
/// The volume is measured on the channel mean, so both channels of a stereo
/// frame share one scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoudnessNormalizer {
    enabled: bool,
}

impl LoudnessNormalizer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the normalized frame and its `(batch, 1)` scale.
    ///
    /// When disabled the frame passes through and the scale is `None`.
    pub fn normalize(&self, frame: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        if !self.enabled {
            return Ok((frame.clone(), None));
        }
        let (batch, _, _) = frame.dims3()?;

        let mono = frame.mean_keepdim(1)?;
        let volume = mono.sqr()?.mean_keepdim(D::Minus1)?.sqrt()?;
        let scale = volume.affine(1.0, SCALE_EPSILON)?;

        let normalized = frame.broadcast_div(&scale)?;
        Ok((normalized, Some(scale.reshape((batch, 1))?)))
    }

    /// Multiply a decoded frame by the scale recorded at encode time.
    pub fn denormalize(&self, frame: &Tensor, scale: Option<&Tensor>) -> Result<Tensor> {
        let Some(scale) = scale else {
            return Ok(frame.clone());
        };
        let (batch, _, _) = frame.dims3()?;
        if scale.dims() != [batch, 1] {
            return Err(CodecError::Shape(format!(
                "scale shape {:?} does not match batch {batch}",
                scale.dims()
            )));
        }
        let scale = scale.to_dtype(frame.dtype())?.reshape((batch, 1, 1))?;
        Ok(frame.broadcast_mul(&scale)?)
    }
}
