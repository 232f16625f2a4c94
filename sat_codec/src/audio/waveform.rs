//! Waveform boundary checks.

use candle_core::Tensor;

use crate::error::{CodecError, Result, ensure_finite};

/// Dimensions of a validated waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveformShape {
    pub batch: usize,
    pub channels: usize,
    pub length: usize,
}

/// Validate a `[batch, channels, length]` waveform.
///
/// Rejects channel counts outside {1, 2}, empty signals and NaN/Inf samples.
pub fn check_waveform(wav: &Tensor) -> Result<WaveformShape> {
    let (batch, channels, length) = match wav.dims() {
        &[b, c, l] => (b, c, l),
        dims => {
            return Err(CodecError::Shape(format!(
                "expected waveform [batch, channels, length], got {dims:?}"
            )));
        }
    };
    if !(1..=2).contains(&channels) {
        return Err(CodecError::Channels(channels));
    }
    if batch == 0 || length == 0 {
        return Err(CodecError::Shape(format!(
            "empty waveform [{batch}, {channels}, {length}]"
        )));
    }
    ensure_finite(wav, "waveform")?;
    Ok(WaveformShape {
        batch,
        channels,
        length,
    })
}
