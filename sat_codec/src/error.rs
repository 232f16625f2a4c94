//! Error type shared by the codec pipeline.

use thiserror::Error;

/// Errors surfaced by the codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Requested bandwidth is not one of the configured target bandwidths.
    #[error("unsupported bandwidth {requested} kbps, select one of {supported:?}")]
    UnsupportedBandwidth { requested: f64, supported: Vec<f64> },

    /// Invalid configuration, detected once at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Waveform channel count outside of {1, 2}.
    #[error("unsupported channel count {0}, expected 1 or 2")]
    Channels(usize),

    /// Tensor shape does not match what the configuration expects.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// NaN or infinite values where finite data is required.
    #[error("non-finite values in {0}")]
    NonFinite(&'static str),

    /// Checkpoint missing, incomplete or incompatible with the configuration.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Bandwidth agreement between workers failed.
    #[error("broadcast error: {0}")]
    Broadcast(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Reject NaN or infinite values before they reach a distance computation.
pub(crate) fn ensure_finite(xs: &candle_core::Tensor, what: &'static str) -> Result<()> {
    let values = xs
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    if values.iter().any(|v| !v.is_finite()) {
        return Err(CodecError::NonFinite(what));
    }
    Ok(())
}
