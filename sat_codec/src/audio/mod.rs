//! Waveform handling around the quantizer.
//!
//! This module contains:
//! - `waveform`: boundary checks for `[batch, channels, length]` input
//! - `segment`: splitting a waveform into fixed-duration frames
//! - `normalize`: per-frame loudness scale
//! - `overlap_add`: stitching decoded frames back together

pub mod normalize;
pub mod overlap_add;
pub mod segment;
pub mod waveform;

pub use normalize::LoudnessNormalizer;
pub use overlap_add::overlap_add;
pub use segment::{Frame, Segmenter};
pub use waveform::{WaveformShape, check_waveform};
