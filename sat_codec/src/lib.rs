//! # SAT codec
//!
//! A variable-bitrate neural audio codec core for the Candle ML framework.
//!
//! This crate provides:
//! - Multi-scale residual vector quantization (`quantizer`)
//! - Bandwidth to stage-count mapping and training-time bandwidth agreement (`bandwidth`)
//! - Segmentation, loudness normalization and overlap-add stitching (`audio`)
//! - The end-to-end codec pipeline and checkpoint loading (`model`)
//! - Code stream and WAV file helpers (`io`)
//!
//! ## Architecture Overview
//!
//! ```text
//! Waveform → Segmenter → Normalizer → FeatureTransform::encode → Embedding
//!          → MultiScaleResidualQuantizer (stages chosen by bandwidth) → Codes
//! Codes → MultiScaleResidualQuantizer::decode → FeatureTransform::decode
//!       → Denormalize → Overlap-add → Waveform
//! ```
//!
//! Decoding any prefix of the stages yields a valid, lower-fidelity embedding,
//! which is what makes a single encoding usable at several bitrates.
//!
//! ## Example
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use sat_codec::model::loader::CodecLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = CodecLoader::from_local_dir("/path/to/codec")?;
//! let mut codec = loader.load_codec(&Device::Cpu)?;
//! codec.set_target_bandwidth(6.0)?;
//!
//! let wav = Tensor::zeros((1, 1, 48_000), candle_core::DType::F32, &Device::Cpu)?;
//! let frames = codec.encode(&wav)?;
//! let decoded = codec.decode(&frames)?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod bandwidth;
pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod quantizer;
pub mod transform;

pub use config::CodecConfig;
pub use error::{CodecError, Result};
pub use model::{EncodedFrame, SatCodec};
pub use transform::{FeatureTransform, FramewiseProjection};
