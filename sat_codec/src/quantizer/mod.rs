//! Multi-scale residual vector quantization.
//!
//! This module contains:
//! - `codebook`: Euclidean codebook (nearest-neighbour search and lookup)
//! - `resample`: Per-stage temporal resampling with optional `phi` refinement
//! - `stage`: One quantization level (codebook + projections + resampler)
//! - `residual`: The ordered multi-scale stage stack
//! - `straight_through`: Straight-through estimator for training

pub mod codebook;
pub mod resample;
pub mod residual;
pub mod stage;
pub mod straight_through;

pub use residual::{MultiScaleResidualQuantizer, QuantizedResult};
pub use stage::CodebookStage;
