//! Euclidean codebook: one table of reference vectors.

use candle_core::{D, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// A table of `bins` reference vectors of dimension `dim`.
///
/// Read-only during inference; when built from a `VarMap` the table is a
/// trainable variable updated by an external optimizer between calls.
#[derive(Debug, Clone)]
pub struct EuclideanCodebook {
    embed: Tensor,
    bins: usize,
    dim: usize,
}

impl EuclideanCodebook {
    pub fn new(dim: usize, bins: usize, vb: VarBuilder) -> Result<Self> {
        let embed = vb.get_with_hints(
            (bins, dim),
            "embed",
            Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;
        Ok(Self { embed, bins, dim })
    }

    /// Build a codebook from an explicit `(bins, dim)` table.
    pub fn from_table(embed: Tensor) -> Result<Self> {
        let (bins, dim) = embed.dims2()?;
        Ok(Self { embed, bins, dim })
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The `(bins, dim)` table.
    pub fn embeddings(&self) -> &Tensor {
        &self.embed
    }

    /// Nearest-neighbour search.
    ///
    /// Input: (..., dim) continuous vectors
    /// Output: same shape without the last dimension, containing U32 indices
    pub fn encode(&self, xs: &Tensor) -> Result<Tensor> {
        let mut target_shape = xs.dims().to_vec();
        target_shape.pop();

        let xs = xs.flatten_to(D::Minus2)?;

        // argmin ||x - e||^2 = argmin (||e||^2 / 2 - x·e); ||x||^2 is constant per row
        let c2 = self.embed.sqr()?.sum(D::Minus1)?.affine(0.5, 0.)?;
        let dot_prod = xs.matmul(&self.embed.t()?)?;
        let distances = c2.broadcast_sub(&dot_prod)?;
        let codes = distances.argmin(D::Minus1)?;

        codes.reshape(target_shape)
    }

    /// Look up code indices.
    ///
    /// Input: (...) indices
    /// Output: (..., dim) reference vectors
    pub fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        // Tensor::embedding only accepts 1D indices
        let mut new_shape = codes.dims().to_vec();
        let codes_flat = codes.flatten_all()?;
        let quantized = self.embed.embedding(&codes_flat)?;
        new_shape.push(self.dim);
        quantized.reshape(new_shape)
    }
}
