//! Top-level codec configuration.

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

/// Configuration for the codec pipeline and its quantizer.
///
/// Loaded from the `config.json` that sits next to the stage weights. Every
/// field has a default so partial files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Model name, stored as metadata in code stream files
    #[serde(default = "default_name")]
    pub name: String,

    /// Audio sample rate in Hz (default: 24000)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: usize,

    /// Number of audio channels, 1 or 2 (default: 1)
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Embedding dimension produced by the feature transform (default: 128)
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Codebook vector dimension (default: 32)
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    /// Entries per codebook, must be a power of two (default: 1024)
    #[serde(default = "default_bins")]
    pub bins: usize,

    /// Downsampling ratios of the feature transform (default: [8, 5, 4, 2])
    #[serde(default = "default_ratios")]
    pub ratios: Vec<usize>,

    /// Per-stage temporal resolution factors; its length is the stage count
    #[serde(default = "default_multi_scale")]
    pub multi_scale: Vec<usize>,

    /// Kernel size of the per-stage refinement convolution (None = identity)
    #[serde(default)]
    pub phi_kernel: Option<usize>,

    /// Supported target bandwidths in kbps
    #[serde(default = "default_target_bandwidths")]
    pub target_bandwidths: Vec<f64>,

    /// Segment duration in seconds (None = encode the whole waveform at once)
    #[serde(default)]
    pub segment: Option<f64>,

    /// Overlap between segments as a fraction of the segment duration (default: 0.01)
    #[serde(default = "default_overlap")]
    pub overlap: f64,

    /// Whether to normalize each segment's loudness before encoding
    #[serde(default)]
    pub normalize: bool,

    /// Weight of the commitment term in the training penalty (default: 1.0)
    #[serde(default = "default_commitment_weight")]
    pub commitment_weight: f64,
}

fn default_name() -> String {
    "sat_codec".to_string()
}
fn default_sample_rate() -> usize {
    24_000
}
fn default_channels() -> usize {
    1
}
fn default_dimension() -> usize {
    128
}
fn default_latent_dim() -> usize {
    32
}
fn default_bins() -> usize {
    1024
}
fn default_ratios() -> Vec<usize> {
    vec![8, 5, 4, 2]
}
fn default_multi_scale() -> Vec<usize> {
    vec![8, 4, 2, 1, 1, 1, 1, 1]
}
fn default_target_bandwidths() -> Vec<f64> {
    vec![1.5, 3.0, 6.0, 12.0, 24.0]
}
fn default_overlap() -> f64 {
    0.01
}
fn default_commitment_weight() -> f64 {
    1.0
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            dimension: default_dimension(),
            latent_dim: default_latent_dim(),
            bins: default_bins(),
            ratios: default_ratios(),
            multi_scale: default_multi_scale(),
            phi_kernel: None,
            target_bandwidths: default_target_bandwidths(),
            segment: None,
            overlap: default_overlap(),
            normalize: false,
            commitment_weight: default_commitment_weight(),
        }
    }
}

impl CodecConfig {
    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Check every invariant that must hold before any stage is built.
    pub fn validate(&self) -> Result<()> {
        if !self.bins.is_power_of_two() {
            return Err(CodecError::Config(format!(
                "quantizer bins must be a power of 2, got {}",
                self.bins
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(CodecError::Channels(self.channels));
        }
        if self.sample_rate == 0 || self.dimension == 0 || self.latent_dim == 0 {
            return Err(CodecError::Config(
                "sample_rate, dimension and latent_dim must be positive".to_string(),
            ));
        }
        if self.ratios.is_empty() || self.ratios.contains(&0) {
            return Err(CodecError::Config(format!(
                "ratios must be non-empty and positive, got {:?}",
                self.ratios
            )));
        }
        if self.multi_scale.is_empty() || self.multi_scale.contains(&0) {
            return Err(CodecError::Config(format!(
                "multi_scale must be non-empty and positive, got {:?}",
                self.multi_scale
            )));
        }
        if let Some(kernel) = self.phi_kernel
            && kernel % 2 == 0
        {
            return Err(CodecError::Config(format!(
                "phi_kernel must be odd, got {kernel}"
            )));
        }
        if self.target_bandwidths.is_empty()
            || self
                .target_bandwidths
                .iter()
                .any(|bw| !bw.is_finite() || *bw <= 0.0)
        {
            return Err(CodecError::Config(format!(
                "target_bandwidths must be non-empty and positive, got {:?}",
                self.target_bandwidths
            )));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(CodecError::Config(format!(
                "overlap must be in [0, 1), got {}",
                self.overlap
            )));
        }
        if let Some(segment) = self.segment
            && self.segment_length().is_none_or(|len| len == 0)
        {
            return Err(CodecError::Config(format!(
                "segment must cover at least one sample, got {segment}s"
            )));
        }
        Ok(())
    }

    /// Number of quantizer stages.
    pub fn num_stages(&self) -> usize {
        self.multi_scale.len()
    }

    /// Samples per embedding timestep.
    pub fn hop_length(&self) -> usize {
        self.ratios.iter().product()
    }

    /// Embedding timesteps per second of audio.
    pub fn frame_rate(&self) -> usize {
        self.sample_rate.div_ceil(self.hop_length())
    }

    /// Bits carried by one code of one stage.
    pub fn bits_per_stage(&self) -> u32 {
        self.bins.trailing_zeros()
    }

    /// Segment length in samples, if segmentation is enabled.
    pub fn segment_length(&self) -> Option<usize> {
        self.segment
            .map(|duration| (duration * self.sample_rate as f64) as usize)
    }

    /// Distance between consecutive segment offsets, if segmentation is enabled.
    pub fn segment_stride(&self) -> Option<usize> {
        self.segment_length()
            .map(|len| (((1.0 - self.overlap) * len as f64) as usize).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CodecConfig::default();
        config.validate().unwrap();
        assert_eq!(config.hop_length(), 320);
        assert_eq!(config.frame_rate(), 75);
        assert_eq!(config.bits_per_stage(), 10);
        assert_eq!(config.num_stages(), 8);
        assert_eq!(config.segment_length(), None);
    }

    #[test]
    fn test_config_from_json_partial() {
        let json = r#"{
            "sample_rate": 48000,
            "channels": 2,
            "segment": 1.0,
            "overlap": 0.25,
            "normalize": true
        }"#;

        let config = CodecConfig::from_json(json).unwrap();
        assert_eq!(config.sample_rate, 48000); // overridden
        assert_eq!(config.channels, 2); // overridden
        assert_eq!(config.bins, 1024); // default
        assert_eq!(config.segment_length(), Some(48000));
        assert_eq!(config.segment_stride(), Some(36000));
        assert!(config.normalize);
    }

    #[test]
    fn test_non_power_of_two_bins_rejected() {
        let config = CodecConfig {
            bins: 1000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CodecError::Config(_))));
    }

    #[test]
    fn test_channels_rejected() {
        let config = CodecConfig {
            channels: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CodecError::Channels(3))));
    }

    #[test]
    fn test_even_phi_kernel_rejected() {
        let config = CodecConfig {
            phi_kernel: Some(4),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stride_never_zero() {
        let config = CodecConfig {
            sample_rate: 10,
            segment: Some(0.1),
            overlap: 0.99,
            ..Default::default()
        };
        assert_eq!(config.segment_length(), Some(1));
        assert_eq!(config.segment_stride(), Some(1));
    }
}
