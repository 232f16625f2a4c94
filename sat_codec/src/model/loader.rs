//! Checkpoint loading and initialisation.
//!
//! A codec directory contains:
//! - `config.json`: [`CodecConfig`]
//! - `model.safetensors`: stage tables under `quantizer.vq.layers.{k}`
//!
//! Checkpoints written before the quantizer was renamed store the same
//! tensors under `quantizer.model.layers.{k}`; they are remapped on load.
//!
//! # Example
//!
//! ```no_run
//! use sat_codec::model::loader::CodecLoader;
//! use candle_core::Device;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = CodecLoader::from_local_dir("/path/to/codec")?;
//! let codec = loader.load_codec(&Device::Cpu)?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::config::CodecConfig;
use crate::error::{CodecError, Result};
use crate::model::SatCodec;
use crate::quantizer::MultiScaleResidualQuantizer;
use crate::transform::FramewiseProjection;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Prefix of the quantizer inside the checkpoint.
pub const QUANTIZER_PREFIX: &str = "quantizer";
const LEGACY_STAGES_PREFIX: &str = "quantizer.model.";
const STAGES_PREFIX: &str = "quantizer.vq.";

/// Rename legacy `quantizer.model.*` keys to `quantizer.vq.*`.
///
/// Keys already in the current layout are left untouched. Returns the
/// remapped map and the number of renamed keys.
pub fn remap_legacy_keys(tensors: HashMap<String, Tensor>) -> (HashMap<String, Tensor>, usize) {
    let mut renamed = 0;
    let tensors = tensors
        .into_iter()
        .map(|(name, tensor)| match name.strip_prefix(LEGACY_STAGES_PREFIX) {
            Some(rest) => {
                renamed += 1;
                (format!("{STAGES_PREFIX}{rest}"), tensor)
            }
            None => (name, tensor),
        })
        .collect();
    (tensors, renamed)
}

/// Stage tensor names a checkpoint must hold for `config`, nothing more.
fn expected_stage_keys(config: &CodecConfig) -> HashSet<String> {
    let mut keys = HashSet::new();
    for k in 0..config.num_stages() {
        let stage = format!("{STAGES_PREFIX}layers.{k}");
        keys.insert(format!("{stage}.codebook.embed"));
        if config.latent_dim != config.dimension {
            keys.insert(format!("{stage}.project_in.weight"));
            keys.insert(format!("{stage}.project_out.weight"));
        }
        if config.phi_kernel.is_some() {
            keys.insert(format!("{stage}.phi.weight"));
            keys.insert(format!("{stage}.phi.bias"));
        }
    }
    keys
}

/// Reject stage tensors the configuration would leave unused.
///
/// Missing tensors and shape mismatches are reported when the stages are
/// built; this catches checkpoints carrying more stages or layers than the
/// config describes.
pub fn check_stage_keys(tensors: &HashMap<String, Tensor>, config: &CodecConfig) -> Result<()> {
    let expected = expected_stage_keys(config);
    let mut unexpected: Vec<&str> = tensors
        .keys()
        .filter(|name| name.starts_with(STAGES_PREFIX) && !expected.contains(name.as_str()))
        .map(String::as_str)
        .collect();
    if unexpected.is_empty() {
        return Ok(());
    }
    unexpected.sort_unstable();
    Err(CodecError::Checkpoint(format!(
        "checkpoint holds stage tensors not used by a {}-stage configuration: {}",
        config.num_stages(),
        unexpected.join(", ")
    )))
}

fn as_checkpoint_error(err: CodecError) -> CodecError {
    match err {
        CodecError::Candle(e) => CodecError::Checkpoint(e.to_string()),
        other => other,
    }
}

/// Loads a codec from a local directory.
#[derive(Debug, Clone)]
pub struct CodecLoader {
    model_dir: PathBuf,
    config: CodecConfig,
}

impl CodecLoader {
    /// Read and validate `config.json` from `model_dir`.
    pub fn from_local_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref().to_path_buf();

        let config_path = model_dir.join(CONFIG_FILE);
        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            CodecError::Checkpoint(format!(
                "failed to read {} at {}: {}",
                CONFIG_FILE,
                config_path.display(),
                e
            ))
        })?;
        let config = CodecConfig::from_json(&config_str)?;
        config.validate()?;

        Ok(Self { model_dir, config })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    fn weights_path(&self) -> Result<PathBuf> {
        let path = self.model_dir.join(WEIGHTS_FILE);
        if !path.exists() {
            return Err(CodecError::Checkpoint(format!(
                "no {} in {}",
                WEIGHTS_FILE,
                self.model_dir.display()
            )));
        }
        Ok(path)
    }

    /// All checkpoint tensors with legacy names remapped.
    pub fn load_tensors(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        let weights_path = self.weights_path()?;
        tracing::info!("Loading codec weights from {}", weights_path.display());

        let tensors = candle_core::safetensors::load(&weights_path, device)
            .map_err(|e| CodecError::Checkpoint(e.to_string()))?;
        let (tensors, renamed) = remap_legacy_keys(tensors);
        if renamed > 0 {
            tracing::warn!(
                renamed,
                "Checkpoint uses legacy `{}` keys, remapped to `{}`",
                LEGACY_STAGES_PREFIX,
                STAGES_PREFIX
            );
        }
        Ok(tensors)
    }

    /// Build the quantizer from the checkpoint.
    ///
    /// Fails without partial results if any stage tensor is missing, left
    /// over, or shaped differently from what the configuration describes.
    pub fn load_quantizer(&self, device: &Device) -> Result<MultiScaleResidualQuantizer> {
        let tensors = self.load_tensors(device)?;
        check_stage_keys(&tensors, &self.config)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let quantizer = MultiScaleResidualQuantizer::new(&self.config, vb.pp(QUANTIZER_PREFIX))
            .map_err(as_checkpoint_error)?;
        tracing::info!(
            stages = quantizer.num_stages(),
            bins = quantizer.bins(),
            "Loaded quantizer"
        );
        Ok(quantizer)
    }

    /// Quantizer plus the parameter-free framewise transform.
    ///
    /// Requires `dimension == channels · Π ratios`.
    pub fn load_codec(&self, device: &Device) -> Result<SatCodec<FramewiseProjection>> {
        let quantizer = self.load_quantizer(device)?;
        let transform = FramewiseProjection::new(self.config.channels, self.config.hop_length())?;
        SatCodec::new(self.config.clone(), quantizer, transform)
    }
}

/// Write `config.json` and freshly initialised stage tables to `model_dir`.
///
/// Returns the `VarMap` holding the new parameters so a caller can train them.
pub fn init_checkpoint(
    model_dir: impl AsRef<Path>,
    config: &CodecConfig,
    device: &Device,
) -> Result<VarMap> {
    config.validate()?;
    let model_dir = model_dir.as_ref();
    std::fs::create_dir_all(model_dir)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    // building the stages registers their variables in `varmap`
    MultiScaleResidualQuantizer::new(config, vb.pp(QUANTIZER_PREFIX))?;

    std::fs::write(
        model_dir.join(CONFIG_FILE),
        serde_json::to_string_pretty(config)?,
    )?;
    save_quantizer(&varmap, model_dir.join(WEIGHTS_FILE))?;

    tracing::info!(
        "Initialised {} stages in {}",
        config.num_stages(),
        model_dir.display()
    );
    Ok(varmap)
}

/// Persist quantizer parameters held in a `VarMap` as safetensors.
pub fn save_quantizer(varmap: &VarMap, path: impl AsRef<Path>) -> Result<()> {
    varmap
        .save(path.as_ref())
        .map_err(|e| CodecError::Checkpoint(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> CodecConfig {
        CodecConfig {
            sample_rate: 800,
            ratios: vec![4],
            dimension: 4,
            latent_dim: 2,
            bins: 8,
            multi_scale: vec![2, 1],
            ..CodecConfig::default()
        }
    }

    #[test]
    fn test_remap_only_touches_legacy_keys() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::zeros(2, DType::F32, &device)?;
        let tensors = HashMap::from([
            ("quantizer.model.layers.0.codebook.embed".to_string(), t.clone()),
            ("quantizer.vq.layers.1.codebook.embed".to_string(), t.clone()),
            ("decoder.conv.weight".to_string(), t),
        ]);

        let (remapped, renamed) = remap_legacy_keys(tensors);
        assert_eq!(renamed, 1);
        assert!(remapped.contains_key("quantizer.vq.layers.0.codebook.embed"));
        assert!(remapped.contains_key("quantizer.vq.layers.1.codebook.embed"));
        assert!(remapped.contains_key("decoder.conv.weight"));
        assert!(!remapped.contains_key("quantizer.model.layers.0.codebook.embed"));
        Ok(())
    }

    #[test]
    fn test_init_then_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        init_checkpoint(dir.path(), &tiny_config(), &Device::Cpu)?;

        let loader = CodecLoader::from_local_dir(dir.path())?;
        assert_eq!(loader.model_dir(), dir.path());
        assert_eq!(loader.config(), &tiny_config());
        let codec = loader.load_codec(&Device::Cpu)?;
        assert_eq!(codec.quantizer().num_stages(), 2);
        assert_eq!(codec.quantizer().bins(), 8);

        let first = &codec.quantizer().stages()[0];
        assert_eq!(first.codebook().dim(), 2);
        assert_eq!(first.codebook().embeddings().dims(), &[8, 2]);
        assert_eq!(first.resampler().factor(), 2);
        assert!(!first.resampler().has_phi());
        Ok(())
    }

    #[test]
    fn test_phi_kernels_are_loaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = CodecConfig {
            phi_kernel: Some(3),
            ..tiny_config()
        };
        init_checkpoint(dir.path(), &config, &Device::Cpu)?;

        let quantizer = CodecLoader::from_local_dir(dir.path())?.load_quantizer(&Device::Cpu)?;
        assert!(quantizer.stages().iter().all(|s| s.resampler().has_phi()));
        Ok(())
    }

    #[test]
    fn test_stale_stage_tensors_are_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let trained = CodecConfig {
            multi_scale: vec![2, 1, 1],
            phi_kernel: Some(3),
            ..tiny_config()
        };
        init_checkpoint(dir.path(), &trained, &Device::Cpu)?;

        // fewer stages and no phi: stage 2 and every phi kernel would be dropped
        let fewer = CodecConfig {
            multi_scale: vec![2, 1],
            phi_kernel: None,
            ..tiny_config()
        };
        std::fs::write(dir.path().join(CONFIG_FILE), serde_json::to_string(&fewer)?)?;
        match CodecLoader::from_local_dir(dir.path())?.load_codec(&Device::Cpu) {
            Err(CodecError::Checkpoint(msg)) => {
                assert!(msg.contains("quantizer.vq.layers.2.codebook.embed"), "{msg}");
                assert!(msg.contains("quantizer.vq.layers.0.phi.weight"), "{msg}");
            }
            other => panic!("expected checkpoint error, got {:?}", other.map(|_| ())),
        }

        // same stage count, phi dropped
        let no_phi = CodecConfig {
            phi_kernel: None,
            ..trained
        };
        std::fs::write(dir.path().join(CONFIG_FILE), serde_json::to_string(&no_phi)?)?;
        assert!(matches!(
            CodecLoader::from_local_dir(dir.path())?.load_quantizer(&Device::Cpu),
            Err(CodecError::Checkpoint(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unrelated_tensors_are_ignored() -> Result<()> {
        let device = Device::Cpu;
        let config = tiny_config();
        let t = Tensor::zeros(2, DType::F32, &device)?;
        let mut tensors: HashMap<String, Tensor> = expected_stage_keys(&config)
            .into_iter()
            .map(|name| (name, t.clone()))
            .collect();
        tensors.insert("decoder.conv.weight".to_string(), t);
        check_stage_keys(&tensors, &config)?;
        Ok(())
    }

    #[test]
    fn test_missing_files_are_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(
            CodecLoader::from_local_dir(dir.path()),
            Err(CodecError::Checkpoint(_))
        ));

        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::to_string(&tiny_config())?,
        )?;
        let loader = CodecLoader::from_local_dir(dir.path())?;
        assert!(matches!(
            loader.load_quantizer(&Device::Cpu),
            Err(CodecError::Checkpoint(_))
        ));
        Ok(())
    }

    #[test]
    fn test_latent_dim_mismatch_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        init_checkpoint(dir.path(), &tiny_config(), &Device::Cpu)?;

        let wider = CodecConfig {
            latent_dim: 3,
            ..tiny_config()
        };
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::to_string(&wider)?,
        )?;
        let loader = CodecLoader::from_local_dir(dir.path())?;
        assert!(matches!(
            loader.load_quantizer(&Device::Cpu),
            Err(CodecError::Checkpoint(_))
        ));
        Ok(())
    }
}
