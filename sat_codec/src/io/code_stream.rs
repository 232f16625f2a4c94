//! Persisted code streams.
//!
//! Encoded frames are written as JSON wrapping base64 safetensors: one
//! `codes.{i}` U32 tensor and, when normalization was on, one `scale.{i}`
//! F32 tensor per frame. The metadata is what `decode` needs to rebuild a
//! waveform of the original length.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use candle_core::safetensors::load_buffer;
use candle_core::{DType, Device, Tensor};
use safetensors::serialize;
use safetensors::tensor::TensorView;
use serde::{Deserialize, Serialize};

use crate::model::{EncodedFrame, SatCodec};
use crate::transform::FeatureTransform;

const CODE_STREAM_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CodeStreamFile {
    /// File format version
    version: u32,
    /// Name of the codec that produced the codes
    codec: String,
    sample_rate: usize,
    channels: usize,
    /// Target bandwidth in kbps, None when every stage was used
    bandwidth: Option<f64>,
    /// Samples per channel of the encoded waveform
    length: usize,
    num_frames: usize,
    /// Serialized frames (base64-encoded safetensors)
    frames: String,
}

/// Encoded frames plus the metadata needed to decode them.
#[derive(Debug, Clone)]
pub struct CodeStream {
    pub codec: String,
    pub sample_rate: usize,
    pub channels: usize,
    pub bandwidth: Option<f64>,
    pub length: usize,
    pub frames: Vec<EncodedFrame>,
}

struct RawTensor {
    name: String,
    dtype: safetensors::Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl RawTensor {
    fn codes(name: String, codes: &Tensor) -> Result<Self> {
        let data = codes.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        Ok(Self {
            name,
            dtype: safetensors::Dtype::U32,
            shape: codes.dims().to_vec(),
            bytes: bytemuck::cast_slice(&data).to_vec(),
        })
    }

    fn scale(name: String, scale: &Tensor) -> Result<Self> {
        let data = scale.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            name,
            dtype: safetensors::Dtype::F32,
            shape: scale.dims().to_vec(),
            bytes: bytemuck::cast_slice(&data).to_vec(),
        })
    }
}

impl CodeStream {
    /// Wrap frames produced by `codec.encode` on a waveform of `length` samples.
    pub fn from_codec<T: FeatureTransform>(
        codec: &SatCodec<T>,
        length: usize,
        frames: Vec<EncodedFrame>,
    ) -> Self {
        let config = codec.config();
        Self {
            codec: config.name.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            bandwidth: codec.target_bandwidth(),
            length,
            frames,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut raw = Vec::with_capacity(self.frames.len() * 2);
        for (i, frame) in self.frames.iter().enumerate() {
            raw.push(RawTensor::codes(format!("codes.{i}"), &frame.codes)?);
            if let Some(scale) = &frame.scale {
                raw.push(RawTensor::scale(format!("scale.{i}"), scale)?);
            }
        }

        let mut views: HashMap<String, TensorView<'_>> = HashMap::new();
        for tensor in &raw {
            views.insert(
                tensor.name.clone(),
                TensorView::new(tensor.dtype, tensor.shape.clone(), &tensor.bytes)?,
            );
        }
        let buffer = serialize(&views, None)?;

        let file = CodeStreamFile {
            version: CODE_STREAM_VERSION,
            codec: self.codec.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            bandwidth: self.bandwidth,
            length: self.length,
            num_frames: self.frames.len(),
            frames: BASE64.encode(&buffer),
        };

        let json = serde_json::to_string_pretty(&file)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write code stream: {:?}", path))?;
        tracing::debug!(frames = self.frames.len(), "Saved code stream to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read code stream: {:?}", path))?;
        let file: CodeStreamFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse code stream: {:?}", path))?;

        if file.version != CODE_STREAM_VERSION {
            bail!(
                "Code stream version mismatch: expected {}, got {}",
                CODE_STREAM_VERSION,
                file.version
            );
        }

        let buffer = BASE64
            .decode(&file.frames)
            .context("Failed to decode code stream data")?;
        let mut tensors = load_buffer(&buffer, device)?;

        let frames = (0..file.num_frames)
            .map(|i| {
                let codes = tensors
                    .remove(&format!("codes.{i}"))
                    .with_context(|| format!("Code stream missing codes.{i}"))?;
                let scale = tensors.remove(&format!("scale.{i}"));
                Ok(EncodedFrame { codes, scale })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            codec: file.codec,
            sample_rate: file.sample_rate,
            channels: file.channels,
            bandwidth: file.bandwidth,
            length: file.length,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_keeps_codes_and_scales() -> Result<()> {
        let device = Device::Cpu;
        let frames = vec![
            EncodedFrame {
                codes: Tensor::new(&[[[1u32, 2, 3], [0, 0, 7]]], &device)?,
                scale: Some(Tensor::new(&[[0.5f32]], &device)?),
            },
            EncodedFrame {
                codes: Tensor::new(&[[[4u32, 5, 6], [1, 1, 1]]], &device)?,
                scale: Some(Tensor::new(&[[2.0f32]], &device)?),
            },
        ];
        let stream = CodeStream {
            codec: "test".to_string(),
            sample_rate: 24000,
            channels: 1,
            bandwidth: Some(3.0),
            length: 1234,
            frames,
        };

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("codes.json");
        stream.save(&path)?;
        let loaded = CodeStream::load(&path, &device)?;

        assert_eq!(loaded.codec, "test");
        assert_eq!(loaded.bandwidth, Some(3.0));
        assert_eq!(loaded.length, 1234);
        assert_eq!(loaded.frames.len(), 2);
        assert_eq!(
            loaded.frames[1].codes.to_vec3::<u32>()?,
            vec![vec![vec![4, 5, 6], vec![1, 1, 1]]]
        );
        let scale = loaded.frames[0].scale.as_ref().map(|s| s.to_vec2::<f32>());
        assert_eq!(scale.transpose()?, Some(vec![vec![0.5]]));
        Ok(())
    }

    #[test]
    fn test_frames_without_scale() -> Result<()> {
        let device = Device::Cpu;
        let stream = CodeStream {
            codec: "test".to_string(),
            sample_rate: 16000,
            channels: 2,
            bandwidth: None,
            length: 3,
            frames: vec![EncodedFrame {
                codes: Tensor::new(&[[[9u32, 9, 9]]], &device)?,
                scale: None,
            }],
        };
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("codes.json");
        stream.save(&path)?;

        let loaded = CodeStream::load(&path, &device)?;
        assert!(loaded.frames[0].scale.is_none());
        assert_eq!(loaded.channels, 2);
        assert_eq!(loaded.bandwidth, None);
        Ok(())
    }

    #[test]
    fn test_rejects_unknown_version() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("codes.json");
        fs::write(
            &path,
            r#"{"version":99,"codec":"x","sample_rate":1,"channels":1,"bandwidth":null,"length":1,"num_frames":0,"frames":""}"#,
        )?;
        assert!(CodeStream::load(&path, &Device::Cpu).is_err());
        Ok(())
    }
}
