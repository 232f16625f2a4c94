//! Stitching decoded frames into one waveform.

use candle_core::{DType, Tensor};

use crate::error::{CodecError, Result};

/// Cross-fade weights for a frame of `len` samples overlapping its
/// neighbours by `overlap` samples.
///
/// Weights ramp linearly across the overlap so that two neighbouring frames
/// sum to one there, and stay at one elsewhere.
fn frame_weights(len: usize, overlap: usize, fade_in: bool, fade_out: bool) -> Vec<f32> {
    let denom = (overlap + 1) as f32;
    (0..len)
        .map(|t| {
            let mut w = 1.0f32;
            if fade_in && t < overlap {
                w = w.min((t + 1) as f32 / denom);
            }
            if fade_out && t + overlap >= len {
                w = w.min((len - t) as f32 / denom);
            }
            w
        })
        .collect()
}

/// Overlap-add equally sized frames placed `stride` samples apart.
///
/// Frames are (batch, channels, len). When `stride >= len` the frames are
/// simply concatenated. Otherwise each frame is weighted by a linear
/// cross-fade over the overlapping region and the sum is divided by the
/// accumulated weight. Output length is `stride · (n − 1) + len`.
pub fn overlap_add(frames: &[Tensor], stride: usize) -> Result<Tensor> {
    let first = frames
        .first()
        .ok_or_else(|| CodecError::Shape("no frames to stitch".to_string()))?;
    let (batch, channels, len) = first.dims3()?;
    for frame in frames {
        if frame.dims() != [batch, channels, len] {
            return Err(CodecError::Shape(format!(
                "frames must share one shape, got {:?} and {:?}",
                first.dims(),
                frame.dims()
            )));
        }
    }
    if stride == 0 {
        return Err(CodecError::Shape("stride must be positive".to_string()));
    }

    if frames.len() == 1 {
        return Ok(first.clone());
    }
    if stride >= len {
        return Ok(Tensor::cat(frames, 2)?);
    }

    let n = frames.len();
    let overlap = len - stride;
    let total = stride * (n - 1) + len;
    let dtype = first.dtype();
    let device = first.device();

    let mut out = Tensor::zeros((batch, channels, total), dtype, device)?;
    let mut weight_sum = vec![0.0f32; total];

    for (idx, frame) in frames.iter().enumerate() {
        let offset = idx * stride;
        let weights = frame_weights(len, overlap, idx > 0, idx + 1 < n);
        for (t, w) in weights.iter().enumerate() {
            weight_sum[offset + t] += w;
        }

        let weights = Tensor::from_vec(weights, (1, 1, len), device)?.to_dtype(dtype)?;
        let weighted = frame.broadcast_mul(&weights)?;
        let placed = weighted.pad_with_zeros(2, offset, total - offset - len)?;
        out = (out + placed)?;
    }

    let weight_sum = Tensor::from_vec(weight_sum, (1, 1, total), device)?.to_dtype(dtype)?;
    Ok(out.broadcast_div(&weight_sum)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn ramp(start: f32, len: usize) -> candle_core::Result<Tensor> {
        Tensor::arange(start, start + len as f32, &Device::Cpu)?.reshape((1, 1, len))
    }

    #[test]
    fn test_no_overlap_is_concatenation() -> Result<()> {
        let frames = vec![ramp(0., 4)?, ramp(4., 4)?, ramp(8., 4)?];
        let out = overlap_add(&frames, 4)?;
        let expected: Vec<f32> = (0..12).map(|v| v as f32).collect();
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, expected);
        Ok(())
    }

    #[test]
    fn test_overlapping_slices_of_one_signal_are_exact() -> Result<()> {
        // frames cut from a ramp agree on their overlap, so the weighted
        // average must give back the ramp
        let signal: Vec<f32> = (0..10).map(|v| v as f32 * 0.5).collect();
        let frames = [0usize, 3, 6]
            .iter()
            .map(|&o| Tensor::new(&signal[o..o + 4], &Device::Cpu)?.reshape((1, 1, 4)))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let out = overlap_add(&frames, 3)?;
        assert_eq!(out.dims(), &[1, 1, 10]);
        let got = out.flatten_all()?.to_vec1::<f32>()?;
        for (g, w) in got.iter().zip(signal.iter()) {
            assert!((g - w).abs() < 1e-5, "{got:?}");
        }
        Ok(())
    }

    #[test]
    fn test_crossfade_blends_disagreeing_frames() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::ones((1, 1, 4), DType::F32, &device)?;
        let b = Tensor::zeros((1, 1, 4), DType::F32, &device)?;
        let out = overlap_add(&[a, b], 2)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(out.len(), 6);
        // 1 outside the overlap, fading through 2/3, 1/3, then 0
        let expected = [1.0, 1.0, 2.0 / 3.0, 1.0 / 3.0, 0.0, 0.0];
        for (g, w) in out.iter().zip(expected.iter()) {
            assert!((g - w).abs() < 1e-6, "{out:?}");
        }
        Ok(())
    }

    #[test]
    fn test_weights_sum_to_one_across_overlap() {
        let left = frame_weights(8, 3, false, true);
        let right = frame_weights(8, 3, true, false);
        for u in 0..3 {
            assert!((left[5 + u] + right[u] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rejects_mismatched_frames() -> Result<()> {
        let frames = vec![ramp(0., 4)?, ramp(0., 5)?];
        assert!(overlap_add(&frames, 4).is_err());
        assert!(overlap_add(&[], 4).is_err());
        Ok(())
    }
}
