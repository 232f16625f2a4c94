use anyhow::{Context, Result, bail};
use candle_core::{DType, Device, Tensor};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Read a WAV file as a (1, channels, length) f32 tensor in [-1, 1].
///
/// Returns the tensor and the file's sample rate.
pub fn read_wav(path: &Path, device: &Device) -> Result<(Tensor, usize)> {
    let mut reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {:?}", path))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let full_scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / full_scale))
                .collect::<Result<_, _>>()?
        }
    };

    if channels == 0 || interleaved.is_empty() {
        bail!("WAV file {:?} contains no samples", path);
    }
    let length = interleaved.len() / channels;

    // [L, R, L, R, ...] -> [[L, L, ...], [R, R, ...]]
    let mut planar = vec![0f32; length * channels];
    for (i, sample) in interleaved.into_iter().take(length * channels).enumerate() {
        planar[(i % channels) * length + i / channels] = sample;
    }

    tracing::debug!(
        channels,
        length,
        sample_rate = spec.sample_rate,
        "Read {}",
        path.display()
    );
    let wav = Tensor::from_vec(planar, (1, channels, length), device)?;
    Ok((wav, spec.sample_rate as usize))
}

/// Write a (1, channels, length) or (channels, length) tensor as 16-bit PCM.
pub fn write_wav(path: &Path, audio: &Tensor, sample_rate: usize) -> Result<()> {
    let audio = match audio.rank() {
        3 => audio.squeeze(0)?,
        2 => audio.clone(),
        1 => audio.unsqueeze(0)?,
        _ => bail!("Cannot write audio of shape {:?}", audio.dims()),
    };
    let (channels, length) = audio.dims2()?;
    if length == 0 {
        bail!("Refusing to write an empty WAV file to {:?}", path);
    }

    let spec = WavSpec {
        channels: channels as u16,
        sample_rate: sample_rate as u32,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).context("Failed to create WAV file")?;

    // interleave on the way out
    let planar = audio.to_dtype(DType::F32)?.t()?.contiguous()?.flatten_all()?.to_vec1::<f32>()?;
    for sample in planar {
        let sample = sample.clamp(-1.0, 1.0);
        writer.write_sample((sample * 32767.0) as i16)?;
    }

    writer.finalize()?;
    Ok(())
}
