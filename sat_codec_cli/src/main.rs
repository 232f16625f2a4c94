//! Command-line interface for the SAT audio codec.
//!
//! # Usage
//!
//! ```bash
//! # Create a codec directory with random codebooks
//! sat-codec init --model-path ./codec --segment 1.0 --normalize
//!
//! # Inspect the bandwidth table
//! sat-codec info --model-path ./codec
//!
//! # Encode at 6 kbps, then decode
//! sat-codec encode --model-path ./codec --input speech.wav --output codes.json --bandwidth 6
//! sat-codec decode --model-path ./codec --input codes.json --output decoded.wav
//!
//! # Both at once, plus one file per stage prefix
//! sat-codec roundtrip --model-path ./codec --input speech.wav --each-scale
//! ```

mod args;

use anyhow::{Context, Result, bail};
use candle_core::{D, Device, Tensor};
use clap::Parser;
use sat_codec::bandwidth::broadcast::LocalBroadcast;
use sat_codec::bandwidth::rng::seeded_rng;
use sat_codec::bandwidth::stages_for_bandwidth;
use sat_codec::io::{CodeStream, read_wav, write_wav};
use sat_codec::model::loader::{CodecLoader, init_checkpoint};
use sat_codec::{CodecConfig, FramewiseProjection, SatCodec};
use std::path::{Path, PathBuf};

use args::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing subscriber if --tracing flag is passed
    if cli.tracing {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .init();
    }

    let device = parse_device(&cli.device)?;

    match cli.command {
        Command::Init {
            model_path,
            config,
            sample_rate,
            channels,
            segment,
            normalize,
        } => {
            let mut config = match config {
                Some(path) => {
                    let json = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read config: {:?}", path))?;
                    CodecConfig::from_json(&json)?
                }
                None => CodecConfig::default(),
            };
            if let Some(sample_rate) = sample_rate {
                config.sample_rate = sample_rate;
            }
            if let Some(channels) = channels {
                config.channels = channels;
            }
            if segment.is_some() {
                config.segment = segment;
            }
            config.normalize |= normalize;
            // the framewise transform folds one hop of every channel per vector
            config.dimension = config.channels * config.hop_length();

            init_checkpoint(&model_path, &config, &device)?;
            println!(
                "Initialised {} ({} stages of {} bins) in {}",
                config.name,
                config.num_stages(),
                config.bins,
                model_path.display()
            );
        }
        Command::Encode {
            model_path,
            input,
            output,
            bandwidth,
        } => {
            let codec = load_codec(&model_path, &device, bandwidth)?;
            let wav = read_input(&codec, &input, &device)?;
            let length = wav.dim(D::Minus1)?;

            let frames = codec.encode(&wav)?;
            println!(
                "Encoded {} samples into {} frame(s) with {} stage(s)",
                length,
                frames.len(),
                codec.num_active_stages()
            );
            CodeStream::from_codec(&codec, length, frames).save(&output)?;
            println!("Saved codes to {}", output.display());
        }
        Command::Decode {
            model_path,
            input,
            output,
        } => {
            let codec = load_codec(&model_path, &device, None)?;
            let stream = CodeStream::load(&input, &device)?;
            if stream.sample_rate != codec.config().sample_rate
                || stream.channels != codec.config().channels
            {
                bail!(
                    "Code stream was produced at {} Hz / {} channel(s), codec runs at {} Hz / {}",
                    stream.sample_rate,
                    stream.channels,
                    codec.config().sample_rate,
                    codec.config().channels
                );
            }

            let wav = codec.decode(&stream.frames)?;
            let wav = wav.narrow(D::Minus1, 0, stream.length.min(wav.dim(D::Minus1)?))?;
            write_wav(&output, &wav, stream.sample_rate)?;
            println!("Saved audio to {}", output.display());
        }
        Command::Roundtrip {
            model_path,
            input,
            output,
            bandwidth,
            each_scale,
            save_codes,
        } => {
            let codec = load_codec(&model_path, &device, bandwidth)?;
            let wav = read_input(&codec, &input, &device)?;
            let length = wav.dim(D::Minus1)?;
            let sample_rate = codec.config().sample_rate;

            let frames = codec.encode(&wav)?;
            let usage = codec.codebook_usage(&frames)?;
            tracing::info!(usage = ?usage, "Codebook usage per stage");

            let decoded = codec.decode(&frames)?.narrow(D::Minus1, 0, length)?;
            write_wav(&output, &decoded, sample_rate)?;
            println!(
                "Saved audio to {} (mse {:.6})",
                output.display(),
                mse(&wav, &decoded)?
            );

            if let Some(path) = save_codes {
                CodeStream::from_codec(&codec, length, frames).save(&path)?;
                println!("Saved codes to {}", path.display());
            }

            if each_scale {
                for (k, partial) in codec.reconstruct_each_scale(&wav)?.iter().enumerate() {
                    let path = stage_output_path(&output, k + 1);
                    write_wav(&path, partial, sample_rate)?;
                    println!(
                        "  {} stage(s): {} (mse {:.6})",
                        k + 1,
                        path.display(),
                        mse(&wav, partial)?
                    );
                }
            }
        }
        Command::TrainStep {
            model_path,
            input,
            seed,
        } => {
            let codec = load_codec(&model_path, &device, None)?;
            let wav = read_input(&codec, &input, &device)?;

            let mut rng = seeded_rng(seed);
            let out = codec.forward_train(&wav, &mut rng, &LocalBroadcast)?;
            println!(
                "bandwidth {} kbps, {} stage(s), penalty {:.6}, mse {:.6}",
                out.bandwidth,
                out.num_stages,
                out.penalty.to_scalar::<f32>()?,
                mse(&wav, &out.output)?
            );
        }
        Command::Info { model_path } => {
            let loader = CodecLoader::from_local_dir(&model_path)?;
            let config = loader.config();
            println!("{}", serde_json::to_string_pretty(config)?);
            println!();
            println!("hop length:      {}", config.hop_length());
            println!("frame rate:      {} Hz", config.frame_rate());
            println!("bits per stage:  {}", config.bits_per_stage());
            if let (Some(len), Some(stride)) = (config.segment_length(), config.segment_stride()) {
                println!("segment:         {} samples, stride {}", len, stride);
            }
            println!();
            println!("bandwidth (kbps)  stages");
            for &bw in &config.target_bandwidths {
                let stages = stages_for_bandwidth(
                    bw,
                    config.frame_rate(),
                    config.bits_per_stage(),
                    config.num_stages(),
                );
                println!("{:>16}  {}", bw, stages);
            }
        }
    }

    Ok(())
}

fn parse_device(device: &str) -> Result<Device> {
    let device = match device {
        "cpu" => Device::Cpu,
        "cuda" | "cuda:0" => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0)?
            }
            #[cfg(not(feature = "cuda"))]
            {
                bail!("CUDA support not compiled. Rebuild with --features cuda")
            }
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)?
            }
            #[cfg(not(feature = "metal"))]
            {
                bail!("Metal support not compiled. Rebuild with --features metal")
            }
        }
        other => bail!("Unknown device: {}. Use cpu, cuda, or metal", other),
    };
    Ok(device)
}

fn load_codec(
    model_path: &Path,
    device: &Device,
    bandwidth: Option<f64>,
) -> Result<SatCodec<FramewiseProjection>> {
    let loader = CodecLoader::from_local_dir(model_path)?;
    let mut codec = loader.load_codec(device)?;
    if let Some(bandwidth) = bandwidth {
        codec.set_target_bandwidth(bandwidth)?;
    }
    tracing::info!(
        model = %model_path.display(),
        device = ?device,
        bandwidth = ?codec.target_bandwidth(),
        stages = codec.num_active_stages(),
        "Codec loaded"
    );
    Ok(codec)
}

fn read_input(
    codec: &SatCodec<FramewiseProjection>,
    path: &Path,
    device: &Device,
) -> Result<Tensor> {
    let (wav, sample_rate) = read_wav(path, device)?;
    let config = codec.config();
    if sample_rate != config.sample_rate {
        bail!(
            "{:?} is sampled at {} Hz, codec expects {} Hz",
            path,
            sample_rate,
            config.sample_rate
        );
    }
    let channels = wav.dim(1)?;
    match (channels, config.channels) {
        (c, expected) if c == expected => Ok(wav),
        (2, 1) => {
            tracing::warn!("Downmixing stereo input to mono");
            Ok(wav.mean_keepdim(1)?)
        }
        (c, expected) => bail!("{:?} has {} channel(s), codec expects {}", path, c, expected),
    }
}

fn mse(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.sqr()?.mean_all()?.to_scalar::<f32>()?)
}

fn stage_output_path(output: &Path, stages: usize) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!("{stem}.stage{stages}.wav"))
}
