use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SAT codec Command Line Interface
///
/// Encode audio into multi-scale RVQ codes and decode them back.
#[derive(Parser, Debug)]
#[command(name = "sat-codec")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Device to use (cpu, cuda, metal).
    #[arg(long, global = true, default_value = "cpu")]
    pub device: String,

    /// Enable tracing output (filter with RUST_LOG)
    #[arg(long, global = true)]
    pub tracing: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a codec directory with randomly initialised codebooks
    Init {
        /// Directory to write config.json and model.safetensors to
        #[arg(short = 'p', long)]
        model_path: PathBuf,

        /// Start from this config.json instead of the defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Sample rate in Hz
        #[arg(long)]
        sample_rate: Option<usize>,

        /// Number of audio channels (1 or 2)
        #[arg(long)]
        channels: Option<usize>,

        /// Segment duration in seconds
        #[arg(long)]
        segment: Option<f64>,

        /// Normalize segment loudness before encoding
        #[arg(long)]
        normalize: bool,
    },

    /// Encode a WAV file to a code stream
    Encode {
        #[arg(short = 'p', long)]
        model_path: PathBuf,

        /// Input WAV file
        #[arg(short, long)]
        input: PathBuf,

        /// Output code stream (JSON)
        #[arg(short, long, default_value = "codes.json")]
        output: PathBuf,

        /// Target bandwidth in kbps (default: every stage)
        #[arg(short, long)]
        bandwidth: Option<f64>,
    },

    /// Decode a code stream to a WAV file
    Decode {
        #[arg(short = 'p', long)]
        model_path: PathBuf,

        /// Input code stream (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Output WAV file
        #[arg(short, long, default_value = "decoded.wav")]
        output: PathBuf,
    },

    /// Encode and decode a WAV file in one go
    Roundtrip {
        #[arg(short = 'p', long)]
        model_path: PathBuf,

        /// Input WAV file
        #[arg(short, long)]
        input: PathBuf,

        /// Output WAV file
        #[arg(short, long, default_value = "roundtrip.wav")]
        output: PathBuf,

        /// Target bandwidth in kbps (default: every stage)
        #[arg(short, long)]
        bandwidth: Option<f64>,

        /// Also write one file per stage prefix (`<output>.stage<k>.wav`)
        #[arg(long)]
        each_scale: bool,

        /// Save the intermediate code stream
        #[arg(long)]
        save_codes: Option<PathBuf>,
    },

    /// Run one training-mode pass and report the penalty
    TrainStep {
        #[arg(short = 'p', long)]
        model_path: PathBuf,

        /// Input WAV file
        #[arg(short, long)]
        input: PathBuf,

        /// Seed for the bandwidth draw
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Print the codec configuration and its bandwidth table
    Info {
        #[arg(short = 'p', long)]
        model_path: PathBuf,
    },
}
