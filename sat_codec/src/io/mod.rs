//! File formats: WAV audio and persisted code streams.

pub mod code_stream;
pub mod wav;

pub use code_stream::CodeStream;
pub use wav::{read_wav, write_wav};
