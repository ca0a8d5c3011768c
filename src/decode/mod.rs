use std::{collections::HashMap, path::Path, time::Duration};
use thiserror::Error;

// Mods and stuff -----------
// --------------------------
#[cfg(feature = "symphonia")]
pub mod rusty;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

#[cfg(feature = "symphonia")]
pub use rusty::RustyDecoder;
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegDecoder;

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("Internal decoder error: {0}")]
    InternalError(String),

    #[error("Could not open media: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode packet")]
    DecodeFailed,

    #[error("End of stream")]
    EndOfStream,

    #[error("No timebase, cannot calculate time")]
    NoTimebase,

    #[error("No supported audio track")]
    NoTrack,

    #[error("No decoder can handle {0}")]
    Unsupported(String),

    #[error("Timed out waiting for decoded data")]
    DecodeTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub rate: u32,
    pub channels: u16,
    pub packet_size: u64,
}

pub trait Decoder {
    fn seek(&mut self, pos: Duration) -> Result<(), DecoderError>;

    /// Timestamp of the most recently decoded packet.
    fn position(&self) -> Option<Duration>;

    /// Total length of the stream, if it is known.
    fn duration(&self) -> Option<Duration>;

    /// Write the decoder's planar samples into the provided buffer, and return
    /// the number of samples written
    fn next_packet_to_buf(&mut self, buf: &mut [f32]) -> Result<usize, DecoderError>;

    fn params(&self) -> StreamParams;

    fn metadata(&self) -> HashMap<String, String>;
}

/// Find the length of a file without playing it.
pub fn media_duration<P: AsRef<Path>>(path: P) -> Option<Duration> {
    let uri = crate::utils::path_to_uri(&path).ok()?;
    crate::utils::pick_format(&uri).ok()?.duration()
}
