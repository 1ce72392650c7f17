//! Engine error types.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by engine components.
///
/// The hot path never propagates these to callers; they are logged, counted
/// in telemetry, and the affected packet is dropped. Construction-time
/// errors (sockets, DSP allocation) do propagate so a component either
/// starts whole or not at all.
#[derive(Debug, Error)]
pub enum Error {
    /// A packet's declared format is impossible or its payload size does not
    /// match it.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// DSP chain construction failed; the processor must not be left
    /// half-built.
    #[error("audio processor construction failed: {0}")]
    ProcessorConstruction(String),

    /// Resampler error from the converter library.
    #[error("resampler error: {0}")]
    Resampler(#[from] samplerate::Error),

    /// Socket setup or send failure.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// MP3 encoder setup failure.
    #[error("mp3 encoder error: {0}")]
    Mp3Encoder(String),

    /// A component was started twice or used before start.
    #[error("invalid component state: {0}")]
    InvalidState(String),

    /// Error bubbled up from the RTP layer during receiver setup.
    #[error(transparent)]
    Rtp(#[from] screamrouter_rtp_core::Error),
}
