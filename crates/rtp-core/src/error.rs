//! Error types for RTP parsing and payload decoding.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the RTP/SAP layer.
///
/// Per the engine's error policy these are logged and counted by callers;
/// none of them propagate past the receiver threads.
#[derive(Debug, Error)]
pub enum Error {
    /// Datagram too small or structurally invalid for RTP.
    #[error("malformed RTP packet: {0}")]
    MalformedPacket(String),

    /// Payload bytes could not be decoded with the resolved codec.
    #[error("payload decode failed: {0}")]
    DecodeFailed(String),

    /// Opus decoder reported an error.
    #[error("opus error: {0}")]
    Opus(#[from] opus::Error),

    /// SDP text could not be parsed into stream properties.
    #[error("invalid SDP: {0}")]
    InvalidSdp(String),

    /// Socket-level failure in the SAP listener.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// A stream's declared format is impossible (channels, depth or rate).
    #[error("unsupported stream format: {0}")]
    UnsupportedFormat(String),
}
