//! Shared SAP/stream metadata types.

use crate::Ssrc;

/// Byte order of PCM samples on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Least significant byte first.
    Little,
    /// Most significant byte first (network order, the RTP default).
    #[default]
    Big,
}

/// Codec a stream's payload is encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamCodec {
    /// Linear PCM (L16/L24/L32).
    Pcm,
    /// G.711 μ-law.
    Pcmu,
    /// G.711 A-law.
    Pcma,
    /// Opus.
    Opus,
    /// Not yet resolved.
    #[default]
    Unknown,
}

/// Resolved format of one RTP stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamProperties {
    /// Samples per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Bits per sample of the wire payload.
    pub bit_depth: u16,
    /// Wire byte order (PCM only).
    pub endianness: Endianness,
    /// RTP port the stream was announced on (0 when unknown).
    pub port: u16,
    /// Announced payload type (negative when unknown).
    pub payload_type: i32,
    /// Payload codec.
    pub codec: StreamCodec,
    /// Opus: elementary stream count (0 = derive from channel count).
    pub opus_streams: u8,
    /// Opus: coupled (stereo) stream count.
    pub opus_coupled_streams: u8,
    /// Opus: channel mapping family.
    pub opus_mapping_family: u8,
    /// Opus: explicit channel mapping table (empty = derive).
    pub opus_channel_mapping: Vec<u8>,
}

impl StreamProperties {
    /// True when the format fields describe a decodable stream.
    pub fn is_plausible(&self) -> bool {
        self.sample_rate > 0
            && (1..=8).contains(&self.channels)
            && matches!(self.bit_depth, 8 | 16 | 24 | 32)
    }
}

/// One announcement as filed in the directory.
#[derive(Debug, Clone, Default)]
pub struct SapAnnouncement {
    /// Connection address from the SDP `c=` line.
    pub stream_ip: String,
    /// Address the announcement datagram came from.
    pub announcer_ip: String,
    /// RTP port from the `m=audio` line.
    pub port: u16,
    /// Resolved stream format.
    pub properties: StreamProperties,
    /// Routing GUID carried in `x-screamrouter-guid`, if any.
    pub stream_guid: String,
    /// Sink hint carried in `x-screamrouter-target`, if any.
    pub target_sink: String,
    /// Host hint carried in `x-screamrouter-target`, if any.
    pub target_host: String,
    /// Session name from the `s=` line.
    pub session_name: String,
}

/// Result of parsing one SAP datagram.
#[derive(Debug, Clone, Default)]
pub struct ParsedSapInfo {
    /// Session id from the `o=` line, used as the stream SSRC.
    pub ssrc: Ssrc,
    /// Connection address.
    pub stream_ip: String,
    /// RTP port.
    pub port: u16,
    /// Resolved format.
    pub properties: StreamProperties,
    /// Routing GUID, if announced.
    pub stream_guid: String,
    /// Target sink hint, if announced.
    pub target_sink: String,
    /// Target host hint, if announced.
    pub target_host: String,
    /// Session name.
    pub session_name: String,
}
