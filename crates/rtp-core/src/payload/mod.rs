//! Per-codec RTP payload handlers.
//!
//! A handler turns a reordered [`RtpPacketData`] plus resolved
//! [`StreamProperties`] into [`DecodedAudio`]: canonical little-endian
//! interleaved PCM with format fields and the Scream channel-mask bytes.
//! The codec set is closed (PCM, PCMU, PCMA, Opus) but handlers stay behind
//! a trait so the receiver drain can iterate a registration list.

mod defaults;
mod g711;
mod opus;
mod pcm;

pub use defaults::{find_payload_default, properties_from_payload_type, PayloadTypeDefault};
pub use g711::{RtpPcmaHandler, RtpPcmuHandler};
pub use opus::RtpOpusHandler;
pub use pcm::RtpPcmHandler;

use crate::sap::StreamProperties;
use crate::{RtpPacketData, Ssrc};

/// Canonical PCM audio produced by a payload handler.
#[derive(Debug, Clone, Default)]
pub struct DecodedAudio {
    /// Interleaved little-endian PCM.
    pub audio_data: Vec<u8>,
    /// Samples per second.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Bits per sample after decode.
    pub bit_depth: u16,
    /// Scream channel-mask low byte.
    pub chlayout1: u8,
    /// Scream channel-mask high byte.
    pub chlayout2: u8,
}

/// One codec's decode path.
pub trait RtpPayloadHandler: Send {
    /// Whether this handler owns the canonical payload type.
    fn supports_payload_type(&self, payload_type: u8) -> bool;

    /// Decodes one packet. Returns `None` when the payload cannot be decoded
    /// with the resolved properties (the caller logs and drops it).
    fn decode(&mut self, packet: &RtpPacketData, properties: &StreamProperties)
        -> Option<DecodedAudio>;

    /// Per-SSRC state (decoders) for `ssrc` is no longer valid.
    fn on_ssrc_state_cleared(&mut self, _ssrc: Ssrc) {}

    /// All per-SSRC state is no longer valid.
    fn on_all_ssrcs_cleared(&mut self) {}
}

/// Collapses wire payload types onto the canonical handler types.
///
/// 10 and 11 are both L16; anything the resolved properties claim maps to
/// the codec's canonical type.
pub fn canonicalize_payload_type(payload_type: u8, properties: Option<&StreamProperties>) -> u8 {
    use crate::sap::StreamCodec;
    if let Some(props) = properties {
        if props.payload_type >= 0 && payload_type == props.payload_type as u8 {
            match props.codec {
                StreamCodec::Opus => return crate::PAYLOAD_TYPE_OPUS,
                StreamCodec::Pcm => return crate::PAYLOAD_TYPE_L16_STEREO,
                StreamCodec::Pcmu => return crate::PAYLOAD_TYPE_PCMU,
                StreamCodec::Pcma => return crate::PAYLOAD_TYPE_PCMA,
                StreamCodec::Unknown => {}
            }
        }
    }
    if payload_type == 10 || payload_type == 11 {
        return crate::PAYLOAD_TYPE_L16_STEREO;
    }
    payload_type
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sap::StreamCodec;

    #[test]
    fn static_l16_types_collapse() {
        assert_eq!(canonicalize_payload_type(10, None), 127);
        assert_eq!(canonicalize_payload_type(11, None), 127);
        assert_eq!(canonicalize_payload_type(0, None), 0);
        assert_eq!(canonicalize_payload_type(96, None), 96);
    }

    #[test]
    fn announced_codec_wins() {
        let props = StreamProperties {
            payload_type: 96,
            codec: StreamCodec::Opus,
            ..Default::default()
        };
        assert_eq!(canonicalize_payload_type(96, Some(&props)), 111);
        // A different wire PT does not match the announcement.
        assert_eq!(canonicalize_payload_type(97, Some(&props)), 97);
    }
}
