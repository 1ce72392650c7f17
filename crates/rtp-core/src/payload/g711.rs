//! G.711 (PCMU/PCMA) payload handlers.

use crate::codec::g711::{decode_alaw, decode_mulaw};
use crate::layout::{channel_mask_bytes, default_channel_mask_for_channels};
use crate::sap::{StreamCodec, StreamProperties};
use crate::{RtpPacketData, PAYLOAD_TYPE_PCMA, PAYLOAD_TYPE_PCMU};

use super::{DecodedAudio, RtpPayloadHandler};

const DEFAULT_G711_SAMPLE_RATE: u32 = 8000;
const DEFAULT_G711_CHANNELS: u16 = 1;

/// μ-law payload handler.
#[derive(Debug, Default)]
pub struct RtpPcmuHandler;

/// A-law payload handler.
#[derive(Debug, Default)]
pub struct RtpPcmaHandler;

fn decode_g711(
    packet: &RtpPacketData,
    properties: &StreamProperties,
    expected_codec: StreamCodec,
    expand: fn(&[u8]) -> Vec<u8>,
) -> Option<DecodedAudio> {
    if packet.payload.is_empty() {
        return None;
    }
    if properties.codec != expected_codec && properties.codec != StreamCodec::Unknown {
        return None;
    }

    let sample_rate = if properties.sample_rate > 0 {
        properties.sample_rate
    } else {
        DEFAULT_G711_SAMPLE_RATE
    };
    let channels = if properties.channels > 0 {
        properties.channels
    } else {
        DEFAULT_G711_CHANNELS
    };

    let mask = default_channel_mask_for_channels(channels);
    let (chlayout1, chlayout2) = channel_mask_bytes(mask);

    Some(DecodedAudio {
        audio_data: expand(&packet.payload),
        sample_rate,
        channels,
        bit_depth: 16,
        chlayout1,
        chlayout2,
    })
}

impl RtpPayloadHandler for RtpPcmuHandler {
    fn supports_payload_type(&self, payload_type: u8) -> bool {
        payload_type == PAYLOAD_TYPE_PCMU
    }

    fn decode(
        &mut self,
        packet: &RtpPacketData,
        properties: &StreamProperties,
    ) -> Option<DecodedAudio> {
        decode_g711(packet, properties, StreamCodec::Pcmu, decode_mulaw)
    }
}

impl RtpPayloadHandler for RtpPcmaHandler {
    fn supports_payload_type(&self, payload_type: u8) -> bool {
        payload_type == PAYLOAD_TYPE_PCMA
    }

    fn decode(
        &mut self,
        packet: &RtpPacketData,
        properties: &StreamProperties,
    ) -> Option<DecodedAudio> {
        decode_g711(packet, properties, StreamCodec::Pcma, decode_alaw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn packet(payload: Vec<u8>) -> RtpPacketData {
        RtpPacketData {
            sequence_number: 1,
            rtp_timestamp: 0,
            received_time: Instant::now(),
            payload: payload.into(),
            ssrc: 1,
            csrcs: vec![],
            payload_type: 0,
            ingress_from_loopback: false,
        }
    }

    #[test]
    fn pcmu_mono_8k_decode() {
        let mut handler = RtpPcmuHandler;
        let mut payload = vec![0u8; 160];
        payload[0] = 0xFF;
        payload[1] = 0x80;
        let decoded = handler
            .decode(&packet(payload), &StreamProperties::default())
            .unwrap();
        assert_eq!(decoded.sample_rate, 8000);
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.bit_depth, 16);
        assert_eq!(decoded.audio_data.len(), 320);
        // 0xFF is μ-law silence.
        assert_eq!(
            i16::from_le_bytes([decoded.audio_data[0], decoded.audio_data[1]]),
            0
        );
        // 0x80 is the largest positive expansion value.
        assert_eq!(
            i16::from_le_bytes([decoded.audio_data[2], decoded.audio_data[3]]),
            32124
        );
        assert_eq!(decoded.chlayout1, 0x04); // mono = front center
    }

    #[test]
    fn pcma_uses_announced_format() {
        let mut handler = RtpPcmaHandler;
        let props = StreamProperties {
            sample_rate: 16000,
            channels: 2,
            codec: StreamCodec::Pcma,
            ..Default::default()
        };
        let decoded = handler.decode(&packet(vec![0x55, 0xD5]), &props).unwrap();
        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.channels, 2);
        assert_eq!(
            i16::from_le_bytes([decoded.audio_data[0], decoded.audio_data[1]]),
            -8
        );
    }

    #[test]
    fn wrong_codec_is_rejected() {
        let mut handler = RtpPcmuHandler;
        let props = StreamProperties {
            codec: StreamCodec::Opus,
            ..Default::default()
        };
        assert!(handler.decode(&packet(vec![0xFF]), &props).is_none());
    }
}
