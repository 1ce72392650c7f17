//! Linear PCM (L16/L24/L32) payload handler.

use crate::layout::{channel_mask_bytes, default_channel_mask_for_channels};
use crate::sap::{Endianness, StreamCodec, StreamProperties};
use crate::{is_host_little_endian, swap_endianness, RtpPacketData, PAYLOAD_TYPE_L16_STEREO};

use super::{DecodedAudio, RtpPayloadHandler};

/// Copies PCM payloads, fixing byte order to host little-endian.
#[derive(Debug, Default)]
pub struct RtpPcmHandler;

impl RtpPayloadHandler for RtpPcmHandler {
    fn supports_payload_type(&self, payload_type: u8) -> bool {
        payload_type == PAYLOAD_TYPE_L16_STEREO
    }

    fn decode(
        &mut self,
        packet: &RtpPacketData,
        properties: &StreamProperties,
    ) -> Option<DecodedAudio> {
        if packet.payload.is_empty() {
            return None;
        }
        if properties.codec != StreamCodec::Pcm && properties.codec != StreamCodec::Unknown {
            return None;
        }
        if !properties.is_plausible() {
            return None;
        }

        let mut audio_data = packet.payload.to_vec();
        let host_le = is_host_little_endian();
        let wire_be = properties.endianness == Endianness::Big;
        if (wire_be && host_le) || (!wire_be && !host_le) {
            swap_endianness(&mut audio_data, properties.bit_depth);
        }

        let mask = if properties.channels == 2 {
            0x0003
        } else {
            default_channel_mask_for_channels(properties.channels)
        };
        let (chlayout1, chlayout2) = channel_mask_bytes(mask);

        Some(DecodedAudio {
            audio_data,
            sample_rate: properties.sample_rate,
            channels: properties.channels,
            bit_depth: properties.bit_depth,
            chlayout1,
            chlayout2,
        })
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
            payload_type: 127,
            ingress_from_loopback: false,
        }
    }

    fn props(endianness: Endianness) -> StreamProperties {
        StreamProperties {
            sample_rate: 48000,
            channels: 2,
            bit_depth: 16,
            endianness,
            codec: StreamCodec::Pcm,
            ..Default::default()
        }
    }

    #[test]
    fn big_endian_wire_is_swapped_on_le_host() {
        let mut handler = RtpPcmHandler;
        let decoded = handler
            .decode(&packet(vec![0x12, 0x34, 0x56, 0x78]), &props(Endianness::Big))
            .unwrap();
        if is_host_little_endian() {
            assert_eq!(decoded.audio_data, vec![0x34, 0x12, 0x78, 0x56]);
        } else {
            assert_eq!(decoded.audio_data, vec![0x12, 0x34, 0x56, 0x78]);
        }
        assert_eq!(decoded.chlayout1, 0x03);
        assert_eq!(decoded.chlayout2, 0x00);
    }

    #[test]
    fn little_endian_wire_passes_through_on_le_host() {
        let mut handler = RtpPcmHandler;
        let decoded = handler
            .decode(
                &packet(vec![0x34, 0x12, 0x78, 0x56]),
                &props(Endianness::Little),
            )
            .unwrap();
        if is_host_little_endian() {
            assert_eq!(decoded.audio_data, vec![0x34, 0x12, 0x78, 0x56]);
        }
    }

    #[test]
    fn rejects_wrong_codec() {
        let mut handler = RtpPcmHandler;
        let mut p = props(Endianness::Big);
        p.codec = StreamCodec::Opus;
        assert!(handler.decode(&packet(vec![0, 0]), &p).is_none());
    }

    #[test]
    fn rejects_empty_payload() {
        let mut handler = RtpPcmHandler;
        assert!(handler
            .decode(&packet(vec![]), &props(Endianness::Big))
            .is_none());
    }
}
