//! Opus payload handler with per-SSRC decoder state.

use std::collections::HashMap;

use tracing::{debug, error};

use crate::codec::opus::{canonical_layout, OpusLayout, OpusStreamDecoder};
use crate::layout::{channel_mask_bytes, default_channel_mask_for_channels};
use crate::sap::{StreamCodec, StreamProperties};
use crate::{RtpPacketData, Ssrc, PAYLOAD_TYPE_OPUS};

use super::{DecodedAudio, RtpPayloadHandler};

const DEFAULT_OPUS_SAMPLE_RATE: u32 = 48000;
const DEFAULT_OPUS_CHANNELS: u16 = 2;

struct DecoderState {
    decoder: OpusStreamDecoder,
    channel_mask: u32,
}

/// Decodes Opus payloads, one decoder chain per SSRC.
///
/// Decoders are rebuilt whenever the sample rate, channel count or
/// multistream layout changes, and torn down when the receiver clears the
/// SSRC's state.
#[derive(Default)]
pub struct RtpOpusHandler {
    decoders: HashMap<Ssrc, DecoderState>,
}

impl RtpOpusHandler {
    /// Resolves the layout for a stream: announced tuple first, canonical
    /// table otherwise. Returns `None` for unresolvable configurations.
    fn resolve_layout(properties: &StreamProperties, channels: u16) -> Option<Option<OpusLayout>> {
        if channels <= 2 {
            return Some(None);
        }

        let announced = OpusLayout {
            streams: properties.opus_streams,
            coupled_streams: properties.opus_coupled_streams,
            mapping: properties.opus_channel_mapping.clone(),
        };
        if announced.streams > 0 && announced.matches_channels(channels) {
            return Some(Some(announced));
        }

        match canonical_layout(channels) {
            Some(layout) => Some(Some(layout)),
            None => {
                error!(channels, "unable to resolve opus multistream layout");
                None
            }
        }
    }
}

impl RtpPayloadHandler for RtpOpusHandler {
    fn supports_payload_type(&self, payload_type: u8) -> bool {
        payload_type == PAYLOAD_TYPE_OPUS
    }

    fn decode(
        &mut self,
        packet: &RtpPacketData,
        properties: &StreamProperties,
    ) -> Option<DecodedAudio> {
        if packet.payload.is_empty() {
            return None;
        }
        if properties.codec != StreamCodec::Opus && properties.codec != StreamCodec::Unknown {
            return None;
        }

        let sample_rate = if properties.sample_rate > 0 {
            properties.sample_rate
        } else {
            DEFAULT_OPUS_SAMPLE_RATE
        };
        let channels = if properties.channels > 0 {
            properties.channels
        } else {
            DEFAULT_OPUS_CHANNELS
        };
        let layout = Self::resolve_layout(properties, channels)?;

        let needs_rebuild = match self.decoders.get(&packet.ssrc) {
            None => true,
            Some(state) => {
                state.decoder.sample_rate() != sample_rate
                    || state.decoder.channels() != channels
                    || state.decoder.layout() != layout.as_ref()
            }
        };

        if needs_rebuild {
            match OpusStreamDecoder::new(sample_rate, channels, layout) {
                Ok(decoder) => {
                    debug!(
                        ssrc = packet.ssrc,
                        sample_rate, channels, "rebuilt opus decoder state"
                    );
                    self.decoders.insert(
                        packet.ssrc,
                        DecoderState {
                            decoder,
                            channel_mask: default_channel_mask_for_channels(channels),
                        },
                    );
                }
                Err(err) => {
                    error!(ssrc = packet.ssrc, %err, "failed to create opus decoder");
                    self.decoders.remove(&packet.ssrc);
                    return None;
                }
            }
        }

        let state = self.decoders.get_mut(&packet.ssrc)?;
        let samples = match state.decoder.decode(&packet.payload) {
            Ok(samples) => samples,
            Err(err) => {
                error!(ssrc = packet.ssrc, %err, "opus decode failed");
                return None;
            }
        };

        let mut audio_data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            audio_data.extend_from_slice(&sample.to_le_bytes());
        }

        let (chlayout1, chlayout2) = channel_mask_bytes(state.channel_mask);
        Some(DecodedAudio {
            audio_data,
            sample_rate,
            channels,
            bit_depth: 16,
            chlayout1,
            chlayout2,
        })
    }

    fn on_ssrc_state_cleared(&mut self, ssrc: Ssrc) {
        if self.decoders.remove(&ssrc).is_some() {
            debug!(ssrc, "dropped opus decoder state");
        }
    }

    fn on_all_ssrcs_cleared(&mut self) {
        self.decoders.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn opus_packet(payload: Vec<u8>, ssrc: u32) -> RtpPacketData {
        RtpPacketData {
            sequence_number: 1,
            rtp_timestamp: 960,
            received_time: Instant::now(),
            payload: payload.into(),
            ssrc,
            csrcs: vec![],
            payload_type: 111,
            ingress_from_loopback: false,
        }
    }

    fn encode_stereo_frame() -> Vec<u8> {
        let mut encoder =
            opus::Encoder::new(48000, opus::Channels::Stereo, opus::Application::Audio).unwrap();
        let pcm = vec![0i16; 960 * 2];
        let mut packet = vec![0u8; 4000];
        let len = encoder.encode(&pcm, &mut packet).unwrap();
        packet.truncate(len);
        packet
    }

    #[test]
    fn decodes_stereo_with_default_properties() {
        let mut handler = RtpOpusHandler::default();
        let payload = encode_stereo_frame();
        let decoded = handler
            .decode(&opus_packet(payload, 42), &StreamProperties::default())
            .unwrap();
        assert_eq!(decoded.sample_rate, 48000);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.bit_depth, 16);
        // 20 ms at 48 kHz stereo, 2 bytes per sample.
        assert_eq!(decoded.audio_data.len(), 960 * 2 * 2);
        assert_eq!(decoded.chlayout1, 0x03);
    }

    #[test]
    fn ssrc_clear_drops_decoder_state() {
        let mut handler = RtpOpusHandler::default();
        let payload = encode_stereo_frame();
        handler
            .decode(&opus_packet(payload, 42), &StreamProperties::default())
            .unwrap();
        assert_eq!(handler.decoders.len(), 1);
        handler.on_ssrc_state_cleared(42);
        assert!(handler.decoders.is_empty());
    }

    #[test]
    fn unresolvable_layout_fails_packet() {
        let mut handler = RtpOpusHandler::default();
        let props = StreamProperties {
            channels: 12, // outside every canonical layout
            codec: StreamCodec::Opus,
            ..Default::default()
        };
        assert!(handler.decode(&opus_packet(vec![0x01], 7), &props).is_none());
    }
}
