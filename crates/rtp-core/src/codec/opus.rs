//! Opus decoding with per-stream elementary decoders.
//!
//! Mono and stereo streams decode through a single `opus::Decoder`. Streams
//! with more than two channels use RTP multistream framing (RFC 7587 carrying
//! RFC 6716): the payload concatenates one packet per elementary stream, all
//! but the last in the self-delimiting framing of RFC 6716 Appendix B. Each
//! elementary stream gets its own mono/stereo decoder and the decoded
//! channels are interleaved through the channel mapping table.
//!
//! When no mapping is announced, the canonical mapping-family-1 (Vorbis
//! order) layout for the channel count applies.

use opus::Channels;
use tracing::debug;

use crate::{Error, Result};

/// Maximum Opus frame duration accepted per packet, in milliseconds.
pub const MAX_FRAME_MS: u32 = 120;

/// Multistream layout: stream counts plus the channel mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusLayout {
    /// Total elementary streams in each packet.
    pub streams: u8,
    /// How many of those streams are coupled (stereo).
    pub coupled_streams: u8,
    /// Output channel → coded channel index (255 = silence).
    pub mapping: Vec<u8>,
}

impl OpusLayout {
    /// Number of coded channels this layout produces.
    pub fn coded_channels(&self) -> u16 {
        self.coupled_streams as u16 * 2 + (self.streams - self.coupled_streams) as u16
    }

    /// Checks stream counts against the output channel count.
    pub fn matches_channels(&self, channels: u16) -> bool {
        self.streams > 0
            && self.coupled_streams <= self.streams
            && self.mapping.len() == channels as usize
            && self
                .mapping
                .iter()
                .all(|&m| m == 255 || (m as u16) < self.coded_channels())
    }
}

/// Canonical mapping family 1 layouts (RFC 7845 §5.1.1.2, Vorbis order).
pub fn canonical_layout(channels: u16) -> Option<OpusLayout> {
    let (streams, coupled, mapping): (u8, u8, &[u8]) = match channels {
        1 => (1, 0, &[0]),
        2 => (1, 1, &[0, 1]),
        3 => (2, 1, &[0, 2, 1]),
        4 => (2, 2, &[0, 1, 2, 3]),
        5 => (3, 2, &[0, 4, 1, 2, 3]),
        6 => (4, 2, &[0, 4, 1, 2, 3, 5]),
        7 => (4, 3, &[0, 4, 1, 2, 3, 5, 6]),
        8 => (5, 3, &[0, 6, 1, 2, 3, 4, 5, 7]),
        _ => return None,
    };
    Some(OpusLayout {
        streams,
        coupled_streams: coupled,
        mapping: mapping.to_vec(),
    })
}

/// Maximum decodable samples per channel for one packet at `sample_rate`.
pub fn maximum_frame_samples(sample_rate: u32) -> usize {
    ((sample_rate as u64 * MAX_FRAME_MS as u64).div_ceil(1000)) as usize
}

/// Stateful decoder for one SSRC.
pub struct OpusStreamDecoder {
    sample_rate: u32,
    channels: u16,
    layout: Option<OpusLayout>,
    decoders: Vec<opus::Decoder>,
}

impl OpusStreamDecoder {
    /// Builds a decoder for the given format.
    ///
    /// `layout` must be `Some` when `channels > 2` and is ignored otherwise.
    pub fn new(sample_rate: u32, channels: u16, layout: Option<OpusLayout>) -> Result<Self> {
        if channels == 0 || channels > 8 {
            return Err(Error::UnsupportedFormat(format!(
                "opus channel count {channels} out of range"
            )));
        }

        let (layout, decoders) = if channels <= 2 {
            let mode = if channels == 1 {
                Channels::Mono
            } else {
                Channels::Stereo
            };
            (None, vec![opus::Decoder::new(sample_rate, mode)?])
        } else {
            let layout = layout.ok_or_else(|| {
                Error::UnsupportedFormat(format!(
                    "no multistream layout for {channels} opus channels"
                ))
            })?;
            if !layout.matches_channels(channels) {
                return Err(Error::UnsupportedFormat(format!(
                    "opus layout (streams={}, coupled={}, mapping={:?}) does not cover {channels} channels",
                    layout.streams, layout.coupled_streams, layout.mapping
                )));
            }
            let mut decoders = Vec::with_capacity(layout.streams as usize);
            for stream in 0..layout.streams {
                let mode = if stream < layout.coupled_streams {
                    Channels::Stereo
                } else {
                    Channels::Mono
                };
                decoders.push(opus::Decoder::new(sample_rate, mode)?);
            }
            (Some(layout), decoders)
        };

        debug!(
            sample_rate,
            channels,
            streams = decoders.len(),
            "configured opus decoder"
        );

        Ok(OpusStreamDecoder {
            sample_rate,
            channels,
            layout,
            decoders,
        })
    }

    /// Sample rate the decoder was built for.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Output channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// The active multistream layout, if any.
    pub fn layout(&self) -> Option<&OpusLayout> {
        self.layout.as_ref()
    }

    /// Decodes one RTP payload into interleaved 16-bit samples.
    ///
    /// Returns the decoded samples; length is `frames × channels`.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        if payload.is_empty() {
            return Err(Error::DecodeFailed("empty opus payload".into()));
        }
        match self.layout.clone() {
            None => self.decode_simple(payload),
            Some(layout) => self.decode_multistream(payload, &layout),
        }
    }

    fn decode_simple(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        let max_samples = maximum_frame_samples(self.sample_rate);
        let mut buffer = vec![0i16; max_samples * self.channels as usize];
        let frames = self.decoders[0].decode(payload, &mut buffer, false)?;
        buffer.truncate(frames * self.channels as usize);
        Ok(buffer)
    }

    fn decode_multistream(&mut self, payload: &[u8], layout: &OpusLayout) -> Result<Vec<i16>> {
        let packets = split_multistream_payload(payload, layout.streams as usize)?;
        let max_samples = maximum_frame_samples(self.sample_rate);

        // Decode every elementary stream; all streams must agree on duration.
        let mut stream_pcm: Vec<Vec<i16>> = Vec::with_capacity(packets.len());
        let mut frames: Option<usize> = None;
        for (index, packet) in packets.iter().enumerate() {
            let stream_channels = if (index as u8) < layout.coupled_streams {
                2
            } else {
                1
            };
            let mut buffer = vec![0i16; max_samples * stream_channels];
            let decoded = self.decoders[index].decode(packet, &mut buffer, false)?;
            match frames {
                None => frames = Some(decoded),
                Some(expected) if expected != decoded => {
                    return Err(Error::DecodeFailed(format!(
                        "stream {index} decoded {decoded} frames, expected {expected}"
                    )));
                }
                Some(_) => {}
            }
            buffer.truncate(decoded * stream_channels);
            stream_pcm.push(buffer);
        }
        let frames = frames.unwrap_or(0);

        // Route coded channels to output channels through the mapping.
        let channels = self.channels as usize;
        let mut out = vec![0i16; frames * channels];
        for (out_ch, &coded) in layout.mapping.iter().enumerate() {
            if coded == 255 {
                continue; // silent channel
            }
            let coded = coded as usize;
            let coupled = layout.coupled_streams as usize;
            let (stream, within, stride) = if coded < coupled * 2 {
                (coded / 2, coded % 2, 2)
            } else {
                (coupled + (coded - coupled * 2), 0, 1)
            };
            let pcm = &stream_pcm[stream];
            for frame in 0..frames {
                out[frame * channels + out_ch] = pcm[frame * stride + within];
            }
        }
        Ok(out)
    }
}

/// Splits a multistream payload into standard-framed elementary packets.
///
/// The first `streams - 1` packets use the RFC 6716 Appendix B
/// self-delimiting framing; the final packet is standard and runs to the end
/// of the payload.
pub fn split_multistream_payload(payload: &[u8], streams: usize) -> Result<Vec<Vec<u8>>> {
    if streams == 0 {
        return Err(Error::DecodeFailed("zero opus streams".into()));
    }
    let mut packets = Vec::with_capacity(streams);
    let mut pos = 0usize;
    for _ in 0..streams - 1 {
        let (packet, consumed) = undelimit_packet(&payload[pos..])?;
        packets.push(packet);
        pos += consumed;
    }
    if pos >= payload.len() {
        return Err(Error::DecodeFailed(
            "multistream payload exhausted before final stream".into(),
        ));
    }
    packets.push(payload[pos..].to_vec());
    Ok(packets)
}

/// Reads a one- or two-byte frame length (RFC 6716 §3.2.1).
fn parse_size(data: &[u8]) -> Result<(usize, usize)> {
    match data.first() {
        None => Err(Error::DecodeFailed("truncated opus length field".into())),
        Some(&b0) if b0 < 252 => Ok((b0 as usize, 1)),
        Some(&b0) => match data.get(1) {
            None => Err(Error::DecodeFailed("truncated opus length field".into())),
            Some(&b1) => Ok((b1 as usize * 4 + b0 as usize, 2)),
        },
    }
}

/// Converts one self-delimited packet at the front of `data` into standard
/// framing, returning the packet and the number of input bytes consumed.
fn undelimit_packet(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let toc = *data
        .first()
        .ok_or_else(|| Error::DecodeFailed("empty self-delimited packet".into()))?;
    let code = toc & 0x03;

    let take = |pos: usize, len: usize| -> Result<&[u8]> {
        data.get(pos..pos + len)
            .ok_or_else(|| Error::DecodeFailed("truncated self-delimited frame".into()))
    };

    match code {
        0 => {
            // One frame; the self-delimited form adds its length after the TOC.
            let (len, len_bytes) = parse_size(&data[1..])?;
            let frame = take(1 + len_bytes, len)?;
            let mut packet = Vec::with_capacity(1 + len);
            packet.push(toc);
            packet.extend_from_slice(frame);
            Ok((packet, 1 + len_bytes + len))
        }
        1 => {
            // Two equal frames; the added length covers each of them.
            let (len, len_bytes) = parse_size(&data[1..])?;
            let frames = take(1 + len_bytes, len * 2)?;
            let mut packet = Vec::with_capacity(1 + len * 2);
            packet.push(toc);
            packet.extend_from_slice(frames);
            Ok((packet, 1 + len_bytes + len * 2))
        }
        2 => {
            // Two frames; the standard form encodes the first length, the
            // self-delimited form appends the second.
            let (len1, len1_bytes) = parse_size(&data[1..])?;
            let (len2, len2_bytes) = parse_size(&data[1 + len1_bytes..])?;
            let frames_at = 1 + len1_bytes + len2_bytes;
            let frames = take(frames_at, len1 + len2)?;
            let mut packet = Vec::with_capacity(1 + len1_bytes + len1 + len2);
            packet.push(toc);
            packet.extend_from_slice(&data[1..1 + len1_bytes]);
            packet.extend_from_slice(frames);
            Ok((packet, frames_at + len1 + len2))
        }
        _ => {
            // Code 3: frame count byte, optional padding, optional VBR
            // lengths, then the added last-frame length.
            let fc = *data
                .get(1)
                .ok_or_else(|| Error::DecodeFailed("truncated code-3 packet".into()))?;
            let frame_count = (fc & 0x3F) as usize;
            if frame_count == 0 {
                return Err(Error::DecodeFailed("code-3 packet with zero frames".into()));
            }
            let vbr = fc & 0x80 != 0;
            let has_padding = fc & 0x40 != 0;

            let mut pos = 2usize;
            let mut padding = 0usize;
            if has_padding {
                loop {
                    let byte = *data
                        .get(pos)
                        .ok_or_else(|| Error::DecodeFailed("truncated padding length".into()))?;
                    pos += 1;
                    if byte == 255 {
                        padding += 254;
                    } else {
                        padding += byte as usize;
                        break;
                    }
                }
            }

            let mut sizes = Vec::with_capacity(frame_count);
            let vbr_lengths_start = pos;
            if vbr {
                for _ in 0..frame_count - 1 {
                    let (len, len_bytes) = parse_size(&data[pos..])?;
                    sizes.push(len);
                    pos += len_bytes;
                }
            }
            let vbr_lengths_end = pos;
            // Self-delimited addition: the last (VBR) or common (CBR) length.
            let (last_len, last_len_bytes) = parse_size(&data[pos..])?;
            pos += last_len_bytes;
            if vbr {
                sizes.push(last_len);
            } else {
                sizes = vec![last_len; frame_count];
            }

            let frames_total: usize = sizes.iter().sum();
            let frames = take(pos, frames_total)?;
            let consumed = pos + frames_total + padding;
            if data.len() < consumed {
                return Err(Error::DecodeFailed("truncated code-3 frames".into()));
            }

            // Rebuild in standard framing with the padding dropped; for VBR
            // the last frame length becomes implicit.
            let mut packet = Vec::with_capacity(2 + frames_total + (vbr_lengths_end - vbr_lengths_start));
            packet.push(toc);
            packet.push(fc & !0x40);
            if vbr {
                packet.extend_from_slice(&data[vbr_lengths_start..vbr_lengths_end]);
            }
            packet.extend_from_slice(frames);
            Ok((packet, consumed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_layouts_cover_one_to_eight() {
        for channels in 1..=8u16 {
            let layout = canonical_layout(channels).unwrap();
            assert!(layout.matches_channels(channels), "channels {channels}");
            assert_eq!(layout.coded_channels(), channels);
        }
        assert!(canonical_layout(0).is_none());
        assert!(canonical_layout(9).is_none());
    }

    #[test]
    fn five_one_layout_matches_vorbis_order() {
        let layout = canonical_layout(6).unwrap();
        assert_eq!(layout.streams, 4);
        assert_eq!(layout.coupled_streams, 2);
        assert_eq!(layout.mapping, vec![0, 4, 1, 2, 3, 5]);
    }

    #[test]
    fn parse_size_one_and_two_bytes() {
        assert_eq!(parse_size(&[10]).unwrap(), (10, 1));
        assert_eq!(parse_size(&[251]).unwrap(), (251, 1));
        assert_eq!(parse_size(&[252, 1]).unwrap(), (256, 2));
        assert_eq!(parse_size(&[255, 10]).unwrap(), (295, 2));
        assert!(parse_size(&[]).is_err());
        assert!(parse_size(&[253]).is_err());
    }

    #[test]
    fn undelimit_code0() {
        // TOC code 0, length 3, frame bytes, then trailing data.
        let data = [0b0000_0000, 3, 0xA, 0xB, 0xC, 0xFF, 0xFF];
        let (packet, consumed) = undelimit_packet(&data).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(packet, vec![0b0000_0000, 0xA, 0xB, 0xC]);
    }

    #[test]
    fn undelimit_code1() {
        let data = [0b0000_0001, 2, 1, 2, 3, 4, 0xEE];
        let (packet, consumed) = undelimit_packet(&data).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(packet, vec![0b0000_0001, 1, 2, 3, 4]);
    }

    #[test]
    fn undelimit_code2() {
        let data = [0b0000_0010, 1, 2, 0xA, 0xB, 0xC, 0x55];
        let (packet, consumed) = undelimit_packet(&data).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(packet, vec![0b0000_0010, 1, 0xA, 0xB, 0xC]);
    }

    #[test]
    fn undelimit_code3_cbr() {
        // 2 CBR frames of 2 bytes each.
        let data = [0b0000_0011, 0x02, 2, 0xA, 0xB, 0xC, 0xD, 0x99];
        let (packet, consumed) = undelimit_packet(&data).unwrap();
        assert_eq!(consumed, 7);
        assert_eq!(packet, vec![0b0000_0011, 0x02, 0xA, 0xB, 0xC, 0xD]);
    }

    #[test]
    fn undelimit_code3_vbr() {
        // VBR, 2 frames: first 1 byte, last 2 bytes.
        let data = [0b0000_0011, 0x82, 1, 2, 0xA, 0xB, 0xC, 0x77];
        let (packet, consumed) = undelimit_packet(&data).unwrap();
        assert_eq!(consumed, 7);
        // Standard VBR keeps the first length, the last becomes implicit.
        assert_eq!(packet, vec![0b0000_0011, 0x82, 1, 0xA, 0xB, 0xC]);
    }

    #[test]
    fn split_reserves_tail_for_last_stream() {
        // Stream 1 self-delimited (code 0, 1 byte), stream 2 standard.
        let data = [0b0000_0000, 1, 0xAA, 0b0000_0000, 0xBB, 0xCC];
        let packets = split_multistream_payload(&data, 2).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], vec![0b0000_0000, 0xAA]);
        assert_eq!(packets[1], vec![0b0000_0000, 0xBB, 0xCC]);
    }

    #[test]
    fn split_rejects_short_payload() {
        let data = [0b0000_0000, 5, 0xAA];
        assert!(split_multistream_payload(&data, 2).is_err());
    }

    #[test]
    fn stereo_decoder_roundtrip_shape() {
        // Encode a stereo frame with the opus crate and decode it back.
        let mut encoder =
            opus::Encoder::new(48000, Channels::Stereo, opus::Application::Audio).unwrap();
        let pcm = vec![0i16; 960 * 2]; // 20 ms at 48 kHz stereo
        let mut packet = vec![0u8; 4000];
        let len = encoder.encode(&pcm, &mut packet).unwrap();
        packet.truncate(len);

        let mut decoder = OpusStreamDecoder::new(48000, 2, None).unwrap();
        let decoded = decoder.decode(&packet).unwrap();
        assert_eq!(decoded.len(), 960 * 2);
    }
}
