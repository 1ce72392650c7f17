//! SAP datagram and SDP body parsing.

use std::collections::HashMap;

use tracing::warn;

use super::types::{Endianness, ParsedSapInfo, StreamCodec, StreamProperties};
use crate::{Error, Result};

#[derive(Debug, Default, Clone)]
struct RtpmapEntry {
    encoding: String,
    sample_rate: u32,
    channels: u16,
    has_explicit_channels: bool,
}

#[derive(Debug, Default)]
struct AudioDescription {
    port: u16,
    payload_types: Vec<i32>,
    rtpmap: HashMap<i32, RtpmapEntry>,
    fmtp: HashMap<i32, HashMap<String, String>>,
}

#[derive(Debug, Default)]
struct SdpMetadata {
    session_name: String,
    ssrc: Option<u32>,
    connection_ip: String,
    stream_guid: String,
    target_sink: String,
    target_host: String,
    audio: AudioDescription,
}

/// Parses one SAP datagram (header + SDP body) into stream info.
pub fn parse_sap_packet(datagram: &[u8]) -> Result<ParsedSapInfo> {
    let sdp = extract_sdp_payload(datagram)?;
    let lines: Vec<&str> = sdp
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(Error::InvalidSdp("empty SDP payload".into()));
    }

    let metadata = parse_sdp_metadata(&lines)?;
    let selection = select_payload(&metadata.audio)?;
    let properties = build_stream_properties(&metadata, &selection);

    Ok(ParsedSapInfo {
        ssrc: metadata.ssrc.expect("validated in parse_sdp_metadata"),
        stream_ip: metadata.connection_ip,
        port: metadata.audio.port,
        properties,
        stream_guid: metadata.stream_guid,
        target_sink: metadata.target_sink,
        target_host: metadata.target_host,
        session_name: metadata.session_name,
    })
}

/// Strips the 4-byte SAP header (plus any authentication data) and returns
/// the SDP body as text.
fn extract_sdp_payload(datagram: &[u8]) -> Result<&str> {
    if datagram.len() < 4 {
        return Err(Error::InvalidSdp(format!(
            "SAP packet too small for header: {} bytes",
            datagram.len()
        )));
    }
    let first = datagram[0];
    let auth_len = if first & 0x10 != 0 {
        datagram[1] as usize * 4
    } else {
        0
    };
    let header_len = 4 + auth_len;
    if datagram.len() <= header_len {
        return Err(Error::InvalidSdp("no SDP data after SAP header".into()));
    }
    let mut body = &datagram[header_len..];
    // Optional "application/sdp" payload-type string, NUL terminated.
    if body.starts_with(b"application/sdp") {
        body = &body[b"application/sdp".len()..];
        if body.first() == Some(&0) {
            body = &body[1..];
        }
    }
    std::str::from_utf8(body).map_err(|_| Error::InvalidSdp("SDP body is not UTF-8".into()))
}

fn parse_sdp_metadata(lines: &[&str]) -> Result<SdpMetadata> {
    let mut metadata = SdpMetadata::default();
    let mut media_line_found = false;

    for line in lines {
        if let Some(rest) = line.strip_prefix("s=") {
            metadata.session_name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("o=") {
            // o=<username> <sess-id> ... ; the session id doubles as SSRC.
            let mut fields = rest.split_whitespace();
            let _username = fields.next();
            match fields.next().and_then(|v| v.parse::<u64>().ok()) {
                Some(session_id) => metadata.ssrc = Some(session_id as u32),
                None => warn!(line, "failed to parse SSRC from o-line"),
            }
        } else if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            // Strip an optional "/ttl" suffix.
            metadata.connection_ip = rest.split('/').next().unwrap_or("").trim().to_string();
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            media_line_found = true;
            let mut fields = rest.split_whitespace();
            metadata.audio.port = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let _proto = fields.next();
            for pt in fields {
                if let Ok(pt) = pt.parse::<i32>() {
                    metadata.audio.payload_types.push(pt);
                }
            }
        } else if let Some(rest) = line.strip_prefix("a=x-screamrouter-guid:") {
            metadata.stream_guid = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("a=x-screamrouter-target:") {
            apply_target_hint(rest, &mut metadata.target_sink, &mut metadata.target_host);
        } else if line.starts_with("a=rtpmap:") {
            parse_rtpmap_line(line, &mut metadata.audio);
        } else if line.starts_with("a=fmtp:") {
            parse_fmtp_line(line, &mut metadata.audio);
        }
    }

    // fmtp can also carry the routing hints.
    for params in metadata.audio.fmtp.values() {
        if let Some(block) = params.get("x-screamrouter-target") {
            let block = block.clone();
            apply_target_hint(&block, &mut metadata.target_sink, &mut metadata.target_host);
        }
        if metadata.stream_guid.is_empty() {
            if let Some(guid) = params.get("x-screamrouter-guid") {
                metadata.stream_guid = guid.trim().to_string();
            }
        }
    }

    if metadata.ssrc.is_none() {
        return Err(Error::InvalidSdp("o-line not found or malformed".into()));
    }
    if !media_line_found {
        return Err(Error::InvalidSdp("no m=audio line".into()));
    }
    if metadata.audio.port == 0 {
        return Err(Error::InvalidSdp("invalid RTP port".into()));
    }
    if metadata.connection_ip.is_empty() {
        warn!("SAP packet carries no connection IP");
    }

    Ok(metadata)
}

/// Parses `sink=...;host=...` hint blocks; a bare value is a sink name.
fn apply_target_hint(block: &str, sink: &mut String, host: &mut String) {
    let mut saw_key = false;
    for token in block.split(';') {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
            None => continue,
        };
        saw_key = true;
        match key.as_str() {
            "sink" => *sink = value.to_string(),
            "host" => *host = value.to_ascii_lowercase(),
            _ => {}
        }
    }
    if !saw_key && sink.is_empty() {
        *sink = block.trim().to_string();
    }
}

fn parse_rtpmap_line(line: &str, audio: &mut AudioDescription) {
    let rest = &line["a=rtpmap:".len()..];
    let Some((pt_str, descriptor)) = rest.trim().split_once(' ') else {
        warn!(line, "malformed rtpmap line");
        return;
    };
    let Ok(payload_type) = pt_str.trim().parse::<i32>() else {
        warn!(line, "failed to parse payload type in rtpmap");
        return;
    };

    let mut parts = descriptor.trim().split('/');
    let Some(encoding) = parts.next() else {
        return;
    };
    let sample_rate = parts
        .next()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0);
    let channels = parts.next().and_then(|v| v.trim().parse::<u16>().ok());

    audio.rtpmap.insert(
        payload_type,
        RtpmapEntry {
            encoding: encoding.to_ascii_lowercase(),
            sample_rate,
            channels: channels.unwrap_or(0),
            has_explicit_channels: channels.map(|c| c > 0).unwrap_or(false),
        },
    );
}

fn parse_fmtp_line(line: &str, audio: &mut AudioDescription) {
    let rest = &line["a=fmtp:".len()..];
    let Some((pt_str, params_block)) = rest.trim().split_once(' ') else {
        return;
    };
    let Ok(payload_type) = pt_str.trim().parse::<i32>() else {
        return;
    };

    let params = audio.fmtp.entry(payload_type).or_default();
    for param in params_block.split(';') {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        match param.split_once('=') {
            Some((key, value)) => {
                params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
            None => {
                params.insert(param.to_ascii_lowercase(), String::new());
            }
        }
    }
}

#[derive(Debug, Default)]
struct PayloadSelection {
    payload_type: i32,
    codec: StreamCodec,
    entry: RtpmapEntry,
}

/// Picks the payload this engine will consume, preferring Opus, then linear
/// PCM variants, then G.711.
fn select_payload(audio: &AudioDescription) -> Result<PayloadSelection> {
    let find = |needle: &str| -> Option<(i32, RtpmapEntry)> {
        for pt in &audio.payload_types {
            if let Some(entry) = audio.rtpmap.get(pt) {
                if entry.encoding.contains(needle) {
                    return Some((*pt, entry.clone()));
                }
            }
        }
        audio
            .rtpmap
            .iter()
            .find(|(_, entry)| entry.encoding.contains(needle))
            .map(|(pt, entry)| (*pt, entry.clone()))
    };

    let preference: &[(&str, StreamCodec)] = &[
        ("opus", StreamCodec::Opus),
        ("l24", StreamCodec::Pcm),
        ("l16", StreamCodec::Pcm),
        ("s16le", StreamCodec::Pcm),
        ("pcmu", StreamCodec::Pcmu),
        ("pcma", StreamCodec::Pcma),
        ("pcm", StreamCodec::Pcm),
    ];

    for (needle, codec) in preference {
        if let Some((pt, entry)) = find(needle) {
            return Ok(PayloadSelection {
                payload_type: pt,
                codec: *codec,
                entry,
            });
        }
    }

    // Fall back to the first described payload.
    for pt in &audio.payload_types {
        if let Some(entry) = audio.rtpmap.get(pt) {
            return Ok(PayloadSelection {
                payload_type: *pt,
                codec: StreamCodec::Unknown,
                entry: entry.clone(),
            });
        }
    }
    if let Some((pt, entry)) = audio.rtpmap.iter().next() {
        return Ok(PayloadSelection {
            payload_type: *pt,
            codec: StreamCodec::Unknown,
            entry: entry.clone(),
        });
    }

    Err(Error::InvalidSdp("no usable rtpmap entry".into()))
}

fn build_stream_properties(metadata: &SdpMetadata, selection: &PayloadSelection) -> StreamProperties {
    let mut props = StreamProperties {
        payload_type: selection.payload_type,
        codec: selection.codec,
        sample_rate: selection.entry.sample_rate,
        port: metadata.audio.port,
        ..Default::default()
    };
    if props.sample_rate == 0 {
        props.sample_rate = match props.codec {
            StreamCodec::Opus => 48000,
            StreamCodec::Pcmu | StreamCodec::Pcma => 8000,
            _ => 0,
        };
    }

    let mut channels = if selection.entry.has_explicit_channels {
        selection.entry.channels
    } else {
        0
    };

    if let Some(params) = metadata.audio.fmtp.get(&selection.payload_type) {
        if let Some(value) = params.get("channels").and_then(|v| v.parse::<u16>().ok()) {
            if value > 0 {
                channels = value;
            }
        }

        let mapping_param = params
            .get("channelmapping")
            .or_else(|| params.get("channel_mapping"));
        if let Some(mapping_value) = mapping_param {
            let mapping = parse_channel_mapping(mapping_value);
            if !mapping.is_empty() {
                channels = mapping.len() as u16;
                props.opus_channel_mapping = mapping;
            }
        }

        let family_param = params
            .get("mappingfamily")
            .or_else(|| params.get("mapping_family"));
        if let Some(value) = family_param.and_then(|v| v.parse::<u8>().ok()) {
            props.opus_mapping_family = value;
        }

        let stereo_param = params.get("stereo").or_else(|| params.get("sprop-stereo"));
        match stereo_param.and_then(|v| v.parse::<i32>().ok()) {
            Some(1) if channels < 2 => channels = 2,
            Some(0) if channels == 0 => channels = 1,
            _ => {}
        }

        if let Some(value) = params.get("streams").and_then(|v| v.parse::<u8>().ok()) {
            if value > 0 {
                props.opus_streams = value;
            }
        }
        let coupled_param = params
            .get("coupledstreams")
            .or_else(|| params.get("coupled_streams"));
        if let Some(value) = coupled_param.and_then(|v| v.parse::<u8>().ok()) {
            props.opus_coupled_streams = value;
        }
    }

    if channels == 0 {
        channels = match props.codec {
            StreamCodec::Opus => 2,
            _ => 1,
        };
    }
    props.channels = channels;

    let encoding = selection.entry.encoding.as_str();
    match props.codec {
        StreamCodec::Opus => {
            props.bit_depth = 16;
            props.endianness = Endianness::Little;
        }
        StreamCodec::Pcmu | StreamCodec::Pcma => {
            props.bit_depth = 8;
            props.endianness = Endianness::Big;
        }
        _ => {
            let (bit_depth, endianness) = pcm_format_from_encoding(encoding);
            props.bit_depth = bit_depth;
            props.endianness = endianness;
            if props.codec == StreamCodec::Unknown
                && (encoding.contains("l16")
                    || encoding.contains("l24")
                    || encoding.contains("l32")
                    || encoding.contains("pcm"))
            {
                props.codec = StreamCodec::Pcm;
            }
        }
    }

    props
}

/// Maps a PCM rtpmap encoding name to bit depth and byte order.
fn pcm_format_from_encoding(encoding: &str) -> (u16, Endianness) {
    const VARIANTS: &[(&str, u16, Endianness)] = &[
        ("s32le", 32, Endianness::Little),
        ("l32le", 32, Endianness::Little),
        ("pcm32le", 32, Endianness::Little),
        ("l32", 32, Endianness::Big),
        ("s32", 32, Endianness::Big),
        ("pcm32", 32, Endianness::Big),
        ("s24le", 24, Endianness::Little),
        ("pcm24le", 24, Endianness::Little),
        ("l24", 24, Endianness::Big),
        ("pcm24", 24, Endianness::Big),
        ("s16le", 16, Endianness::Little),
        ("pcm16le", 16, Endianness::Little),
        ("l16", 16, Endianness::Big),
    ];
    for (needle, depth, endian) in VARIANTS {
        if encoding.contains(needle) {
            return (*depth, *endian);
        }
    }
    (16, Endianness::Big)
}

/// Parses `0,1,2` or `0/1/2` style channel mapping lists.
fn parse_channel_mapping(value: &str) -> Vec<u8> {
    let mut mapping = Vec::new();
    for token in value.replace('/', ",").split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse::<u8>() {
            Ok(v) => mapping.push(v),
            Err(_) => return Vec::new(),
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sap_wrap(sdp: &str) -> Vec<u8> {
        let mut datagram = vec![0x20, 0x00, 0x00, 0x00];
        datagram.extend_from_slice(sdp.as_bytes());
        datagram
    }

    #[test]
    fn parses_l16_announcement() {
        let sdp = "v=0\r\n\
                   o=- 3735928559 0 IN IP4 10.0.0.5\r\n\
                   s=Living Room\r\n\
                   c=IN IP4 239.1.2.3/32\r\n\
                   m=audio 40002 RTP/AVP 127\r\n\
                   a=rtpmap:127 L16/48000/2\r\n";
        let info = parse_sap_packet(&sap_wrap(sdp)).unwrap();
        assert_eq!(info.ssrc, 3735928559);
        assert_eq!(info.stream_ip, "239.1.2.3");
        assert_eq!(info.port, 40002);
        assert_eq!(info.session_name, "Living Room");
        assert_eq!(info.properties.codec, StreamCodec::Pcm);
        assert_eq!(info.properties.sample_rate, 48000);
        assert_eq!(info.properties.channels, 2);
        assert_eq!(info.properties.bit_depth, 16);
        assert_eq!(info.properties.endianness, Endianness::Big);
    }

    #[test]
    fn parses_opus_multistream_fmtp() {
        let sdp = "v=0\r\n\
                   o=- 42 0 IN IP4 10.0.0.5\r\n\
                   s=Surround\r\n\
                   c=IN IP4 239.9.9.9\r\n\
                   m=audio 40010 RTP/AVP 111\r\n\
                   a=rtpmap:111 opus/48000/2\r\n\
                   a=fmtp:111 streams=4;coupledstreams=2;channelmapping=0,4,1,2,3,5;mappingfamily=1\r\n";
        let info = parse_sap_packet(&sap_wrap(sdp)).unwrap();
        assert_eq!(info.properties.codec, StreamCodec::Opus);
        assert_eq!(info.properties.channels, 6);
        assert_eq!(info.properties.opus_streams, 4);
        assert_eq!(info.properties.opus_coupled_streams, 2);
        assert_eq!(info.properties.opus_mapping_family, 1);
        assert_eq!(info.properties.opus_channel_mapping, vec![0, 4, 1, 2, 3, 5]);
        assert_eq!(info.properties.endianness, Endianness::Little);
    }

    #[test]
    fn parses_guid_and_target_hints() {
        let sdp = "v=0\r\n\
                   o=- 7 0 IN IP4 10.0.0.5\r\n\
                   s=Tagged\r\n\
                   c=IN IP4 239.0.0.7\r\n\
                   m=audio 40004 RTP/AVP 127\r\n\
                   a=rtpmap:127 L16/48000/2\r\n\
                   a=x-screamrouter-guid:abc-123\r\n\
                   a=x-screamrouter-target:sink=kitchen;host=router1\r\n";
        let info = parse_sap_packet(&sap_wrap(sdp)).unwrap();
        assert_eq!(info.stream_guid, "abc-123");
        assert_eq!(info.target_sink, "kitchen");
        assert_eq!(info.target_host, "router1");
    }

    #[test]
    fn opus_stereo_hint_bumps_channels() {
        let sdp = "v=0\r\n\
                   o=- 9 0 IN IP4 10.0.0.5\r\n\
                   s=x\r\n\
                   c=IN IP4 239.0.0.9\r\n\
                   m=audio 40008 RTP/AVP 111\r\n\
                   a=rtpmap:111 opus/48000\r\n\
                   a=fmtp:111 stereo=1\r\n";
        let info = parse_sap_packet(&sap_wrap(sdp)).unwrap();
        assert_eq!(info.properties.channels, 2);
    }

    #[test]
    fn rejects_missing_media_line() {
        let sdp = "v=0\r\no=- 7 0 IN IP4 10.0.0.5\r\ns=x\r\nc=IN IP4 239.0.0.7\r\n";
        assert!(parse_sap_packet(&sap_wrap(sdp)).is_err());
    }

    #[test]
    fn rejects_short_datagram() {
        assert!(parse_sap_packet(&[0x20, 0x00]).is_err());
    }

    #[test]
    fn skips_auth_data() {
        let sdp = "v=0\r\n\
                   o=- 5 0 IN IP4 10.0.0.5\r\n\
                   s=x\r\n\
                   c=IN IP4 239.0.0.5\r\n\
                   m=audio 40000 RTP/AVP 0\r\n\
                   a=rtpmap:0 PCMU/8000\r\n";
        // Auth flag set, auth length = 1 word (4 bytes).
        let mut datagram = vec![0x30, 0x01, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0xDD];
        datagram.extend_from_slice(sdp.as_bytes());
        let info = parse_sap_packet(&datagram).unwrap();
        assert_eq!(info.properties.codec, StreamCodec::Pcmu);
        assert_eq!(info.properties.sample_rate, 8000);
        assert_eq!(info.properties.channels, 1);
    }
}
