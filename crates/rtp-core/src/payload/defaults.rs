//! Static payload-type format defaults (used when SAP is silent).

use crate::sap::{Endianness, StreamCodec, StreamProperties};

/// Default format assumed for a static/conventional payload type.
#[derive(Debug, Clone, Copy)]
pub struct PayloadTypeDefault {
    /// Wire payload type.
    pub payload_type: u8,
    /// Codec.
    pub codec: StreamCodec,
    /// Samples per second.
    pub sample_rate: u32,
    /// Channels.
    pub channels: u16,
    /// Bits per wire sample.
    pub bit_depth: u16,
    /// Wire byte order.
    pub endianness: Endianness,
}

const DEFAULTS: [PayloadTypeDefault; 6] = [
    PayloadTypeDefault {
        payload_type: 111,
        codec: StreamCodec::Opus,
        sample_rate: 48000,
        channels: 2,
        bit_depth: 16,
        endianness: Endianness::Little,
    },
    PayloadTypeDefault {
        payload_type: 0,
        codec: StreamCodec::Pcmu,
        sample_rate: 8000,
        channels: 1,
        bit_depth: 8,
        endianness: Endianness::Big,
    },
    PayloadTypeDefault {
        payload_type: 8,
        codec: StreamCodec::Pcma,
        sample_rate: 8000,
        channels: 1,
        bit_depth: 8,
        endianness: Endianness::Big,
    },
    PayloadTypeDefault {
        payload_type: 10,
        codec: StreamCodec::Pcm,
        sample_rate: 44100,
        channels: 1,
        bit_depth: 16,
        endianness: Endianness::Big,
    },
    PayloadTypeDefault {
        payload_type: 11,
        codec: StreamCodec::Pcm,
        sample_rate: 44100,
        channels: 2,
        bit_depth: 16,
        endianness: Endianness::Big,
    },
    PayloadTypeDefault {
        payload_type: 127,
        codec: StreamCodec::Pcm,
        sample_rate: 48000,
        channels: 2,
        bit_depth: 16,
        endianness: Endianness::Big,
    },
];

/// Looks up the default for a payload type.
pub fn find_payload_default(payload_type: u8) -> Option<&'static PayloadTypeDefault> {
    DEFAULTS.iter().find(|d| d.payload_type == payload_type)
}

/// Builds stream properties from the payload-type defaults, trying the wire
/// type first and the canonical type second.
pub fn properties_from_payload_type(
    payload_type: u8,
    canonical_payload_type: u8,
    listen_port: u16,
) -> Option<StreamProperties> {
    let default = find_payload_default(payload_type)
        .or_else(|| find_payload_default(canonical_payload_type))?;
    Some(StreamProperties {
        payload_type: default.payload_type as i32,
        codec: default.codec,
        sample_rate: default.sample_rate,
        channels: default.channels,
        bit_depth: default.bit_depth,
        endianness: default.endianness,
        port: listen_port,
        opus_streams: 0,
        opus_coupled_streams: 0,
        opus_mapping_family: 0,
        opus_channel_mapping: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_resolve() {
        assert_eq!(find_payload_default(0).unwrap().codec, StreamCodec::Pcmu);
        assert_eq!(find_payload_default(8).unwrap().codec, StreamCodec::Pcma);
        assert_eq!(find_payload_default(111).unwrap().codec, StreamCodec::Opus);
        assert_eq!(find_payload_default(127).unwrap().channels, 2);
        assert!(find_payload_default(96).is_none());
    }

    #[test]
    fn canonical_fallback_applies() {
        // Unknown wire PT 11 would hit directly; PT 96 falls through to the
        // canonical type.
        let props = properties_from_payload_type(96, 127, 40000).unwrap();
        assert_eq!(props.codec, StreamCodec::Pcm);
        assert_eq!(props.sample_rate, 48000);
        assert_eq!(props.port, 40000);
    }
}
