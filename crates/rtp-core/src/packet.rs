//! RTP fixed-header parsing (RFC 3550).

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::{Error, Result, RtpSequenceNumber, RtpTimestamp, Ssrc, RTP_FIXED_HEADER_SIZE};

/// Parsed view of the 12-byte RTP fixed header plus CSRC list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version, must be 2.
    pub version: u8,
    /// Padding flag.
    pub padding: bool,
    /// Extension flag.
    pub extension: bool,
    /// Marker bit.
    pub marker: bool,
    /// Payload type (7 bits).
    pub payload_type: u8,
    /// Sequence number.
    pub sequence_number: RtpSequenceNumber,
    /// Media timestamp.
    pub timestamp: RtpTimestamp,
    /// Synchronization source.
    pub ssrc: Ssrc,
    /// Contributing sources (0..=15 entries).
    pub csrcs: Vec<Ssrc>,
}

impl RtpHeader {
    /// Parses the header from the front of a datagram.
    ///
    /// Returns the header and the number of bytes it occupies (12 plus four
    /// per CSRC). Header extensions are not consumed here; ScreamRouter
    /// streams do not carry them.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RTP_FIXED_HEADER_SIZE {
            return Err(Error::MalformedPacket(format!(
                "{} bytes is too small for an RTP header",
                data.len()
            )));
        }

        let version = data[0] >> 6;
        if version != 2 {
            return Err(Error::MalformedPacket(format!("bad RTP version {version}")));
        }

        let csrc_count = (data[0] & 0x0F) as usize;
        let header_len = RTP_FIXED_HEADER_SIZE + csrc_count * 4;
        if data.len() < header_len {
            return Err(Error::MalformedPacket(format!(
                "packet shorter than its own header ({} < {})",
                data.len(),
                header_len
            )));
        }

        let mut csrcs = Vec::with_capacity(csrc_count);
        for i in 0..csrc_count {
            let off = RTP_FIXED_HEADER_SIZE + i * 4;
            csrcs.push(u32::from_be_bytes([
                data[off],
                data[off + 1],
                data[off + 2],
                data[off + 3],
            ]));
        }

        Ok((
            RtpHeader {
                version,
                padding: data[0] & 0x20 != 0,
                extension: data[0] & 0x10 != 0,
                marker: data[1] & 0x80 != 0,
                payload_type: data[1] & 0x7F,
                sequence_number: u16::from_be_bytes([data[2], data[3]]),
                timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                csrcs,
            },
            header_len,
        ))
    }
}

/// The data a receiver keeps for one RTP packet while it sits in the
/// reordering buffer.
#[derive(Debug, Clone)]
pub struct RtpPacketData {
    /// Sequence number from the header.
    pub sequence_number: RtpSequenceNumber,
    /// Media timestamp from the header.
    pub rtp_timestamp: RtpTimestamp,
    /// Local monotonic arrival time.
    pub received_time: Instant,
    /// Raw payload bytes (after the header and CSRC list).
    pub payload: Bytes,
    /// Synchronization source.
    pub ssrc: Ssrc,
    /// Contributing sources.
    pub csrcs: Vec<Ssrc>,
    /// Wire payload type.
    pub payload_type: u8,
    /// Set when the datagram arrived over loopback (diagnostic).
    pub ingress_from_loopback: bool,
}

impl RtpPacketData {
    /// Builds packet data from a parsed header and the datagram that carried it.
    pub fn from_datagram(
        header: &RtpHeader,
        datagram: &[u8],
        header_len: usize,
        received_time: Instant,
        peer: SocketAddr,
    ) -> Self {
        RtpPacketData {
            sequence_number: header.sequence_number,
            rtp_timestamp: header.timestamp,
            received_time,
            payload: Bytes::copy_from_slice(&datagram[header_len..]),
            ssrc: header.ssrc,
            csrcs: header.csrcs.clone(),
            payload_type: header.payload_type,
            ingress_from_loopback: peer.ip().is_loopback(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet(csrc_count: u8) -> Vec<u8> {
        let mut data = vec![
            0x80 | (csrc_count & 0x0F), // V=2, no P/X
            0x7F,                       // PT 127
            0x12,
            0x34, // seq 0x1234
            0x00,
            0x01,
            0x02,
            0x03, // ts
            0xDE,
            0xAD,
            0xBE,
            0xEF, // ssrc
        ];
        for i in 0..csrc_count as u32 {
            data.extend_from_slice(&(0x1000 + i).to_be_bytes());
        }
        data.extend_from_slice(&[0xAA; 16]);
        data
    }

    #[test]
    fn parses_fixed_header() {
        let data = sample_packet(0);
        let (header, len) = RtpHeader::parse(&data).unwrap();
        assert_eq!(len, 12);
        assert_eq!(header.version, 2);
        assert_eq!(header.payload_type, 127);
        assert_eq!(header.sequence_number, 0x1234);
        assert_eq!(header.timestamp, 0x00010203);
        assert_eq!(header.ssrc, 0xDEADBEEF);
        assert!(header.csrcs.is_empty());
    }

    #[test]
    fn parses_csrc_list() {
        let data = sample_packet(3);
        let (header, len) = RtpHeader::parse(&data).unwrap();
        assert_eq!(len, 24);
        assert_eq!(header.csrcs, vec![0x1000, 0x1001, 0x1002]);
    }

    #[test]
    fn rejects_truncated_header() {
        let data = sample_packet(0);
        assert!(RtpHeader::parse(&data[..8]).is_err());
    }

    #[test]
    fn rejects_truncated_csrc_list() {
        let mut data = sample_packet(4);
        data.truncate(14);
        assert!(RtpHeader::parse(&data).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut data = sample_packet(0);
        data[0] = 0x40;
        assert!(RtpHeader::parse(&data).is_err());
    }
}
