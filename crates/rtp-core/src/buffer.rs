//! Sequence-number reordering for RTP streams.
//!
//! Packets are buffered keyed by their 16-bit sequence number with a
//! wrap-aware comparison and drained in order. The drain policy never waits
//! for a missing packet: on a gap it skips straight to the next buffered
//! sequence number (a hole is cheaper than a delay). A single-packet gap can
//! optionally be filled with linearly interpolated samples when the stream's
//! sample format is known.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{RtpPacketData, RtpSequenceNumber};

/// Default cap on buffered out-of-order packets.
pub const DEFAULT_REORDER_MAX_SIZE: usize = 128;

/// Sample format hint enabling single-gap interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpolationFormat {
    /// Interleaved channel count.
    pub channels: u16,
    /// Bits per sample (16, 24 or 32; 8-bit streams are never interpolated).
    pub bit_depth: u16,
}

/// Buffers out-of-order RTP packets and releases them in sequence order.
///
/// Before the first drain, packets are only deduplicated; mildly older
/// sequence numbers than the first arrival still sort ahead of it, so an
/// initial burst arriving permuted comes out in order. Once a drain has
/// anchored `next_expected`, anything older is discarded on arrival.
#[derive(Debug)]
pub struct RtpReorderingBuffer {
    buffer: BTreeMap<SeqKey, RtpPacketData>,
    next_expected_seq: RtpSequenceNumber,
    anchor: Option<RtpSequenceNumber>,
    drained_once: bool,
    max_size: usize,
    interpolation: Option<InterpolationFormat>,
    // Last in-order packet handed out, kept only while interpolation is on.
    last_emitted: Option<RtpPacketData>,
}

/// Ordering key: sequence number offset from the current reference point,
/// so wrap-around keeps map iteration in stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SeqKey(u16);

/// Wrap-aware strictly-greater comparison on 16-bit sequence numbers.
#[inline]
pub fn is_sequence_greater(a: RtpSequenceNumber, b: RtpSequenceNumber) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

impl RtpReorderingBuffer {
    /// Creates a buffer with the default size cap and no interpolation.
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_REORDER_MAX_SIZE)
    }

    /// Creates a buffer holding at most `max_size` out-of-order packets.
    pub fn with_max_size(max_size: usize) -> Self {
        RtpReorderingBuffer {
            buffer: BTreeMap::new(),
            next_expected_seq: 0,
            anchor: None,
            drained_once: false,
            max_size: max_size.max(1),
            interpolation: None,
            last_emitted: None,
        }
    }

    /// Enables (or disables, with `None`) single-gap sample interpolation.
    ///
    /// This is opt-in per source; the default policy is to skip gaps
    /// immediately.
    pub fn set_interpolation_format(&mut self, format: Option<InterpolationFormat>) {
        self.interpolation = match format {
            Some(f) if f.channels > 0 && matches!(f.bit_depth, 16 | 24 | 32) => Some(f),
            _ => None,
        };
    }

    /// Inserts a packet, dropping late duplicates and evicting the oldest
    /// stored packet when the buffer is full.
    pub fn add_packet(&mut self, packet: RtpPacketData) {
        if self.anchor.is_none() {
            self.anchor = Some(packet.sequence_number);
            debug!(seq = packet.sequence_number, "reordering buffer initialized");
        }

        if self.drained_once
            && packet.sequence_number != self.next_expected_seq
            && !is_sequence_greater(packet.sequence_number, self.next_expected_seq)
        {
            debug!(
                seq = packet.sequence_number,
                expected = self.next_expected_seq,
                "discarding late packet"
            );
            return;
        }

        let key = self.key_for(packet.sequence_number);
        if self.buffer.contains_key(&key) {
            debug!(seq = packet.sequence_number, "discarding duplicate packet");
            return;
        }

        if self.buffer.len() >= self.max_size {
            if let Some((&oldest, _)) = self.buffer.iter().next() {
                warn!(
                    buffered = self.buffer.len(),
                    incoming = packet.sequence_number,
                    "reordering buffer full, evicting oldest packet"
                );
                self.buffer.remove(&oldest);
            }
        }

        self.buffer.insert(key, packet);
    }

    /// Drains every packet that is ready, in sequence order.
    ///
    /// On a gap the expected sequence jumps straight to the next buffered
    /// packet; when interpolation is enabled and exactly one packet is
    /// missing between two compatible neighbours, a synthesized packet is
    /// emitted in its place.
    pub fn ready_packets(&mut self) -> Vec<RtpPacketData> {
        let mut ready = Vec::new();
        if self.buffer.is_empty() {
            return ready;
        }

        if !self.drained_once {
            // Anchor on the lowest buffered sequence number so a permuted
            // initial burst comes out in order.
            if let Some(first) = self.buffer.values().next() {
                self.next_expected_seq = first.sequence_number;
            }
            self.drained_once = true;
            self.rekey();
        }

        loop {
            let (first_key, first_seq) = match self.buffer.iter().next() {
                Some((k, p)) => (*k, p.sequence_number),
                None => break,
            };

            if first_seq == self.next_expected_seq {
                let packet = self.buffer.remove(&first_key).expect("key just observed");
                self.next_expected_seq = self.next_expected_seq.wrapping_add(1);
                if self.interpolation.is_some() {
                    self.last_emitted = Some(packet.clone());
                }
                ready.push(packet);
                self.rekey();
                continue;
            }

            if is_sequence_greater(first_seq, self.next_expected_seq) {
                let missing = first_seq.wrapping_sub(self.next_expected_seq);
                if missing == 1 {
                    if let Some(filled) = self.try_interpolate(first_key) {
                        debug!(seq = filled.sequence_number, "interpolated missing packet");
                        self.next_expected_seq = self.next_expected_seq.wrapping_add(1);
                        self.last_emitted = Some(filled.clone());
                        ready.push(filled);
                        self.rekey();
                        continue;
                    }
                }
                warn!(
                    missing,
                    from = self.next_expected_seq,
                    to = first_seq.wrapping_sub(1),
                    "skipping missing packets, advancing to next available"
                );
                self.next_expected_seq = first_seq;
                self.rekey();
                continue;
            }

            // Older than expected; we already moved past it.
            debug!(
                seq = first_seq,
                expected = self.next_expected_seq,
                "discarding stale packet"
            );
            self.buffer.remove(&first_key);
        }

        ready
    }

    /// Clears all state. Call on SSRC change.
    pub fn reset(&mut self) {
        debug!("resetting reordering buffer state");
        self.buffer.clear();
        self.anchor = None;
        self.drained_once = false;
        self.next_expected_seq = 0;
        self.last_emitted = None;
    }

    /// Number of packets currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The sequence number the next drain will look for, once anchored.
    pub fn next_expected(&self) -> RtpSequenceNumber {
        self.next_expected_seq
    }

    fn key_for(&self, seq: RtpSequenceNumber) -> SeqKey {
        let reference = if self.drained_once {
            self.next_expected_seq
        } else {
            // Pre-anchor window: packets up to 0x4000 older than the first
            // arrival still sort ahead of it.
            self.anchor.unwrap_or(seq).wrapping_sub(0x4000)
        };
        SeqKey(seq.wrapping_sub(reference))
    }

    /// Rebuilds keys after the reference point moved so map order stays
    /// aligned with stream order across the 16-bit wrap.
    fn rekey(&mut self) {
        let old = std::mem::take(&mut self.buffer);
        for (_, packet) in old {
            let key = self.key_for(packet.sequence_number);
            self.buffer.insert(key, packet);
        }
    }

    /// Synthesizes the packet between the last emitted packet and the one
    /// stored at `next_key` by linear sample interpolation. Returns `None`
    /// when the stream format is unknown or the neighbours are incompatible.
    fn try_interpolate(&self, next_key: SeqKey) -> Option<RtpPacketData> {
        let format = self.interpolation?;
        let prev = self.last_emitted.as_ref()?;
        let next = self.buffer.get(&next_key)?;

        if prev.payload.len() != next.payload.len() || prev.payload.is_empty() {
            return None;
        }
        let bytes_per_sample = (format.bit_depth / 8) as usize;
        let frame_bytes = bytes_per_sample * format.channels as usize;
        if frame_bytes == 0 || prev.payload.len() % frame_bytes != 0 {
            return None;
        }

        let ts_span = next.rtp_timestamp.wrapping_sub(prev.rtp_timestamp);
        let mut payload = vec![0u8; prev.payload.len()];
        let samples = prev.payload.len() / bytes_per_sample;
        for i in 0..samples {
            let a = read_sample_le(&prev.payload[i * bytes_per_sample..], format.bit_depth);
            let b = read_sample_le(&next.payload[i * bytes_per_sample..], format.bit_depth);
            let mid = ((a as i64 + b as i64) / 2) as i32;
            write_sample_le(&mut payload[i * bytes_per_sample..], format.bit_depth, mid);
        }

        Some(RtpPacketData {
            sequence_number: self.next_expected_seq,
            rtp_timestamp: prev.rtp_timestamp.wrapping_add(ts_span / 2),
            received_time: next.received_time,
            payload: payload.into(),
            ssrc: prev.ssrc,
            csrcs: prev.csrcs.clone(),
            payload_type: prev.payload_type,
            ingress_from_loopback: prev.ingress_from_loopback,
        })
    }
}

impl Default for RtpReorderingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn read_sample_le(data: &[u8], bit_depth: u16) -> i32 {
    match bit_depth {
        16 => i16::from_le_bytes([data[0], data[1]]) as i32,
        24 => {
            let raw = data[0] as i32 | (data[1] as i32) << 8 | (data[2] as i32) << 16;
            (raw << 8) >> 8
        }
        32 => i32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        _ => 0,
    }
}

fn write_sample_le(data: &mut [u8], bit_depth: u16, value: i32) {
    match bit_depth {
        16 => data[..2].copy_from_slice(&(value as i16).to_le_bytes()),
        24 => {
            let bytes = value.to_le_bytes();
            data[..3].copy_from_slice(&bytes[..3]);
        }
        32 => data[..4].copy_from_slice(&value.to_le_bytes()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn packet(seq: u16) -> RtpPacketData {
        packet_with_payload(seq, vec![0u8; 4])
    }

    fn packet_with_payload(seq: u16, payload: Vec<u8>) -> RtpPacketData {
        RtpPacketData {
            sequence_number: seq,
            rtp_timestamp: seq as u32 * 100,
            received_time: Instant::now(),
            payload: payload.into(),
            ssrc: 0x1234,
            csrcs: vec![],
            payload_type: 127,
            ingress_from_loopback: false,
        }
    }

    #[test]
    fn sequence_comparator() {
        assert!(is_sequence_greater(10, 5));
        assert!(!is_sequence_greater(5, 10));
        assert!(!is_sequence_greater(7, 7));
        // Wrap-around cases
        assert!(is_sequence_greater(0x0001, 0xFFFF));
        assert!(!is_sequence_greater(0xFFFF, 0x0001));
    }

    #[test]
    fn in_order_passthrough() {
        let mut buf = RtpReorderingBuffer::new();
        buf.add_packet(packet(100));
        let out = buf.ready_packets();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, 100);

        buf.add_packet(packet(101));
        let out = buf.ready_packets();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, 101);
    }

    #[test]
    fn initial_burst_permutation_comes_out_sorted() {
        let mut buf = RtpReorderingBuffer::new();
        buf.add_packet(packet(102));
        buf.add_packet(packet(100));
        buf.add_packet(packet(101));
        let out = buf.ready_packets();
        let seqs: Vec<u16> = out.iter().map(|p| p.sequence_number).collect();
        assert_eq!(seqs, vec![100, 101, 102]);
        assert_eq!(buf.next_expected(), 103);
    }

    #[test]
    fn skips_gap_immediately() {
        let mut buf = RtpReorderingBuffer::new();
        buf.add_packet(packet(10));
        assert_eq!(buf.ready_packets().len(), 1);
        buf.add_packet(packet(13));
        let out = buf.ready_packets();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, 13);
    }

    #[test]
    fn drops_duplicates_and_late_packets() {
        let mut buf = RtpReorderingBuffer::new();
        buf.add_packet(packet(50));
        buf.add_packet(packet(50));
        assert_eq!(buf.ready_packets().len(), 1);
        buf.add_packet(packet(49));
        assert!(buf.ready_packets().is_empty());
    }

    #[test]
    fn delivers_across_sequence_wrap() {
        let mut buf = RtpReorderingBuffer::new();
        buf.add_packet(packet(0xFFFE));
        assert_eq!(buf.ready_packets().len(), 1);
        for seq in [0xFFFFu16, 0x0000, 0x0001] {
            buf.add_packet(packet(seq));
        }
        let out = buf.ready_packets();
        let seqs: Vec<u16> = out.iter().map(|p| p.sequence_number).collect();
        assert_eq!(seqs, vec![0xFFFF, 0x0000, 0x0001]);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut buf = RtpReorderingBuffer::with_max_size(4);
        buf.add_packet(packet(0));
        assert_eq!(buf.ready_packets().len(), 1);
        // Leave a gap so packets accumulate.
        for seq in 2..9u16 {
            buf.add_packet(packet(seq));
        }
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn reset_clears_state() {
        let mut buf = RtpReorderingBuffer::new();
        buf.add_packet(packet(7));
        buf.reset();
        assert!(buf.is_empty());
        buf.add_packet(packet(900));
        let out = buf.ready_packets();
        assert_eq!(out[0].sequence_number, 900);
    }

    #[test]
    fn interpolates_single_gap_when_enabled() {
        let mut buf = RtpReorderingBuffer::new();
        buf.set_interpolation_format(Some(InterpolationFormat {
            channels: 1,
            bit_depth: 16,
        }));
        let a = packet_with_payload(10, 100i16.to_le_bytes().to_vec());
        let c = packet_with_payload(12, 300i16.to_le_bytes().to_vec());
        buf.add_packet(a);
        assert_eq!(buf.ready_packets().len(), 1);
        buf.add_packet(c);
        let out = buf.ready_packets();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sequence_number, 11);
        let mid = i16::from_le_bytes([out[0].payload[0], out[0].payload[1]]);
        assert_eq!(mid, 200);
        assert_eq!(out[0].ssrc, 0x1234);
        assert_eq!(out[1].sequence_number, 12);
    }

    #[test]
    fn wide_gap_is_never_interpolated() {
        let mut buf = RtpReorderingBuffer::new();
        buf.set_interpolation_format(Some(InterpolationFormat {
            channels: 1,
            bit_depth: 16,
        }));
        buf.add_packet(packet_with_payload(10, vec![0, 0]));
        assert_eq!(buf.ready_packets().len(), 1);
        buf.add_packet(packet_with_payload(14, vec![0, 0]));
        let out = buf.ready_packets();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, 14);
    }
}
