//! Statistical audio format detection for unannounced streams.
//!
//! When neither SAP nor the payload-type defaults describe a stream, raw
//! payload bytes are buffered and analyzed: coded formats (μ-law, A-law,
//! Opus) are attempted first and scored by waveform discontinuity; if none
//! wins convincingly, PCM interpretations are brute-forced over channel
//! count, bit depth and endianness. Sample rate falls out of the byte rate
//! over the probe window. Detection is sticky once it succeeds.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::codec::g711::{decode_alaw_sample, decode_mulaw_sample};
use crate::sap::{Endianness, StreamCodec, StreamProperties};

/// Common sample rates detection snaps to.
pub const COMMON_SAMPLE_RATES: [u32; 11] = [
    8000, 11025, 16000, 22050, 32000, 44100, 48000, 88200, 96000, 176400, 192000,
];

/// Minimum bytes before detection may run (overridable).
pub const DEFAULT_MIN_PROBE_BYTES: usize = 5000;
/// Minimum probe window before detection may run (overridable).
pub const DEFAULT_PROBE_DURATION_MS: f64 = 500.0;
/// Probe buffer cap: about two seconds of 48 kHz stereo 32-bit audio.
pub const MAX_PROBE_BYTES: usize = 48000 * 2 * 4 * 2;

/// Discontinuity threshold as a fraction of full scale.
const DISCONTINUITY_THRESHOLD: f64 = 0.3;
/// Sample jump treated as a discontinuity for 16-bit decode scoring.
const LARGE_STEP_INT16: i32 = 6500;
/// Normalized variance below which a candidate is considered silence.
const MIN_VARIANCE_THRESHOLD: f64 = 0.001;
/// A coded format must score below this fraction of the best PCM score.
const CODEC_IMPROVEMENT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct FormatCandidate {
    channels: u16,
    bit_depth: u16,
    endianness: Endianness,
    score: f64,
}

/// Buffers raw payload bytes and statistically determines the stream format.
pub struct AudioFormatProbe {
    probe_buffer: Vec<u8>,
    first_packet_time: Option<Instant>,
    last_packet_time: Option<Instant>,
    total_bytes_received: usize,
    detected_format: StreamProperties,
    confidence: f32,
    detection_complete: bool,
    probe_duration_ms: f64,
    probe_min_bytes: usize,
}

impl Default for AudioFormatProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioFormatProbe {
    /// Creates an empty probe with default thresholds.
    pub fn new() -> Self {
        AudioFormatProbe {
            probe_buffer: Vec::with_capacity(MAX_PROBE_BYTES / 2),
            first_packet_time: None,
            last_packet_time: None,
            total_bytes_received: 0,
            detected_format: StreamProperties::default(),
            confidence: 0.0,
            detection_complete: false,
            probe_duration_ms: DEFAULT_PROBE_DURATION_MS,
            probe_min_bytes: DEFAULT_MIN_PROBE_BYTES,
        }
    }

    /// Overrides the minimum probe window.
    pub fn set_probe_duration_ms(&mut self, duration_ms: f64) {
        self.probe_duration_ms = duration_ms;
    }

    /// Overrides the minimum byte count.
    pub fn set_probe_min_bytes(&mut self, min_bytes: usize) {
        self.probe_min_bytes = min_bytes;
    }

    /// Feeds raw payload bytes into the probe.
    pub fn add_data(&mut self, payload: &[u8], received_time: Instant) {
        if self.detection_complete {
            return;
        }
        if self.total_bytes_received == 0 {
            self.first_packet_time = Some(received_time);
        }
        self.last_packet_time = Some(received_time);
        self.total_bytes_received += payload.len();

        let space = MAX_PROBE_BYTES.saturating_sub(self.probe_buffer.len());
        let take = payload.len().min(space);
        if take > 0 {
            self.probe_buffer.extend_from_slice(&payload[..take]);
        }
    }

    /// Whether enough data and time have accumulated to attempt detection.
    pub fn has_sufficient_data(&self) -> bool {
        if self.detection_complete {
            return true;
        }
        if self.probe_buffer.len() < self.probe_min_bytes {
            return false;
        }
        match (self.first_packet_time, self.last_packet_time) {
            (Some(first), Some(last)) => {
                last.duration_since(first) >= Duration::from_millis(self.probe_duration_ms as u64)
            }
            _ => false,
        }
    }

    /// Whether detection has completed.
    pub fn is_detection_complete(&self) -> bool {
        self.detection_complete
    }

    /// Detected format, valid only after detection completes.
    pub fn detected_format(&self) -> &StreamProperties {
        &self.detected_format
    }

    /// Detection confidence in `[0, 1]`.
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Clears all state for reuse.
    pub fn reset(&mut self) {
        self.probe_buffer.clear();
        self.first_packet_time = None;
        self.last_packet_time = None;
        self.total_bytes_received = 0;
        self.detected_format = StreamProperties::default();
        self.confidence = 0.0;
        self.detection_complete = false;
    }

    /// Runs detection; returns true on success. Success is sticky.
    pub fn finalize_detection(&mut self) -> bool {
        if self.detection_complete {
            return true;
        }
        if !self.has_sufficient_data() {
            return false;
        }

        if let Some(codec) = self.detect_codec() {
            self.apply_codec_detection(codec);
            self.confidence = 0.75;
            self.detection_complete = true;
            return true;
        }

        // PCM brute force over plausible channel/bit-depth pairs.
        let mut candidates: Vec<FormatCandidate> = Vec::new();
        for &channels in &[1u16, 2, 6, 8] {
            for &bit_depth in &[8u16, 16, 24, 32] {
                let bytes_per_frame = channels as usize * (bit_depth as usize / 8);
                if self.probe_buffer.len() < bytes_per_frame * 100 {
                    continue;
                }
                let endianness = if bit_depth == 8 {
                    Endianness::Little
                } else {
                    self.detect_endianness(bit_depth)
                };
                let score = self.discontinuity_score(channels, bit_depth, endianness);
                candidates.push(FormatCandidate {
                    channels,
                    bit_depth,
                    endianness,
                    score,
                });
            }
        }
        if candidates.is_empty() {
            return false;
        }
        candidates.sort_by(|a, b| a.score.total_cmp(&b.score));
        let best = candidates[0];

        self.confidence = if candidates.len() > 1 {
            let second = candidates[1].score;
            if best.score > 0.0 && second > 0.0 {
                (((second / best.score) - 1.0) / 2.0).min(1.0) as f32
            } else if best.score == 0.0 {
                0.5
            } else {
                0.8
            }
        } else {
            0.6
        };

        self.detected_format = StreamProperties {
            sample_rate: self.estimate_sample_rate(best.channels, best.bit_depth),
            channels: best.channels,
            bit_depth: best.bit_depth,
            endianness: best.endianness,
            codec: StreamCodec::Pcm,
            ..Default::default()
        };
        debug!(
            channels = best.channels,
            bit_depth = best.bit_depth,
            sample_rate = self.detected_format.sample_rate,
            confidence = self.confidence,
            "probe settled on PCM format"
        );
        self.detection_complete = true;
        true
    }

    fn apply_codec_detection(&mut self, codec: StreamCodec) {
        self.detected_format.codec = codec;
        match codec {
            StreamCodec::Pcmu | StreamCodec::Pcma => {
                // Companded audio is 8-bit; find the channel count whose byte
                // rate lands closest to a common sample rate.
                let byte_rate = self.byte_rate();
                let mut best_channels = 1u16;
                let mut best_rate = 8000u32;
                let mut min_error = u32::MAX;
                for &channels in &[1u16, 2, 6, 8] {
                    let raw = (byte_rate / channels as f64) as u32;
                    let rounded = round_to_common_sample_rate(raw);
                    let error = raw.abs_diff(rounded);
                    if error < min_error {
                        min_error = error;
                        best_channels = channels;
                        best_rate = rounded;
                    }
                }
                self.detected_format.bit_depth = 8;
                self.detected_format.channels = best_channels;
                self.detected_format.sample_rate = best_rate;
                self.detected_format.endianness = Endianness::Big;
            }
            StreamCodec::Opus => {
                // Opus RTP clock is 48 kHz; channels resolved by decode-and-score.
                let mut best_channels = 2u16;
                let mut best_score = f64::MAX;
                for channels in [1u16, 2] {
                    if let Some(score) = self.opus_decode_score(channels) {
                        if score < best_score {
                            best_score = score;
                            best_channels = channels;
                        }
                    }
                }
                self.detected_format.bit_depth = 16;
                self.detected_format.channels = best_channels;
                self.detected_format.sample_rate = 48000;
                self.detected_format.endianness = Endianness::Little;
            }
            _ => {}
        }
    }

    fn byte_rate(&self) -> f64 {
        match (self.first_packet_time, self.last_packet_time) {
            (Some(first), Some(last)) => {
                let seconds = last.duration_since(first).as_secs_f64();
                if seconds > 0.0 {
                    self.total_bytes_received as f64 / seconds
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Attempts each coded format and compares the winner against the best
    /// PCM interpretation.
    fn detect_codec(&self) -> Option<StreamCodec> {
        if self.probe_buffer.len() < 1000 {
            return None;
        }

        let mut scores: Vec<(StreamCodec, f64)> = Vec::new();
        if let Some(score) = self.ulaw_discontinuity() {
            scores.push((StreamCodec::Pcmu, score));
        }
        if let Some(score) = self.alaw_discontinuity() {
            scores.push((StreamCodec::Pcma, score));
        }
        if let Some(score) = self.opus_decode_score(2) {
            scores.push((StreamCodec::Opus, score));
        }
        if scores.is_empty() {
            return None;
        }

        let mut best_pcm = f64::MAX;
        for &channels in &[1u16, 2] {
            for &bits in &[8u16, 16] {
                let endianness = if bits == 8 {
                    Endianness::Little
                } else {
                    self.detect_endianness(bits)
                };
                let score = self.discontinuity_score(channels, bits, endianness);
                if score < best_pcm {
                    best_pcm = score;
                }
            }
        }

        let (codec, score) = scores
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .copied()
            .expect("non-empty scores");

        if best_pcm > 0.0 && score / best_pcm < CODEC_IMPROVEMENT_THRESHOLD {
            Some(codec)
        } else {
            None
        }
    }

    /// Counts large inter-sample jumps for a PCM interpretation; lower is
    /// smoother and therefore more plausible.
    fn discontinuity_score(&self, channels: u16, bit_depth: u16, endianness: Endianness) -> f64 {
        let bytes_per_sample = bit_depth as usize / 8;
        let bytes_per_frame = channels as usize * bytes_per_sample;
        if bytes_per_frame == 0 || self.probe_buffer.len() < bytes_per_frame * 10 {
            return f64::MAX;
        }

        let num_frames = self.probe_buffer.len() / bytes_per_frame;
        let max_amp = max_amplitude(bit_depth) as f64;
        let threshold = (max_amp * DISCONTINUITY_THRESHOLD) as i64;

        // First pass: mean.
        let mut sum: i64 = 0;
        let mut count: usize = 0;
        for frame in 0..num_frames {
            for ch in 0..channels as usize {
                let offset = frame * bytes_per_frame + ch * bytes_per_sample;
                sum += read_sample(&self.probe_buffer[offset..], bit_depth, endianness);
                count += 1;
            }
        }
        let mean = sum as f64 / count as f64;

        // Second pass: variance and discontinuities.
        let mut total_discontinuity = 0.0f64;
        let mut total_variance = 0.0f64;
        let mut prev = [0i64; 8];
        for frame in 0..num_frames {
            for ch in 0..channels as usize {
                let offset = frame * bytes_per_frame + ch * bytes_per_sample;
                let sample = read_sample(&self.probe_buffer[offset..], bit_depth, endianness);
                let diff_from_mean = sample as f64 - mean;
                total_variance += diff_from_mean * diff_from_mean;
                if frame > 0 {
                    let jump = (sample - prev[ch]).abs();
                    if jump > threshold {
                        total_discontinuity += jump as f64 / max_amp;
                    }
                }
                prev[ch] = sample;
            }
        }

        let normalized_variance = (total_variance / count as f64) / (max_amp * max_amp);
        if normalized_variance < MIN_VARIANCE_THRESHOLD {
            // Silence scores almost arbitrarily well; deprioritize it.
            return f64::MAX / 2.0;
        }

        total_discontinuity / num_frames as f64
    }

    /// Picks the wire byte order from per-position byte volatility: the byte
    /// that changes most between consecutive samples is the LSB.
    fn detect_endianness(&self, bit_depth: u16) -> Endianness {
        if bit_depth == 8 {
            return Endianness::Little;
        }
        let bytes_per_sample = bit_depth as usize / 8;
        let num_samples = self.probe_buffer.len() / bytes_per_sample;
        if num_samples < 100 {
            return Endianness::Big;
        }

        let mut byte_changes = vec![0usize; bytes_per_sample];
        for i in 1..num_samples {
            let curr = &self.probe_buffer[i * bytes_per_sample..];
            let prev = &self.probe_buffer[(i - 1) * bytes_per_sample..];
            for b in 0..bytes_per_sample {
                if curr[b] != prev[b] {
                    byte_changes[b] += 1;
                }
            }
        }

        let (most_volatile, _) = byte_changes
            .iter()
            .enumerate()
            .max_by_key(|(_, &count)| count)
            .expect("non-empty");
        if most_volatile == 0 {
            return Endianness::Little;
        }
        if most_volatile == bytes_per_sample - 1 {
            return Endianness::Big;
        }

        // Ambiguous: compare first vs last byte with a ±30% dead band,
        // defaulting to big-endian for compatibility.
        let first = byte_changes[0] as f64;
        let last = byte_changes[bytes_per_sample - 1].max(1) as f64;
        let ratio = first / last;
        if ratio > 1.3 {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    fn estimate_sample_rate(&self, channels: u16, bit_depth: u16) -> u32 {
        let bytes_per_frame = channels as u32 * (bit_depth as u32 / 8);
        let byte_rate = self.byte_rate();
        if byte_rate <= 0.0 || bytes_per_frame == 0 {
            return 48000;
        }
        round_to_common_sample_rate((byte_rate / bytes_per_frame as f64 + 0.5) as u32)
    }

    fn ulaw_discontinuity(&self) -> Option<f64> {
        self.g711_discontinuity(decode_mulaw_sample)
    }

    fn alaw_discontinuity(&self) -> Option<f64> {
        self.g711_discontinuity(decode_alaw_sample)
    }

    fn g711_discontinuity(&self, expand: fn(u8) -> i16) -> Option<f64> {
        if self.probe_buffer.len() < 100 {
            return None;
        }
        let mut total = 0.0f64;
        let mut prev = expand(self.probe_buffer[0]) as i32;
        for &byte in &self.probe_buffer[1..] {
            let sample = expand(byte) as i32;
            let diff = (sample - prev).abs();
            if diff > LARGE_STEP_INT16 {
                total += diff as f64 / 32767.0;
            }
            prev = sample;
        }
        Some(total / self.probe_buffer.len() as f64)
    }

    /// Decodes the buffer prefix as a single Opus frame and scores the PCM.
    fn opus_decode_score(&self, channels: u16) -> Option<f64> {
        if self.probe_buffer.len() < 100 {
            return None;
        }
        let mode = if channels == 1 {
            opus::Channels::Mono
        } else {
            opus::Channels::Stereo
        };
        let mut decoder = opus::Decoder::new(48000, mode).ok()?;

        const MAX_FRAME_SAMPLES: usize = 5760; // 120 ms at 48 kHz
        let mut pcm = vec![0i16; MAX_FRAME_SAMPLES * channels as usize];
        let prefix_len = self.probe_buffer.len().min(1500);
        let frames = decoder
            .decode(&self.probe_buffer[..prefix_len], &mut pcm, false)
            .ok()?;
        if frames == 0 {
            return None;
        }

        let total_samples = frames * channels as usize;
        let mut total = 0.0f64;
        for i in 1..total_samples {
            let diff = (pcm[i] as i32 - pcm[i - 1] as i32).abs();
            if diff > LARGE_STEP_INT16 {
                total += diff as f64 / 32767.0;
            }
        }
        Some(total / total_samples as f64)
    }
}

/// Snaps a raw rate estimate to the nearest common sample rate.
pub fn round_to_common_sample_rate(raw_rate: u32) -> u32 {
    let mut closest = 48000;
    let mut min_diff = raw_rate.abs_diff(48000);
    for &rate in &COMMON_SAMPLE_RATES {
        let diff = raw_rate.abs_diff(rate);
        if diff < min_diff {
            min_diff = diff;
            closest = rate;
        }
    }
    closest
}

fn max_amplitude(bit_depth: u16) -> i64 {
    match bit_depth {
        8 => 127,
        16 => 32767,
        24 => 8_388_607,
        32 => 2_147_483_647,
        _ => 32767,
    }
}

fn read_sample(data: &[u8], bit_depth: u16, endianness: Endianness) -> i64 {
    match bit_depth {
        8 => data[0] as i64 - 128,
        16 => {
            let val = match endianness {
                Endianness::Little => i16::from_le_bytes([data[0], data[1]]),
                Endianness::Big => i16::from_be_bytes([data[0], data[1]]),
            };
            val as i64
        }
        24 => {
            let raw = match endianness {
                Endianness::Little => {
                    data[0] as i32 | (data[1] as i32) << 8 | (data[2] as i32) << 16
                }
                Endianness::Big => (data[0] as i32) << 16 | (data[1] as i32) << 8 | data[2] as i32,
            };
            (((raw << 8) >> 8)) as i64
        }
        32 => {
            let val = match endianness {
                Endianness::Little => i32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                Endianness::Big => i32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            };
            val as i64
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Generates interleaved 16-bit sine audio in the requested byte order.
    fn sine_pcm16(channels: usize, frames: usize, endianness: Endianness) -> Vec<u8> {
        let mut out = Vec::with_capacity(frames * channels * 2);
        for frame in 0..frames {
            for ch in 0..channels {
                let phase = (frame as f64 / 48.0 + ch as f64 * 0.25) * std::f64::consts::TAU;
                let sample = (phase.sin() * 12000.0) as i16;
                match endianness {
                    Endianness::Little => out.extend_from_slice(&sample.to_le_bytes()),
                    Endianness::Big => out.extend_from_slice(&sample.to_be_bytes()),
                }
            }
        }
        out
    }

    fn feed(probe: &mut AudioFormatProbe, data: &[u8], packets: usize, span: Duration) {
        let start = Instant::now() - span;
        let chunk = data.len() / packets;
        for i in 0..packets {
            let at = start + span.mul_f64(i as f64 / (packets - 1).max(1) as f64);
            probe.add_data(&data[i * chunk..(i + 1) * chunk], at);
        }
    }

    #[test]
    fn sample_rate_snapping_is_idempotent() {
        for rate in COMMON_SAMPLE_RATES {
            assert_eq!(round_to_common_sample_rate(rate), rate);
        }
        assert_eq!(round_to_common_sample_rate(47800), 48000);
        assert_eq!(round_to_common_sample_rate(44000), 44100);
        assert_eq!(round_to_common_sample_rate(7500), 8000);
    }

    #[test]
    fn insufficient_data_defers_detection() {
        let mut probe = AudioFormatProbe::new();
        probe.add_data(&[0u8; 100], Instant::now());
        assert!(!probe.has_sufficient_data());
        assert!(!probe.finalize_detection());
    }

    #[test]
    fn detects_stereo_le_pcm() {
        let mut probe = AudioFormatProbe::new();
        // One second of 48 kHz stereo 16-bit audio.
        let data = sine_pcm16(2, 48000, Endianness::Little);
        feed(&mut probe, &data, 100, Duration::from_secs(1));
        assert!(probe.has_sufficient_data());
        assert!(probe.finalize_detection());
        let format = probe.detected_format();
        assert_eq!(format.codec, StreamCodec::Pcm);
        assert_eq!(format.bit_depth, 16);
        assert_eq!(format.endianness, Endianness::Little);
        assert_eq!(format.sample_rate, 48000);
    }

    #[test]
    fn detects_mulaw_stream() {
        // Encode a sine as μ-law by inverting the expansion table lookup:
        // pick for each target sample the closest companded byte.
        let mut data = Vec::with_capacity(16000);
        for i in 0..16000usize {
            let target = ((i as f64 / 40.0).sin() * 8000.0) as i16;
            let mut best = 0u8;
            let mut best_err = i32::MAX;
            for byte in 0u16..=255 {
                let err = (decode_mulaw_sample(byte as u8) as i32 - target as i32).abs();
                if err < best_err {
                    best_err = err;
                    best = byte as u8;
                }
            }
            data.push(best);
        }
        let mut probe = AudioFormatProbe::new();
        feed(&mut probe, &data, 100, Duration::from_secs(2));
        assert!(probe.finalize_detection());
        assert_eq!(probe.detected_format().codec, StreamCodec::Pcmu);
        assert_eq!(probe.detected_format().bit_depth, 8);
    }

    #[test]
    fn detection_is_sticky() {
        let mut probe = AudioFormatProbe::new();
        let data = sine_pcm16(2, 48000, Endianness::Little);
        feed(&mut probe, &data, 100, Duration::from_secs(1));
        assert!(probe.finalize_detection());
        let format = probe.detected_format().clone();
        // Additional data changes nothing once detection completed.
        probe.add_data(&[0xAB; 4096], Instant::now());
        assert!(probe.finalize_detection());
        assert_eq!(probe.detected_format(), &format);
    }

    #[test]
    fn reset_clears_detection() {
        let mut probe = AudioFormatProbe::new();
        let data = sine_pcm16(2, 48000, Endianness::Little);
        feed(&mut probe, &data, 100, Duration::from_secs(1));
        assert!(probe.finalize_detection());
        probe.reset();
        assert!(!probe.is_detection_complete());
        assert!(!probe.has_sufficient_data());
    }

    #[test]
    fn endianness_follows_lsb_volatility() {
        let mut probe = AudioFormatProbe::new();
        let data = sine_pcm16(1, 24000, Endianness::Big);
        feed(&mut probe, &data, 50, Duration::from_secs(1));
        assert_eq!(probe.detect_endianness(16), Endianness::Big);

        let mut probe = AudioFormatProbe::new();
        let data = sine_pcm16(1, 24000, Endianness::Little);
        feed(&mut probe, &data, 50, Duration::from_secs(1));
        assert_eq!(probe.detect_endianness(16), Endianness::Little);
    }
}
