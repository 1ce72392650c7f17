//! Core data types carried between engine components.

use std::time::Instant;

use crate::EQ_BANDS;

/// The universal in-flight unit: one decoded audio packet with its source
/// identity, timing and format.
#[derive(Debug, Clone)]
pub struct TaggedAudioPacket {
    /// Routable source identifier. A trailing `*` in a consumer's filter
    /// matches tags by prefix.
    pub source_tag: String,
    /// Local monotonic arrival time.
    pub received_time: Instant,
    /// RTP timestamp; required for scheduling.
    pub rtp_timestamp: Option<u32>,
    /// RTP sequence number, when the transport had one.
    pub rtp_sequence_number: Option<u16>,
    /// SSRC first, then any CSRCs.
    pub ssrcs: Vec<u32>,
    /// Samples per second.
    pub sample_rate: u32,
    /// Channel count (1..=8).
    pub channels: u16,
    /// Bits per sample (8, 16, 24 or 32).
    pub bit_depth: u16,
    /// Scream channel-mask low byte.
    pub chlayout1: u8,
    /// Scream channel-mask high byte.
    pub chlayout2: u8,
    /// Interleaved little-endian PCM.
    pub audio_data: Vec<u8>,
    /// Playback-rate ratio the scheduler annotated this packet with.
    pub playback_rate: f64,
    /// Whether the datagram arrived over loopback (diagnostic).
    pub ingress_from_loopback: bool,
    /// Sparse debug marker, set once per 100 000-tick RTP timestamp bucket.
    pub is_sentinel: bool,
}

impl Default for TaggedAudioPacket {
    fn default() -> Self {
        TaggedAudioPacket {
            source_tag: String::new(),
            received_time: Instant::now(),
            rtp_timestamp: None,
            rtp_sequence_number: None,
            ssrcs: Vec::new(),
            sample_rate: 0,
            channels: 0,
            bit_depth: 0,
            chlayout1: 0,
            chlayout2: 0,
            audio_data: Vec::new(),
            playback_rate: 1.0,
            ingress_from_loopback: false,
            is_sentinel: false,
        }
    }
}

impl TaggedAudioPacket {
    /// Bytes per interleaved frame, zero when the format is incomplete.
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Frame count implied by the payload size.
    pub fn frames(&self) -> usize {
        let bpf = self.bytes_per_frame();
        if bpf == 0 {
            0
        } else {
            self.audio_data.len() / bpf
        }
    }

    /// Audio duration of this packet in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Validates the size invariant and field ranges.
    pub fn format_is_valid(&self) -> bool {
        (1..=8).contains(&self.channels)
            && matches!(self.bit_depth, 8 | 16 | 24 | 32)
            && self.sample_rate > 0
            && !self.audio_data.is_empty()
            && self.audio_data.len() % self.bytes_per_frame() == 0
    }
}

/// Fixed-size block of processed audio handed from a source processor to a
/// sink mixer: exactly [`crate::OUTPUT_CHUNK_SAMPLES`] interleaved 32-bit
/// samples.
#[derive(Debug, Clone)]
pub struct ProcessedAudioChunk {
    /// Interleaved 32-bit samples.
    pub audio_data: Vec<i32>,
    /// When the chunk left the source processor.
    pub produced_time: Instant,
    /// Arrival time of the packet the first sample came from.
    pub origin_time: Option<Instant>,
    /// Sentinel marker carried through from the originating packet.
    pub is_sentinel: bool,
}

impl Default for ProcessedAudioChunk {
    fn default() -> Self {
        ProcessedAudioChunk {
            audio_data: Vec::new(),
            produced_time: Instant::now(),
            origin_time: None,
            is_sentinel: false,
        }
    }
}

/// One encoded MP3 frame from a sink's MP3 branch.
#[derive(Debug, Clone, Default)]
pub struct EncodedMp3Frame {
    /// Encoded bytes.
    pub data: Vec<u8>,
}

/// Speaker layout override for one input channel count.
#[derive(Debug, Clone)]
pub struct SpeakerLayout {
    /// Use the built-in matrix for the channel pair.
    pub auto_mode: bool,
    /// Explicit mix matrix, indexed `[input_channel][output_channel]`.
    pub matrix: [[f32; crate::MAX_CHANNELS]; crate::MAX_CHANNELS],
}

impl Default for SpeakerLayout {
    fn default() -> Self {
        SpeakerLayout {
            auto_mode: true,
            matrix: [[0.0; crate::MAX_CHANNELS]; crate::MAX_CHANNELS],
        }
    }
}

/// Control commands consumed by a source processor.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Set the source gain.
    SetVolume(f32),
    /// Replace the 18-band EQ curve.
    SetEq([f32; EQ_BANDS]),
    /// Set the static playout delay in milliseconds.
    SetDelay(i32),
    /// Set the timeshift backshift in seconds.
    SetTimeshift(f32),
    /// Install a speaker layout for an input channel count.
    SetSpeakerLayout {
        /// Input channel count the layout applies to.
        input_channels: u16,
        /// The layout.
        layout: SpeakerLayout,
    },
    /// Playback-rate ratio pushed down by a sink's rate controller.
    SetPlaybackRate(f64),
}

/// Direction of a discovered device/source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDirection {
    /// Audio flowing into the engine.
    Capture,
    /// Audio flowing out of the engine.
    Playback,
}

/// Emitted exactly once when a receiver first sees a source tag.
#[derive(Debug, Clone)]
pub struct DeviceDiscoveryNotification {
    /// The newly observed source tag.
    pub source_tag: String,
    /// Direction of the device.
    pub direction: DeviceDirection,
    /// Whether the device is currently active.
    pub active: bool,
}

/// Configuration for one source input processor instance.
#[derive(Debug, Clone)]
pub struct SourceProcessorConfig {
    /// Unique instance id (assigned by the control layer).
    pub instance_id: String,
    /// Source tag filter; a trailing `*` makes it a wildcard prefix.
    pub source_tag: String,
    /// Output channel count of the owning sink.
    pub output_channels: u16,
    /// Output sample rate of the owning sink.
    pub output_samplerate: u32,
    /// Initial gain.
    pub initial_volume: f32,
    /// Initial EQ curve.
    pub initial_eq: [f32; EQ_BANDS],
    /// Initial static delay in milliseconds.
    pub initial_delay_ms: i32,
    /// Initial timeshift backshift in seconds.
    pub initial_timeshift_sec: f32,
}

impl Default for SourceProcessorConfig {
    fn default() -> Self {
        SourceProcessorConfig {
            instance_id: String::new(),
            source_tag: String::new(),
            output_channels: 2,
            output_samplerate: 48000,
            initial_volume: 1.0,
            initial_eq: [1.0; EQ_BANDS],
            initial_delay_ms: 0,
            initial_timeshift_sec: 0.0,
        }
    }
}

/// Configuration for one sink mixer.
#[derive(Debug, Clone)]
pub struct SinkMixerConfig {
    /// Identifier used in logs.
    pub sink_id: String,
    /// Destination address for UDP emission.
    pub output_ip: String,
    /// Destination port for UDP emission.
    pub output_port: u16,
    /// Output bit depth (8, 16, 24 or 32).
    pub output_bitdepth: u16,
    /// Output sample rate.
    pub output_samplerate: u32,
    /// Output channel count.
    pub output_channels: u16,
    /// Channel-mask low byte for the Scream header.
    pub output_chlayout1: u8,
    /// Channel-mask high byte for the Scream header.
    pub output_chlayout2: u8,
    /// Enable the MP3 branch.
    pub enable_mp3: bool,
}

impl Default for SinkMixerConfig {
    fn default() -> Self {
        SinkMixerConfig {
            sink_id: String::new(),
            output_ip: "127.0.0.1".into(),
            output_port: 4010,
            output_bitdepth: 16,
            output_samplerate: 48000,
            output_channels: 2,
            output_chlayout1: 0x03,
            output_chlayout2: 0x00,
            enable_mp3: false,
        }
    }
}

/// Configuration for the RTP receiver.
#[derive(Debug, Clone)]
pub struct RtpReceiverConfig {
    /// Port the default (probing) socket binds; 0 uses the engine default.
    pub listen_port: u16,
    /// Local interface addresses handed to the SAP listener.
    pub known_ips: Vec<std::net::Ipv4Addr>,
}

impl Default for RtpReceiverConfig {
    fn default() -> Self {
        RtpReceiverConfig {
            listen_port: screamrouter_rtp_core::DEFAULT_RTP_LISTEN_PORT,
            known_ips: Vec::new(),
        }
    }
}

/// Configuration for the raw and per-process Scream receivers.
#[derive(Debug, Clone)]
pub struct ScreamReceiverConfig {
    /// UDP listen port.
    pub listen_port: u16,
}

impl Default for ScreamReceiverConfig {
    fn default() -> Self {
        ScreamReceiverConfig { listen_port: 4010 }
    }
}

/// Parameters for a system capture receiver (FIFO or ALSA).
#[derive(Debug, Clone)]
pub struct CaptureParams {
    /// Device identifier: an ALSA `hw:` id or a FIFO path.
    pub hw_id: String,
    /// Channel count delivered by the device.
    pub channels: u16,
    /// Sample rate delivered by the device.
    pub sample_rate: u32,
    /// Bit depth delivered by the device (16 or 32).
    pub bit_depth: u16,
    /// Frames per period/read.
    pub period_frames: usize,
}

impl Default for CaptureParams {
    fn default() -> Self {
        CaptureParams {
            hw_id: String::new(),
            channels: 2,
            sample_rate: 48000,
            bit_depth: 16,
            period_frames: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_size_invariant() {
        let mut packet = TaggedAudioPacket {
            sample_rate: 48000,
            channels: 2,
            bit_depth: 16,
            audio_data: vec![0u8; 1152],
            ..Default::default()
        };
        assert!(packet.format_is_valid());
        assert_eq!(packet.frames(), 288);
        assert!((packet.duration_ms() - 6.0).abs() < 1e-9);

        packet.audio_data.truncate(1151);
        assert!(!packet.format_is_valid());
    }

    #[test]
    fn impossible_formats_rejected() {
        let packet = TaggedAudioPacket {
            sample_rate: 48000,
            channels: 9,
            bit_depth: 16,
            audio_data: vec![0u8; 18],
            ..Default::default()
        };
        assert!(!packet.format_is_valid());

        let packet = TaggedAudioPacket {
            sample_rate: 48000,
            channels: 2,
            bit_depth: 12,
            audio_data: vec![0u8; 12],
            ..Default::default()
        };
        assert!(!packet.format_is_valid());
    }
}
