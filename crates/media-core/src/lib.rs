//! The ScreamRouter audio engine hot path.
//!
//! Audio flows leaves-first: network receivers decode RTP/Scream datagrams
//! into [`types::TaggedAudioPacket`]s and hand them to the
//! [`timeshift::TimeshiftManager`], which owns the global packet ring and a
//! per-consumer playout schedule. Each consumer is a
//! [`source::SourceInputProcessor`] running the per-source DSP chain
//! ([`dsp::AudioProcessor`]); its fixed-size chunks feed one or more
//! [`sink::SinkAudioMixer`]s, which mix, downscale, frame and emit Scream
//! packets over UDP/TCP with an optional MP3 side channel.
//!
//! Everything runs on dedicated OS threads with atomic stop flags and
//! internally synchronized queues; the only timed wait is the timeshift
//! scheduler's condition variable.

pub mod dsp;
pub mod error;
pub mod receivers;
pub mod settings;
pub mod sink;
pub mod source;
pub mod timeshift;
pub mod types;
pub mod utils;

pub use error::{Error, Result};
pub use settings::AudioEngineSettings;
pub use types::{ProcessedAudioChunk, TaggedAudioPacket};

/// Scream wire payload size in bytes (one network chunk of PCM).
pub const SINK_CHUNK_SIZE_BYTES: usize = 1152;

/// Scream header size in bytes.
pub const SCREAM_HEADER_SIZE: usize = 5;

/// Full Scream packet size (header + payload).
pub const SCREAM_PACKET_SIZE_BYTES: usize = SCREAM_HEADER_SIZE + SINK_CHUNK_SIZE_BYTES;

/// 32-bit samples per mixing cycle; downscaling this many samples yields one
/// 1152-byte payload at 16-bit (the reference sink format).
pub const SINK_MIXING_BUFFER_SAMPLES: usize = 576;

/// Interleaved 32-bit samples per [`ProcessedAudioChunk`].
pub const OUTPUT_CHUNK_SAMPLES: usize = SINK_MIXING_BUFFER_SAMPLES;

/// Number of EQ bands in the per-source equalizer.
pub const EQ_BANDS: usize = 18;

/// Maximum channels carried through the engine.
pub const MAX_CHANNELS: usize = 8;
