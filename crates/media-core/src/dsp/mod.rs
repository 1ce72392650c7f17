//! Per-source DSP chain.

mod processor;
mod speaker_mix;

pub use processor::{AudioProcessor, AudioProcessorConfig};
pub use speaker_mix::default_speaker_mix;
