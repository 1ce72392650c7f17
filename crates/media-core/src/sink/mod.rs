//! Sink-side mixing and emission.

mod mixer;
mod rate_controller;

pub use mixer::{Mp3Queue, SinkAudioMixer};
pub use rate_controller::{InputBufferMetrics, RateCommandCallback, SinkRateController};
