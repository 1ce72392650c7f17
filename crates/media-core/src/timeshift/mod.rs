//! Timeshift buffering and playout scheduling.

mod clock;
mod manager;

pub use clock::StreamClock;
pub use manager::{PacketQueue, StreamTimingSnapshot, TimeshiftManager, TimeshiftManagerStats};
