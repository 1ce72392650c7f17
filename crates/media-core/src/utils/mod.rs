//! Shared building blocks: queues, byte ring, sentinel logging.

mod queue;
mod ring;
pub mod sentinel;

pub use queue::{PushResult, ThreadSafeQueue};
pub use ring::ByteRingBuffer;
