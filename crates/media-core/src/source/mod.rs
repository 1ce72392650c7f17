//! Per-source processing.

mod processor;

pub use processor::{
    ChunkQueue, CommandQueue, SourceInputProcessor, TimeshiftUpdate, TimeshiftUpdateCallback,
};
