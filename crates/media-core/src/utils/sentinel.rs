//! Sparse sentinel logging.
//!
//! Receivers mark one packet per 100 000-tick RTP timestamp bucket as a
//! sentinel; each pipeline stage that touches a sentinel logs it, giving a
//! low-rate end-to-end trace without flooding the logs.

use tracing::warn;

use crate::types::{ProcessedAudioChunk, TaggedAudioPacket};

/// RTP timestamp bucket width between sentinel markers.
pub const SENTINEL_BUCKET_TICKS: u32 = 100_000;

/// Logs a sentinel packet passing through `stage`.
pub fn log_packet_sentinel(stage: &str, packet: &TaggedAudioPacket) {
    if !packet.is_sentinel {
        return;
    }
    match packet.rtp_timestamp {
        Some(rtp_ts) => warn!(
            stage,
            source = %packet.source_tag,
            rtp_ts,
            "sentinel packet"
        ),
        None => warn!(stage, source = %packet.source_tag, "sentinel packet"),
    }
}

/// Logs a sentinel chunk passing through `stage`.
pub fn log_chunk_sentinel(stage: &str, chunk: &ProcessedAudioChunk) {
    if !chunk.is_sentinel {
        return;
    }
    let origin_age_us = chunk
        .origin_time
        .map(|t| t.elapsed().as_micros() as i64)
        .unwrap_or(-1);
    warn!(stage, origin_age_us, "sentinel chunk");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_sentinels_are_silent() {
        // Logging a non-sentinel is a no-op; this just exercises the path.
        log_packet_sentinel("test", &TaggedAudioPacket::default());
        log_chunk_sentinel("test", &ProcessedAudioChunk::default());
    }
}
