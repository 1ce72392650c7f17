//! Network and system capture receivers.
//!
//! Every receiver runs its own thread: poll the transport with a short
//! timeout, decode whatever arrived into [`TaggedAudioPacket`]s, emit a
//! discovery notification the first time a source tag is seen, and hand the
//! packets to the timeshift manager. Nothing here blocks on downstream
//! consumers.

mod capture;
mod rtp;
mod scream;

pub use capture::FifoCaptureReceiver;
#[cfg(feature = "capture-alsa")]
pub use capture::AlsaCaptureReceiver;
pub use rtp::RtpReceiver;
pub use scream::{PerProcessScreamReceiver, RawScreamReceiver};

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::types::{DeviceDiscoveryNotification, DeviceDirection};
use crate::utils::ThreadSafeQueue;

/// Queue discovery notifications are delivered on.
pub type NotificationQueue = ThreadSafeQueue<DeviceDiscoveryNotification>;

/// Scream header byte layout shared by the Scream receivers and parsers.
pub(crate) fn parse_scream_sample_rate(byte: u8) -> Option<u32> {
    let base: u32 = if byte & 0x80 != 0 { 44100 } else { 48000 };
    let mult = (byte & 0x7F) as u32;
    if mult == 0 {
        return None;
    }
    Some(base * mult)
}

/// Tracks which source tags a receiver has already announced.
pub(crate) struct SourceTracker {
    known: Mutex<HashSet<String>>,
    seen: Mutex<Vec<String>>,
    notifications: Option<Arc<NotificationQueue>>,
    logger_prefix: &'static str,
}

impl SourceTracker {
    pub(crate) fn new(
        notifications: Option<Arc<NotificationQueue>>,
        logger_prefix: &'static str,
    ) -> Self {
        SourceTracker {
            known: Mutex::new(HashSet::new()),
            seen: Mutex::new(Vec::new()),
            notifications,
            logger_prefix,
        }
    }

    /// Records a tag; emits the discovery notification exactly once.
    pub(crate) fn register(&self, tag: &str) {
        let is_new = self.known.lock().insert(tag.to_string());
        {
            let mut seen = self.seen.lock();
            if !seen.iter().any(|t| t == tag) {
                seen.push(tag.to_string());
            }
        }
        if is_new {
            info!(receiver = self.logger_prefix, source = %tag, "new source detected");
            if let Some(queue) = &self.notifications {
                queue.push(DeviceDiscoveryNotification {
                    source_tag: tag.to_string(),
                    direction: DeviceDirection::Capture,
                    active: true,
                });
            }
        }
    }

    /// Forgets a tag so its next appearance notifies again.
    pub(crate) fn forget(&self, tag: &str) {
        self.known.lock().remove(tag);
    }

    /// Returns the tags observed since the previous call, clearing the list.
    pub(crate) fn take_seen(&self) -> Vec<String> {
        std::mem::take(&mut *self.seen.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scream_rate_byte_decodes() {
        assert_eq!(parse_scream_sample_rate(0x01), Some(48000));
        assert_eq!(parse_scream_sample_rate(0x81), Some(44100));
        assert_eq!(parse_scream_sample_rate(0x02), Some(96000));
        assert_eq!(parse_scream_sample_rate(0x82), Some(88200));
        assert_eq!(parse_scream_sample_rate(0x00), None);
        assert_eq!(parse_scream_sample_rate(0x80), None);
    }

    #[test]
    fn tracker_notifies_once_per_tag() {
        let queue = Arc::new(NotificationQueue::new());
        let tracker = SourceTracker::new(Some(Arc::clone(&queue)), "[test]");
        tracker.register("10.0.0.1");
        tracker.register("10.0.0.1");
        tracker.register("10.0.0.2");
        assert_eq!(queue.len(), 2);
        assert_eq!(tracker.take_seen().len(), 2);
        assert!(tracker.take_seen().is_empty());

        tracker.forget("10.0.0.1");
        tracker.register("10.0.0.1");
        assert_eq!(queue.len(), 3);
    }
}
