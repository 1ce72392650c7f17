//! System capture receivers: named-pipe (FIFO) and ALSA.
//!
//! Captured frames have no network clock, so both receivers re-chunk the
//! byte stream and stamp packets with a synthetic RTP timestamp advanced by
//! the frame cursor; the scheduler then treats them like any network
//! source with `playback_rate = 1.0`.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use screamrouter_rtp_core::layout::{channel_mask_bytes, default_channel_mask_for_channels};

use crate::timeshift::TimeshiftManager;
use crate::types::{CaptureParams, TaggedAudioPacket};
use crate::utils::sentinel::SENTINEL_BUCKET_TICKS;
use crate::utils::ByteRingBuffer;
use crate::Result;

use super::{NotificationQueue, SourceTracker};

/// Builds capture chunks and dispatches them with a synthetic clock.
struct CaptureChunker {
    source_tag: String,
    params: CaptureParams,
    bytes_per_frame: usize,
    chunk_bytes: usize,
    accumulator: ByteRingBuffer,
    frame_cursor: u32,
    last_sentinel_bucket: Option<u32>,
    chlayout1: u8,
    chlayout2: u8,
    timeshift: Arc<TimeshiftManager>,
    tracker: Arc<SourceTracker>,
}

impl CaptureChunker {
    fn new(
        source_tag: String,
        params: CaptureParams,
        timeshift: Arc<TimeshiftManager>,
        tracker: Arc<SourceTracker>,
    ) -> Self {
        let bytes_per_frame = params.channels as usize * params.bit_depth as usize / 8;
        let chunk_bytes = bytes_per_frame * params.period_frames.max(1);
        let mask = default_channel_mask_for_channels(params.channels);
        let (chlayout1, chlayout2) = channel_mask_bytes(mask);
        let mut accumulator = ByteRingBuffer::new();
        accumulator.reserve(chunk_bytes * 2);
        CaptureChunker {
            source_tag,
            params,
            bytes_per_frame,
            chunk_bytes,
            accumulator,
            frame_cursor: 0,
            last_sentinel_bucket: None,
            chlayout1,
            chlayout2,
            timeshift,
            tracker,
        }
    }

    /// Feeds captured bytes; emits one packet per complete chunk.
    fn feed(&mut self, data: &[u8]) {
        self.accumulator.write(data);
        while self.accumulator.len() >= self.chunk_bytes {
            let mut audio_data = vec![0u8; self.chunk_bytes];
            self.accumulator.pop(&mut audio_data);
            let frames = (self.chunk_bytes / self.bytes_per_frame) as u32;

            let rtp_timestamp = self.frame_cursor;
            self.frame_cursor = self.frame_cursor.wrapping_add(frames);

            let bucket = rtp_timestamp / SENTINEL_BUCKET_TICKS;
            let is_sentinel = match self.last_sentinel_bucket {
                Some(last) if last != bucket => {
                    self.last_sentinel_bucket = Some(bucket);
                    true
                }
                Some(_) => false,
                None => {
                    self.last_sentinel_bucket = Some(bucket);
                    false
                }
            };

            self.tracker.register(&self.source_tag);
            self.timeshift.add_packet(TaggedAudioPacket {
                source_tag: self.source_tag.clone(),
                received_time: Instant::now(),
                rtp_timestamp: Some(rtp_timestamp),
                rtp_sequence_number: None,
                ssrcs: Vec::new(),
                sample_rate: self.params.sample_rate,
                channels: self.params.channels,
                bit_depth: self.params.bit_depth,
                chlayout1: self.chlayout1,
                chlayout2: self.chlayout2,
                audio_data,
                playback_rate: 1.0,
                ingress_from_loopback: false,
                is_sentinel,
            });
        }
    }
}

/// Captures raw PCM from a named pipe.
pub struct FifoCaptureReceiver {
    source_tag: String,
    params: CaptureParams,
    notifications: Arc<NotificationQueue>,
    timeshift: Arc<TimeshiftManager>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FifoCaptureReceiver {
    /// Creates a stopped receiver reading from `params.hw_id` (a FIFO path).
    pub fn new(
        source_tag: impl Into<String>,
        params: CaptureParams,
        notifications: Arc<NotificationQueue>,
        timeshift: Arc<TimeshiftManager>,
    ) -> Self {
        FifoCaptureReceiver {
            source_tag: source_tag.into(),
            params,
            notifications,
            timeshift,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Launches the capture thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        if self.params.hw_id.is_empty() {
            return Err(crate::Error::InvalidState("FIFO path is empty".into()));
        }
        self.stop_flag.store(false, Ordering::SeqCst);

        let tracker = Arc::new(SourceTracker::new(Some(Arc::clone(&self.notifications)), "[FifoCapture]"));
        let mut chunker = CaptureChunker::new(
            self.source_tag.clone(),
            self.params.clone(),
            Arc::clone(&self.timeshift),
            tracker,
        );
        let path = self.params.hw_id.clone();
        let stop = Arc::clone(&self.stop_flag);
        let read_len = chunker.chunk_bytes;

        let handle = std::thread::Builder::new()
            .name("fifo-capture".into())
            .spawn(move || {
                info!(%path, "fifo capture loop started");
                let mut buffer = vec![0u8; read_len];
                let mut file: Option<std::fs::File> = None;
                while !stop.load(Ordering::SeqCst) {
                    let reader = match file.as_mut() {
                        Some(reader) => reader,
                        None => match open_nonblocking(&path) {
                            Ok(opened) => {
                                info!(%path, "fifo opened");
                                file = Some(opened);
                                file.as_mut().expect("just set")
                            }
                            Err(err) => {
                                debug!(%path, %err, "fifo not available yet");
                                std::thread::sleep(Duration::from_millis(250));
                                continue;
                            }
                        },
                    };
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            // Writer went away; wait for the next one.
                            debug!(%path, "fifo writer closed");
                            file = None;
                            std::thread::sleep(Duration::from_millis(100));
                        }
                        Ok(n) => chunker.feed(&buffer[..n]),
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        Err(err) => {
                            if !stop.load(Ordering::SeqCst) {
                                warn!(%path, %err, "fifo read failed, reopening");
                            }
                            file = None;
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
                info!(%path, "fifo capture loop exiting");
            })
            .map_err(std::io::Error::other)?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stops and joins the capture thread.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.stop_flag.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                error!("fifo capture thread panicked");
            }
        }
    }
}

impl Drop for FifoCaptureReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn open_nonblocking(path: &str) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    // O_NONBLOCK: opening a FIFO for read must not wait for a writer.
    const O_NONBLOCK: i32 = 0x800;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_nonblocking(path: &str) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().read(true).open(path)
}

/// Captures PCM from an ALSA device.
#[cfg(feature = "capture-alsa")]
pub struct AlsaCaptureReceiver {
    source_tag: String,
    params: CaptureParams,
    notifications: Arc<NotificationQueue>,
    timeshift: Arc<TimeshiftManager>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

#[cfg(feature = "capture-alsa")]
impl AlsaCaptureReceiver {
    /// Creates a stopped receiver for `params.hw_id` (e.g. `hw:1,0`).
    pub fn new(
        source_tag: impl Into<String>,
        params: CaptureParams,
        notifications: Arc<NotificationQueue>,
        timeshift: Arc<TimeshiftManager>,
    ) -> Self {
        AlsaCaptureReceiver {
            source_tag: source_tag.into(),
            params,
            notifications,
            timeshift,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Opens the PCM device and launches the capture thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::SeqCst);

        let tracker = Arc::new(SourceTracker::new(Some(Arc::clone(&self.notifications)), "[AlsaCapture]"));
        let mut chunker = CaptureChunker::new(
            self.source_tag.clone(),
            self.params.clone(),
            Arc::clone(&self.timeshift),
            tracker,
        );
        let params = self.params.clone();
        let stop = Arc::clone(&self.stop_flag);

        let handle = std::thread::Builder::new()
            .name("alsa-capture".into())
            .spawn(move || {
                if let Err(err) = alsa_capture_loop(&params, &mut chunker, &stop) {
                    error!(device = %params.hw_id, %err, "alsa capture loop failed");
                }
            })
            .map_err(std::io::Error::other)?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stops and joins the capture thread.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.stop_flag.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                error!("alsa capture thread panicked");
            }
        }
    }
}

#[cfg(feature = "capture-alsa")]
impl Drop for AlsaCaptureReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "capture-alsa")]
fn alsa_capture_loop(
    params: &CaptureParams,
    chunker: &mut CaptureChunker,
    stop: &AtomicBool,
) -> std::result::Result<(), alsa::Error> {
    use alsa::pcm::{Access, Format, HwParams, PCM};
    use alsa::Direction;

    let pcm = PCM::new(&params.hw_id, Direction::Capture, false)?;
    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_channels(params.channels as u32)?;
        hwp.set_rate(params.sample_rate, alsa::ValueOr::Nearest)?;
        hwp.set_format(match params.bit_depth {
            32 => Format::s32(),
            _ => Format::s16(),
        })?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_period_size(params.period_frames as i64, alsa::ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }
    pcm.start()?;
    info!(device = %params.hw_id, "alsa capture started");

    let bytes_per_sample = params.bit_depth as usize / 8;
    let samples_per_period = params.period_frames * params.channels as usize;

    if params.bit_depth == 32 {
        let io = pcm.io_i32()?;
        let mut frame_buf = vec![0i32; samples_per_period];
        while !stop.load(Ordering::SeqCst) {
            match io.readi(&mut frame_buf) {
                Ok(frames) => {
                    let samples = frames * params.channels as usize;
                    let mut bytes = Vec::with_capacity(samples * bytes_per_sample);
                    for sample in &frame_buf[..samples] {
                        bytes.extend_from_slice(&sample.to_le_bytes());
                    }
                    chunker.feed(&bytes);
                }
                Err(err) => {
                    warn!(device = %params.hw_id, %err, "alsa read error, recovering");
                    pcm.try_recover(err, true)?;
                }
            }
        }
    } else {
        let io = pcm.io_i16()?;
        let mut frame_buf = vec![0i16; samples_per_period];
        while !stop.load(Ordering::SeqCst) {
            match io.readi(&mut frame_buf) {
                Ok(frames) => {
                    let samples = frames * params.channels as usize;
                    let mut bytes = Vec::with_capacity(samples * bytes_per_sample);
                    for sample in &frame_buf[..samples] {
                        bytes.extend_from_slice(&sample.to_le_bytes());
                    }
                    chunker.feed(&bytes);
                }
                Err(err) => {
                    warn!(device = %params.hw_id, %err, "alsa read error, recovering");
                    pcm.try_recover(err, true)?;
                }
            }
        }
    }

    info!(device = %params.hw_id, "alsa capture stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::AudioEngineSettings;

    fn chunker(period_frames: usize) -> (CaptureChunker, Arc<TimeshiftManager>) {
        let timeshift = Arc::new(TimeshiftManager::new(Arc::new(
            AudioEngineSettings::default(),
        )));
        let chunker = CaptureChunker::new(
            "capture:test".into(),
            CaptureParams {
                hw_id: String::new(),
                channels: 2,
                sample_rate: 48000,
                bit_depth: 16,
                period_frames,
            },
            Arc::clone(&timeshift),
            Arc::new(SourceTracker::new(None, "[test]")),
        );
        (chunker, timeshift)
    }

    #[test]
    fn rechunks_into_period_sized_packets() {
        let (mut chunker, timeshift) = chunker(256);
        // 256 frames * 4 bytes = 1024-byte chunks; feed 2.5 chunks.
        chunker.feed(&vec![0u8; 2560]);
        assert_eq!(timeshift.stats().global_buffer_size, 2);
        assert_eq!(chunker.accumulator.len(), 512);
    }

    #[test]
    fn synthetic_timestamps_advance_by_frames() {
        let (mut chunker, timeshift) = chunker(256);
        chunker.feed(&vec![0u8; 1024]);
        chunker.feed(&vec![0u8; 1024]);
        assert_eq!(chunker.frame_cursor, 512);
        let stream = &timeshift.stats().streams["capture:test"];
        assert_eq!(stream.total_packets, 2);
    }

    #[test]
    fn partial_feeds_accumulate() {
        let (mut chunker, timeshift) = chunker(256);
        chunker.feed(&vec![0u8; 500]);
        chunker.feed(&vec![0u8; 500]);
        assert_eq!(timeshift.stats().global_buffer_size, 0);
        chunker.feed(&vec![0u8; 100]);
        assert_eq!(timeshift.stats().global_buffer_size, 1);
    }
}
