//! Raw and per-process Scream receivers.
//!
//! Both listen on a UDP port for Scream-framed PCM. A raw frame is the
//! 5-byte header plus 1152 payload bytes, tagged with the sender's IP. The
//! per-process variant prepends a 30-byte space-padded program tag and is
//! tagged `fixed_15_char_ip + program_tag` so each process on a host routes
//! independently. Scream transports carry no RTP clock, so a synthetic
//! timestamp advances by the frame count per source.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use crate::timeshift::TimeshiftManager;
use crate::types::{ScreamReceiverConfig, TaggedAudioPacket};
use crate::utils::sentinel::SENTINEL_BUCKET_TICKS;
use crate::{Result, SCREAM_HEADER_SIZE, SINK_CHUNK_SIZE_BYTES};

use super::{parse_scream_sample_rate, NotificationQueue, SourceTracker};

const RAW_PACKET_SIZE: usize = SCREAM_HEADER_SIZE + SINK_CHUNK_SIZE_BYTES; // 1157
const PROGRAM_TAG_SIZE: usize = 30;
const PER_PROCESS_PACKET_SIZE: usize = PROGRAM_TAG_SIZE + RAW_PACKET_SIZE; // 1187
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Which Scream framing a receiver expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Raw,
    PerProcess,
}

struct ScreamWorkerState {
    framing: Framing,
    tracker: Arc<SourceTracker>,
    timeshift: Arc<TimeshiftManager>,
    // Synthetic RTP clock per source tag.
    frame_cursors: HashMap<String, u32>,
    sentinel_buckets: HashMap<String, u32>,
}

fn spawn_scream_receiver(
    name: &str,
    config: &ScreamReceiverConfig,
    framing: Framing,
    tracker: Arc<SourceTracker>,
    timeshift: Arc<TimeshiftManager>,
    stop_flag: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.listen_port)).into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(POLL_TIMEOUT))?;
    info!(receiver = name, port = config.listen_port, "scream receiver socket bound");

    let mut state = ScreamWorkerState {
        framing,
        tracker,
        timeshift,
        frame_cursors: HashMap::new(),
        sentinel_buckets: HashMap::new(),
    };

    let thread_name = name.to_string();
    let handle = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            info!(receiver = %thread_name, "receiver loop started");
            let mut buffer = [0u8; 2048];
            while !stop_flag.load(Ordering::SeqCst) {
                let (len, peer) = match socket.recv_from(&mut buffer) {
                    Ok(ok) => ok,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(err) => {
                        if !stop_flag.load(Ordering::SeqCst) {
                            error!(receiver = %thread_name, %err, "recv failed, backing off");
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        continue;
                    }
                };
                state.handle_datagram(&buffer[..len], peer);
            }
            info!(receiver = %thread_name, "receiver loop exiting");
        })
        .map_err(std::io::Error::other)?;
    Ok(handle)
}

impl ScreamWorkerState {
    fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) {
        let (tag, header, payload) = match self.framing {
            Framing::Raw => {
                if datagram.len() != RAW_PACKET_SIZE {
                    warn!(len = datagram.len(), %peer, "dropping malformed raw scream packet");
                    return;
                }
                let tag = peer.ip().to_string();
                (tag, &datagram[..SCREAM_HEADER_SIZE], &datagram[SCREAM_HEADER_SIZE..])
            }
            Framing::PerProcess => {
                if datagram.len() != PER_PROCESS_PACKET_SIZE {
                    warn!(len = datagram.len(), %peer, "dropping malformed per-process scream packet");
                    return;
                }
                let program_tag = String::from_utf8_lossy(&datagram[..PROGRAM_TAG_SIZE]);
                let program_tag = program_tag.trim_end().to_string();
                // Fixed-width IP keeps composite tags alignable and unique.
                let tag = format!("{:<15}{}", peer.ip(), program_tag);
                (
                    tag,
                    &datagram[PROGRAM_TAG_SIZE..PROGRAM_TAG_SIZE + SCREAM_HEADER_SIZE],
                    &datagram[PROGRAM_TAG_SIZE + SCREAM_HEADER_SIZE..],
                )
            }
        };

        let Some(sample_rate) = parse_scream_sample_rate(header[0]) else {
            warn!(byte = header[0], %peer, "dropping packet with invalid scream rate byte");
            return;
        };
        let bit_depth = header[1] as u16;
        let channels = header[2] as u16;
        if !(1..=8).contains(&channels) || !matches!(bit_depth, 8 | 16 | 24 | 32) {
            warn!(channels, bit_depth, %peer, "dropping packet with impossible scream format");
            return;
        }

        let bytes_per_frame = channels as usize * bit_depth as usize / 8;
        if payload.len() % bytes_per_frame != 0 {
            warn!(len = payload.len(), bytes_per_frame, "scream payload is not whole frames");
            return;
        }
        let frames = (payload.len() / bytes_per_frame) as u32;

        let cursor = self.frame_cursors.entry(tag.clone()).or_insert(0);
        let rtp_timestamp = *cursor;
        *cursor = cursor.wrapping_add(frames);

        let bucket = rtp_timestamp / SENTINEL_BUCKET_TICKS;
        let is_sentinel = match self.sentinel_buckets.get_mut(&tag) {
            Some(last) if *last != bucket => {
                *last = bucket;
                true
            }
            Some(_) => false,
            None => {
                self.sentinel_buckets.insert(tag.clone(), bucket);
                false
            }
        };

        self.tracker.register(&tag);

        let packet = TaggedAudioPacket {
            source_tag: tag,
            received_time: Instant::now(),
            rtp_timestamp: Some(rtp_timestamp),
            rtp_sequence_number: None,
            ssrcs: Vec::new(),
            sample_rate,
            channels,
            bit_depth,
            chlayout1: header[3],
            chlayout2: header[4],
            audio_data: payload.to_vec(),
            playback_rate: 1.0,
            ingress_from_loopback: peer.ip().is_loopback(),
            is_sentinel,
        };
        self.timeshift.add_packet(packet);
    }
}

/// Receives 1157-byte raw Scream frames; `source_tag = sender_ip`.
pub struct RawScreamReceiver {
    config: ScreamReceiverConfig,
    tracker: Arc<SourceTracker>,
    timeshift: Arc<TimeshiftManager>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RawScreamReceiver {
    /// Creates a stopped receiver.
    pub fn new(
        config: ScreamReceiverConfig,
        notifications: Arc<NotificationQueue>,
        timeshift: Arc<TimeshiftManager>,
    ) -> Self {
        RawScreamReceiver {
            config,
            tracker: Arc::new(SourceTracker::new(Some(notifications), "[RawScream]")),
            timeshift,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Returns the source tags observed since the previous call.
    pub fn take_seen_tags(&self) -> Vec<String> {
        self.tracker.take_seen()
    }

    /// Binds the socket and launches the receive thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        self.thread = Some(spawn_scream_receiver(
            "raw-scream-rx",
            &self.config,
            Framing::Raw,
            Arc::clone(&self.tracker),
            Arc::clone(&self.timeshift),
            Arc::clone(&self.stop_flag),
        )?);
        Ok(())
    }

    /// Stops and joins the receive thread.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.stop_flag.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                error!("raw scream receiver thread panicked");
            }
        }
    }
}

impl Drop for RawScreamReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Receives 1187-byte per-process Scream frames;
/// `source_tag = fixed_15_char_ip + program_tag`.
pub struct PerProcessScreamReceiver {
    config: ScreamReceiverConfig,
    tracker: Arc<SourceTracker>,
    timeshift: Arc<TimeshiftManager>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PerProcessScreamReceiver {
    /// Creates a stopped receiver.
    pub fn new(
        config: ScreamReceiverConfig,
        notifications: Arc<NotificationQueue>,
        timeshift: Arc<TimeshiftManager>,
    ) -> Self {
        PerProcessScreamReceiver {
            config,
            tracker: Arc::new(SourceTracker::new(Some(notifications), "[PerProcScream]")),
            timeshift,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Returns the source tags observed since the previous call.
    pub fn take_seen_tags(&self) -> Vec<String> {
        self.tracker.take_seen()
    }

    /// Binds the socket and launches the receive thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        self.thread = Some(spawn_scream_receiver(
            "pp-scream-rx",
            &self.config,
            Framing::PerProcess,
            Arc::clone(&self.tracker),
            Arc::clone(&self.timeshift),
            Arc::clone(&self.stop_flag),
        )?);
        Ok(())
    }

    /// Stops and joins the receive thread.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.stop_flag.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                error!("per-process scream receiver thread panicked");
            }
        }
    }
}

impl Drop for PerProcessScreamReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::AudioEngineSettings;

    fn state(framing: Framing) -> (ScreamWorkerState, Arc<TimeshiftManager>) {
        let timeshift = Arc::new(TimeshiftManager::new(Arc::new(
            AudioEngineSettings::default(),
        )));
        let state = ScreamWorkerState {
            framing,
            tracker: Arc::new(SourceTracker::new(None, "[test]")),
            timeshift: Arc::clone(&timeshift),
            frame_cursors: HashMap::new(),
            sentinel_buckets: HashMap::new(),
        };
        (state, timeshift)
    }

    fn raw_frame(rate_byte: u8, depth: u8, channels: u8) -> Vec<u8> {
        let mut frame = vec![rate_byte, depth, channels, 0x03, 0x00];
        frame.extend_from_slice(&[0u8; SINK_CHUNK_SIZE_BYTES]);
        frame
    }

    fn peer() -> SocketAddr {
        "10.1.2.3:4010".parse().unwrap()
    }

    #[test]
    fn raw_frame_becomes_packet_with_synthetic_clock() {
        let (mut state, timeshift) = state(Framing::Raw);
        state.handle_datagram(&raw_frame(0x01, 16, 2), peer());
        state.handle_datagram(&raw_frame(0x01, 16, 2), peer());

        let stats = timeshift.stats();
        assert_eq!(stats.global_buffer_size, 2);
        let stream = stats.streams.get("10.1.2.3").expect("tagged by sender ip");
        assert_eq!(stream.total_packets, 2);
        // 1152 bytes of 16-bit stereo = 288 frames per packet.
        assert_eq!(state.frame_cursors["10.1.2.3"], 576);
    }

    #[test]
    fn wrong_size_and_bad_header_are_dropped() {
        let (mut state, timeshift) = state(Framing::Raw);
        state.handle_datagram(&[0u8; 100], peer());
        state.handle_datagram(&raw_frame(0x00, 16, 2), peer()); // mult 0
        state.handle_datagram(&raw_frame(0x01, 12, 2), peer()); // depth 12
        state.handle_datagram(&raw_frame(0x01, 16, 9), peer()); // 9 channels
        assert_eq!(timeshift.stats().global_buffer_size, 0);
    }

    #[test]
    fn per_process_composite_tag() {
        let (mut state, timeshift) = state(Framing::PerProcess);
        let mut frame = Vec::new();
        frame.extend_from_slice(b"firefox.exe                   "); // 30 bytes
        frame.extend_from_slice(&raw_frame(0x01, 16, 2));
        assert_eq!(frame.len(), PER_PROCESS_PACKET_SIZE);
        state.handle_datagram(&frame, peer());

        let stats = timeshift.stats();
        assert_eq!(stats.global_buffer_size, 1);
        // 15-char space-padded IP + trimmed program tag.
        assert!(stats.streams.contains_key("10.1.2.3       firefox.exe"));
    }

    #[test]
    fn sentinel_marks_once_per_bucket() {
        let (mut state, _timeshift) = state(Framing::Raw);
        // 288 frames per packet: the 100 000-tick boundary falls inside
        // packet 348, which must be the only sentinel.
        for _ in 0..400 {
            state.handle_datagram(&raw_frame(0x01, 16, 2), peer());
        }
        assert_eq!(state.sentinel_buckets["10.1.2.3"], 1);
    }
}
