//! RTP network receiver.
//!
//! One thread polls a set of UDP sockets (the default probing port plus any
//! session ports SAP announces) with `mio`. Datagrams are parsed, filtered
//! by payload type, reordered per SSRC, decoded by the payload handlers and
//! dispatched to the timeshift manager. Stream formats resolve in order:
//! SAP announcement, cached probe result, static payload-type defaults, and
//! finally the statistical format probe for dynamic payload types on the
//! default port.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use screamrouter_rtp_core::buffer::RtpReorderingBuffer;
use screamrouter_rtp_core::payload::{
    canonicalize_payload_type, properties_from_payload_type, DecodedAudio, RtpOpusHandler,
    RtpPayloadHandler, RtpPcmHandler, RtpPcmaHandler, RtpPcmuHandler,
};
use screamrouter_rtp_core::probe::AudioFormatProbe;
use screamrouter_rtp_core::sap::{
    SapDirectory, SapListener, SapListenerConfig, StreamCodec, StreamProperties,
};
use screamrouter_rtp_core::{
    sanitize_tag, RtpHeader, RtpPacketData, Ssrc, DEFAULT_RTP_LISTEN_PORT, PAYLOAD_TYPE_L16_STEREO,
    PAYLOAD_TYPE_OPUS, PAYLOAD_TYPE_PCMA, PAYLOAD_TYPE_PCMU,
};

use crate::timeshift::TimeshiftManager;
use crate::types::{RtpReceiverConfig, TaggedAudioPacket};
use crate::utils::sentinel::SENTINEL_BUCKET_TICKS;
use crate::Result;

use super::{NotificationQueue, SourceTracker};

const WAKER_TOKEN: Token = Token(0);
const FIRST_SOCKET_TOKEN: usize = 1;
const POLL_TIMEOUT: Duration = Duration::from_millis(5);
const RECEIVE_BUFFER_SIZE: usize = 2048;
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(30);

/// The many-socket RTP ingest component.
pub struct RtpReceiver {
    config: RtpReceiverConfig,
    timeshift: Arc<TimeshiftManager>,
    sap_directory: Arc<SapDirectory>,
    sap_listener: Option<SapListener>,
    tracker: Arc<SourceTracker>,
    pending_sessions: Arc<Mutex<Vec<(String, u16)>>>,
    waker: Option<Arc<Waker>>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RtpReceiver {
    /// Creates a stopped receiver.
    pub fn new(
        config: RtpReceiverConfig,
        notifications: Arc<NotificationQueue>,
        timeshift: Arc<TimeshiftManager>,
    ) -> Self {
        let sap_directory = Arc::new(SapDirectory::new());
        let tracker = Arc::new(SourceTracker::new(
            Some(Arc::clone(&notifications)),
            "[RtpReceiver]",
        ));
        RtpReceiver {
            config,
            timeshift,
            sap_directory,
            sap_listener: None,
            tracker,
            pending_sessions: Arc::new(Mutex::new(Vec::new())),
            waker: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// The SAP directory this receiver resolves formats against.
    pub fn sap_directory(&self) -> Arc<SapDirectory> {
        Arc::clone(&self.sap_directory)
    }

    /// Returns the source tags observed since the previous call.
    pub fn take_seen_tags(&self) -> Vec<String> {
        self.tracker.take_seen()
    }

    /// Binds the default socket, starts SAP and launches the poll thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::SeqCst);

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        self.waker = Some(Arc::clone(&waker));

        // SAP announcements open dynamic session sockets through the waker.
        let pending = Arc::clone(&self.pending_sessions);
        let waker_for_sap = Arc::clone(&waker);
        let mut listener = SapListener::new(
            SapListenerConfig {
                known_ips: self.config.known_ips.clone(),
            },
            Arc::clone(&self.sap_directory),
        );
        listener.set_session_callback(Box::new(move |ip, port, _announcer| {
            pending.lock().push((ip.to_string(), port));
            let _ = waker_for_sap.wake();
        }));
        listener.start()?;
        self.sap_listener = Some(listener);

        let listen_port = if self.config.listen_port == 0 {
            DEFAULT_RTP_LISTEN_PORT
        } else {
            self.config.listen_port
        };

        let mut worker = RtpWorker {
            listen_port,
            timeshift: Arc::clone(&self.timeshift),
            sap_directory: Arc::clone(&self.sap_directory),
            pending_sessions: Arc::clone(&self.pending_sessions),
            stop_flag: Arc::clone(&self.stop_flag),
            tracker: Arc::clone(&self.tracker),
            poll,
            sockets: HashMap::new(),
            bound_endpoints: HashSet::new(),
            next_token: FIRST_SOCKET_TOKEN,
            handlers: default_handlers(),
            reorder_buffers: HashMap::new(),
            probes: HashMap::new(),
            detected_formats: HashMap::new(),
            ssrc_last_addr: HashMap::new(),
            source_last_ssrc: HashMap::new(),
            sentinel_buckets: HashMap::new(),
            telemetry_last_log: Instant::now(),
        };
        worker.open_session("0.0.0.0", listen_port)?;
        info!(listen_port, "rtp receiver default socket bound");

        let handle = std::thread::Builder::new()
            .name("rtp-receiver".into())
            .spawn(move || worker.run())
            .map_err(std::io::Error::other)?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stops SAP and the poll thread.
    pub fn stop(&mut self) {
        if let Some(mut listener) = self.sap_listener.take() {
            listener.stop();
        }
        if let Some(handle) = self.thread.take() {
            self.stop_flag.store(true, Ordering::SeqCst);
            if let Some(waker) = &self.waker {
                let _ = waker.wake();
            }
            if handle.join().is_err() {
                error!("rtp receiver thread panicked");
            }
        }
    }
}

impl Drop for RtpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn default_handlers() -> Vec<Box<dyn RtpPayloadHandler>> {
    vec![
        Box::new(RtpPcmHandler),
        Box::new(RtpPcmuHandler),
        Box::new(RtpPcmaHandler),
        Box::<RtpOpusHandler>::default(),
    ]
}

struct RtpWorker {
    listen_port: u16,
    timeshift: Arc<TimeshiftManager>,
    sap_directory: Arc<SapDirectory>,
    pending_sessions: Arc<Mutex<Vec<(String, u16)>>>,
    stop_flag: Arc<AtomicBool>,
    tracker: Arc<SourceTracker>,

    poll: Poll,
    sockets: HashMap<Token, UdpSocket>,
    bound_endpoints: HashSet<u16>,
    next_token: usize,

    handlers: Vec<Box<dyn RtpPayloadHandler>>,
    reorder_buffers: HashMap<Ssrc, RtpReorderingBuffer>,
    probes: HashMap<Ssrc, AudioFormatProbe>,
    detected_formats: HashMap<Ssrc, StreamProperties>,
    ssrc_last_addr: HashMap<Ssrc, SocketAddr>,
    source_last_ssrc: HashMap<String, Ssrc>,
    sentinel_buckets: HashMap<Ssrc, u32>,
    telemetry_last_log: Instant,
}

impl RtpWorker {
    fn run(mut self) {
        info!("rtp receiver loop started");
        let mut events = Events::with_capacity(64);
        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];

        while !self.stop_flag.load(Ordering::SeqCst) {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "poll failed, backing off");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }

            if events.is_empty() {
                // Idle tick: flush anything the reordering buffers released.
                let ssrcs: Vec<Ssrc> = self.reorder_buffers.keys().copied().collect();
                for ssrc in ssrcs {
                    if let Some(addr) = self.ssrc_last_addr.get(&ssrc).copied() {
                        self.drain_ready_packets(ssrc, addr);
                    }
                }
            }

            let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
            for token in tokens {
                if token == WAKER_TOKEN {
                    self.open_pending_sessions();
                    continue;
                }
                self.drain_socket(token, &mut buffer);
            }

            self.maybe_log_telemetry();
        }
        info!("rtp receiver loop exiting");
    }

    fn open_pending_sessions(&mut self) {
        let pending: Vec<(String, u16)> = std::mem::take(&mut *self.pending_sessions.lock());
        for (ip, port) in pending {
            if let Err(err) = self.open_session(&ip, port) {
                warn!(%ip, port, %err, "failed to open dynamic RTP session");
            }
        }
    }

    /// Binds a socket for a session endpoint, joining the group when the
    /// address is multicast. Ports already bound are ignored.
    fn open_session(&mut self, ip: &str, port: u16) -> Result<()> {
        if port == 0 || self.bound_endpoints.contains(&port) {
            return Ok(());
        }
        info!(%ip, port, "opening RTP session socket");

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        // Deep receive buffer: bursts arrive while the scheduler sleeps.
        if let Err(err) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
            debug!(%err, "could not grow socket receive buffer");
        }
        socket.bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;

        if let Ok(addr) = ip.parse::<Ipv4Addr>() {
            if addr.is_multicast() {
                if let Err(err) = socket.join_multicast_v4(&addr, &Ipv4Addr::UNSPECIFIED) {
                    warn!(group = %addr, %err, "failed to join RTP multicast group");
                }
            }
        }

        let std_socket: StdUdpSocket = socket.into();
        let mut mio_socket = UdpSocket::from_std(std_socket);
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut mio_socket, token, Interest::READABLE)?;
        self.sockets.insert(token, mio_socket);
        self.bound_endpoints.insert(port);
        Ok(())
    }

    fn drain_socket(&mut self, token: Token, buffer: &mut [u8]) {
        loop {
            let Some(socket) = self.sockets.get(&token) else {
                return;
            };
            let (len, peer) = match socket.recv_from(buffer) {
                Ok(ok) => ok,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    if !self.stop_flag.load(Ordering::SeqCst) {
                        warn!(%err, "recv_from failed");
                    }
                    return;
                }
            };
            self.handle_datagram(&buffer[..len], peer);
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) {
        let received_time = Instant::now();
        let (header, header_len) = match RtpHeader::parse(datagram) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%peer, %err, "ignoring non-RTP datagram");
                return;
            }
        };

        if !self.supports_payload_type(header.payload_type, header.ssrc) {
            return;
        }

        // SSRC change on a known endpoint clears all per-SSRC state.
        let source_key = format!("{}:{}", peer.ip(), peer.port());
        match self.source_last_ssrc.get(&source_key).copied() {
            None => {
                info!(%source_key, ssrc = format_args!("{:#010x}", header.ssrc), "new RTP source");
                self.source_last_ssrc.insert(source_key, header.ssrc);
            }
            Some(last) if last != header.ssrc => {
                self.handle_ssrc_changed(last, header.ssrc, &source_key);
                self.source_last_ssrc.insert(source_key, header.ssrc);
            }
            Some(_) => {}
        }
        self.ssrc_last_addr.insert(header.ssrc, peer);

        let packet = RtpPacketData::from_datagram(&header, datagram, header_len, received_time, peer);
        self.reorder_buffers
            .entry(header.ssrc)
            .or_insert_with(RtpReorderingBuffer::new)
            .add_packet(packet);

        self.drain_ready_packets(header.ssrc, peer);
    }

    fn handle_ssrc_changed(&mut self, old_ssrc: Ssrc, new_ssrc: Ssrc, source_key: &str) {
        info!(
            %source_key,
            old = format_args!("{old_ssrc:#010x}"),
            new = format_args!("{new_ssrc:#010x}"),
            "SSRC changed, clearing per-SSRC state"
        );
        if let Some(buffer) = self.reorder_buffers.get_mut(&old_ssrc) {
            buffer.reset();
        }
        self.ssrc_last_addr.remove(&old_ssrc);
        self.probes.remove(&old_ssrc);
        self.detected_formats.remove(&old_ssrc);
        self.sentinel_buckets.remove(&old_ssrc);
        for handler in &mut self.handlers {
            handler.on_ssrc_state_cleared(old_ssrc);
        }
    }

    fn supports_payload_type(&mut self, payload_type: u8, ssrc: Ssrc) -> bool {
        let props = self.sap_directory.properties_for_ssrc(ssrc);
        let canonical = canonicalize_payload_type(payload_type, props.as_ref());
        if self.find_handler(canonical).is_some() {
            return true;
        }
        // Unknown dynamic payload types are accepted on the probing port and
        // routed through the PCM handler once the probe resolves a format.
        self.listen_port == DEFAULT_RTP_LISTEN_PORT
            && (96..=127).contains(&payload_type)
            && self.find_handler(PAYLOAD_TYPE_L16_STEREO).is_some()
    }

    fn find_handler(&self, canonical_payload_type: u8) -> Option<usize> {
        self.handlers
            .iter()
            .position(|h| h.supports_payload_type(canonical_payload_type))
    }

    /// Resolves properties and dispatches everything the reordering buffer
    /// released for an SSRC.
    fn drain_ready_packets(&mut self, ssrc: Ssrc, peer: SocketAddr) {
        let Some(buffer) = self.reorder_buffers.get_mut(&ssrc) else {
            return;
        };
        let ready = buffer.ready_packets();
        if ready.is_empty() {
            return;
        }
        if ready.len() > 1 {
            debug!(
                ssrc = format_args!("{ssrc:#010x}"),
                count = ready.len(),
                "processing reordered packet batch"
            );
        }

        let payload_type = ready[0].payload_type;
        let Some(props) = self.resolve_stream_properties(ssrc, peer, payload_type, &ready) else {
            // Probing (or unknown off-port source); nothing dispatches yet.
            return;
        };

        let source_tag = self.source_tag_for(ssrc, peer);
        for packet in &ready {
            self.dispatch_packet(packet, &props, &source_tag);
        }
    }

    fn resolve_stream_properties(
        &mut self,
        ssrc: Ssrc,
        peer: SocketAddr,
        payload_type: u8,
        ready: &[RtpPacketData],
    ) -> Option<StreamProperties> {
        if let Some(props) = self.sap_directory.properties_for_ssrc(ssrc) {
            return Some(props);
        }
        let peer_ip = peer.ip().to_string();
        if let Some(props) = self
            .sap_directory
            .properties_for_endpoint(&peer_ip, peer.port())
        {
            return Some(props);
        }

        // Off the probing port we only play announced streams.
        if self.listen_port != DEFAULT_RTP_LISTEN_PORT {
            debug!(
                ssrc = format_args!("{ssrc:#010x}"),
                "no SAP properties for SSRC, ignoring"
            );
            return None;
        }

        let canonical = canonicalize_payload_type(payload_type, None);
        if let Some(props) = properties_from_payload_type(payload_type, canonical, self.listen_port)
        {
            return Some(props);
        }

        if let Some(props) = self.detected_formats.get(&ssrc) {
            let mut props = props.clone();
            props.port = self.listen_port;
            return Some(props);
        }

        // Statistical probing path: feed bytes, finalize when confident.
        let probe = self.probes.entry(ssrc).or_insert_with(|| {
            info!(
                ssrc = format_args!("{ssrc:#010x}"),
                "starting format auto-detection"
            );
            AudioFormatProbe::new()
        });
        for packet in ready {
            if !packet.payload.is_empty() {
                probe.add_data(&packet.payload, packet.received_time);
            }
        }
        if probe.has_sufficient_data() && probe.finalize_detection() {
            let mut detected = probe.detected_format().clone();
            let confidence = probe.confidence();
            detected.port = self.listen_port;
            detected.payload_type = payload_type as i32;
            info!(
                ssrc = format_args!("{ssrc:#010x}"),
                codec = ?detected.codec,
                sample_rate = detected.sample_rate,
                channels = detected.channels,
                bit_depth = detected.bit_depth,
                confidence,
                "auto-detected stream format"
            );
            self.detected_formats.insert(ssrc, detected.clone());
            self.probes.remove(&ssrc);
            Some(detected)
        } else {
            None
        }
    }

    /// `rtp:<guid>#<ip>.<port>` when SAP supplied a GUID, else the sanitized
    /// session name, else `ip:port`.
    fn source_tag_for(&self, ssrc: Ssrc, peer: SocketAddr) -> String {
        let peer_ip = peer.ip().to_string();
        let identity = self
            .sap_directory
            .identity_for_ssrc(ssrc)
            .or_else(|| self.sap_directory.identity_for_endpoint(&peer_ip, peer.port()));

        if let Some(identity) = identity {
            let ip_part = if identity.stream_ip.is_empty() {
                peer_ip.clone()
            } else {
                identity.stream_ip.clone()
            };
            let port_part = if identity.port > 0 {
                identity.port
            } else {
                peer.port()
            };
            if !identity.guid.is_empty() {
                return format!("rtp:{}#{}.{}", identity.guid, ip_part, port_part);
            }
            let sanitized = sanitize_tag(&identity.session_name);
            if !sanitized.is_empty() {
                return format!("rtp:{sanitized}#{ip_part}.{port_part}");
            }
        }
        format!("{}:{}", peer_ip, peer.port())
    }

    fn dispatch_packet(
        &mut self,
        packet: &RtpPacketData,
        props: &StreamProperties,
        source_tag: &str,
    ) {
        let canonical = canonicalize_payload_type(packet.payload_type, Some(props));
        let handler_index = self.find_handler(canonical).or_else(|| match props.codec {
            StreamCodec::Opus => self.find_handler(PAYLOAD_TYPE_OPUS),
            StreamCodec::Pcm | StreamCodec::Unknown => self.find_handler(PAYLOAD_TYPE_L16_STEREO),
            StreamCodec::Pcmu => self.find_handler(PAYLOAD_TYPE_PCMU),
            StreamCodec::Pcma => self.find_handler(PAYLOAD_TYPE_PCMA),
        });
        let Some(handler_index) = handler_index else {
            warn!(
                payload_type = packet.payload_type,
                ssrc = format_args!("{:#010x}", packet.ssrc),
                "no handler for payload type, dropping packet"
            );
            return;
        };

        let Some(decoded) = self.handlers[handler_index].decode(packet, props) else {
            warn!(
                payload_type = packet.payload_type,
                ssrc = format_args!("{:#010x}", packet.ssrc),
                bytes = packet.payload.len(),
                "payload decode failed, dropping packet"
            );
            return;
        };

        let is_sentinel = self.mark_sentinel_if_boundary(packet);
        self.tracker.register(source_tag);

        let DecodedAudio {
            audio_data,
            sample_rate,
            channels,
            bit_depth,
            chlayout1,
            chlayout2,
        } = decoded;

        let mut ssrcs = Vec::with_capacity(1 + packet.csrcs.len());
        ssrcs.push(packet.ssrc);
        ssrcs.extend_from_slice(&packet.csrcs);

        let tagged = TaggedAudioPacket {
            source_tag: source_tag.to_string(),
            received_time: packet.received_time,
            rtp_timestamp: Some(packet.rtp_timestamp),
            rtp_sequence_number: Some(packet.sequence_number),
            ssrcs,
            sample_rate,
            channels,
            bit_depth,
            chlayout1,
            chlayout2,
            audio_data,
            playback_rate: 1.0,
            ingress_from_loopback: packet.ingress_from_loopback,
            is_sentinel,
        };
        crate::utils::sentinel::log_packet_sentinel("rtp_ready", &tagged);
        self.timeshift.add_packet(tagged);
    }

    /// Marks one packet per 100 000-tick RTP bucket as a sentinel.
    fn mark_sentinel_if_boundary(&mut self, packet: &RtpPacketData) -> bool {
        let bucket = packet.rtp_timestamp / SENTINEL_BUCKET_TICKS;
        match self.sentinel_buckets.get_mut(&packet.ssrc) {
            None => {
                self.sentinel_buckets.insert(packet.ssrc, bucket);
                false
            }
            Some(last) if *last != bucket => {
                *last = bucket;
                true
            }
            Some(_) => false,
        }
    }

    fn maybe_log_telemetry(&mut self) {
        if self.telemetry_last_log.elapsed() < TELEMETRY_INTERVAL {
            return;
        }
        self.telemetry_last_log = Instant::now();
        let total: usize = self.reorder_buffers.values().map(|b| b.len()).sum();
        let max = self.reorder_buffers.values().map(|b| b.len()).max().unwrap_or(0);
        info!(
            reorder_buffers = self.reorder_buffers.len(),
            total_packets = total,
            max_packets = max,
            "rtp receiver telemetry"
        );
    }
}
