//! SAP multicast listener thread.
//!
//! Joins the well-known SAP groups, parses every announcement, files it in
//! the [`SapDirectory`], and invites the receiver layer to open a socket for
//! newly announced sessions. Announcements whose session id matches an SSRC
//! this process registered as its own are ignored.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use super::directory::SapDirectory;
use super::{SAP_MULTICAST_GROUPS, SAP_PORT};
use crate::registry::local_ssrc_registry;
use crate::Result;

/// Invoked when an announcement names a session endpoint we may need a
/// socket for: `(stream_ip, port, announcer_ip)`.
pub type SessionCallback = Box<dyn Fn(&str, u16, &str) + Send + Sync>;

/// Listener configuration.
#[derive(Debug, Clone, Default)]
pub struct SapListenerConfig {
    /// Local interface addresses to join the multicast groups on; the
    /// unspecified interface is always joined as well.
    pub known_ips: Vec<Ipv4Addr>,
}

/// Owns the SAP socket and its polling thread.
pub struct SapListener {
    config: SapListenerConfig,
    directory: Arc<SapDirectory>,
    session_callback: Option<Arc<SessionCallback>>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SapListener {
    /// Creates a stopped listener around a shared directory.
    pub fn new(config: SapListenerConfig, directory: Arc<SapDirectory>) -> Self {
        SapListener {
            config,
            directory,
            session_callback: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Installs the dynamic-session callback; call before `start`.
    pub fn set_session_callback(&mut self, callback: SessionCallback) {
        self.session_callback = Some(Arc::new(callback));
    }

    /// Binds the SAP socket and launches the polling thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        info!(port = SAP_PORT, "starting SAP listener");
        let socket = Self::bind_socket(&self.config)?;
        self.stop_flag.store(false, Ordering::SeqCst);

        let stop = Arc::clone(&self.stop_flag);
        let directory = Arc::clone(&self.directory);
        let callback = self.session_callback.clone();
        let handle = std::thread::Builder::new()
            .name("sap-listener".into())
            .spawn(move || run_loop(socket, stop, directory, callback))
            .map_err(std::io::Error::other)?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Signals the thread and joins it.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            info!("stopping SAP listener");
            self.stop_flag.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                warn!("SAP listener thread panicked");
            }
        }
    }

    /// The shared announcement directory.
    pub fn directory(&self) -> &Arc<SapDirectory> {
        &self.directory
    }

    fn bind_socket(config: &SapListenerConfig) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(false)?;
        socket.bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SAP_PORT)).into())?;

        for group in SAP_MULTICAST_GROUPS {
            let group: Ipv4Addr = group.parse().expect("well-known group literal");
            if let Err(err) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
                warn!(%group, %err, "failed to join SAP group on default interface");
            }
            for interface in &config.known_ips {
                if let Err(err) = socket.join_multicast_v4(&group, interface) {
                    debug!(%group, %interface, %err, "failed to join SAP group on interface");
                }
            }
        }

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(Duration::from_millis(250)))?;
        Ok(socket)
    }
}

impl Drop for SapListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    socket: UdpSocket,
    stop: Arc<AtomicBool>,
    directory: Arc<SapDirectory>,
    callback: Option<Arc<SessionCallback>>,
) {
    info!("SAP listener thread started");
    let mut buffer = [0u8; 2048];
    while !stop.load(Ordering::SeqCst) {
        let (len, peer) = match socket.recv_from(&mut buffer) {
            Ok(ok) => ok,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                if !stop.load(Ordering::SeqCst) {
                    warn!(%err, "SAP recv failed, backing off");
                    std::thread::sleep(Duration::from_millis(10));
                }
                continue;
            }
        };

        let info = match super::parser::parse_sap_packet(&buffer[..len]) {
            Ok(info) => info,
            Err(err) => {
                debug!(%err, %peer, "ignoring unparseable SAP packet");
                continue;
            }
        };

        // Our own announcements come back on the multicast group; skip them.
        if local_ssrc_registry().is_local(info.ssrc) {
            debug!(ssrc = info.ssrc, "ignoring self-authored SAP announcement");
            continue;
        }

        let announcer_ip = peer.ip().to_string();
        debug!(
            ssrc = info.ssrc,
            stream_ip = %info.stream_ip,
            port = info.port,
            session = %info.session_name,
            "filed SAP announcement"
        );
        directory.upsert(&info, &announcer_ip);

        if let Some(callback) = &callback {
            callback(&info.stream_ip, info.port, &announcer_ip);
        }
    }
    info!("SAP listener thread finished");
}
