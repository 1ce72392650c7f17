//! SAP/SDP session discovery.
//!
//! ScreamRouter senders announce their RTP streams over SAP (RFC 2974) with
//! an SDP body. The listener joins the well-known multicast groups, parses
//! announcements into [`StreamProperties`], and files them in a directory
//! keyed by SSRC and by stream endpoint so receivers can resolve formats for
//! incoming packets.

mod directory;
mod listener;
mod parser;
mod types;

pub use directory::{SapDirectory, StreamIdentity};
pub use listener::{SapListener, SapListenerConfig, SessionCallback};
pub use parser::parse_sap_packet;
pub use types::{Endianness, ParsedSapInfo, SapAnnouncement, StreamCodec, StreamProperties};

/// UDP port SAP announcements arrive on.
pub const SAP_PORT: u16 = 9875;

/// Multicast groups joined by the listener.
pub const SAP_MULTICAST_GROUPS: [&str; 2] = ["224.2.127.254", "224.0.0.56"];
