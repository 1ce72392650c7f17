//! Directory of active SAP announcements.
//!
//! Announcements are filed by SSRC and by `ip:port` stream endpoint so a
//! receiver can resolve properties either way. Lookups never block on the
//! listener thread; everything sits behind one mutex.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::types::{ParsedSapInfo, SapAnnouncement, StreamProperties};
use crate::Ssrc;

/// Identity of an announced stream, used for source tagging.
#[derive(Debug, Clone, Default)]
pub struct StreamIdentity {
    /// Routing GUID, possibly empty.
    pub guid: String,
    /// Session name, possibly empty.
    pub session_name: String,
    /// Announced stream address.
    pub stream_ip: String,
    /// Announced RTP port.
    pub port: u16,
}

#[derive(Default)]
struct Inner {
    ssrc_to_properties: HashMap<Ssrc, StreamProperties>,
    ssrc_to_identity: HashMap<Ssrc, StreamIdentity>,
    endpoint_to_properties: HashMap<String, StreamProperties>,
    announcements_by_endpoint: HashMap<String, SapAnnouncement>,
}

/// Thread-safe store of everything SAP has told us.
#[derive(Default)]
pub struct SapDirectory {
    inner: Mutex<Inner>,
}

impl SapDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Files (or refreshes) one parsed announcement.
    pub fn upsert(&self, info: &ParsedSapInfo, announcer_ip: &str) {
        let endpoint = make_endpoint_key(&info.stream_ip, info.port);
        let announcement = SapAnnouncement {
            stream_ip: info.stream_ip.clone(),
            announcer_ip: announcer_ip.to_string(),
            port: info.port,
            properties: info.properties.clone(),
            stream_guid: info.stream_guid.clone(),
            target_sink: info.target_sink.clone(),
            target_host: info.target_host.clone(),
            session_name: info.session_name.clone(),
        };
        let identity = StreamIdentity {
            guid: info.stream_guid.clone(),
            session_name: info.session_name.clone(),
            stream_ip: info.stream_ip.clone(),
            port: info.port,
        };

        let mut inner = self.inner.lock();
        inner.ssrc_to_properties.insert(info.ssrc, info.properties.clone());
        inner.ssrc_to_identity.insert(info.ssrc, identity);
        inner
            .endpoint_to_properties
            .insert(endpoint.clone(), info.properties.clone());
        // Also keyed by bare IP so a packet from an unannounced source port
        // still resolves.
        inner
            .endpoint_to_properties
            .insert(info.stream_ip.clone(), info.properties.clone());
        inner.announcements_by_endpoint.insert(endpoint, announcement);
    }

    /// Looks up the properties announced for an SSRC.
    pub fn properties_for_ssrc(&self, ssrc: Ssrc) -> Option<StreamProperties> {
        self.inner.lock().ssrc_to_properties.get(&ssrc).cloned()
    }

    /// Looks up properties by stream endpoint, trying `ip:port` then bare ip.
    pub fn properties_for_endpoint(&self, ip: &str, port: u16) -> Option<StreamProperties> {
        let inner = self.inner.lock();
        inner
            .endpoint_to_properties
            .get(&make_endpoint_key(ip, port))
            .or_else(|| inner.endpoint_to_properties.get(ip))
            .cloned()
    }

    /// Returns the announced identity for an SSRC.
    pub fn identity_for_ssrc(&self, ssrc: Ssrc) -> Option<StreamIdentity> {
        self.inner.lock().ssrc_to_identity.get(&ssrc).cloned()
    }

    /// Returns the announced identity for a stream endpoint.
    pub fn identity_for_endpoint(&self, ip: &str, port: u16) -> Option<StreamIdentity> {
        let inner = self.inner.lock();
        let ann = inner
            .announcements_by_endpoint
            .get(&make_endpoint_key(ip, port))
            .or_else(|| {
                inner
                    .announcements_by_endpoint
                    .values()
                    .find(|a| a.stream_ip == ip)
            })?;
        Some(StreamIdentity {
            guid: ann.stream_guid.clone(),
            session_name: ann.session_name.clone(),
            stream_ip: ann.stream_ip.clone(),
            port: ann.port,
        })
    }

    /// Snapshot of every filed announcement.
    pub fn all_announcements(&self) -> Vec<SapAnnouncement> {
        self.inner
            .lock()
            .announcements_by_endpoint
            .values()
            .cloned()
            .collect()
    }

    /// Drops everything (used on listener restart).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.ssrc_to_properties.clear();
        inner.ssrc_to_identity.clear();
        inner.endpoint_to_properties.clear();
        inner.announcements_by_endpoint.clear();
    }
}

fn make_endpoint_key(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sap::types::StreamCodec;

    fn info(ssrc: u32, ip: &str, port: u16) -> ParsedSapInfo {
        ParsedSapInfo {
            ssrc,
            stream_ip: ip.to_string(),
            port,
            properties: StreamProperties {
                sample_rate: 48000,
                channels: 2,
                bit_depth: 16,
                codec: StreamCodec::Pcm,
                port,
                ..Default::default()
            },
            stream_guid: "guid-1".into(),
            session_name: "desk".into(),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_by_ssrc_and_endpoint() {
        let dir = SapDirectory::new();
        dir.upsert(&info(77, "10.0.0.9", 40002), "10.0.0.9");

        assert!(dir.properties_for_ssrc(77).is_some());
        assert!(dir.properties_for_ssrc(78).is_none());
        assert!(dir.properties_for_endpoint("10.0.0.9", 40002).is_some());
        // Bare-IP fallback for unannounced source ports.
        assert!(dir.properties_for_endpoint("10.0.0.9", 9999).is_some());
        assert!(dir.properties_for_endpoint("10.0.0.8", 40002).is_none());
    }

    #[test]
    fn identity_carries_guid_and_session() {
        let dir = SapDirectory::new();
        dir.upsert(&info(5, "10.1.1.1", 40000), "10.1.1.1");
        let id = dir.identity_for_ssrc(5).unwrap();
        assert_eq!(id.guid, "guid-1");
        assert_eq!(id.session_name, "desk");
        assert_eq!(id.port, 40000);
    }

    #[test]
    fn refresh_replaces_properties() {
        let dir = SapDirectory::new();
        dir.upsert(&info(5, "10.1.1.1", 40000), "10.1.1.1");
        let mut updated = info(5, "10.1.1.1", 40000);
        updated.properties.sample_rate = 44100;
        dir.upsert(&updated, "10.1.1.1");
        assert_eq!(dir.properties_for_ssrc(5).unwrap().sample_rate, 44100);
    }
}
