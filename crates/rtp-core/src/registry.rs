//! Process-local registry of SSRCs this instance transmits with.
//!
//! The SAP listener consults it to drop announcements this process authored
//! (they loop back on the multicast group). One instance per process.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::Ssrc;

static REGISTRY: Lazy<LocalSsrcRegistry> = Lazy::new(LocalSsrcRegistry::default);

/// The process-wide registry.
pub fn local_ssrc_registry() -> &'static LocalSsrcRegistry {
    &REGISTRY
}

/// Set of SSRCs registered as locally originated.
#[derive(Default)]
pub struct LocalSsrcRegistry {
    ssrcs: Mutex<HashSet<Ssrc>>,
}

impl LocalSsrcRegistry {
    /// Registers an SSRC as locally originated.
    pub fn add(&self, ssrc: Ssrc) {
        self.ssrcs.lock().insert(ssrc);
    }

    /// Removes an SSRC (sender shut down).
    pub fn remove(&self, ssrc: Ssrc) {
        self.ssrcs.lock().remove(&ssrc);
    }

    /// True when the SSRC belongs to this process.
    pub fn is_local(&self, ssrc: Ssrc) -> bool {
        self.ssrcs.lock().contains(&ssrc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_query_remove() {
        let registry = local_ssrc_registry();
        registry.add(0xABCD_0001);
        assert!(registry.is_local(0xABCD_0001));
        registry.remove(0xABCD_0001);
        assert!(!registry.is_local(0xABCD_0001));
    }
}
