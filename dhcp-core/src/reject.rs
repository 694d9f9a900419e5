//! Reject list (C8 — half of it; the other half is `validate`): per-
//! interface source-address suppression.

use std::net::Ipv4Addr;

use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct RejectList {
    entries: Vec<(Ipv4Addr, Ipv4Addr)>,
}

impl RejectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, address: Ipv4Addr, mask: Ipv4Addr) {
        if !self.entries.contains(&(address, mask)) {
            self.entries.push((address, mask));
        }
    }

    /// Reject a single host outright (mask of all-ones), the common case
    /// when a server issues an unusable lease.
    pub fn add_host(&mut self, address: Ipv4Addr) {
        self.add(address, Ipv4Addr::new(255, 255, 255, 255));
    }

    /// Returns `true` (and logs the matching rule) if `source` matches
    /// any entry.
    pub fn matches(&self, source: Ipv4Addr) -> bool {
        for (addr, mask) in &self.entries {
            let src = u32::from(source) & u32::from(*mask);
            let rule = u32::from(*addr) & u32::from(*mask);
            if src == rule {
                warn!(%source, rule_address = %addr, rule_mask = %mask, "dropping packet: source matches reject list");
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
