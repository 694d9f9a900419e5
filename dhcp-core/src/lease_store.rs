//! Lease record & store: a human-readable, append-friendly log of leases
//! per interface, with a full-rewrite threshold to bound file growth,
//! plus the DUID persisted alongside it.

use std::collections::HashMap;
use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::duid::Duid;
use crate::error::{DhcpError, Result};
use crate::lease::Lease;
use crate::options::{OptionKey, OptionSpace, OptionStore, OptionValue};

/// Full rewrite happens after this many buffered appends.
pub const REWRITE_THRESHOLD: u32 = 20;

#[derive(Debug, Clone, Default)]
struct InterfaceLeases {
    active: Option<Lease>,
    leases: Vec<Lease>,
}

pub struct LeaseStore {
    path: PathBuf,
    duid: Option<Duid>,
    interfaces: HashMap<String, InterfaceLeases>,
    writes_since_rewrite: u32,
}

impl LeaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            duid: None,
            interfaces: HashMap::new(),
            writes_since_rewrite: 0,
        }
    }

    /// Parse an existing lease file, if any. A missing file is not an
    /// error — the store simply starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self::new(&path);
        if !path.exists() {
            return Ok(store);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| DhcpError::LeaseStore(format!("read {}: {e}", path.display())))?;
        store.parse_into(&text)?;
        info!(path = %path.display(), interfaces = store.interfaces.len(), "loaded lease store");
        Ok(store)
    }

    pub fn duid(&self) -> Option<&Duid> {
        self.duid.as_ref()
    }

    pub fn set_duid(&mut self, duid: Duid) {
        self.duid = Some(duid);
    }

    pub fn active(&self, interface: &str) -> Option<&Lease> {
        self.interfaces.get(interface).and_then(|i| i.active.as_ref())
    }

    /// The ordered fallback list walked when every medium times out.
    pub fn fallback_leases(&self, interface: &str) -> &[Lease] {
        self.interfaces.get(interface).map(|i| i.leases.as_slice()).unwrap_or(&[])
    }

    pub fn set_active(&mut self, interface: &str, lease: Option<Lease>) {
        self.interfaces.entry(interface.to_string()).or_default().active = lease;
    }

    /// Move the current `active` lease (if any) into the tail of
    /// `leases` when it is static, discard it otherwise; mirrors
    /// `bind_lease`'s own handling of the outgoing lease.
    pub fn demote_active(&mut self, interface: &str) {
        let entry = self.interfaces.entry(interface.to_string()).or_default();
        if let Some(old) = entry.active.take() {
            if old.is_static {
                Self::append_unique(&mut entry.leases, old);
            }
        }
    }

    /// Append a lease to the tail of `leases`, honoring the duplicate
    /// policy: remove any existing lease with the same address and the
    /// same `is_static` flag first.
    fn append_unique(leases: &mut Vec<Lease>, lease: Lease) {
        leases.retain(|l| !(l.address == lease.address && l.is_static == lease.is_static));
        leases.push(lease);
    }

    pub fn append_fallback(&mut self, interface: &str, lease: Lease) {
        let entry = self.interfaces.entry(interface.to_string()).or_default();
        Self::append_unique(&mut entry.leases, lease);
    }

    /// Persist the lease just bound/renewed on `interface`. Most calls
    /// append only that interface's current block to the end of the file;
    /// every `REWRITE_THRESHOLD`th call instead does a full rewrite, which
    /// also has the effect of compacting away the stale blocks the
    /// intervening appends left behind. `sync` requests an `fsync` after
    /// the write completes, used for RELEASE and other records that must
    /// survive a crash.
    pub fn commit(&mut self, interface: &str, sync: bool) -> Result<()> {
        self.writes_since_rewrite += 1;
        if self.writes_since_rewrite >= REWRITE_THRESHOLD {
            self.writes_since_rewrite = 0;
            return self.rewrite(sync);
        }
        self.append_record(interface, sync)
    }

    /// Append just `interface`'s current active-lease block to the file
    /// without touching the rest of it. The in-memory model already holds
    /// the deduplicated, authoritative state (`append_unique`), so any
    /// stale blocks this leaves on disk are harmless filler until the
    /// next full `rewrite`.
    fn append_record(&mut self, interface: &str, sync: bool) -> Result<()> {
        let Some(entry) = self.interfaces.get(interface) else {
            return Ok(());
        };
        let Some(ref active) = entry.active else {
            return Ok(());
        };
        let block = render_lease_block("active-lease", interface, active);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DhcpError::LeaseStore(format!("mkdir {}: {e}", parent.display())))?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DhcpError::LeaseStore(format!("open {}: {e}", self.path.display())))?;
        file.write_all(block.as_bytes())
            .map_err(|e| DhcpError::LeaseStore(format!("append {}: {e}", self.path.display())))?;
        if sync {
            file.sync_all()
                .map_err(|e| DhcpError::LeaseStore(format!("fsync {}: {e}", self.path.display())))?;
        }
        debug!(path = %self.path.display(), interface, sync, "lease store appended");
        Ok(())
    }

    /// Force a full rewrite regardless of the write counter. Called at
    /// startup and whenever the caller wants a guaranteed
    /// consistent-on-disk snapshot.
    pub fn rewrite(&mut self, sync: bool) -> Result<()> {
        let text = self.serialize();
        let tmp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DhcpError::LeaseStore(format!("mkdir {}: {e}", parent.display())))?;
            }
        }

        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| DhcpError::LeaseStore(format!("create {}: {e}", tmp_path.display())))?;
        file.write_all(text.as_bytes())
            .map_err(|e| DhcpError::LeaseStore(format!("write {}: {e}", tmp_path.display())))?;
        if sync {
            file.sync_all()
                .map_err(|e| DhcpError::LeaseStore(format!("fsync {}: {e}", tmp_path.display())))?;
        }
        drop(file);

        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| DhcpError::LeaseStore(format!("rename to {}: {e}", self.path.display())))?;

        debug!(path = %self.path.display(), sync, "lease store rewritten");
        Ok(())
    }

    fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(ref duid) = self.duid {
            out.push_str(&format!("default-duid {};\n", duid.to_hex()));
        }

        // Deterministic ordering so tests (and diffs) are stable.
        let mut names: Vec<&String> = self.interfaces.keys().collect();
        names.sort();

        for name in names {
            let iface = &self.interfaces[name];
            for lease in &iface.leases {
                out.push_str(&render_lease_block("lease", name, lease));
            }
            if let Some(ref active) = iface.active {
                out.push_str(&render_lease_block("active-lease", name, active));
            }
        }
        out
    }

    fn parse_into(&mut self, text: &str) -> Result<()> {
        let mut lines = text.lines().peekable();
        while let Some(raw_line) = lines.next() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("default-duid ") {
                let hex = rest.trim_end_matches(';').trim();
                self.duid = Duid::from_hex(hex);
                continue;
            }
            let (kind, opens_block) = if line.starts_with("lease {") {
                ("lease", true)
            } else if line.starts_with("active-lease {") {
                ("active-lease", true)
            } else {
                ("", false)
            };
            if !opens_block {
                continue;
            }

            let mut interface = String::new();
            let mut lease = Lease::new(Ipv4Addr::UNSPECIFIED);

            for body_line in lines.by_ref() {
                let body_line = body_line.trim();
                if body_line == "}" {
                    break;
                }
                parse_lease_field(body_line, &mut interface, &mut lease);
            }

            let entry = self.interfaces.entry(interface).or_default();
            if kind == "active-lease" {
                entry.active = Some(lease);
            } else {
                entry.leases.push(lease);
            }
        }
        Ok(())
    }
}

fn render_lease_block(kind: &str, interface: &str, lease: &Lease) -> String {
    let mut out = String::new();
    out.push_str(&format!("{kind} {{\n"));
    out.push_str(&format!("  interface {interface};\n"));
    out.push_str(&format!("  fixed-address {};\n", lease.address));
    if let Some(ns) = lease.next_server_address {
        out.push_str(&format!("  next-server {ns};\n"));
    }
    if let Some(ref sn) = lease.server_name {
        out.push_str(&format!("  server-name \"{sn}\";\n"));
    }
    if let Some(ref fname) = lease.filename {
        out.push_str(&format!("  filename \"{fname}\";\n"));
    }
    if let Some(ref medium) = lease.medium {
        out.push_str(&format!("  medium \"{medium}\";\n"));
    }
    if lease.is_static {
        out.push_str("  static;\n");
    }
    if lease.is_bootp {
        out.push_str("  bootp;\n");
    }
    out.push_str(&format!("  renew {};\n", lease.renewal));
    out.push_str(&format!("  rebind {};\n", lease.rebind));
    out.push_str(&format!("  expire {};\n", lease.expiry));
    for (key, value) in lease.options.iter() {
        let space = match key.space {
            OptionSpace::Dhcp => "dhcp",
            OptionSpace::VendorEncapsulated => "vendor",
        };
        let hex = value.to_bytes().iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":");
        out.push_str(&format!("  option {space} {} raw {hex};\n", key.code));
    }
    out.push_str("}\n");
    out
}

fn parse_lease_field(line: &str, interface: &mut String, lease: &mut Lease) {
    let line = line.trim_end_matches(';');
    let Some((key, value)) = line.split_once(' ') else {
        if line == "static" {
            lease.is_static = true;
        } else if line == "bootp" {
            lease.is_bootp = true;
        }
        return;
    };
    let value = value.trim();
    let unquote = |s: &str| s.trim_matches('"').to_string();
    match key {
        "interface" => *interface = value.to_string(),
        "fixed-address" => {
            if let Ok(addr) = value.parse::<Ipv4Addr>() {
                lease.address = addr;
            }
        }
        "next-server" => lease.next_server_address = value.parse().ok(),
        "server-name" => lease.server_name = Some(unquote(value)),
        "filename" => lease.filename = Some(unquote(value)),
        "medium" => lease.medium = Some(unquote(value)),
        "renew" => lease.renewal = value.parse().unwrap_or(0),
        "rebind" => lease.rebind = value.parse().unwrap_or(0),
        "expire" => lease.expiry = value.parse().unwrap_or(0),
        "option" => parse_option_field(value, &mut lease.options),
        _ => warn!(key, "unrecognized lease store field, ignoring"),
    }
}

fn parse_option_field(value: &str, options: &mut OptionStore) {
    // "<space> <code> raw <hex-colon-bytes>"
    let parts: Vec<&str> = value.splitn(4, ' ').collect();
    if parts.len() != 4 || parts[2] != "raw" {
        return;
    }
    let space = match parts[0] {
        "vendor" => OptionSpace::VendorEncapsulated,
        _ => OptionSpace::Dhcp,
    };
    let Ok(code) = parts[1].parse::<u8>() else { return };
    let bytes: Option<Vec<u8>> = parts[3]
        .split(':')
        .map(|b| u8::from_str_radix(b, 16).ok())
        .collect();
    if let Some(bytes) = bytes {
        options.save(OptionKey { space, code }, OptionValue::Raw(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OPT_SUBNET_MASK;
    use tempfile::NamedTempFile;

    fn sample_lease(addr: [u8; 4]) -> Lease {
        let mut lease = Lease::new(Ipv4Addr::from(addr));
        lease.expiry = 1_700_003_600;
        lease.rebind = 1_700_003_000;
        lease.renewal = 1_700_001_800;
        lease.options.save_dhcp(
            OPT_SUBNET_MASK,
            OptionValue::Ipv4(Ipv4Addr::new(255, 255, 255, 0)),
        );
        lease
    }

    #[test]
    fn rewrite_then_reread_round_trips() {
        let tmp = NamedTempFile::new().unwrap();
        let mut store = LeaseStore::new(tmp.path());
        store.set_duid(Duid::generate_ll(1, &[2, 0, 0, 0, 0, 0x0a]));
        store.append_fallback("eth0", sample_lease([192, 0, 2, 50]));
        store.set_active("eth0", Some(sample_lease([192, 0, 2, 51])));
        store.rewrite(false).unwrap();

        let reread = LeaseStore::load(tmp.path()).unwrap();
        assert_eq!(reread.duid(), store.duid());
        assert_eq!(reread.active("eth0").unwrap().address, Ipv4Addr::new(192, 0, 2, 51));
        assert_eq!(reread.fallback_leases("eth0").len(), 1);
        assert_eq!(
            reread.fallback_leases("eth0")[0]
                .options
                .lookup(OptionSpace::Dhcp, OPT_SUBNET_MASK)
                .and_then(|v| v.as_ipv4()),
            Some(Ipv4Addr::new(255, 255, 255, 0))
        );
    }

    #[test]
    fn duplicate_address_and_staticness_is_deduplicated_on_append() {
        let tmp = NamedTempFile::new().unwrap();
        let mut store = LeaseStore::new(tmp.path());

        let mut dynamic = sample_lease([10, 0, 0, 5]);
        dynamic.is_static = false;
        let mut static_lease = sample_lease([10, 0, 0, 5]);
        static_lease.is_static = true;

        store.append_fallback("eth0", dynamic.clone());
        store.append_fallback("eth0", static_lease.clone());
        // Re-append a dynamic lease for the same address: should replace,
        // not duplicate, leaving exactly one dynamic + one static entry.
        store.append_fallback("eth0", dynamic);

        let leases = store.fallback_leases("eth0");
        assert_eq!(leases.len(), 2);
        assert_eq!(leases.iter().filter(|l| l.is_static).count(), 1);
        assert_eq!(leases.iter().filter(|l| !l.is_static).count(), 1);
    }

    #[test]
    fn commit_appends_until_threshold_then_rewrites() {
        let tmp = NamedTempFile::new().unwrap();
        let mut store = LeaseStore::new(tmp.path());
        store.set_active("eth0", Some(sample_lease([192, 0, 2, 60])));

        for _ in 0..REWRITE_THRESHOLD - 1 {
            store.commit("eth0", false).unwrap();
        }
        let text = std::fs::read_to_string(tmp.path()).unwrap();
        // Every pre-threshold commit appends one more block.
        assert_eq!(text.matches("active-lease {").count(), (REWRITE_THRESHOLD - 1) as usize);

        store.commit("eth0", false).unwrap();
        let text = std::fs::read_to_string(tmp.path()).unwrap();
        // The threshold commit compacts back down to a single block.
        assert_eq!(text.matches("active-lease {").count(), 1);
    }

    #[test]
    fn demote_active_preserves_static_leases_at_tail() {
        let tmp = NamedTempFile::new().unwrap();
        let mut store = LeaseStore::new(tmp.path());
        let mut active = sample_lease([10, 0, 0, 9]);
        active.is_static = true;
        store.set_active("eth0", Some(active));

        store.demote_active("eth0");

        assert!(store.active("eth0").is_none());
        assert_eq!(store.fallback_leases("eth0").len(), 1);
        assert!(store.fallback_leases("eth0")[0].is_static);
    }

    #[test]
    fn demote_active_discards_non_static_lease() {
        let tmp = NamedTempFile::new().unwrap();
        let mut store = LeaseStore::new(tmp.path());
        store.set_active("eth0", Some(sample_lease([10, 0, 0, 9])));

        store.demote_active("eth0");

        assert!(store.active("eth0").is_none());
        assert_eq!(store.fallback_leases("eth0").len(), 0);
    }
}
