//! Option store: a keyed collection of option values with scopes.
//!
//! The client never evaluates arbitrary expressions the way the ISC server
//! side does — options are always rendered from concrete packet, lease or
//! config data, so "evaluation" here just means "turn this typed value into
//! wire bytes" rather than materializing against an expression tree.

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Option code constants (RFC 2132), the subset the client cares about.
pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_TIME_OFFSET: u8 = 2;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVER: u8 = 6;
pub const OPT_HOSTNAME: u8 = 12;
pub const OPT_BOOT_FILE_SIZE: u8 = 13;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_ROOT_PATH: u8 = 17;
pub const OPT_BROADCAST_ADDR: u8 = 28;
pub const OPT_NIS_DOMAIN: u8 = 40;
pub const OPT_NETBIOS_SCOPE: u8 = 47;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_OVERLOAD: u8 = 52;
pub const OPT_MSG_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST: u8 = 55;
pub const OPT_MESSAGE: u8 = 56;
pub const OPT_MAX_MSG_SIZE: u8 = 57;
pub const OPT_RENEWAL_TIME: u8 = 58;
pub const OPT_REBINDING_TIME: u8 = 59;
pub const OPT_VENDOR_CLASS: u8 = 60;
pub const OPT_CLIENT_ID: u8 = 61;
pub const OPT_DOMAIN_SEARCH: u8 = 119;
pub const OPT_VENDOR_ENCAPSULATED: u8 = 43;
pub const OPT_END: u8 = 255;

/// DHCP message types (RFC 2131 §3).
pub const DHCPDISCOVER: u8 = 1;
pub const DHCPOFFER: u8 = 2;
pub const DHCPREQUEST: u8 = 3;
pub const DHCPDECLINE: u8 = 4;
pub const DHCPACK: u8 = 5;
pub const DHCPNAK: u8 = 6;
pub const DHCPRELEASE: u8 = 7;
pub const DHCPINFORM: u8 = 8;

/// The configurator-facing name for the subset of option codes this
/// client renders by name rather than by bare code number; environment
/// variable names are derived from these. Codes with no entry here still
/// get exported, just under a numeric `option_<code>` fallback name (see
/// `configurator::lease_environment`).
pub fn option_name(code: u8) -> Option<&'static str> {
    Some(match code {
        OPT_SUBNET_MASK => "subnet-mask",
        OPT_TIME_OFFSET => "time-offset",
        OPT_ROUTER => "routers",
        OPT_DNS_SERVER => "domain-name-servers",
        OPT_HOSTNAME => "host-name",
        OPT_BOOT_FILE_SIZE => "boot-size",
        OPT_DOMAIN_NAME => "domain-name",
        OPT_ROOT_PATH => "root-path",
        OPT_BROADCAST_ADDR => "broadcast-address",
        OPT_NIS_DOMAIN => "nis-domain",
        OPT_NETBIOS_SCOPE => "netbios-scope",
        OPT_DOMAIN_SEARCH => "domain-search",
        OPT_VENDOR_CLASS => "vendor-class-identifier",
        OPT_CLIENT_ID => "dhcp-client-identifier",
        _ => return None,
    })
}

/// An option's universe. The vendor-encapsulated option (43) carries a
/// nested TLV stream in the same shape as the top-level option area;
/// its entries live in their own scope so a code collision between, say,
/// the top-level DOMAIN_NAME and a vendor sub-option of the same number
/// can never overwrite the wrong entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionSpace {
    Dhcp,
    VendorEncapsulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OptionKey {
    pub space: OptionSpace,
    pub code: u8,
}

impl OptionKey {
    pub fn dhcp(code: u8) -> Self {
        Self { space: OptionSpace::Dhcp, code }
    }

    pub fn vendor(code: u8) -> Self {
        Self { space: OptionSpace::VendorEncapsulated, code }
    }
}

/// A materialized option value. List-valued options keep their element
/// order; the store itself keeps insertion order for the option set as a
/// whole (see `OptionStore`), so a list rendered across calls is stable.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Raw(Vec<u8>),
    Ipv4(Ipv4Addr),
    Ipv4List(Vec<Ipv4Addr>),
    U32(u32),
    U16(u16),
    U8(u8),
    Str(String),
    /// An ordered list of single-byte codes — used for the parameter
    /// request list, where order must be preserved end to end.
    CodeList(Vec<u8>),
}

impl OptionValue {
    /// Render to wire bytes. Never fails — the client only ever builds
    /// values it already knows how to serialize; a value that arrived from
    /// the wire as `Raw` round-trips byte for byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            OptionValue::Raw(b) => b.clone(),
            OptionValue::Ipv4(a) => a.octets().to_vec(),
            OptionValue::Ipv4List(list) => {
                list.iter().flat_map(|a| a.octets()).collect()
            }
            OptionValue::U32(v) => v.to_be_bytes().to_vec(),
            OptionValue::U16(v) => v.to_be_bytes().to_vec(),
            OptionValue::U8(v) => vec![*v],
            OptionValue::Str(s) => s.as_bytes().to_vec(),
            OptionValue::CodeList(codes) => codes.clone(),
        }
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            OptionValue::Ipv4(a) => Some(*a),
            OptionValue::Raw(b) if b.len() == 4 => Some(Ipv4Addr::new(b[0], b[1], b[2], b[3])),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            OptionValue::U32(v) => Some(*v),
            OptionValue::Raw(b) if b.len() == 4 => {
                Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            OptionValue::U8(v) => Some(*v),
            OptionValue::Raw(b) => b.first().copied(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        match self {
            OptionValue::Str(s) => Some(s.clone()),
            OptionValue::Raw(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        }
    }

    pub fn as_code_list(&self) -> Option<&[u8]> {
        match self {
            OptionValue::CodeList(v) => Some(v),
            OptionValue::Raw(b) => Some(b),
            _ => None,
        }
    }

    /// Human-readable rendering for the configurator environment (spec
    /// §4.7). Typed values render their natural text form; raw bytes that
    /// happen to be valid UTF-8 (e.g. a domain name decoded straight off
    /// the wire) render as text, otherwise as colon-separated hex — never
    /// `None`, so every option can still be exported under some form.
    pub fn display_text(&self) -> String {
        match self {
            OptionValue::Ipv4(a) => a.to_string(),
            OptionValue::Ipv4List(list) => list.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" "),
            OptionValue::U32(v) => v.to_string(),
            OptionValue::U16(v) => v.to_string(),
            OptionValue::U8(v) => v.to_string(),
            OptionValue::Str(s) => s.clone(),
            OptionValue::CodeList(codes) => codes.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(" "),
            OptionValue::Raw(bytes) => std::str::from_utf8(bytes)
                .ok()
                .map(|s| s.to_string())
                .unwrap_or_else(|| bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")),
        }
    }
}

/// Keyed collection of option values. Backed by an insertion-ordered
/// vector rather than a bare `HashMap` so that list-valued options (and,
/// incidentally, the option set as rendered into an outbound packet)
/// preserve the order they were written in.
#[derive(Debug, Clone, Default)]
pub struct OptionStore {
    order: Vec<OptionKey>,
    values: HashMap<OptionKey, OptionValue>,
}

impl OptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, space: OptionSpace, code: u8) -> Option<&OptionValue> {
        self.values.get(&OptionKey { space, code })
    }

    /// Insert or overwrite. Duplicate keys within a scope overwrite the
    /// prior value in place; the key keeps its original position in
    /// `order` so iteration order is stable across repeated saves.
    pub fn save(&mut self, key: OptionKey, value: OptionValue) {
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value);
    }

    pub fn save_dhcp(&mut self, code: u8, value: OptionValue) {
        self.save(OptionKey::dhcp(code), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OptionKey, &OptionValue)> {
        self.order.iter().map(move |k| (k, self.values.get(k).expect("order/values desync")))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Parameter request list, in the order the caller built it.
    pub fn parameter_request_list(&self) -> Vec<u8> {
        self.lookup(OptionSpace::Dhcp, OPT_PARAM_REQUEST)
            .and_then(|v| v.as_code_list())
            .map(|s| s.to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_save_overwrites_in_place() {
        let mut store = OptionStore::new();
        store.save_dhcp(OPT_LEASE_TIME, OptionValue::U32(100));
        store.save_dhcp(OPT_SUBNET_MASK, OptionValue::Ipv4(Ipv4Addr::new(255, 255, 255, 0)));
        store.save_dhcp(OPT_LEASE_TIME, OptionValue::U32(200));

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.lookup(OptionSpace::Dhcp, OPT_LEASE_TIME).and_then(|v| v.as_u32()),
            Some(200)
        );
        let codes: Vec<u8> = store.iter().map(|(k, _)| k.code).collect();
        assert_eq!(codes, vec![OPT_LEASE_TIME, OPT_SUBNET_MASK]);
    }

    #[test]
    fn vendor_space_is_disjoint_from_dhcp_space() {
        let mut store = OptionStore::new();
        store.save_dhcp(1, OptionValue::U8(9));
        store.save(OptionKey::vendor(1), OptionValue::U8(42));

        assert_eq!(store.lookup(OptionSpace::Dhcp, 1).and_then(|v| v.as_u8()), Some(9));
        assert_eq!(
            store.lookup(OptionSpace::VendorEncapsulated, 1).and_then(|v| v.as_u8()),
            Some(42)
        );
    }

    #[test]
    fn display_text_renders_typed_values_and_falls_back_to_hex() {
        assert_eq!(OptionValue::Ipv4(Ipv4Addr::new(192, 0, 2, 1)).display_text(), "192.0.2.1");
        assert_eq!(OptionValue::U32(600).display_text(), "600");
        assert_eq!(OptionValue::Raw(vec![0xff, 0xfe]).display_text(), "ff:fe");
        assert_eq!(OptionValue::Raw(b"lan".to_vec()).display_text(), "lan");
    }

    #[test]
    fn option_name_covers_common_codes_and_falls_back_to_none() {
        assert_eq!(option_name(OPT_ROUTER), Some("routers"));
        assert_eq!(option_name(OPT_DOMAIN_NAME), Some("domain-name"));
        assert_eq!(option_name(250), None);
    }

    #[test]
    fn param_request_list_preserves_order() {
        let mut store = OptionStore::new();
        store.save_dhcp(
            OPT_PARAM_REQUEST,
            OptionValue::CodeList(vec![OPT_SUBNET_MASK, OPT_ROUTER, OPT_DOMAIN_NAME]),
        );
        assert_eq!(
            store.parameter_request_list(),
            vec![OPT_SUBNET_MASK, OPT_ROUTER, OPT_DOMAIN_NAME]
        );
    }
}
