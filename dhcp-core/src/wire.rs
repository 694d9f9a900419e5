//! Wire codec: BOOTP header + magic cookie + TLV option stream.
//!
//! Handles the fixed RFC 2131 header, the overloaded `sname`/`file` fields
//! (RFC 2132 option 52), vendor-encapsulated sub-options (option 43) as a
//! nested option space, and truncated-option recovery.

use std::net::Ipv4Addr;

use crate::options::{
    OptionKey, OptionSpace, OptionStore, OptionValue, DHCPACK, DHCPNAK, DHCPOFFER, OPT_END,
    OPT_MSG_TYPE, OPT_OVERLOAD, OPT_PAD, OPT_VENDOR_ENCAPSULATED,
};

/// Packets are padded to at least this many bytes on the wire (RFC 951 / BOOTP).
pub const BOOTP_MIN_LEN: usize = 300;

pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;

const HEADER_LEN: usize = 236; // up to and including `file`
const CHADDR_OFF: usize = 28;
const CHADDR_LEN: usize = 16;
const SNAME_OFF: usize = 44;
const SNAME_LEN: usize = 64;
const FILE_OFF: usize = 108;
const FILE_LEN: usize = 128;

/// A hardware address as it appears on the wire: an ARP hardware type plus
/// the address bytes with any link-layer framing type byte already
/// stripped from `chaddr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareAddress {
    pub htype: u8,
    pub address: Vec<u8>,
}

impl HardwareAddress {
    pub const ETHERNET: u8 = 1;

    pub fn ethernet(mac: [u8; 6]) -> Self {
        Self { htype: Self::ETHERNET, address: mac.to_vec() }
    }
}

/// High-level classification of a decoded incoming packet, used by the
/// state machine's `handle(state, variant)` dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Offer,
    Ack,
    Nak,
    /// A BOOTREPLY with no DHCP message-type option at all.
    Bootp,
    Other(u8),
}

/// A decoded DHCPv4/BOOTP message.
#[derive(Debug, Clone)]
pub struct DhcpMessage {
    pub op: u8,
    pub htype: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub broadcast_flag: bool,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: HardwareAddress,
    /// Present only when `sname` was not given over to option overload,
    /// and the bytes formed a valid C string.
    pub server_name_text: Option<String>,
    pub filename_text: Option<String>,
    pub options: OptionStore,
    /// False if parsing hit a truncated option; the prefix successfully
    /// parsed is kept and this flag is surfaced to the caller.
    pub options_valid: bool,
}

impl DhcpMessage {
    pub fn message_kind(&self) -> MessageKind {
        match self.options.lookup(OptionSpace::Dhcp, OPT_MSG_TYPE).and_then(|v| v.as_u8()) {
            None => MessageKind::Bootp,
            Some(DHCPOFFER) => MessageKind::Offer,
            Some(DHCPACK) => MessageKind::Ack,
            Some(DHCPNAK) => MessageKind::Nak,
            Some(other) => MessageKind::Other(other),
        }
    }

    pub fn is_bootp(&self) -> bool {
        matches!(self.message_kind(), MessageKind::Bootp)
    }

    /// Parse a raw UDP payload into a `DhcpMessage`.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN + 4 {
            return Err(WireError::TooShort(data.len()));
        }
        if data[HEADER_LEN..HEADER_LEN + 4] != MAGIC_COOKIE {
            return Err(WireError::InvalidMagic);
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2] as usize;
        let hops = data[3];
        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);
        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let hlen = hlen.min(CHADDR_LEN);
        let chaddr = HardwareAddress {
            htype,
            address: data[CHADDR_OFF..CHADDR_OFF + hlen].to_vec(),
        };

        let sname_raw = &data[SNAME_OFF..SNAME_OFF + SNAME_LEN];
        let file_raw = &data[FILE_OFF..FILE_OFF + FILE_LEN];

        let opt_area = &data[HEADER_LEN + 4..];
        let (mut options, mut options_valid) = parse_option_tlv(opt_area);

        // RFC 2131 §4.1: overload must be consulted before treating sname/file
        // as text, since it may instead hold more options.
        let overload = options
            .lookup(OptionSpace::Dhcp, OPT_OVERLOAD)
            .and_then(|v| v.as_u8())
            .unwrap_or(0);

        let mut server_name_text = None;
        let mut filename_text = None;

        if overload & 0x2 != 0 {
            let (more, valid) = parse_option_tlv(sname_raw);
            merge_options(&mut options, more);
            options_valid &= valid;
        } else {
            server_name_text = cstr_text(sname_raw);
        }

        if overload & 0x1 != 0 {
            let (more, valid) = parse_option_tlv(file_raw);
            merge_options(&mut options, more);
            options_valid &= valid;
        } else {
            filename_text = cstr_text(file_raw);
        }

        expand_vendor_suboptions(&mut options);

        Ok(DhcpMessage {
            op,
            htype,
            hops,
            xid,
            secs,
            broadcast_flag: flags & 0x8000 != 0,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            server_name_text,
            filename_text,
            options,
            options_valid,
        })
    }

    /// Serialize to wire bytes. `secs` and `broadcast_flag` are taken as
    /// already computed by the caller (§4.1/§4.6 of the retransmission and
    /// state-machine logic own that policy, not the codec).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BOOTP_MIN_LEN);

        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.chaddr.address.len().min(CHADDR_LEN) as u8);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        let flags: u16 = if self.broadcast_flag { 0x8000 } else { 0 };
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());

        let mut chaddr = [0u8; CHADDR_LEN];
        let n = self.chaddr.address.len().min(CHADDR_LEN);
        chaddr[..n].copy_from_slice(&self.chaddr.address[..n]);
        buf.extend_from_slice(&chaddr);

        let mut sname = [0u8; SNAME_LEN];
        if let Some(ref s) = self.server_name_text {
            let n = s.len().min(SNAME_LEN - 1);
            sname[..n].copy_from_slice(&s.as_bytes()[..n]);
        }
        buf.extend_from_slice(&sname);

        let mut file = [0u8; FILE_LEN];
        if let Some(ref s) = self.filename_text {
            let n = s.len().min(FILE_LEN - 1);
            file[..n].copy_from_slice(&s.as_bytes()[..n]);
        }
        buf.extend_from_slice(&file);

        buf.extend_from_slice(&MAGIC_COOKIE);
        buf.extend_from_slice(&encode_option_tlv(&self.options));
        buf.push(OPT_END);

        while buf.len() < BOOTP_MIN_LEN {
            buf.push(OPT_PAD);
        }

        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid magic cookie")]
    InvalidMagic,
}

/// Parse a raw TLV option region. Returns the parsed store and whether
/// parsing ran to a clean END without truncation.
fn parse_option_tlv(data: &[u8]) -> (OptionStore, bool) {
    let mut store = OptionStore::new();
    let mut i = 0;
    while i < data.len() {
        let code = data[i];
        if code == OPT_END {
            return (store, true);
        }
        if code == OPT_PAD {
            i += 1;
            continue;
        }
        i += 1;
        if i >= data.len() {
            return (store, false);
        }
        let len = data[i] as usize;
        i += 1;
        if i + len > data.len() {
            return (store, false);
        }
        store.save_dhcp(code, OptionValue::Raw(data[i..i + len].to_vec()));
        i += len;
    }
    // Ran off the end of the buffer without an END marker; still a clean
    // parse of every option that was present (RFC 2131 doesn't mandate END
    // inside an overloaded field, for instance).
    (store, true)
}

fn encode_option_tlv(options: &OptionStore) -> Vec<u8> {
    let mut buf = Vec::new();
    for (key, value) in options.iter() {
        if key.space != OptionSpace::Dhcp {
            continue;
        }
        if key.code == OPT_VENDOR_ENCAPSULATED {
            continue; // handled separately below, nested.
        }
        let bytes = value.to_bytes();
        for chunk in bytes.chunks(255) {
            buf.push(key.code);
            buf.push(chunk.len() as u8);
            buf.extend_from_slice(chunk);
        }
    }

    let vendor_bytes = encode_vendor_suboptions(options);
    if !vendor_bytes.is_empty() {
        buf.push(OPT_VENDOR_ENCAPSULATED);
        buf.push(vendor_bytes.len().min(255) as u8);
        buf.extend_from_slice(&vendor_bytes[..vendor_bytes.len().min(255)]);
    }

    buf
}

fn encode_vendor_suboptions(options: &OptionStore) -> Vec<u8> {
    let mut buf = Vec::new();
    for (key, value) in options.iter() {
        if key.space != OptionSpace::VendorEncapsulated {
            continue;
        }
        let bytes = value.to_bytes();
        buf.push(key.code);
        buf.push(bytes.len().min(255) as u8);
        buf.extend_from_slice(&bytes[..bytes.len().min(255)]);
    }
    buf
}

fn merge_options(into: &mut OptionStore, from: OptionStore) {
    for (key, value) in from.iter() {
        into.save(key.clone(), value.clone());
    }
}

/// Option 43 carries a nested TLV stream with the same PAD/END shape as
/// the top level. Re-parse it into the vendor-encapsulated space and
/// remove the raw entry so callers see only the expanded form.
fn expand_vendor_suboptions(options: &mut OptionStore) {
    let Some(raw) = options
        .lookup(OptionSpace::Dhcp, OPT_VENDOR_ENCAPSULATED)
        .map(|v| v.to_bytes())
    else {
        return;
    };
    let (nested, _valid) = parse_option_tlv(&raw);
    for (key, value) in nested.iter() {
        options.save(OptionKey::vendor(key.code), value.clone());
    }
}

fn cstr_text(field: &[u8]) -> Option<String> {
    if field.iter().all(|&b| b == 0) {
        return None;
    }
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).ok().map(|s| s.to_string())
}

/// Convenience builders used by `machine`/`configurator` to stamp a fresh
/// outbound request without repeating boilerplate header assembly.
pub fn new_bootrequest(xid: u32, chaddr: HardwareAddress, secs: u16, broadcast: bool) -> DhcpMessage {
    DhcpMessage {
        op: OP_BOOTREQUEST,
        htype: chaddr.htype,
        hops: 0,
        xid,
        secs,
        broadcast_flag: broadcast,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: Ipv4Addr::UNSPECIFIED,
        chaddr,
        server_name_text: None,
        filename_text: None,
        options: OptionStore::new(),
        options_valid: true,
    }
}

pub fn is_reply(op: u8) -> bool {
    op == OP_BOOTREPLY
}
