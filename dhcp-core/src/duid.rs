//! DUID: persisted once in the lease store, regenerated only if absent.
//! Used both for the optional RFC 4361 v4 client-id and as the ambient
//! primitive any future v6 work would consume (the v6 sub-machine itself
//! is out of this core's scope).

const DUID_LLT: u16 = 1;
const DUID_LL: u16 = 3;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, used by the
/// DUID-LLT time field per RFC 3315 §9.2.
pub const EPOCH_2000_OFFSET: u64 = 946_684_800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Duid {
    LinkLayer { htype: u16, address: Vec<u8> },
    LinkLayerTime { htype: u16, seconds_since_2000: u32, address: Vec<u8> },
}

impl Duid {
    /// Generate a DUID-LLT from a hardware address and the current wall
    /// clock, per RFC 3315 §9.2. This is the shape the ISC client
    /// generates by default when no DUID is on file.
    pub fn generate_llt(htype: u16, address: &[u8], now_unix_secs: u64) -> Self {
        let seconds_since_2000 = now_unix_secs.saturating_sub(EPOCH_2000_OFFSET) as u32;
        Duid::LinkLayerTime { htype, seconds_since_2000, address: address.to_vec() }
    }

    pub fn generate_ll(htype: u16, address: &[u8]) -> Self {
        Duid::LinkLayer { htype, address: address.to_vec() }
    }

    /// Encode to the byte layout used on the wire / in the lease store's
    /// hex rendering.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Duid::LinkLayerTime { htype, seconds_since_2000, address } => {
                buf.extend_from_slice(&DUID_LLT.to_be_bytes());
                buf.extend_from_slice(&htype.to_be_bytes());
                buf.extend_from_slice(&seconds_since_2000.to_be_bytes());
                buf.extend_from_slice(address);
            }
            Duid::LinkLayer { htype, address } => {
                buf.extend_from_slice(&DUID_LL.to_be_bytes());
                buf.extend_from_slice(&htype.to_be_bytes());
                buf.extend_from_slice(address);
            }
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let kind = u16::from_be_bytes([data[0], data[1]]);
        let htype = u16::from_be_bytes([data[2], data[3]]);
        match kind {
            k if k == DUID_LLT => {
                if data.len() < 8 {
                    return None;
                }
                let seconds_since_2000 = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                Some(Duid::LinkLayerTime { htype, seconds_since_2000, address: data[8..].to_vec() })
            }
            k if k == DUID_LL => Some(Duid::LinkLayer { htype, address: data[4..].to_vec() }),
            _ => None,
        }
    }

    /// Render the way `default-duid <hex>;` is written in the lease file.
    pub fn to_hex(&self) -> String {
        self.to_bytes().iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: Option<Vec<u8>> = s
            .split(':')
            .map(|chunk| u8::from_str_radix(chunk, 16).ok())
            .collect();
        Self::from_bytes(&bytes?)
    }
}
