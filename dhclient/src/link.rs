//! The link-layer collaborator boundary: interface discovery and the raw
//! UDP socket each client exchange sends and receives on. Neither
//! BPF/AF_PACKET framing nor hardware-address enumeration beyond
//! `/sys/class/net` is in scope; this is the minimal UDP-socket shape that
//! boundary needs to function.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use dhcp_core::machine::SendDestination;
use dhcp_core::timer::ClientId;
use dhcp_core::wire::{DhcpMessage, HardwareAddress};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tracing::warn;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// A raw datagram lifted off the link, tagged with the client it arrived
/// for, reduced to what the orchestrator actually needs once parsing is
/// deferred to `dhcp_core::wire::DhcpMessage::decode`.
pub struct IncomingDatagram {
    pub client_id: ClientId,
    pub source: Ipv4Addr,
    pub bytes: Vec<u8>,
}

/// The link-layer collaborator boundary: a UDP socket bound to 0.0.0.0:68
/// with `SO_BROADCAST`/`SO_REUSEADDR`, following
/// `hr_dhcp::server::run_dhcp_server`'s socket setup (port 67 there, 68
/// here, and binding an interface where the platform supports it). There
/// is exactly one implementation, so this stays a concrete type rather
/// than a trait the orchestrator dispatches through.
pub struct UdpLinkIo {
    socket: Arc<tokio::net::UdpSocket>,
}

impl UdpLinkIo {
    pub fn bind(interface_name: &str) -> std::io::Result<Self> {
        Ok(Self { socket: Arc::new(bind_client_socket(interface_name)?) })
    }

    pub async fn send_packet(&self, message: &DhcpMessage, destination: SendDestination) -> std::io::Result<usize> {
        let addr = match destination {
            SendDestination::Broadcast => SocketAddr::new(Ipv4Addr::BROADCAST.into(), SERVER_PORT),
            SendDestination::Unicast(addr) => SocketAddr::new(addr.into(), SERVER_PORT),
        };
        let bytes = message.encode();
        match self.socket.send_to(&bytes, addr).await {
            Ok(n) => Ok(n),
            Err(e) => {
                warn!(%addr, error = %e, "link send failed, relying on retransmission");
                Err(e)
            }
        }
    }

    /// Spawn the background task that forwards every datagram this
    /// interface receives to the orchestrator's single event loop over
    /// `tx`. One task per interface; the orchestrator itself stays on one
    /// task with no state shared between threads, and these reader tasks
    /// only ever produce input for it, never touch client state
    /// themselves.
    pub fn spawn_reader(&self, client_id: ClientId, tx: mpsc::Sender<IncomingDatagram>) {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        let source = match src.ip() {
                            std::net::IpAddr::V4(v4) => v4,
                            std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                        };
                        let datagram = IncomingDatagram { client_id, source, bytes: buf[..len].to_vec() };
                        if tx.send(datagram).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "link receive failed, continuing");
                    }
                }
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub hardware: HardwareAddress,
    pub is_up: bool,
    pub ipv4: Option<Ipv4Addr>,
}

pub trait InterfaceSource {
    fn discover(&self) -> Vec<InterfaceInfo>;
}

/// Reads `/sys/class/net` the way host-agent tooling elsewhere in this
/// stack enumerates interfaces, then shells out to `ip` for the current
/// IPv4 address (informational only — this client never trusts it as a
/// lease).
pub struct SysfsInterfaceSource;

impl InterfaceSource for SysfsInterfaceSource {
    fn discover(&self) -> Vec<InterfaceInfo> {
        let mut interfaces = Vec::new();
        let entries = match std::fs::read_dir("/sys/class/net") {
            Ok(entries) => entries,
            Err(_) => return interfaces,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "lo" {
                continue;
            }
            let mac = std::fs::read_to_string(format!("/sys/class/net/{}/address", name))
                .unwrap_or_default()
                .trim()
                .to_string();
            let hardware = match parse_mac(&mac) {
                Some(hardware) => hardware,
                None => continue,
            };
            let operstate = std::fs::read_to_string(format!("/sys/class/net/{}/operstate", name))
                .unwrap_or_default()
                .trim()
                .to_string();
            let ipv4 = std::process::Command::new("ip")
                .args(["-4", "-o", "addr", "show", &name])
                .output()
                .ok()
                .and_then(|output| {
                    String::from_utf8_lossy(&output.stdout)
                        .split_whitespace()
                        .find(|token| token.contains('/'))
                        .and_then(|token| token.split('/').next())
                        .and_then(|addr| addr.parse().ok())
                });
            interfaces.push(InterfaceInfo {
                name,
                hardware,
                is_up: operstate == "up",
                ipv4,
            });
        }
        interfaces
    }
}

fn parse_mac(mac: &str) -> Option<HardwareAddress> {
    if mac.is_empty() || mac == "00:00:00:00:00:00" {
        return None;
    }
    let mut bytes = [0u8; 6];
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (index, part) in parts.iter().enumerate() {
        bytes[index] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(HardwareAddress::ethernet(bytes))
}

/// Bind the per-interface UDP socket a client exchange sends DISCOVER/REQUEST
/// on and receives OFFER/ACK/NAK on. Broadcast is enabled because the
/// client has no address until it is bound.
pub fn bind_client_socket(interface_name: &str) -> std::io::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;

    let addr: SocketAddr = "0.0.0.0:68".parse().unwrap();
    socket.bind(&addr.into())?;

    #[cfg(target_os = "linux")]
    socket.bind_device(Some(interface_name.as_bytes()))?;
    #[cfg(not(target_os = "linux"))]
    let _ = interface_name;

    socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(socket.into())
}
