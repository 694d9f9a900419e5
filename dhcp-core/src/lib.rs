//! `dhcp-core`: the sans-io half of the DHCPv4 client.
//!
//! Everything in this crate is deterministic given its inputs — no clock
//! reads, no sockets, no forked processes except the single, explicit
//! synchronous exception of [`configurator::ConfiguratorRunner`]. The
//! binary that actually runs a client (sockets, the timer wait loop,
//! signal handling, CLI/config parsing) lives in the separate `dhclient`
//! crate, which depends on this one.

pub mod configurator;
pub mod duid;
pub mod error;
pub mod lease;
pub mod lease_store;
pub mod machine;
pub mod options;
pub mod reject;
pub mod retransmit;
pub mod timer;
pub mod validate;
pub mod wire;

pub use error::{DhcpError, Result};
pub use lease::Lease;
pub use lease_store::LeaseStore;
pub use configurator::{ConfiguratorRunner, ProcessConfigurator, Reason};
pub use machine::{Action, Client, ClientConfig, MachineContext, SendDestination, State};
pub use timer::{ClientId, Dispatcher, TimerTag};
pub use wire::{DhcpMessage, HardwareAddress};
