//! Top-level orchestrator: builds one `dhcp_core::machine::Client` per
//! managed interface, runs the startup sequence, and drives the single
//! cooperative event loop that feeds timers and incoming packets to each
//! client. Everything that touches a clock or a socket lives here;
//! `dhcp_core` itself stays sans-io.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use dhcp_core::configurator::{ConfiguratorRunner, ProcessConfigurator, Reason};
use dhcp_core::duid::Duid;
use dhcp_core::lease::Lease;
use dhcp_core::lease_store::LeaseStore;
use dhcp_core::machine::{Action, Client, MachineContext, State};
use dhcp_core::reject::RejectList;
use dhcp_core::timer::{ClientId, Dispatcher, TimerTag};
use dhcp_core::wire::{self, DhcpMessage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{self, ClientConfig as FileConfig, RunMode};
use crate::link::{IncomingDatagram, InterfaceSource, SysfsInterfaceSource, UdpLinkIo};

struct Interface {
    client: Client,
    link: UdpLinkIo,
    reject_list: RejectList,
}

/// The orchestrator owns everything a runtime needs: no process-wide
/// globals, just fields of one value that a test harness could construct
/// more than one of.
pub struct Orchestrator {
    interfaces: HashMap<ClientId, Interface>,
    /// Per-client choice of how to start, resolved the first time its
    /// `TimerTag::Start` kick fires: `Some(lease)` enters REBOOTING,
    /// `None` enters INIT from scratch.
    pending_start: HashMap<ClientId, Option<Lease>>,
    dispatcher: Dispatcher,
    lease_store: LeaseStore,
    configurator: ProcessConfigurator,
    rng: StdRng,
    incoming_rx: mpsc::Receiver<IncomingDatagram>,
    /// Set when the process should exit after every interface reaches a
    /// terminal state once ("one-try-then-exit"), rather than running the
    /// renewal loop forever.
    onetry: bool,
    /// `config.lease_id_format`: which `chrono` rendering this process
    /// uses for the human-readable lease times in its own log lines.
    lease_id_format: String,
}

impl Orchestrator {
    /// The startup sequence: load config and stored leases,
    /// establish a DUID if one isn't on file, rewrite the store, discover
    /// interfaces, call the configurator with `PREINIT` per interface (or
    /// `NBI` if none were found), seed the PRNG, and schedule each
    /// interface's first `state_reboot`/`state_init` kick.
    pub async fn start(config: &FileConfig, onetry: bool) -> Result<Self> {
        let mut lease_store =
            LeaseStore::load(&config.lease_file).with_context(|| format!("loading lease store {}", config.lease_file))?;

        let discovered = SysfsInterfaceSource.discover();
        let mut configurator = ProcessConfigurator::new(&config.script);

        if discovered.is_empty() {
            warn!("no usable interfaces found");
            let _ = configurator.invoke(Reason::Nbi, &[]);
        }

        if lease_store.duid().is_none() {
            if let Some(first) = discovered.first() {
                let now_epoch = unix_now();
                let duid = Duid::generate_llt(first.hardware.htype as u16, &first.hardware.address, now_epoch);
                lease_store.set_duid(duid);
            }
        }
        lease_store.rewrite(false).context("rewriting lease store at startup")?;

        let seed = discovered
            .first()
            .map(|i| i.hardware.address.iter().fold(0u64, |acc, b| acc.wrapping_mul(257).wrapping_add(*b as u64)))
            .unwrap_or(0)
            .wrapping_add(unix_now());
        let mut rng = StdRng::seed_from_u64(seed);

        let (incoming_tx, incoming_rx) = mpsc::channel(64);

        let mut interfaces = HashMap::new();
        let mut pending_start = HashMap::new();
        let mut dispatcher = Dispatcher::new();
        let now = Instant::now();

        for (idx, settings) in config.interfaces.iter().enumerate() {
            let Some(info) = discovered.iter().find(|i| i.name == settings.name) else {
                warn!(interface = %settings.name, "configured interface not found, skipping");
                continue;
            };

            let client_id: ClientId = idx as ClientId + 1;
            let machine_config = config::build_machine_config(config, settings, onetry);
            let client = Client::new(client_id, settings.name.as_str(), info.hardware.clone(), machine_config);

            let mut reject_list = RejectList::new();
            for (addr, mask) in config.reject_rules() {
                reject_list.add(addr, mask);
            }

            let _ = configurator.invoke(
                Reason::Preinit,
                &[("interface".to_string(), settings.name.clone())],
            );

            let link = UdpLinkIo::bind(&settings.name)
                .with_context(|| format!("binding client socket on {}", settings.name))?;
            link.spawn_reader(client_id, incoming_tx.clone());

            let now_epoch = unix_now();
            let saved = lease_store.active(&settings.name).cloned().filter(|l| !l.is_expired(now_epoch));
            pending_start.insert(client_id, saved);

            let jitter = if config.initial_delay_secs > 0 {
                Duration::from_secs(rng.random_range(0..=config.initial_delay_secs))
            } else {
                Duration::ZERO
            };
            dispatcher.schedule_replacing(client_id, TimerTag::Start, now + jitter);

            interfaces.insert(client_id, Interface { client, link, reject_list });
        }

        Ok(Self {
            interfaces,
            pending_start,
            dispatcher,
            lease_store,
            configurator,
            rng,
            incoming_rx,
            onetry,
            lease_id_format: config.lease_id_format.clone(),
        })
    }

    /// The cooperative dispatch loop: sleep until the next timer or an
    /// incoming datagram, handle exactly one event, repeat.
    /// In one-try mode, returns as soon as every managed interface has
    /// reached a terminal state (`BOUND` or `STOPPED`); otherwise runs
    /// until the process is killed.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let deadline = self.dispatcher.next_deadline();
            tokio::select! {
                _ = sleep_until_deadline(deadline) => {
                    let now = Instant::now();
                    while let Some((client_id, tag)) = self.dispatcher.pop_ready(now) {
                        self.fire_timer(client_id, tag, now).await;
                    }
                }
                Some(datagram) = self.incoming_rx.recv() => {
                    self.handle_datagram(datagram).await;
                }
            }

            if let Some(result) = self.onetry_outcome() {
                return result;
            }
        }
    }

    /// `None` while one-try mode hasn't settled yet, or when running as a
    /// daemon. Once settled: `Some(Ok(()))` if every interface bound,
    /// `Some(Err(_))` if any gave up without a lease (the historic "exit
    /// with status 2" case, simplified here to a process-level error
    /// rather than a specific exit code).
    fn onetry_outcome(&self) -> Option<Result<()>> {
        if !self.onetry || self.interfaces.is_empty() {
            return None;
        }
        let all_terminal = self.interfaces.values().all(|i| matches!(i.client.state(), State::Bound | State::Stopped));
        if !all_terminal {
            return None;
        }
        if self.interfaces.values().all(|i| i.client.state() == State::Bound) {
            Some(Ok(()))
        } else {
            Some(Err(anyhow!("one-try mode: one or more interfaces failed to obtain a lease")))
        }
    }

    /// The machine's own calls into the configurator bridge are
    /// synchronous forks/execs, the one deliberate blocking exception in
    /// this loop; `block_in_place` keeps that from starving the rest of
    /// the runtime's worker threads while it runs.
    async fn fire_timer(&mut self, client_id: ClientId, tag: TimerTag, now: Instant) {
        let now_epoch = unix_now();
        let Some(iface) = self.interfaces.get_mut(&client_id) else { return };

        let actions = if tag == TimerTag::Start {
            let saved = self.pending_start.remove(&client_id).flatten();
            if let Some(ref lease) = saved {
                info!(interface = iface.client.interface(), address = %lease.address, "rebooting with saved lease");
            }
            let rng = &mut self.rng;
            let configurator = &mut self.configurator;
            let lease_store = &mut self.lease_store;
            tokio::task::block_in_place(move || {
                let mut ctx = MachineContext { configurator, lease_store, reject_list: &mut iface.reject_list };
                match saved {
                    Some(lease) => iface.client.start_reboot(lease, now, now_epoch, &mut ctx, rng),
                    None => iface.client.enter_init(now, &mut ctx, rng),
                }
            })
        } else {
            let rng = &mut self.rng;
            let configurator = &mut self.configurator;
            let lease_store = &mut self.lease_store;
            tokio::task::block_in_place(move || {
                let mut ctx = MachineContext { configurator, lease_store, reject_list: &mut iface.reject_list };
                iface.client.on_timer(tag, now, now_epoch, &mut ctx, rng)
            })
        };

        self.apply_actions(client_id, actions).await;
        self.log_if_bound(client_id);
    }

    async fn handle_datagram(&mut self, datagram: IncomingDatagram) {
        let msg = match DhcpMessage::decode(&datagram.bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping unparseable datagram");
                return;
            }
        };
        if !wire::is_reply(msg.op) {
            return;
        }

        let now = Instant::now();
        let now_epoch = unix_now();
        let Some(iface) = self.interfaces.get_mut(&datagram.client_id) else { return };
        let rng = &mut self.rng;
        let configurator = &mut self.configurator;
        let lease_store = &mut self.lease_store;
        let actions = tokio::task::block_in_place(move || {
            let mut ctx = MachineContext { configurator, lease_store, reject_list: &mut iface.reject_list };
            iface.client.on_message(datagram.source, msg, now, now_epoch, &mut ctx, rng)
        });
        self.apply_actions(datagram.client_id, actions).await;
        self.log_if_bound(datagram.client_id);
    }

    /// Logs the human-readable lease expiry once an interface lands in
    /// `BOUND`, in whichever `chrono` rendering `lease_id_format` names.
    fn log_if_bound(&self, client_id: ClientId) {
        let Some(iface) = self.interfaces.get(&client_id) else { return };
        if iface.client.state() != State::Bound {
            return;
        }
        let Some(lease) = iface.client.active_lease() else { return };
        info!(
            interface = iface.client.interface(),
            address = %lease.address,
            expires = %format_epoch(lease.expiry, &self.lease_id_format),
            "lease bound"
        );
    }

    async fn apply_actions(&mut self, client_id: ClientId, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { message, destination } => {
                    if let Some(iface) = self.interfaces.get(&client_id) {
                        if let Err(e) = iface.link.send_packet(&message, destination).await {
                            warn!(client_id, error = %e, "transient link error, relying on retransmission");
                        }
                    }
                }
                Action::Schedule { tag, when } => self.dispatcher.schedule_replacing(client_id, tag, when),
                Action::Cancel { tag } => self.dispatcher.cancel(client_id, tag),
            }
        }
    }

    /// Release mode: for every managed interface, collapse its active
    /// lease's time fields to now, flush it with `fsync`, invoke the
    /// configurator with `RELEASE`, and go quiescent.
    pub async fn release_all(mut self) -> Result<()> {
        let now_epoch = unix_now();
        let client_ids: Vec<ClientId> = self.interfaces.keys().copied().collect();
        for client_id in client_ids {
            let iface = self.interfaces.get_mut(&client_id).expect("client id came from this map");
            let configurator = &mut self.configurator;
            let lease_store = &mut self.lease_store;
            let actions = tokio::task::block_in_place(move || {
                let mut ctx = MachineContext { configurator, lease_store, reject_list: &mut iface.reject_list };
                iface.client.release(now_epoch, &mut ctx)
            });
            self.apply_actions(client_id, actions).await;
        }
        Ok(())
    }

    /// Exit mode: `state_stop` plus a `STOP` configurator call per
    /// interface, no lease mutation.
    pub async fn stop_all(mut self) -> Result<()> {
        let client_ids: Vec<ClientId> = self.interfaces.keys().copied().collect();
        for client_id in client_ids {
            let iface = self.interfaces.get_mut(&client_id).expect("client id came from this map");
            let configurator = &mut self.configurator;
            let lease_store = &mut self.lease_store;
            let actions = tokio::task::block_in_place(move || {
                let mut ctx = MachineContext { configurator, lease_store, reject_list: &mut iface.reject_list };
                iface.client.stop(&mut ctx)
            });
            self.apply_actions(client_id, actions).await;
        }
        Ok(())
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant.into()).await,
        None => std::future::pending().await,
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Renders a lease epoch for log lines. `"legacy"` matches classic
/// dhclient's `ctime`-style log output (`Mon Jan  1 00:00:00 2024`);
/// anything else renders RFC 3339, which is easier to grep/sort.
fn format_epoch(epoch: u64, format: &str) -> String {
    let Some(dt) = chrono::DateTime::from_timestamp(epoch as i64, 0) else {
        return epoch.to_string();
    };
    if format == "legacy" {
        dt.format("%a %b %e %H:%M:%S %Y").to_string()
    } else {
        dt.to_rfc3339()
    }
}

/// Run the orchestrator to completion for the given mode: daemon stays
/// resident in `run()`, one-try performs the same startup but inherits
/// `onetry` semantics from `machine::ClientConfig` (the panic/decline
/// paths exit the process themselves), and release tears every interface
/// down immediately.
pub async fn execute(config: FileConfig, mode: RunMode) -> Result<()> {
    match mode {
        RunMode::Daemon => {
            let orchestrator = Orchestrator::start(&config, false).await?;
            orchestrator.run().await
        }
        RunMode::OneTry => {
            let orchestrator = Orchestrator::start(&config, true).await?;
            orchestrator.run().await
        }
        RunMode::Release => {
            let orchestrator = Orchestrator::start(&config, false).await?;
            orchestrator.release_all().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_now_is_plausible() {
        // A loose sanity bound, not a precision check: catches an epoch
        // computed against the wrong reference point.
        assert!(unix_now() > 1_700_000_000);
    }

    #[test]
    fn format_epoch_switches_on_lease_id_format() {
        let legacy = format_epoch(1_700_000_000, "legacy");
        assert!(legacy.contains("2023"));
        let rfc3339 = format_epoch(1_700_000_000, "iso8601");
        assert_eq!(rfc3339, "2023-11-14T22:13:20+00:00");
    }
}
