//! Per-interface state machine: the nine-state DHCPv4 client.
//!
//! `Client` is driven by two entry points, `on_message` and `on_timer`,
//! each a total function over `(state, event)` — unhandled combinations
//! are traced no-ops rather than panics. Both return a list of `Action`s
//! for the caller to carry out (send a packet, (re)schedule a timer);
//! the one exception is the configurator invocation, which happens
//! synchronously inline because later logic depends on its exit code.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::configurator::{lease_environment, ConfiguratorRunner, LeasePrefix, Reason};
use crate::lease::{saturating_add, Lease, BOOTP_EXPIRY, BOOTP_REBIND, BOOTP_RENEWAL};
use crate::lease_store::LeaseStore;
use crate::options::{
    OptionSpace, OptionStore, OptionValue, DHCPDECLINE, DHCPDISCOVER, DHCPREQUEST, OPT_LEASE_TIME,
    OPT_MSG_TYPE, OPT_PARAM_REQUEST, OPT_REBINDING_TIME, OPT_RENEWAL_TIME, OPT_REQUESTED_IP,
    OPT_SERVER_ID,
};
use crate::reject::RejectList;
use crate::retransmit::{self, Destination, RetransmitConfig, RetransmitOutcome, RetransmitState};
use crate::timer::{ClientId, TimerTag};
use crate::wire::{self, DhcpMessage, HardwareAddress, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
    Rebooting,
    Stopped,
    Declining,
}

/// An operation deferred because the machine was mid-exchange when it was
/// requested; currently informational only — `release`/`stop` act
/// immediately rather than waiting for `pending` to drain, since neither
/// needs to interrupt an in-flight exchange cleanly in this design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    None,
    Reboot,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDestination {
    Broadcast,
    Unicast(Ipv4Addr),
}

#[derive(Debug, Clone)]
pub enum Action {
    Send { message: DhcpMessage, destination: SendDestination },
    Schedule { tag: TimerTag, when: Instant },
    Cancel { tag: TimerTag },
}

/// Per-client tuning knobs. One of these is built per interface by the
/// caller (typically from a broader on-disk config) and handed to
/// `Client::new`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub initial_interval: Duration,
    pub backoff_cutoff: Duration,
    pub timeout: Duration,
    pub reboot_timeout: Duration,
    pub select_interval: Duration,
    pub retry_interval: Duration,
    pub decline_wait_time: Duration,
    pub min_lease_write: Duration,
    pub required_options: Vec<u8>,
    /// `(code, configurator-facing name)` pairs, in the order they should
    /// appear in the outbound parameter-request list / the `requested_*`
    /// environment variables.
    pub requested_options: Vec<(u8, String)>,
    pub media: Vec<String>,
    /// Run exactly one bind/fail cycle then stop instead of retrying.
    pub onetry: bool,
}

impl ClientConfig {
    fn parameter_request_list(&self) -> Vec<u8> {
        self.requested_options.iter().map(|(code, _)| *code).collect()
    }

    fn requested_option_names(&self) -> Vec<String> {
        self.requested_options.iter().map(|(_, name)| name.clone()).collect()
    }
}

/// The collaborators a `Client` needs but does not own: the configurator
/// child process, the durable lease store, and the per-interface reject
/// list. Bundled so `on_message`/`on_timer` don't carry three separate
/// mutable borrows around.
pub struct MachineContext<'a> {
    pub configurator: &'a mut dyn ConfiguratorRunner,
    pub lease_store: &'a mut LeaseStore,
    pub reject_list: &'a mut RejectList,
}

pub struct Client {
    id: ClientId,
    interface: String,
    hardware: HardwareAddress,
    config: ClientConfig,

    state: State,
    xid: u32,
    retransmit: RetransmitState,
    media: VecDeque<String>,
    offer_received: bool,

    requested_address: Option<Ipv4Addr>,
    server_identifier: Option<Ipv4Addr>,

    active: Option<Lease>,
    new: Option<Lease>,
    alias: Option<Lease>,
    offered_leases: Vec<Lease>,
    pending: PendingOp,
    last_write: Option<Instant>,
}

impl Client {
    pub fn new(id: ClientId, interface: impl Into<String>, hardware: HardwareAddress, config: ClientConfig) -> Self {
        Self {
            id,
            interface: interface.into(),
            hardware,
            config,
            state: State::Init,
            xid: 0,
            retransmit: RetransmitState::start(Instant::now()),
            media: VecDeque::new(),
            offer_received: false,
            requested_address: None,
            server_identifier: None,
            active: None,
            new: None,
            alias: None,
            offered_leases: Vec::new(),
            pending: PendingOp::None,
            last_write: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn active_lease(&self) -> Option<&Lease> {
        self.active.as_ref()
    }

    pub fn set_alias(&mut self, alias: Option<Lease>) {
        self.alias = alias;
    }

    /// Reset the retransmission clock for a fresh exchange. `fresh_media`
    /// is false when re-entering REQUESTING/RENEWING/REBINDING/REBOOTING
    /// from a SELECTING that already received an offer — those states
    /// never walk the media list themselves, they just keep retransmitting
    /// the same request, so `offer_received` must stay `true` to suppress
    /// it (`retransmit::tick` only advances the media queue while
    /// `!offer_received`).
    fn start_exchange(&mut self, now: Instant, fresh_media: bool) {
        self.retransmit = RetransmitState::start(now);
        if fresh_media {
            self.offer_received = false;
            self.media = self.config.media.clone().into();
        }
    }

    fn elapsed_secs(&self, now: Instant) -> u16 {
        now.saturating_duration_since(self.retransmit.first_sending).as_secs().min(65535) as u16
    }

    fn requested_names(&self) -> Vec<String> {
        self.config.requested_option_names()
    }

    // ---- entry points ----------------------------------------------

    /// Start (or restart) the DISCOVER/OFFER exchange from scratch.
    pub fn enter_init(&mut self, now: Instant, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        self.state = State::Init;
        self.xid = fresh_xid(rng);
        self.offered_leases.clear();
        self.requested_address = None;
        self.server_identifier = None;
        self.start_exchange(now, true);
        self.state = State::Selecting;

        let mut actions = self.send_discover(now, ctx, rng);
        actions.push(Action::Schedule { tag: TimerTag::SelectTimeout, when: now + self.config.select_interval });
        actions
    }

    /// Startup path when a non-expired saved lease exists: skip straight
    /// to REBOOTING instead of discovering from nothing.
    pub fn start_reboot(
        &mut self,
        saved: Lease,
        now: Instant,
        now_epoch: u64,
        ctx: &mut MachineContext,
        rng: &mut impl Rng,
    ) -> Vec<Action> {
        self.xid = fresh_xid(rng);
        self.requested_address = Some(saved.address);
        self.server_identifier = None;
        self.active = Some(saved);
        self.state = State::Rebooting;
        self.start_exchange(now, true);
        self.send_request(now, now_epoch, ctx, rng)
    }

    pub fn on_message(
        &mut self,
        source: Ipv4Addr,
        msg: DhcpMessage,
        now: Instant,
        now_epoch: u64,
        ctx: &mut MachineContext,
        rng: &mut impl Rng,
    ) -> Vec<Action> {
        if ctx.reject_list.matches(source) {
            return vec![];
        }
        if msg.xid != self.xid {
            debug!(interface = %self.interface, "dropping packet: xid mismatch");
            return vec![];
        }
        if msg.chaddr.address != self.hardware.address {
            debug!(interface = %self.interface, "dropping packet: chaddr mismatch");
            return vec![];
        }
        if !msg.options_valid {
            warn!(interface = %self.interface, "dropping packet: malformed option stream");
            return vec![];
        }

        let kind = msg.message_kind();
        match (self.state, kind) {
            (State::Selecting, MessageKind::Offer) | (State::Selecting, MessageKind::Bootp) => {
                self.handle_offer(msg)
            }
            (State::Requesting, MessageKind::Ack) | (State::Requesting, MessageKind::Bootp) => {
                self.handle_ack(msg, now, now_epoch, Reason::Bound, ctx, rng)
            }
            (State::Requesting, MessageKind::Nak) => self.handle_expire(now, ctx, rng),
            (State::Rebooting, MessageKind::Ack) | (State::Rebooting, MessageKind::Bootp) => {
                self.handle_ack(msg, now, now_epoch, Reason::Reboot, ctx, rng)
            }
            (State::Rebooting, MessageKind::Nak) => self.enter_init(now, ctx, rng),
            (State::Renewing, MessageKind::Ack) => self.handle_ack(msg, now, now_epoch, Reason::Renew, ctx, rng),
            (State::Renewing, MessageKind::Nak) => self.handle_expire(now, ctx, rng),
            (State::Rebinding, MessageKind::Ack) => self.handle_ack(msg, now, now_epoch, Reason::Rebind, ctx, rng),
            (State::Rebinding, MessageKind::Nak) => self.handle_expire(now, ctx, rng),
            _ => {
                debug!(interface = %self.interface, state = ?self.state, kind = ?kind, "message not handled in this state");
                vec![]
            }
        }
    }

    pub fn on_timer(
        &mut self,
        tag: TimerTag,
        now: Instant,
        now_epoch: u64,
        ctx: &mut MachineContext,
        rng: &mut impl Rng,
    ) -> Vec<Action> {
        match tag {
            TimerTag::SendDiscover => self.send_discover(now, ctx, rng),
            TimerTag::SelectTimeout => self.on_select_timeout(now, now_epoch, ctx, rng),
            TimerTag::SendRequest | TimerTag::RebootTimeout => self.send_request(now, now_epoch, ctx, rng),
            TimerTag::StateBound => self.on_state_bound(now, now_epoch, ctx, rng),
            TimerTag::Panic => self.panic_walk(now, now_epoch, ctx, rng),
            TimerTag::Decline | TimerTag::Retry => self.enter_init(now, ctx, rng),
        }
    }

    /// Collapse the active lease's time fields to now and hand off to the
    /// configurator with `RELEASE`, then go quiescent.
    pub fn release(&mut self, now_epoch: u64, ctx: &mut MachineContext) -> Vec<Action> {
        if let Some(active) = self.active.as_mut() {
            active.expiry = now_epoch;
            active.renewal = now_epoch;
            active.rebind = now_epoch;
            let env = lease_environment(LeasePrefix::Old, active, &[]);
            ctx.lease_store.set_active(&self.interface, Some(active.clone()));
            if let Err(e) = ctx.lease_store.commit(&self.interface, true) {
                warn!(interface = %self.interface, error = %e, "failed to persist released lease");
            }
            let _ = ctx.configurator.invoke(Reason::Release, &env);
        }
        self.state = State::Stopped;
        vec![
            Action::Cancel { tag: TimerTag::StateBound },
            Action::Cancel { tag: TimerTag::SendRequest },
        ]
    }

    pub fn stop(&mut self, ctx: &mut MachineContext) -> Vec<Action> {
        self.state = State::Stopped;
        let _ = ctx.configurator.invoke(Reason::Stop, &[]);
        vec![]
    }

    // ---- SELECTING --------------------------------------------------

    fn handle_offer(&mut self, msg: DhcpMessage) -> Vec<Action> {
        for code in &self.config.required_options {
            if msg.options.lookup(OptionSpace::Dhcp, *code).is_none() {
                debug!(interface = %self.interface, code, "offer missing a required option, ignoring");
                return vec![];
            }
        }
        if self.offered_leases.iter().any(|l| l.address == msg.yiaddr) {
            debug!(interface = %self.interface, address = %msg.yiaddr, "duplicate offer, ignoring");
            return vec![];
        }

        let mut lease = Lease::new(msg.yiaddr);
        lease.next_server_address = (!msg.siaddr.is_unspecified()).then_some(msg.siaddr);
        lease.server_name = msg.server_name_text.clone();
        lease.filename = msg.filename_text.clone();
        lease.is_bootp = msg.is_bootp();
        lease.options = msg.options;
        self.offered_leases.push(lease);
        self.offer_received = true;
        vec![]
    }

    fn on_select_timeout(&mut self, now: Instant, now_epoch: u64, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        if self.state != State::Selecting {
            return vec![];
        }
        if self.offered_leases.is_empty() {
            return self.enter_init(now, ctx, rng);
        }
        // The first entry is already the one to keep: duplicate suppression
        // in `handle_offer` is first-seen-wins, so whichever offer arrived
        // first — including a re-offer of the previously requested address
        // — occupies slot zero.
        let picked = self.offered_leases.remove(0);
        self.offered_leases.clear();

        let mut actions = vec![Action::Cancel { tag: TimerTag::SendDiscover }];
        if picked.is_bootp {
            // A BOOTREPLY with no DHCP message type has no REQUEST/ACK
            // semantics to answer; bind it straight off the offer with
            // synthetic lease times, the way dhclient's state_selecting()
            // does for a plain bootp responder.
            actions.extend(self.bind_bootp_offer(picked, now, now_epoch, ctx, rng));
        } else {
            actions.extend(self.enter_requesting(picked, now, ctx, rng));
        }
        actions
    }

    fn bind_bootp_offer(&mut self, mut picked: Lease, now: Instant, now_epoch: u64, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        picked.renewal = saturating_add(now_epoch, BOOTP_RENEWAL);
        picked.rebind = saturating_add(now_epoch, BOOTP_REBIND);
        picked.expiry = saturating_add(now_epoch, BOOTP_EXPIRY);
        picked.medium = self.media.front().cloned();
        picked.normalize();

        self.new = Some(picked);
        self.bind_lease(Reason::Bound, now, now_epoch, ctx, rng)
    }

    fn enter_requesting(&mut self, picked: Lease, now: Instant, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        self.requested_address = Some(picked.address);
        self.server_identifier = picked
            .options
            .lookup(OptionSpace::Dhcp, OPT_SERVER_ID)
            .and_then(|v| v.as_ipv4())
            .or(picked.next_server_address);
        self.state = State::Requesting;
        self.start_exchange(now, false);
        self.send_request(now, 0, ctx, rng)
    }

    // ---- REQUESTING / RENEWING / REBINDING / REBOOTING --------------

    fn send_discover(&mut self, now: Instant, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        let cfg = RetransmitConfig {
            initial_interval: self.config.initial_interval,
            backoff_cutoff: self.config.backoff_cutoff,
            timeout: self.config.timeout,
        };
        match advance_retransmit(&mut self.retransmit, &mut self.media, self.offer_received, now, &cfg, ctx.configurator, rng) {
            RetransmitOutcome::Panic => {
                // Nothing answered for the whole panic window; SELECTING's
                // own select_interval is normally shorter than this and
                // will already have fired first, but guard against a
                // misconfiguration where it hasn't.
                vec![Action::Schedule { tag: TimerTag::Retry, when: now }]
            }
            RetransmitOutcome::AdvanceMedium(_) => {
                vec![Action::Schedule { tag: TimerTag::SendDiscover, when: now }]
            }
            RetransmitOutcome::Retransmit { next_tick, .. } => {
                let msg = self.build_discover(now);
                vec![
                    Action::Send { message: msg, destination: SendDestination::Broadcast },
                    Action::Schedule { tag: TimerTag::SendDiscover, when: next_tick },
                ]
            }
        }
    }

    fn send_request(&mut self, now: Instant, now_epoch: u64, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        let (timeout, tag) = match self.state {
            State::Rebooting => (self.config.reboot_timeout, TimerTag::RebootTimeout),
            _ => (self.config.timeout, TimerTag::SendRequest),
        };
        let cfg = RetransmitConfig { initial_interval: self.config.initial_interval, backoff_cutoff: self.config.backoff_cutoff, timeout };

        match advance_retransmit(&mut self.retransmit, &mut self.media, self.offer_received, now, &cfg, ctx.configurator, rng) {
            RetransmitOutcome::Panic => self.on_request_panic(now, now_epoch, ctx, rng),
            RetransmitOutcome::AdvanceMedium(_) => vec![Action::Schedule { tag, when: now }],
            RetransmitOutcome::Retransmit { next_tick, .. } => {
                if matches!(self.state, State::Renewing | State::Rebinding) {
                    if let Some(active) = self.active.clone() {
                        if now_epoch >= active.expiry {
                            return self.handle_expire(now, ctx, rng);
                        }
                        if self.state == State::Renewing && now_epoch >= active.rebind {
                            self.state = State::Rebinding;
                        }
                    }
                }
                let destination = self.request_destination(now_epoch);
                let msg = self.build_request(now, destination);
                vec![
                    Action::Send { message: msg, destination },
                    Action::Schedule { tag, when: next_tick },
                ]
            }
        }
    }

    fn on_request_panic(&mut self, now: Instant, now_epoch: u64, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        match self.state {
            State::Requesting => self.panic_walk(now, now_epoch, ctx, rng),
            State::Rebooting => self.enter_init(now, ctx, rng),
            State::Renewing | State::Rebinding => self.handle_expire(now, ctx, rng),
            _ => vec![],
        }
    }

    fn request_destination(&self, now_epoch: u64) -> SendDestination {
        let now_after_rebind = self.active.as_ref().map(|a| now_epoch > a.rebind).unwrap_or(false);
        let is_requesting_or_rebooting = matches!(self.state, State::Requesting | State::Rebooting);
        match retransmit::request_destination(is_requesting_or_rebooting, now_after_rebind) {
            Destination::Broadcast => SendDestination::Broadcast,
            Destination::Unicast => SendDestination::Unicast(self.server_identifier.unwrap_or(Ipv4Addr::UNSPECIFIED)),
        }
    }

    fn handle_ack(
        &mut self,
        msg: DhcpMessage,
        now: Instant,
        now_epoch: u64,
        reason: Reason,
        ctx: &mut MachineContext,
        rng: &mut impl Rng,
    ) -> Vec<Action> {
        let times = if msg.is_bootp() {
            Some((
                saturating_add(now_epoch, BOOTP_RENEWAL),
                saturating_add(now_epoch, BOOTP_REBIND),
                saturating_add(now_epoch, BOOTP_EXPIRY),
            ))
        } else {
            compute_lease_times(&msg.options, now_epoch, rng)
        };

        let Some((renewal, rebind, expiry)) = times else {
            let server = msg
                .options
                .lookup(OptionSpace::Dhcp, OPT_SERVER_ID)
                .and_then(|v| v.as_ipv4())
                .unwrap_or(msg.siaddr);
            warn!(interface = %self.interface, server = %server, "ack carries no usable lease time, rejecting");
            ctx.reject_list.add_host(server);
            return vec![Action::Schedule { tag: TimerTag::Retry, when: now + Duration::from_millis(500) }];
        };

        let mut lease = Lease::new(msg.yiaddr);
        lease.next_server_address = (!msg.siaddr.is_unspecified()).then_some(msg.siaddr);
        lease.server_name = msg.server_name_text.clone();
        lease.filename = msg.filename_text.clone();
        lease.is_bootp = msg.is_bootp();
        lease.medium = self.media.front().cloned();
        lease.options = msg.options;
        lease.renewal = renewal;
        lease.rebind = rebind;
        lease.expiry = expiry;
        lease.normalize();

        self.new = Some(lease);
        self.bind_lease(reason, now, now_epoch, ctx, rng)
    }

    fn bind_lease(&mut self, reason: Reason, now: Instant, now_epoch: u64, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        let Some(new_lease) = self.new.take() else {
            warn!(interface = %self.interface, "bind_lease invoked with no tentative lease");
            return vec![];
        };

        let mut env = Vec::new();
        if let Some(ref old) = self.active {
            env.extend(lease_environment(LeasePrefix::Old, old, &[]));
        }
        if let Some(ref alias) = self.alias {
            env.extend(lease_environment(LeasePrefix::Alias, alias, &[]));
        }
        env.extend(lease_environment(LeasePrefix::New, &new_lease, &self.requested_names()));

        let leaving_tag = match self.state {
            State::Rebooting => Some(TimerTag::RebootTimeout),
            State::Requesting | State::Renewing | State::Rebinding => Some(TimerTag::SendRequest),
            _ => None,
        };

        match ctx.configurator.invoke(reason, &env) {
            Ok(outcome) if outcome.is_success() => {
                info!(interface = %self.interface, address = %new_lease.address, reason = reason.as_str(), "lease bound");

                let should_write = self
                    .last_write
                    .map(|t| now.saturating_duration_since(t) >= self.config.min_lease_write)
                    .unwrap_or(true);
                if should_write {
                    ctx.lease_store.demote_active(&self.interface);
                    ctx.lease_store.set_active(&self.interface, Some(new_lease.clone()));
                    match ctx.lease_store.commit(&self.interface, false) {
                        Ok(()) => self.last_write = Some(now),
                        Err(e) => warn!(interface = %self.interface, error = %e, "failed to persist lease"),
                    }
                }

                let delta = new_lease.renewal.saturating_sub(now_epoch);
                let jitter = Duration::from_micros(rng.random_range(0..1_000));
                self.active = Some(new_lease);
                self.requested_address = None;
                self.state = State::Bound;

                let mut actions = Vec::new();
                if let Some(tag) = leaving_tag {
                    actions.push(Action::Cancel { tag });
                }
                actions.push(Action::Schedule { tag: TimerTag::StateBound, when: now + Duration::from_secs(delta) + jitter });
                actions
            }
            _ => {
                warn!(interface = %self.interface, address = %new_lease.address, "configurator rejected lease, sending decline");
                let decline = self.build_decline(new_lease.address, now);
                let mut actions = vec![Action::Send { message: decline, destination: SendDestination::Broadcast }];
                if let Some(tag) = leaving_tag {
                    actions.push(Action::Cancel { tag });
                }
                if self.config.onetry {
                    self.state = State::Stopped;
                } else {
                    self.state = State::Declining;
                    actions.push(Action::Schedule { tag: TimerTag::Decline, when: now + self.config.decline_wait_time });
                }
                actions
            }
        }
    }

    fn handle_expire(&mut self, now: Instant, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        if let Some(old) = self.active.take() {
            let env = lease_environment(LeasePrefix::Old, &old, &[]);
            let _ = ctx.configurator.invoke(Reason::Expire, &env);
        }
        ctx.lease_store.set_active(&self.interface, None);
        let _ = ctx.configurator.invoke(Reason::Preinit, &[]);

        let mut actions = vec![Action::Cancel { tag: TimerTag::SendRequest }];
        actions.extend(self.enter_init(now, ctx, rng));
        actions
    }

    // ---- BOUND / RENEWING --------------------------------------------

    fn on_state_bound(&mut self, now: Instant, now_epoch: u64, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        if self.state != State::Bound {
            return vec![];
        }
        let Some(active) = self.active.clone() else { return vec![] };

        self.state = State::Renewing;
        self.server_identifier = active
            .options
            .lookup(OptionSpace::Dhcp, OPT_SERVER_ID)
            .and_then(|v| v.as_ipv4())
            .or(active.next_server_address);
        self.requested_address = Some(active.address);
        self.start_exchange(now, false);
        self.send_request(now, now_epoch, ctx, rng)
    }

    // ---- panic / fallback ---------------------------------------------

    fn panic_walk(&mut self, now: Instant, now_epoch: u64, ctx: &mut MachineContext, rng: &mut impl Rng) -> Vec<Action> {
        let candidates: Vec<Lease> = ctx.lease_store.fallback_leases(&self.interface).to_vec();
        for lease in candidates {
            if lease.is_expired(now_epoch) {
                continue;
            }
            let env = lease_environment(LeasePrefix::New, &lease, &[]);
            if matches!(ctx.configurator.invoke(Reason::Timeout, &env), Ok(outcome) if outcome.is_success()) {
                ctx.lease_store.set_active(&self.interface, Some(lease.clone()));
                let _ = ctx.lease_store.commit(&self.interface, false);
                self.active = Some(lease.clone());
                self.state = State::Bound;

                let when = if now_epoch < lease.renewal {
                    now + Duration::from_secs(lease.renewal - now_epoch)
                } else {
                    now
                };
                return vec![Action::Schedule { tag: TimerTag::StateBound, when }];
            }
        }

        let _ = ctx.configurator.invoke(Reason::Fail, &[]);
        if self.config.onetry {
            self.state = State::Stopped;
            return vec![];
        }
        let retry = self.config.retry_interval;
        let jitter = Duration::from_millis(rng.random_range(0..retry.as_millis().max(1) as u64));
        self.state = State::Init;
        vec![Action::Schedule { tag: TimerTag::Retry, when: now + retry / 2 + jitter }]
    }

    // ---- packet builders ------------------------------------------------

    fn build_discover(&self, now: Instant) -> DhcpMessage {
        let secs = self.elapsed_secs(now);
        let mut msg = wire::new_bootrequest(self.xid, self.hardware.clone(), secs, true);
        msg.options.save_dhcp(OPT_MSG_TYPE, OptionValue::U8(DHCPDISCOVER));
        self.attach_parameter_request_list(&mut msg);
        msg
    }

    fn build_request(&self, now: Instant, destination: SendDestination) -> DhcpMessage {
        let secs = self.elapsed_secs(now);
        let broadcast = matches!(destination, SendDestination::Broadcast) && self.active.is_none();
        let mut msg = wire::new_bootrequest(self.xid, self.hardware.clone(), secs, broadcast);
        msg.options.save_dhcp(OPT_MSG_TYPE, OptionValue::U8(DHCPREQUEST));

        match self.state {
            State::Requesting | State::Rebooting => {
                if let Some(addr) = self.requested_address {
                    msg.options.save_dhcp(OPT_REQUESTED_IP, OptionValue::Ipv4(addr));
                }
                if self.state == State::Requesting {
                    if let Some(server) = self.server_identifier {
                        msg.options.save_dhcp(OPT_SERVER_ID, OptionValue::Ipv4(server));
                    }
                }
            }
            State::Renewing | State::Rebinding => {
                if let Some(ref active) = self.active {
                    msg.ciaddr = active.address;
                }
            }
            _ => {}
        }

        self.attach_parameter_request_list(&mut msg);
        msg
    }

    fn build_decline(&self, address: Ipv4Addr, now: Instant) -> DhcpMessage {
        let secs = self.elapsed_secs(now);
        let mut msg = wire::new_bootrequest(self.xid, self.hardware.clone(), secs, true);
        msg.options.save_dhcp(OPT_MSG_TYPE, OptionValue::U8(DHCPDECLINE));
        msg.options.save_dhcp(OPT_REQUESTED_IP, OptionValue::Ipv4(address));
        if let Some(server) = self.server_identifier {
            msg.options.save_dhcp(OPT_SERVER_ID, OptionValue::Ipv4(server));
        }
        msg
    }

    fn attach_parameter_request_list(&self, msg: &mut DhcpMessage) {
        let codes = self.config.parameter_request_list();
        if !codes.is_empty() {
            msg.options.save_dhcp(OPT_PARAM_REQUEST, OptionValue::CodeList(codes));
        }
    }
}

/// Walk the retransmission state machine one tick, invoking the
/// configurator inline for a `MEDIUM` step (kept as part of the regular
/// tick rather than hoisted fully out to state entry — see the Open
/// Questions note on media-walk granularity in DESIGN.md).
fn advance_retransmit(
    state: &mut RetransmitState,
    media: &mut VecDeque<String>,
    offer_received: bool,
    now: Instant,
    cfg: &RetransmitConfig,
    configurator: &mut dyn ConfiguratorRunner,
    rng: &mut impl Rng,
) -> RetransmitOutcome {
    let outcome = retransmit::tick(state, now, cfg, media, offer_received, rng);
    if let RetransmitOutcome::AdvanceMedium(ref medium) = outcome {
        debug!(medium, "advancing media list");
        let _ = configurator.invoke(Reason::Medium, &[("medium".to_string(), medium.clone())]);
    }
    outcome
}

/// The ACK time-field computation: given server-provided lease-time (L),
/// renewal (R) and rebind (B), produce well-ordered absolute
/// renewal/rebind/expiry values, or `None` if the lease must be rejected
/// outright (missing or zero lease time).
fn compute_lease_times(options: &OptionStore, now_epoch: u64, rng: &mut impl Rng) -> Option<(u64, u64, u64)> {
    let lease_time = options.lookup(OptionSpace::Dhcp, OPT_LEASE_TIME).and_then(|v| v.as_u32());
    let l = match lease_time {
        None | Some(0) => return None,
        Some(l) => l as u64,
    };

    let mut r = options
        .lookup(OptionSpace::Dhcp, OPT_RENEWAL_TIME)
        .and_then(|v| v.as_u32())
        .map(|v| v as u64)
        .unwrap_or(l / 2 + 1);

    // Multiplicative jitter into roughly [0.75R, 1.25R).
    let rand_mod_r = if r == 0 { 0 } else { rng.random_range(0..r) };
    r = (3 * r + 3) / 4 + (rand_mod_r + 3) / 4;

    let b = options
        .lookup(OptionSpace::Dhcp, OPT_REBINDING_TIME)
        .and_then(|v| v.as_u32())
        .map(|v| v as u64)
        .unwrap_or(l * 7 / 8);

    if r > b {
        r = 3 * b / 4;
    }

    Some((saturating_add(now_epoch, r), saturating_add(now_epoch, b), saturating_add(now_epoch, l)))
}

fn fresh_xid(rng: &mut impl Rng) -> u32 {
    loop {
        let xid: u32 = rng.random();
        if xid != 0 {
            return xid;
        }
    }
}
