//! End-to-end scenario tests driving `dhcp_core::machine::Client` the way
//! the orchestrator does, minus the sockets: a packet or timer tag goes in,
//! the resulting `Action`s and configurator invocations are checked against
//! the behavior a real exchange should produce.
//!
//! `dhclient` itself has no library target, so these can only reach
//! `dhcp_core`'s public API — the orchestrator/config/link glue is covered
//! by the unit tests alongside those modules instead.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dhcp_core::configurator::{ConfiguratorRunner, ExitOutcome, Reason};
use dhcp_core::lease::Lease;
use dhcp_core::lease_store::LeaseStore;
use dhcp_core::machine::{Action, Client, ClientConfig, MachineContext, State};
use dhcp_core::options::{OptionValue, DHCPACK, DHCPNAK, DHCPOFFER, OPT_LEASE_TIME, OPT_MSG_TYPE, OPT_SUBNET_MASK};
use dhcp_core::reject::RejectList;
use dhcp_core::timer::TimerTag;
use dhcp_core::wire::{self, HardwareAddress};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// A `ConfiguratorRunner` test double recording every invocation and its
/// environment, with a per-`Reason` exit outcome override (default: success).
struct ScriptedConfigurator {
    invocations: Vec<(Reason, Vec<(String, String)>)>,
    outcomes: HashMap<Reason, ExitOutcome>,
}

impl ScriptedConfigurator {
    fn new() -> Self {
        Self { invocations: Vec::new(), outcomes: HashMap::new() }
    }

    fn fail_on(mut self, reason: Reason) -> Self {
        self.outcomes.insert(reason, ExitOutcome::Status(1));
        self
    }

    fn env_of(&self, reason: Reason) -> Option<&[(String, String)]> {
        self.invocations.iter().find(|(r, _)| *r == reason).map(|(_, env)| env.as_slice())
    }

    fn var(&self, reason: Reason, name: &str) -> Option<String> {
        self.env_of(reason)?.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }
}

impl ConfiguratorRunner for ScriptedConfigurator {
    fn invoke(&mut self, reason: Reason, env: &[(String, String)]) -> std::io::Result<ExitOutcome> {
        self.invocations.push((reason, env.to_vec()));
        Ok(*self.outcomes.get(&reason).unwrap_or(&ExitOutcome::Status(0)))
    }
}

const MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x0a];

fn scenario_config() -> ClientConfig {
    ClientConfig {
        initial_interval: Duration::from_secs(4),
        backoff_cutoff: Duration::from_secs(64),
        timeout: Duration::from_secs(60),
        reboot_timeout: Duration::from_secs(10),
        select_interval: Duration::from_secs(4),
        retry_interval: Duration::from_secs(300),
        decline_wait_time: Duration::from_secs(10),
        min_lease_write: Duration::from_secs(300),
        required_options: vec![],
        requested_options: vec![(OPT_SUBNET_MASK, "subnet-mask".to_string())],
        media: vec![],
        onetry: false,
    }
}

fn scenario_client() -> Client {
    Client::new(1, "eth0", HardwareAddress::ethernet(MAC), scenario_config())
}

fn scenario_store() -> LeaseStore {
    let n = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    LeaseStore::new(std::env::temp_dir().join(format!("dhclient-scenario-{n}")))
}

fn offer(xid: u32, yiaddr: Ipv4Addr, lease_time: Option<u32>) -> wire::DhcpMessage {
    let mut msg = wire::new_bootrequest(xid, HardwareAddress::ethernet(MAC), 0, false);
    msg.op = 2;
    msg.yiaddr = yiaddr;
    msg.siaddr = Ipv4Addr::new(192, 0, 2, 1);
    msg.options.save_dhcp(OPT_MSG_TYPE, OptionValue::U8(DHCPOFFER));
    msg.options.save_dhcp(OPT_SUBNET_MASK, OptionValue::Ipv4(Ipv4Addr::new(255, 255, 255, 0)));
    if let Some(l) = lease_time {
        msg.options.save_dhcp(OPT_LEASE_TIME, OptionValue::U32(l));
    }
    msg
}

fn ack(xid: u32, yiaddr: Ipv4Addr, lease_time: u32) -> wire::DhcpMessage {
    let mut msg = offer(xid, yiaddr, Some(lease_time));
    msg.options.save_dhcp(OPT_MSG_TYPE, OptionValue::U8(DHCPACK));
    msg
}

fn nak(xid: u32) -> wire::DhcpMessage {
    let mut msg = wire::new_bootrequest(xid, HardwareAddress::ethernet(MAC), 0, false);
    msg.op = 2;
    msg.options.save_dhcp(OPT_MSG_TYPE, OptionValue::U8(DHCPNAK));
    msg
}

const SERVER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

/// S1 — cold boot, one server: DISCOVER/OFFER/REQUEST/ACK against a single
/// responder, lease 600s, T1 should land at roughly 300s ± jitter.
#[test]
fn s1_cold_boot_one_server_binds_and_schedules_renewal() {
    let mut client = scenario_client();
    let mut store = scenario_store();
    let mut rejects = RejectList::new();
    let mut configurator = ScriptedConfigurator::new();
    let mut rng = StdRng::seed_from_u64(42);
    let now = Instant::now();
    let now_epoch = 1_700_000_000u64;

    let discover_actions = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.enter_init(now, &mut ctx, &mut rng)
    };
    assert_eq!(client.state(), State::Selecting);
    assert!(discover_actions.iter().any(|a| matches!(a, Action::Send { destination: dhcp_core::machine::SendDestination::Broadcast, .. })));

    let offer_xid = {
        // The xid is private; recover it the same way the orchestrator
        // would, by reading it back off the DISCOVER we just built.
        match &discover_actions[0] {
            Action::Send { message, .. } => message.xid,
            _ => panic!("expected a DISCOVER send"),
        }
    };

    let offer_msg = offer(offer_xid, Ipv4Addr::new(192, 0, 2, 50), None);
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, offer_msg, now, now_epoch, &mut ctx, &mut rng);
    }

    let request_actions = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_timer(TimerTag::SelectTimeout, now, now_epoch, &mut ctx, &mut rng)
    };
    assert_eq!(client.state(), State::Requesting);
    assert!(request_actions.iter().any(|a| matches!(a, Action::Send { .. })));

    let ack_msg = ack(offer_xid, Ipv4Addr::new(192, 0, 2, 50), 600);
    let bound_actions = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, ack_msg, now, now_epoch, &mut ctx, &mut rng)
    };

    assert_eq!(client.state(), State::Bound);
    assert_eq!(client.active_lease().unwrap().address, Ipv4Addr::new(192, 0, 2, 50));

    assert_eq!(configurator.var(Reason::Bound, "new_ip_address").as_deref(), Some("192.0.2.50"));
    assert_eq!(configurator.var(Reason::Bound, "new_network_number").as_deref(), Some("192.0.2.0"));
    assert_eq!(configurator.var(Reason::Bound, "new_broadcast_address").as_deref(), Some("192.0.2.255"));
    assert_eq!(configurator.var(Reason::Bound, "new_subnet_mask").as_deref(), Some("255.255.255.0"));

    let renewal_delay = match bound_actions.iter().find(|a| matches!(a, Action::Schedule { tag: TimerTag::StateBound, .. })) {
        Some(Action::Schedule { when, .. }) => when.saturating_duration_since(now),
        _ => panic!("expected a StateBound schedule"),
    };
    // T1 defaults to lease/2 + 1 = 301s, jittered into roughly [0.75, 1.25).
    assert!(renewal_delay >= Duration::from_secs(225) && renewal_delay <= Duration::from_secs(380), "renewal_delay = {renewal_delay:?}");
}

/// S2 — NAK during renewal: a NAK while RENEWING tears the lease down
/// (EXPIRE, then PREINIT) and starts a fresh DISCOVER from INIT.
#[test]
fn s2_nak_during_renewal_restarts_from_init() {
    let mut client = scenario_client();
    let mut store = scenario_store();
    let mut rejects = RejectList::new();
    let mut configurator = ScriptedConfigurator::new();
    let mut rng = StdRng::seed_from_u64(9);
    let now = Instant::now();

    // Drive the machine into RENEWING the way `on_state_bound` would, using
    // only public entry points: bind once, then let the StateBound timer fire.
    let offer_xid = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        match client.enter_init(now, &mut ctx, &mut rng).into_iter().find(|a| matches!(a, Action::Send { .. })) {
            Some(Action::Send { message, .. }) => message.xid,
            _ => panic!("expected a DISCOVER send"),
        }
    };
    let offer_msg = offer(offer_xid, Ipv4Addr::new(192, 0, 2, 50), None);
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, offer_msg, now, 1_700_000_000, &mut ctx, &mut rng);
    }
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_timer(TimerTag::SelectTimeout, now, 1_700_000_000, &mut ctx, &mut rng);
    }
    let requesting_xid = offer_xid;
    let bind_ack = ack(requesting_xid, Ipv4Addr::new(192, 0, 2, 50), 600);
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, bind_ack, now, 1_700_000_000, &mut ctx, &mut rng);
    }
    assert_eq!(client.state(), State::Bound);

    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_timer(TimerTag::StateBound, now, 1_700_000_100, &mut ctx, &mut rng);
    }
    assert_eq!(client.state(), State::Renewing);

    let nak_msg = nak(requesting_xid);
    let actions = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, nak_msg, now, 1_700_000_200, &mut ctx, &mut rng)
    };

    assert_eq!(client.state(), State::Selecting);
    assert!(configurator.invocations.iter().any(|(r, _)| *r == Reason::Expire));
    assert_eq!(configurator.var(Reason::Expire, "old_ip_address").as_deref(), Some("192.0.2.50"));
    assert!(configurator.invocations.iter().any(|(r, _)| *r == Reason::Preinit));
    assert!(actions.iter().any(|a| matches!(a, Action::Send { .. })));
}

/// S3 — an ACK with no DHO_DHCP_LEASE_TIME is rejected: the server lands on
/// the reject list, the machine is kicked back toward INIT inside 500ms, and
/// no `new_ip_address` is ever exposed to the configurator.
#[test]
fn s3_missing_lease_time_rejects_server_and_recovers() {
    let mut client = scenario_client();
    let mut store = scenario_store();
    let mut rejects = RejectList::new();
    let mut configurator = ScriptedConfigurator::new();
    let mut rng = StdRng::seed_from_u64(5);
    let now = Instant::now();

    let discover_xid = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        match client.enter_init(now, &mut ctx, &mut rng).into_iter().find(|a| matches!(a, Action::Send { .. })) {
            Some(Action::Send { message, .. }) => message.xid,
            _ => panic!("expected a DISCOVER send"),
        }
    };
    let offer_msg = offer(discover_xid, Ipv4Addr::new(192, 0, 2, 77), None);
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, offer_msg, now, 1_700_000_000, &mut ctx, &mut rng);
    }
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_timer(TimerTag::SelectTimeout, now, 1_700_000_000, &mut ctx, &mut rng);
    }
    assert_eq!(client.state(), State::Requesting);

    let mut bad_ack = wire::new_bootrequest(discover_xid, HardwareAddress::ethernet(MAC), 0, false);
    bad_ack.op = 2;
    bad_ack.siaddr = SERVER;
    bad_ack.yiaddr = Ipv4Addr::new(192, 0, 2, 77);
    bad_ack.options.save_dhcp(OPT_MSG_TYPE, OptionValue::U8(DHCPACK));

    let actions = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, bad_ack, now, 1_700_000_000, &mut ctx, &mut rng)
    };

    assert_eq!(rejects.len(), 1);
    assert!(rejects.matches(SERVER));
    let retry_delay = match actions.as_slice() {
        [Action::Schedule { tag: TimerTag::Retry, when }] => when.saturating_duration_since(now),
        other => panic!("expected exactly one Retry schedule, got {other:?}"),
    };
    assert!(retry_delay <= Duration::from_millis(500));

    // Firing that retry returns the machine to INIT/SELECTING with a fresh
    // DISCOVER, and the configurator never saw `new_ip_address`.
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_timer(TimerTag::Retry, now + retry_delay, 1_700_000_000, &mut ctx, &mut rng);
    }
    assert_eq!(client.state(), State::Selecting);
    assert!(configurator.invocations.iter().all(|(_, env)| !env.iter().any(|(k, _)| k == "new_ip_address")));
}

/// S4 — the configurator itself rejects a bound lease (exit status 1): the
/// machine declines the address, discards the tentative lease, and schedules
/// the return to INIT at `now + decline_wait_time`.
#[test]
fn s4_configurator_rejection_triggers_decline() {
    let mut client = scenario_client();
    let mut store = scenario_store();
    let mut rejects = RejectList::new();
    let mut configurator = ScriptedConfigurator::new().fail_on(Reason::Bound);
    let mut rng = StdRng::seed_from_u64(13);
    let now = Instant::now();

    let discover_xid = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        match client.enter_init(now, &mut ctx, &mut rng).into_iter().find(|a| matches!(a, Action::Send { .. })) {
            Some(Action::Send { message, .. }) => message.xid,
            _ => panic!("expected a DISCOVER send"),
        }
    };
    let offer_msg = offer(discover_xid, Ipv4Addr::new(192, 0, 2, 90), None);
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, offer_msg, now, 1_700_000_000, &mut ctx, &mut rng);
    }
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_timer(TimerTag::SelectTimeout, now, 1_700_000_000, &mut ctx, &mut rng);
    }

    let ack_msg = ack(discover_xid, Ipv4Addr::new(192, 0, 2, 90), 600);
    let actions = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, ack_msg, now, 1_700_000_000, &mut ctx, &mut rng)
    };

    assert_eq!(client.state(), State::Declining);
    assert!(client.active_lease().is_none(), "the declined lease must not become active");
    assert!(actions.iter().any(|a| matches!(a, Action::Send { .. })));
    let decline_delay = match actions.iter().find(|a| matches!(a, Action::Schedule { tag: TimerTag::Decline, .. })) {
        Some(Action::Schedule { when, .. }) => when.saturating_duration_since(now),
        _ => panic!("expected a Decline schedule"),
    };
    assert_eq!(decline_delay, Duration::from_secs(10)); // decline_wait_time_secs in scenario_config
}

/// S5 — no OFFER ever arrives; a static fallback lease for 10.0.0.5 is on
/// file. The Panic walk binds it with `reason=TIMEOUT` and schedules renewal.
#[test]
fn s5_panic_walk_binds_static_fallback() {
    let mut client = scenario_client();
    let mut store = scenario_store();
    let mut rejects = RejectList::new();
    let mut configurator = ScriptedConfigurator::new();
    let mut rng = StdRng::seed_from_u64(21);
    let now = Instant::now();
    let now_epoch = 1_700_000_000u64;

    let mut fallback = Lease::static_fallback(Ipv4Addr::new(10, 0, 0, 5));
    fallback.expiry = now_epoch + 1_000_000_000;
    fallback.rebind = now_epoch + 800;
    fallback.renewal = now_epoch + 500;
    store.append_fallback("eth0", fallback);

    let actions = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_timer(TimerTag::Panic, now, now_epoch, &mut ctx, &mut rng)
    };

    assert_eq!(client.state(), State::Bound);
    assert_eq!(client.active_lease().unwrap().address, Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(configurator.var(Reason::Timeout, "new_ip_address").as_deref(), Some("10.0.0.5"));
    assert!(actions.iter().any(|a| matches!(a, Action::Schedule { tag: TimerTag::StateBound, .. })));
}

/// S6 — process starts with a still-valid saved lease: the machine skips
/// straight to REBOOTING with a fresh xid, broadcasts a REQUEST for the
/// saved address, and on ACK passes `reason=REBOOT`.
#[test]
fn s6_reboot_with_valid_saved_lease() {
    let mut client = scenario_client();
    let mut store = scenario_store();
    let mut rejects = RejectList::new();
    let mut configurator = ScriptedConfigurator::new();
    let mut rng = StdRng::seed_from_u64(3);
    let now = Instant::now();
    let now_epoch = 1_700_000_000u64;

    let mut saved = Lease::new(Ipv4Addr::new(192, 0, 2, 42));
    saved.expiry = now_epoch + 500;
    saved.renewal = now_epoch + 100;
    saved.rebind = now_epoch + 300;

    let reboot_actions = {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.start_reboot(saved, now, now_epoch, &mut ctx, &mut rng)
    };
    assert_eq!(client.state(), State::Rebooting);

    let (reboot_xid, destination) = match &reboot_actions[0] {
        Action::Send { message, destination } => (message.xid, *destination),
        _ => panic!("expected a REQUEST send on reboot"),
    };
    assert!(matches!(destination, dhcp_core::machine::SendDestination::Broadcast));

    let ack_msg = ack(reboot_xid, Ipv4Addr::new(192, 0, 2, 42), 600);
    {
        let mut ctx = MachineContext { configurator: &mut configurator, lease_store: &mut store, reject_list: &mut rejects };
        client.on_message(SERVER, ack_msg, now, now_epoch, &mut ctx, &mut rng);
    }

    assert_eq!(client.state(), State::Bound);
    assert!(configurator.invocations.iter().any(|(r, _)| *r == Reason::Reboot));
    assert_eq!(configurator.var(Reason::Reboot, "new_ip_address").as_deref(), Some("192.0.2.42"));
}
