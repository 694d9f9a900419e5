//! Configurator bridge: the environment assembled for, and the contract
//! implemented by, the external program that actually applies a lease to
//! the OS.

use std::net::Ipv4Addr;

use crate::lease::Lease;
use crate::options::{option_name, OptionSpace, OPT_BROADCAST_ADDR, OPT_SUBNET_MASK};
use crate::validate::validate_for_export;

/// The fourteen reasons a configurator invocation can be made for. `Nbi`,
/// `Preinit6`, `Stop6` are kept as variants even though the v6 sub-machine
/// is out of scope; the same external program is expected to understand
/// them regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Preinit,
    Medium,
    Bound,
    Renew,
    Rebind,
    Reboot,
    Expire,
    Fail,
    Release,
    Stop,
    Timeout,
    Nbi,
    Preinit6,
    Stop6,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Preinit => "PREINIT",
            Reason::Medium => "MEDIUM",
            Reason::Bound => "BOUND",
            Reason::Renew => "RENEW",
            Reason::Rebind => "REBIND",
            Reason::Reboot => "REBOOT",
            Reason::Expire => "EXPIRE",
            Reason::Fail => "FAIL",
            Reason::Release => "RELEASE",
            Reason::Stop => "STOP",
            Reason::Timeout => "TIMEOUT",
            Reason::Nbi => "NBI",
            Reason::Preinit6 => "PREINIT6",
            Reason::Stop6 => "STOP6",
        }
    }
}

/// The result of waiting on the configurator child. Positive is an exit
/// status, negative (here, the signal variant) the signal number that
/// killed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Status(i32),
    Signal(i32),
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Status(0))
    }
}

/// Implemented by whatever actually forks/execs the configurator
/// program. Synchronous and blocking by design: this is the one place
/// allowed to suspend mid-callback; the orchestrator wraps the call in
/// `tokio::task::block_in_place` so the async runtime isn't otherwise
/// starved while still preserving at most one configurator invocation in
/// flight process-wide.
pub trait ConfiguratorRunner {
    fn invoke(&mut self, reason: Reason, env: &[(String, String)]) -> std::io::Result<ExitOutcome>;
}

/// A lease is rendered into the environment under one of four prefixes
/// depending on which slot it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePrefix {
    New,
    Old,
    Alias,
    Requested,
}

impl LeasePrefix {
    fn as_str(&self) -> &'static str {
        match self {
            LeasePrefix::New => "new_",
            LeasePrefix::Old => "old_",
            LeasePrefix::Alias => "alias_",
            LeasePrefix::Requested => "requested_",
        }
    }
}

/// Derive an environment variable name from an option name: `-` becomes
/// `_`, and a non-default option space gets `_<space>_` spliced in front.
pub fn env_var_name(space: Option<&str>, option_name: &str) -> String {
    let base = option_name.replace('-', "_");
    match space {
        Some(space) => format!("_{space}_{base}"),
        None => base,
    }
}

/// Build the `new_*`/`old_*`/`alias_*` variables for one lease, validating
/// every value before export and silently dropping any that fail
/// validation (a warning is logged by the caller from the returned drop
/// list, if it cares to).
pub fn lease_environment(prefix: LeasePrefix, lease: &Lease, requested_options: &[String]) -> Vec<(String, String)> {
    let p = prefix.as_str();
    let mut vars = Vec::new();

    vars.push((format!("{p}ip_address"), lease.address.to_string()));
    if let Some(ns) = lease.next_server_address {
        vars.push((format!("{p}next_server"), ns.to_string()));
    }
    if let Some(ref name) = lease.server_name {
        vars.push((format!("{p}server_name"), name.clone()));
    }
    if let Some(ref file) = lease.filename {
        vars.push((format!("{p}filename"), file.clone()));
    }
    vars.push((format!("{p}expiry"), lease.expiry.to_string()));

    if let Some(mask) = lease.options.lookup(OptionSpace::Dhcp, OPT_SUBNET_MASK).and_then(|v| v.as_ipv4()) {
        let network = u32::from(lease.address) & u32::from(mask);
        let broadcast = if let Some(b) = lease.options.lookup(OptionSpace::Dhcp, OPT_BROADCAST_ADDR).and_then(|v| v.as_ipv4()) {
            b
        } else {
            Ipv4Addr::from(network | !u32::from(mask))
        };
        vars.push((format!("{p}network_number"), Ipv4Addr::from(network).to_string()));
        vars.push((format!("{p}broadcast_address"), broadcast.to_string()));
    }

    for (key, value) in lease.options.iter() {
        if key.space != OptionSpace::Dhcp {
            continue;
        }
        if key.code == OPT_BROADCAST_ADDR {
            continue; // already handled above with derived semantics
        }
        // Options this client knows how to name validate and export under
        // that name; anything else still exports, just under
        // a numeric fallback, since validation families are keyed by name
        // and an unnamed option can't belong to a named family anyway.
        let fallback_name = format!("option_{}", key.code);
        let canonical_name = option_name(key.code).unwrap_or("");
        let env_name = format!("{p}{}", env_var_name(None, option_name(key.code).unwrap_or(&fallback_name)));
        if validate_for_export(canonical_name, &value.to_bytes()).is_ok() {
            vars.push((env_name, value.display_text()));
        }
    }

    if prefix == LeasePrefix::New {
        for opt in requested_options {
            vars.push((format!("requested_{}", opt.replace('-', "_")), "1".to_string()));
        }
    }

    vars
}

/// Assemble the full child environment: operator-supplied vars, then
/// lease-derived vars, then a fixed `PATH`, in that order.
pub fn build_environment(
    operator_vars: &[(String, String)],
    lease_vars: &[(String, String)],
    path: &str,
) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(operator_vars.len() + lease_vars.len() + 1);
    env.extend(operator_vars.iter().cloned());
    env.extend(lease_vars.iter().cloned());
    env.push(("PATH".to_string(), path.to_string()));
    env
}

/// The concrete `ConfiguratorRunner`: forks/execs the configured script
/// with a cleared environment (only what `build_environment`/callers
/// assembled is visible to the child), inherited stdio, and waits for it
/// synchronously. A missing script file is reported as an I/O error
/// rather than panicking; the orchestrator treats it like any other
/// recoverable configurator failure.
pub struct ProcessConfigurator {
    script: std::path::PathBuf,
}

impl ProcessConfigurator {
    pub fn new(script: impl Into<std::path::PathBuf>) -> Self {
        Self { script: script.into() }
    }
}

impl ConfiguratorRunner for ProcessConfigurator {
    fn invoke(&mut self, reason: Reason, env: &[(String, String)]) -> std::io::Result<ExitOutcome> {
        let status = std::process::Command::new(&self.script)
            .env_clear()
            .envs(env.iter().cloned())
            .env("reason", reason.as_str())
            .status()?;

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Ok(ExitOutcome::Signal(signal));
            }
        }
        Ok(ExitOutcome::Status(status.code().unwrap_or(-1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::Lease;
    use crate::options::OptionValue;

    #[test]
    fn env_var_name_translates_dashes_and_spaces() {
        assert_eq!(env_var_name(None, "domain-name"), "domain_name");
        assert_eq!(env_var_name(Some("vendor"), "sub-code"), "_vendor_sub_code");
    }

    #[test]
    fn lease_environment_includes_derived_network_fields() {
        let mut lease = Lease::new(Ipv4Addr::new(192, 0, 2, 50));
        lease.expiry = 1_700_000_000;
        lease.options.save_dhcp(OPT_SUBNET_MASK, OptionValue::Ipv4(Ipv4Addr::new(255, 255, 255, 0)));

        let vars = lease_environment(LeasePrefix::New, &lease, &["subnet-mask".to_string()]);
        let get = |k: &str| vars.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());

        assert_eq!(get("new_ip_address"), Some("192.0.2.50".to_string()));
        assert_eq!(get("new_network_number"), Some("192.0.2.0".to_string()));
        assert_eq!(get("new_broadcast_address"), Some("192.0.2.255".to_string()));
        assert_eq!(get("new_subnet_mask"), Some("255.255.255.0".to_string()));
        assert_eq!(get("requested_subnet_mask"), Some("1".to_string()));
    }

    #[test]
    fn lease_environment_names_known_options_by_canonical_name() {
        let mut lease = Lease::new(Ipv4Addr::new(192, 0, 2, 50));
        lease.expiry = 1_700_000_000;
        lease.options.save_dhcp(crate::options::OPT_ROUTER, OptionValue::Ipv4(Ipv4Addr::new(192, 0, 2, 1)));

        let vars = lease_environment(LeasePrefix::New, &lease, &[]);
        let get = |k: &str| vars.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("new_routers"), Some("192.0.2.1".to_string()));
    }

    #[test]
    fn build_environment_orders_operator_then_lease_then_path() {
        let operator = vec![("FOO".to_string(), "bar".to_string())];
        let lease = vec![("new_ip_address".to_string(), "10.0.0.5".to_string())];
        let env = build_environment(&operator, &lease, "/usr/bin:/bin");
        assert_eq!(env[0].0, "FOO");
        assert_eq!(env[1].0, "new_ip_address");
        assert_eq!(env[2], ("PATH".to_string(), "/usr/bin:/bin".to_string()));
    }
}
