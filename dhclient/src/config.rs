//! On-disk configuration. A single JSON document describes client-wide
//! defaults plus a list of interfaces to manage; each interface is turned
//! into a `dhcp_core::machine::ClientConfig` by `build_machine_config`.

use std::net::Ipv4Addr;
use std::time::Duration;

use dhcp_core::machine::ClientConfig as MachineConfig;
use dhcp_core::options;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Stay resident, renewing/rebinding as leases age.
    Daemon,
    /// Perform exactly one bind-or-fail cycle then exit.
    OneTry,
    /// Release the current lease on every managed interface and exit.
    Release,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSettings {
    pub name: String,
    #[serde(default)]
    pub media: Vec<String>,
    /// Option names requested in the outbound parameter-request list,
    /// e.g. `"subnet-mask"`, `"routers"`.
    #[serde(default = "default_request_list")]
    pub request: Vec<String>,
    /// Option names an OFFER must carry to be considered.
    #[serde(default)]
    pub require: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_lease_file")]
    pub lease_file: String,
    #[serde(default = "default_script")]
    pub script: String,
    #[serde(default = "default_initial_interval")]
    pub initial_interval_secs: u64,
    #[serde(default = "default_backoff_cutoff")]
    pub backoff_cutoff_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_reboot_timeout")]
    pub reboot_timeout_secs: u64,
    #[serde(default = "default_select_interval")]
    pub select_interval_secs: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_decline_wait_time")]
    pub decline_wait_time_secs: u64,
    #[serde(default = "default_min_lease_write")]
    pub min_lease_write_secs: u64,
    /// Jitter ceiling (seconds) applied before the first `state_reboot`
    /// kick at startup; 0 disables it.
    #[serde(default)]
    pub initial_delay_secs: u64,
    /// `"10.0.0.1"` or `"10.0.0.0/24"` entries; hosts/subnets whose
    /// responses are dropped outright.
    #[serde(default)]
    pub reject: Vec<String>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSettings>,
    /// The OMAPI listener itself is out of scope; kept only so a config
    /// file that names a port doesn't fail to parse, and so a future
    /// listener has somewhere to read it from.
    #[serde(default)]
    pub omapi_port: Option<u16>,
    /// DDNS updates are out of scope; stored for config-file
    /// compatibility, never read.
    #[serde(default)]
    pub do_forward_update: bool,
    /// Selects which `chrono` rendering `dhclient`'s own log lines use for
    /// lease times (`"legacy"` for dhclient's historic `ctime`-style
    /// output, anything else for RFC 3339). The on-disk lease-store
    /// grammar itself is a fixed format and out of scope for this knob.
    #[serde(default = "default_lease_id_format")]
    pub lease_id_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl ClientConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn reject_rules(&self) -> Vec<(Ipv4Addr, Ipv4Addr)> {
        self.reject
            .iter()
            .filter_map(|entry| parse_reject_entry(entry))
            .collect()
    }
}

fn parse_reject_entry(entry: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
    match entry.split_once('/') {
        Some((addr, bits)) => {
            let addr: Ipv4Addr = addr.parse().ok()?;
            let bits: u32 = bits.parse().ok()?;
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits.min(32)) };
            Some((addr, Ipv4Addr::from(mask)))
        }
        None => {
            let addr: Ipv4Addr = entry.parse().ok()?;
            Some((addr, Ipv4Addr::new(255, 255, 255, 255)))
        }
    }
}

/// Translate a configurator-facing option name into its wire code, for the
/// handful of options this client knows how to name by string. Anything
/// else is silently skipped — the requested/required option lists only
/// accept names this table recognizes.
fn option_code(name: &str) -> Option<u8> {
    Some(match name {
        "subnet-mask" => options::OPT_SUBNET_MASK,
        "time-offset" => options::OPT_TIME_OFFSET,
        "routers" => options::OPT_ROUTER,
        "domain-name-servers" => options::OPT_DNS_SERVER,
        "host-name" => options::OPT_HOSTNAME,
        "boot-size" => options::OPT_BOOT_FILE_SIZE,
        "domain-name" => options::OPT_DOMAIN_NAME,
        "root-path" => options::OPT_ROOT_PATH,
        "broadcast-address" => options::OPT_BROADCAST_ADDR,
        "nis-domain" => options::OPT_NIS_DOMAIN,
        "netbios-scope" => options::OPT_NETBIOS_SCOPE,
        "domain-search" => options::OPT_DOMAIN_SEARCH,
        _ => return None,
    })
}

fn default_request_list() -> Vec<String> {
    vec![
        "subnet-mask".to_string(),
        "broadcast-address".to_string(),
        "time-offset".to_string(),
        "routers".to_string(),
        "domain-name".to_string(),
        "domain-name-servers".to_string(),
        "host-name".to_string(),
    ]
}

fn default_lease_file() -> String {
    "/var/lib/dhclient/dhclient.leases".to_string()
}

fn default_script() -> String {
    "/sbin/dhclient-script".to_string()
}

fn default_initial_interval() -> u64 {
    10
}

fn default_backoff_cutoff() -> u64 {
    120
}

fn default_timeout() -> u64 {
    60
}

fn default_reboot_timeout() -> u64 {
    10
}

fn default_select_interval() -> u64 {
    4
}

fn default_retry_interval() -> u64 {
    300
}

fn default_decline_wait_time() -> u64 {
    10
}

fn default_min_lease_write() -> u64 {
    300
}

fn default_lease_id_format() -> String {
    "legacy".to_string()
}

/// Build the `dhcp-core` side config for one interface from the client-wide
/// defaults plus its own overrides.
pub fn build_machine_config(client: &ClientConfig, iface: &InterfaceSettings, onetry: bool) -> MachineConfig {
    let requested_options: Vec<(u8, String)> = iface
        .request
        .iter()
        .filter_map(|name| option_code(name).map(|code| (code, name.replace('-', "_"))))
        .collect();
    let required_options: Vec<u8> = iface.require.iter().filter_map(|name| option_code(name)).collect();

    MachineConfig {
        initial_interval: Duration::from_secs(client.initial_interval_secs),
        backoff_cutoff: Duration::from_secs(client.backoff_cutoff_secs),
        timeout: Duration::from_secs(client.timeout_secs),
        reboot_timeout: Duration::from_secs(client.reboot_timeout_secs),
        select_interval: Duration::from_secs(client.select_interval_secs),
        retry_interval: Duration::from_secs(client.retry_interval_secs),
        decline_wait_time: Duration::from_secs(client.decline_wait_time_secs),
        min_lease_write: Duration::from_secs(client.min_lease_write_secs),
        required_options,
        requested_options,
        media: iface.media.clone(),
        onetry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_lease_file() {
        let config = ClientConfig::default();
        assert_eq!(config.lease_file, "/var/lib/dhclient/dhclient.leases");
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn reject_entries_parse_host_and_subnet_forms() {
        let config = ClientConfig {
            reject: vec!["10.0.0.9".to_string(), "192.168.1.0/24".to_string()],
            ..ClientConfig::default()
        };
        let rules = config.reject_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], (Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(255, 255, 255, 255)));
        assert_eq!(rules[1], (Ipv4Addr::new(192, 168, 1, 0), Ipv4Addr::new(255, 255, 255, 0)));
    }

    #[test]
    fn build_machine_config_translates_known_option_names() {
        let client = ClientConfig::default();
        let iface = InterfaceSettings {
            name: "eth0".to_string(),
            media: vec![],
            request: vec!["subnet-mask".to_string(), "unknown-option".to_string()],
            require: vec![],
        };
        let machine = build_machine_config(&client, &iface, false);
        assert_eq!(machine.requested_options.len(), 1);
        assert_eq!(machine.requested_options[0].0, options::OPT_SUBNET_MASK);
    }
}
