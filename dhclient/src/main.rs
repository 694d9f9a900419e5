mod config;
mod link;
mod orchestrator;

use std::path::PathBuf;

use anyhow::Result;
use tracing::{error, info};

use config::{ClientConfig, RunMode};

const DEFAULT_CONFIG_PATH: &str = "/etc/dhclient.json";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dhclient=debug".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mode = parse_mode(&args);
    let config_path = parse_config_path(&args).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    info!(mode = ?mode, config = %config_path.display(), "dhclient starting");

    let config = ClientConfig::load(&config_path)?;
    if let Err(e) = orchestrator::execute(config, mode).await {
        error!(error = %e, "dhclient exiting on error");
        return Err(e);
    }
    Ok(())
}

/// `-r` releases every managed lease and exits; `-1` ("one-try") performs
/// exactly one bind-or-fail cycle. Anything else stays resident.
fn parse_mode(args: &[String]) -> RunMode {
    if args.iter().any(|a| a == "-r" || a == "--release") {
        RunMode::Release
    } else if args.iter().any(|a| a == "-1" || a == "--one-try") {
        RunMode::OneTry
    } else {
        RunMode::Daemon
    }
}

/// `-cf <path>` names an alternate config file, mirroring dhclient's own
/// `-cf` flag.
fn parse_config_path(args: &[String]) -> Option<PathBuf> {
    let idx = args.iter().position(|a| a == "-cf")?;
    args.get(idx + 1).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_flag_selects_release_mode() {
        let args = vec!["dhclient".to_string(), "-r".to_string()];
        assert_eq!(parse_mode(&args), RunMode::Release);
    }

    #[test]
    fn one_try_flag_selects_one_try_mode() {
        let args = vec!["dhclient".to_string(), "-1".to_string()];
        assert_eq!(parse_mode(&args), RunMode::OneTry);
    }

    #[test]
    fn no_flags_selects_daemon_mode() {
        let args = vec!["dhclient".to_string()];
        assert_eq!(parse_mode(&args), RunMode::Daemon);
    }

    #[test]
    fn cf_flag_names_alternate_config_path() {
        let args = vec!["dhclient".to_string(), "-cf".to_string(), "/tmp/x.json".to_string()];
        assert_eq!(parse_config_path(&args), Some(PathBuf::from("/tmp/x.json")));
    }
}
