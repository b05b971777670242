//! Active probing of classic Bluetooth devices.

use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use mac_address::MacAddress;
use tokio::process::Command;

use crate::config::ProbeConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found(/* signal strength */ Option<i16>),
    Absent,
}

/// Probes a single device. Never fails: any transport problem is reported
/// as [`ProbeOutcome::Absent`].
pub trait Prober {
    async fn probe(&self, address: &MacAddress) -> ProbeOutcome;
}

/// Runs an external command (`l2ping` by default) against the address.
#[derive(Clone, Debug)]
pub struct CommandProber {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProber {
    pub fn new(config: &ProbeConfig) -> Self {
        CommandProber {
            command: config.command(),
            args: config.args(),
            timeout: config.timeout(),
        }
    }

    fn args_for(&self, address: &MacAddress) -> Vec<String> {
        let address = address.to_string();
        let timeout = self.timeout.as_secs().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{address}", &address).replace("{timeout}", &timeout))
            .collect()
    }
}

/// Picks the signal strength out of `hcitool rssi` style output.
fn parse_rssi(output: &str) -> Option<i16> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("RSSI return value:")
            .and_then(|value| value.trim().parse().ok())
    })
}

impl Prober for CommandProber {
    async fn probe(&self, address: &MacAddress) -> ProbeOutcome {
        let child = Command::new(&self.command)
            .args(self.args_for(address))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();
        // allow the command its own timeout plus a grace period
        match tokio::time::timeout(self.timeout + Duration::from_secs(1), child).await {
            Ok(Ok(output)) if output.status.success() => {
                ProbeOutcome::Found(parse_rssi(&String::from_utf8_lossy(&output.stdout)))
            }
            Ok(Ok(output)) => {
                debug!("Probe of {} exited with {}", address, output.status);
                ProbeOutcome::Absent
            }
            Ok(Err(err)) => {
                warn!("Could not run probe command {}: {}", self.command, err);
                ProbeOutcome::Absent
            }
            Err(_) => {
                debug!("Probe of {} timed out", address);
                ProbeOutcome::Absent
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prober(command: &str, args: &[&str]) -> CommandProber {
        CommandProber::new(&ProbeConfig {
            command: Some(command.to_string()),
            args: Some(args.iter().map(|a| a.to_string()).collect()),
            timeout_seconds: Some(2),
        })
    }

    fn address() -> MacAddress {
        "11:22:33:44:55:66".parse().unwrap()
    }

    #[test]
    fn test_args_substitution() {
        let prober = CommandProber::new(&ProbeConfig::default());
        assert_eq!(
            prober.args_for(&address()),
            vec!["-c", "1", "-t", "5", "11:22:33:44:55:66"]
        );
    }

    #[test]
    fn test_parse_rssi() {
        assert_eq!(parse_rssi("RSSI return value: -7\n"), Some(-7));
        assert_eq!(parse_rssi("1 sent, 1 received, 0% loss"), None);
    }

    #[tokio::test]
    async fn test_successful_command_is_found() {
        let prober = prober("sh", &["-c", "echo 'RSSI return value: -4'"]);
        assert_eq!(prober.probe(&address()).await, ProbeOutcome::Found(Some(-4)));
    }

    #[tokio::test]
    async fn test_failures_are_absent() {
        assert_eq!(prober("false", &[]).probe(&address()).await, ProbeOutcome::Absent);
        assert_eq!(
            prober("/nonexistent/probe-command", &[]).probe(&address()).await,
            ProbeOutcome::Absent
        );
        assert_eq!(
            prober("sleep", &["10"]).probe(&address()).await,
            ProbeOutcome::Absent
        );
    }
}
