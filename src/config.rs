use std::time::Duration;

use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub scanner_name: Option<String>,
    pub vera: Option<VeraConfig>,
    pub mqtt: Option<MqttConfig>,
    pub devices: Option<Vec<DeviceConfig>>,
    pub timing: Option<TimingConfig>,
    pub probe: Option<ProbeConfig>,
}

impl AppConfig {
    pub fn scanner_name(&self) -> String {
        self.scanner_name
            .clone()
            .unwrap_or_else(|| "Scanner".to_string())
    }

    pub fn timing(&self) -> Timing {
        self.timing.clone().unwrap_or_default().resolve()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct VeraConfig {
    pub host: String,
    pub port: Option<u16>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

/// A registry entry declared directly in the config file, for setups
/// without a Vera controller.
#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub address: String,
    /// `"ibeacon"` or `"bluetooth"`
    pub device_type: String,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TimingConfig {
    pub found_hold_seconds: Option<u64>,
    pub beacon_listen_period_seconds: Option<u64>,
    pub beacon_listen_timeout_seconds: Option<u64>,
    pub beacon_listen_quantity: Option<usize>,
    pub poll_period_live_seconds: Option<u64>,
    pub poll_period_dead_seconds: Option<u64>,
    pub min_report_idle_seconds: Option<u64>,
    pub registry_sync_period_seconds: Option<u64>,
    pub registry_sync_retry_seconds: Option<u64>,
}

impl TimingConfig {
    pub fn resolve(&self) -> Timing {
        let secs = |value: Option<u64>, default: u64| Duration::from_secs(value.unwrap_or(default));
        Timing {
            found_hold: secs(self.found_hold_seconds, 120),
            beacon_listen_period: secs(self.beacon_listen_period_seconds, 10),
            beacon_listen_timeout: secs(self.beacon_listen_timeout_seconds, 2),
            beacon_listen_quantity: self.beacon_listen_quantity.unwrap_or(10),
            poll_period_live: secs(self.poll_period_live_seconds, 60),
            poll_period_dead: secs(self.poll_period_dead_seconds, 10),
            min_report_idle: secs(self.min_report_idle_seconds, 30),
            registry_sync_period: secs(self.registry_sync_period_seconds, 600),
            registry_sync_retry: secs(self.registry_sync_retry_seconds, 10),
        }
    }
}

/// Engine tunables with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub found_hold: Duration,
    pub beacon_listen_period: Duration,
    pub beacon_listen_timeout: Duration,
    pub beacon_listen_quantity: usize,
    pub poll_period_live: Duration,
    pub poll_period_dead: Duration,
    pub min_report_idle: Duration,
    pub registry_sync_period: Duration,
    pub registry_sync_retry: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        TimingConfig::default().resolve()
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProbeConfig {
    /// Program to run; `{address}` and `{timeout}` in `args` are substituted.
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub timeout_seconds: Option<u64>,
}

impl ProbeConfig {
    pub fn command(&self) -> String {
        self.command.clone().unwrap_or_else(|| "l2ping".to_string())
    }

    pub fn args(&self) -> Vec<String> {
        self.args.clone().unwrap_or_else(|| {
            ["-c", "1", "-t", "{timeout}", "{address}"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(5))
    }
}
