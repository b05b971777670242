use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::broadcast;

mod config;
mod devices;
mod manager;
mod messages;
mod mqtt;
mod notify;
mod poller;
mod probe;
mod registry;
mod scanner;
#[cfg(test)]
mod testing;
mod tracker;
mod vera;

use scanner::{ScanSource as _, Scanner as _};

/// Reports whether known BLE beacons and Bluetooth phones are nearby.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track devices and report presence changes (default)
    Run,
    /// Print nearby advertisements to find a beacon's address or id
    Discover {
        /// Number of reports to print
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
        /// Seconds to listen before giving up
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },
}

fn load_config(path: &Path) -> anyhow::Result<config::AppConfig> {
    let config_contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = toml::de::from_str(&config_contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

async fn discover(count: usize, timeout: u64) -> anyhow::Result<()> {
    let mut scanner = scanner::BleScanSource.acquire_scanner().await?;
    let reports = scanner
        .read_reports(count, Duration::from_secs(timeout))
        .await?;
    for report in reports {
        println!("{report}");
    }
    Ok(())
}

async fn run(config: config::AppConfig) -> anyhow::Result<()> {
    let vera = config
        .vera
        .as_ref()
        .map(vera::VeraClient::new)
        .transpose()
        .context("building Vera client")?;

    let directory = match (&vera, &config.devices) {
        (Some(client), _) => registry::DeviceSource::Vera(client.clone()),
        (None, Some(devices)) => {
            registry::DeviceSource::Static(registry::StaticDirectory::new(devices))
        }
        (None, None) => bail!("config needs a [vera] table or [[devices]] entries"),
    };

    let mut notifiers = notify::Notifiers { vera, mqtt: None };

    let (tx, rx) = broadcast::channel(10);
    if let Some(mqtt_config) = &config.mqtt {
        let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
        let listener = mqtt_client.clone();
        // Handle incoming MQTT messages (e.g. arrival scan requests)
        tokio::task::spawn(async move {
            listener.event_loop(&mut eventloop, tx).await;
        });
        notifiers.mqtt = Some(mqtt_client);
    }

    let probe_config = config.probe.clone().unwrap_or_default();
    let core = manager::Manager::new(
        directory,
        notifiers.clone(),
        scanner::BleScanSource,
        probe::CommandProber::new(&probe_config),
        config.timing(),
        config.scanner_name(),
    )
    .with_scan_requests(rx);

    let result = core.run_loop().await;

    if let Some(mqtt_client) = &notifiers.mqtt {
        mqtt_client.disconnect().await?;
    }
    result
}

async fn start(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Discover { count, timeout } => discover(count, timeout).await,
        Command::Run => {
            let config = load_config(&cli.config)?;
            info!(
                "Starting scanner {} with config {}",
                config.scanner_name(),
                cli.config.display()
            );
            run(config).await
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    pretty_env_logger::init();

    match start(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
