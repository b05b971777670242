//! Passive BLE scanning: turns advertisement events into scan reports.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::{FutureExt as _, Stream, StreamExt as _};
use log::{debug, info};
use mac_address::MacAddress;
use thiserror::Error;

use crate::devices::BeaconKey;

/// Bluetooth SIG assigned company identifier for Apple.
const APPLE_COMPANY_ID: u16 = 0x004C;
const IBEACON_PREFIX: [u8; 2] = [0x02, 0x15];
const IBEACON_LEN: usize = 23;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no bluetooth adapter found")]
    NoAdapter,
    #[error("bluetooth radio unavailable: {0}")]
    RadioUnavailable(#[source] btleplug::Error),
    #[error("error reading scan reports: {0}")]
    Read(#[source] btleplug::Error),
}

/// iBeacon identifier fields carried in Apple manufacturer data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeaconId {
    pub uuid: [u8; 16],
    pub major: u16,
    pub minor: u16,
    pub tx_power: i8,
}

impl BeaconId {
    pub fn from_manufacturer_data(data: &HashMap<u16, Vec<u8>>) -> Option<Self> {
        let payload = data.get(&APPLE_COMPANY_ID)?;
        if payload.len() < IBEACON_LEN || payload[..2] != IBEACON_PREFIX {
            return None;
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&payload[2..18]);
        Some(BeaconId {
            uuid,
            major: u16::from_be_bytes([payload[18], payload[19]]),
            minor: u16::from_be_bytes([payload[20], payload[21]]),
            tx_power: payload[22] as i8,
        })
    }

    pub fn uuid_hex(&self) -> String {
        self.uuid.iter().map(|b| format!("{b:02X}")).collect()
    }

    /// Composite `UUIDHEX,MAJOR,MINOR` key.
    pub fn key(&self) -> BeaconKey {
        BeaconKey::normalize(&format!("{},{},{}", self.uuid_hex(), self.major, self.minor))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanReport {
    pub address: MacAddress,
    pub beacon: Option<BeaconId>,
    pub rssi: Option<i16>,
}

impl ScanReport {
    /// Keys a tracked beacon may be registered under, MAC first.
    pub fn match_keys(&self) -> impl Iterator<Item = BeaconKey> + '_ {
        std::iter::once(BeaconKey::from_mac(&self.address)).chain(self.beacon.map(|b| b.key()))
    }
}

impl fmt::Display for ScanReport {
    /// `MAC,UUID,MAJOR,MINOR,TX,RSSI`, empty fields when unknown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},", self.address)?;
        match &self.beacon {
            Some(b) => write!(f, "{},{},{},{},", b.uuid_hex(), b.major, b.minor, b.tx_power)?,
            None => f.write_str(",,,,")?,
        }
        if let Some(rssi) = self.rssi {
            write!(f, "{rssi}")?;
        }
        Ok(())
    }
}

/// An acquired radio producing bounded batches of reports.
pub trait Scanner {
    async fn read_reports(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<ScanReport>, ScanError>;
}

pub trait ScanSource {
    type Scanner: Scanner;

    async fn acquire_scanner(&mut self) -> Result<Self::Scanner, ScanError>;
}

/// Scan source backed by the first btleplug adapter.
#[derive(Default)]
pub struct BleScanSource;

impl ScanSource for BleScanSource {
    type Scanner = BleScanner;

    async fn acquire_scanner(&mut self) -> Result<BleScanner, ScanError> {
        let manager = Manager::new().await.map_err(ScanError::RadioUnavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ScanError::RadioUnavailable)?
            .into_iter()
            .next()
            .ok_or(ScanError::NoAdapter)?;
        let events = adapter.events().await.map_err(ScanError::RadioUnavailable)?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ScanError::RadioUnavailable)?;
        info!("Started BLE scan");
        Ok(BleScanner { adapter, events })
    }
}

pub struct BleScanner {
    adapter: Adapter,
    events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
}

impl BleScanner {
    async fn report(&self, id: &PeripheralId) -> Result<Option<ScanReport>, btleplug::Error> {
        let peripheral = self.adapter.peripheral(id).await?;
        let Some(properties) = peripheral.properties().await? else {
            return Ok(None);
        };
        Ok(Some(ScanReport {
            address: MacAddress::new(properties.address.into_inner()),
            beacon: BeaconId::from_manufacturer_data(&properties.manufacturer_data),
            rssi: properties.rssi,
        }))
    }
}

fn peripheral_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

/// Discards whatever the stream has already queued without waiting.
fn drain_buffered<St: Stream + Unpin>(events: &mut St) -> usize {
    let mut dropped = 0;
    while let Some(Some(_)) = events.next().now_or_never() {
        dropped += 1;
    }
    dropped
}

/// Ids seen on `events` from now until `timeout`, at most `max_count`
/// distinct ones. Events queued before the call are skipped.
async fn fresh_ids<St, K>(
    events: &mut St,
    max_count: usize,
    timeout: Duration,
    id_of: impl Fn(St::Item) -> Option<K>,
) -> Vec<K>
where
    St: Stream + Unpin,
    K: PartialEq,
{
    let stale = drain_buffered(events);
    if stale > 0 {
        debug!("Dropped {} queued BLE events", stale);
    }
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ids = Vec::with_capacity(max_count);
    while ids.len() < max_count {
        let event = match tokio::time::timeout_at(deadline, events.next()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("BLE event stream closed");
                break;
            }
            Err(_) => break,
        };
        let Some(id) = id_of(event) else {
            continue;
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Keeps every report that could be looked up. The batch only fails when
/// no lookup succeeded at all.
fn collect_lookups(
    lookups: Vec<Result<Option<ScanReport>, btleplug::Error>>,
) -> Result<Vec<ScanReport>, ScanError> {
    let mut reports = Vec::with_capacity(lookups.len());
    let mut last_err = None;
    let mut succeeded = false;
    for lookup in lookups {
        match lookup {
            Ok(report) => {
                succeeded = true;
                reports.extend(report);
            }
            Err(err) => {
                debug!("Skipping peripheral: {}", err);
                last_err = Some(err);
            }
        }
    }
    match last_err {
        Some(err) if !succeeded => Err(ScanError::Read(err)),
        _ => Ok(reports),
    }
}

impl Scanner for BleScanner {
    async fn read_reports(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<ScanReport>, ScanError> {
        let ids = fresh_ids(&mut self.events, max_count, timeout, peripheral_id).await;
        let mut lookups = Vec::with_capacity(ids.len());
        for id in &ids {
            lookups.push(self.report(id).await);
        }
        collect_lookups(lookups)
    }
}
