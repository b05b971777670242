//! Reconciles the tracked device set with the external device registry.

use std::collections::HashMap;

use log::{debug, info};
use mac_address::MacAddress;
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::devices::{BeaconKey, TrackedBeacon, TrackedDevices, TrackedPhone};
use crate::messages::DeviceKind;
use crate::vera::VeraClient;

/// Registry device type of presence sensors; every other kind is ignored.
pub const PRESENCE_SENSOR_KIND: &str = "urn:schemas-afoyi-com:device:PresenceSensor:1";

const ADDRESS_ATTRIBUTE: &str = "Address";
const DEVICE_TYPE_ATTRIBUTE: &str = "DeviceType";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("registry replied with HTTP status {0}")]
    Status(u16),
    #[error("registry reply is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("registry returned an empty device directory")]
    Empty,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: String,
    pub kind: String,
    pub attributes: HashMap<String, String>,
}

impl DirectoryEntry {
    pub fn presence_sensor(id: &str, address: &str, device_type: &str) -> Self {
        DirectoryEntry {
            id: id.to_string(),
            kind: PRESENCE_SENSOR_KIND.to_string(),
            attributes: HashMap::from([
                (ADDRESS_ATTRIBUTE.to_string(), address.to_string()),
                (DEVICE_TYPE_ATTRIBUTE.to_string(), device_type.to_string()),
            ]),
        }
    }
}

/// Source of the device directory. Fails as a whole rather than
/// returning a partial listing.
pub trait Directory {
    async fn fetch_devices(&self) -> Result<Vec<DirectoryEntry>, RegistryError>;
}

/// Directory declared in the config file.
#[derive(Clone, Debug, Default)]
pub struct StaticDirectory {
    entries: Vec<DirectoryEntry>,
}

impl StaticDirectory {
    pub fn new(devices: &[DeviceConfig]) -> Self {
        StaticDirectory {
            entries: devices
                .iter()
                .map(|d| DirectoryEntry::presence_sensor(&d.id, &d.address, &d.device_type))
                .collect(),
        }
    }
}

impl Directory for StaticDirectory {
    async fn fetch_devices(&self) -> Result<Vec<DirectoryEntry>, RegistryError> {
        Ok(self.entries.clone())
    }
}

pub enum DeviceSource {
    Vera(VeraClient),
    Static(StaticDirectory),
}

impl Directory for DeviceSource {
    async fn fetch_devices(&self) -> Result<Vec<DirectoryEntry>, RegistryError> {
        match self {
            DeviceSource::Vera(client) => client.fetch_devices().await,
            DeviceSource::Static(directory) => directory.fetch_devices().await,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.removed > 0
    }
}

/// Registry address of a presence sensor, parsed per device type.
#[derive(Debug, PartialEq, Eq)]
enum SensorKey {
    Beacon(BeaconKey),
    Phone(MacAddress),
}

/// A presence sensor entry with its required attributes extracted.
#[derive(Debug, PartialEq, Eq)]
struct SensorEntry<'a> {
    id: &'a str,
    key: SensorKey,
}

fn sensor_entry(entry: &DirectoryEntry) -> Option<SensorEntry<'_>> {
    let (Some(address), Some(device_type)) = (
        entry.attributes.get(ADDRESS_ATTRIBUTE),
        entry.attributes.get(DEVICE_TYPE_ATTRIBUTE),
    ) else {
        debug!("Device id = {} is incomplete. Skipping.", entry.id);
        return None;
    };
    let key = match DeviceKind::parse(device_type) {
        Some(DeviceKind::IBeacon) => SensorKey::Beacon(BeaconKey::normalize(address)),
        Some(DeviceKind::Bluetooth) => match address.trim().parse::<MacAddress>() {
            Ok(mac) => SensorKey::Phone(mac),
            Err(_) => {
                debug!(
                    "Device id = {} has invalid bluetooth address ({}). Skipping.",
                    entry.id, address
                );
                return None;
            }
        },
        None => {
            debug!(
                "Device id = {} has invalid type ({}). Skipping.",
                entry.id, device_type
            );
            return None;
        }
    };
    Some(SensorEntry { id: &entry.id, key })
}

/// Fetches the directory and applies it to `devices`.
///
/// On any error `devices` is left untouched.
pub async fn sync<D: Directory>(
    directory: &D,
    devices: &mut TrackedDevices,
) -> Result<SyncReport, RegistryError> {
    let entries = directory.fetch_devices().await?;
    if entries.is_empty() {
        return Err(RegistryError::Empty);
    }
    let report = reconcile(&entries, devices);
    if report.changed() {
        info!(
            "Registry sync: {} added, {} removed, {} skipped, tracking {} beacons and {} phones",
            report.added,
            report.removed,
            report.skipped,
            devices.beacons.len(),
            devices.phones.len()
        );
    } else {
        debug!("Registry sync: no changes");
    }
    Ok(report)
}

/// Removes tracked devices no longer backed by a matching sensor entry,
/// then starts tracking sensors not seen before. Existing entries keep
/// their presence state.
pub fn reconcile(entries: &[DirectoryEntry], devices: &mut TrackedDevices) -> SyncReport {
    let mut report = SyncReport::default();
    let mut sensors = Vec::new();
    for entry in entries.iter().filter(|e| e.kind == PRESENCE_SENSOR_KIND) {
        match sensor_entry(entry) {
            Some(sensor) => sensors.push(sensor),
            None => report.skipped += 1,
        }
    }

    let before = devices.beacons.len() + devices.phones.len();
    devices.beacons.retain(|key, beacon| {
        let keep = sensors.iter().any(|s| {
            s.id == beacon.controller_id && matches!(&s.key, SensorKey::Beacon(k) if k == key)
        });
        if !keep {
            debug!("Deleting ibeacon {} from device list", key);
        }
        keep
    });
    devices.phones.retain(|address, phone| {
        let keep = sensors.iter().any(|s| {
            s.id == phone.controller_id && matches!(&s.key, SensorKey::Phone(a) if a == address)
        });
        if !keep {
            debug!("Deleting bluetooth {} from device list", address);
        }
        keep
    });
    report.removed = before - devices.beacons.len() - devices.phones.len();

    for sensor in &sensors {
        match &sensor.key {
            SensorKey::Beacon(key) => {
                if devices.beacons.contains_key(key) {
                    continue;
                }
                if devices.phones.keys().any(|a| &BeaconKey::from_mac(a) == key) {
                    debug!("iBeacon {} is already tracked as bluetooth. Skipping.", key);
                    report.skipped += 1;
                    continue;
                }
                debug!("Adding ibeacon {} to device list id = {}", key, sensor.id);
                devices.beacons.insert(key.clone(), TrackedBeacon::new(sensor.id));
                report.added += 1;
            }
            SensorKey::Phone(address) => {
                if devices.phones.contains_key(address) {
                    continue;
                }
                if devices.beacons.contains_key(&BeaconKey::from_mac(address)) {
                    debug!("Bluetooth {} is already tracked as ibeacon. Skipping.", address);
                    report.skipped += 1;
                    continue;
                }
                debug!("Adding bluetooth {} to device list id = {}", address, sensor.id);
                devices.phones.insert(*address, TrackedPhone::new(sensor.id));
                report.added += 1;
            }
        }
    }
    report
}
