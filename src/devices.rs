//! Tracked device state shared by registry sync, the beacon tracker and
//! the probe poller.
//!
//! Registry sync is the only code that inserts or removes entries. The
//! tracker and poller only touch the mutable timing and presence fields.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use mac_address::MacAddress;

/// Normalized key used to match scan reports against tracked beacons.
///
/// Either a MAC address (`AA:BB:CC:DD:EE:FF`) or a composite iBeacon
/// identifier (`UUIDHEX,MAJOR,MINOR`), always uppercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeaconKey(String);

impl BeaconKey {
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        if upper.contains(',') {
            // composite ids are stored with or without uuid dashes
            let parts: Vec<String> = upper
                .split(',')
                .map(|part| part.trim().replace('-', ""))
                .collect();
            BeaconKey(parts.join(","))
        } else {
            BeaconKey(upper)
        }
    }

    pub fn from_mac(address: &MacAddress) -> Self {
        BeaconKey(address.to_string().to_uppercase())
    }
}

impl fmt::Display for BeaconKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `true` when `last_seen` is more than `hold` before `now`.
fn hold_expired(last_seen: Option<Instant>, now: Instant, hold: Duration) -> bool {
    match last_seen {
        Some(seen) => now.saturating_duration_since(seen) > hold,
        None => true,
    }
}

/// Moves a timestamp forward, never backward.
fn advance(slot: &mut Option<Instant>, now: Instant) {
    *slot = Some(slot.map_or(now, |prev| prev.max(now)));
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedBeacon {
    pub controller_id: String,
    pub present: bool,
    pub last_seen: Option<Instant>,
    pub last_report: Option<Instant>,
}

impl TrackedBeacon {
    pub fn new(controller_id: impl Into<String>) -> Self {
        TrackedBeacon {
            controller_id: controller_id.into(),
            present: false,
            last_seen: None,
            last_report: None,
        }
    }

    pub fn mark_seen(&mut self, now: Instant) {
        advance(&mut self.last_seen, now);
    }

    pub fn mark_reported(&mut self, now: Instant) {
        advance(&mut self.last_report, now);
    }

    pub fn report_due(&self, now: Instant, min_idle: Duration) -> bool {
        match self.last_report {
            Some(reported) => now.saturating_duration_since(reported) >= min_idle,
            None => true,
        }
    }

    pub fn hold_expired(&self, now: Instant, hold: Duration) -> bool {
        hold_expired(self.last_seen, now, hold)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedPhone {
    pub controller_id: String,
    pub present: bool,
    pub last_seen: Option<Instant>,
    /// `None` means due immediately.
    pub next_poll: Option<Instant>,
}

impl TrackedPhone {
    pub fn new(controller_id: impl Into<String>) -> Self {
        TrackedPhone {
            controller_id: controller_id.into(),
            present: false,
            last_seen: None,
            next_poll: None,
        }
    }

    pub fn mark_seen(&mut self, now: Instant) {
        advance(&mut self.last_seen, now);
    }

    pub fn poll_due(&self, now: Instant) -> bool {
        self.next_poll.is_none_or(|due| due <= now)
    }

    pub fn hold_expired(&self, now: Instant, hold: Duration) -> bool {
        hold_expired(self.last_seen, now, hold)
    }
}

/// The full set of devices this scanner is responsible for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackedDevices {
    pub beacons: HashMap<BeaconKey, TrackedBeacon>,
    pub phones: HashMap<MacAddress, TrackedPhone>,
}

impl TrackedDevices {
    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty() && self.phones.is_empty()
    }

    /// Earliest `next_poll` across phones, `None` if no phones are tracked.
    pub fn next_phone_poll(&self, now: Instant) -> Option<Instant> {
        self.phones
            .values()
            .map(|phone| phone.next_poll.unwrap_or(now))
            .min()
    }
}
