//! Debounced presence for passively scanned beacons.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::info;

use crate::config::Timing;
use crate::devices::{BeaconKey, TrackedBeacon};
use crate::messages::{DeviceAnnouncement, DeviceKind, DevicePresence};
use crate::scanner::ScanReport;

#[derive(Clone, Copy, Debug)]
pub struct BeaconTracker {
    found_hold: Duration,
    min_report_idle: Duration,
}

impl BeaconTracker {
    pub fn new(timing: &Timing) -> Self {
        BeaconTracker {
            found_hold: timing.found_hold,
            min_report_idle: timing.min_report_idle,
        }
    }

    /// Applies one scan cycle's reports and returns the notifications to send.
    ///
    /// A matched beacon is re-announced at most once per `min_report_idle`
    /// while it stays present. A beacon unseen for longer than `found_hold`
    /// drops to absent and that is always announced.
    pub fn on_scan_batch(
        &self,
        reports: &[ScanReport],
        beacons: &mut HashMap<BeaconKey, TrackedBeacon>,
        now: Instant,
    ) -> Vec<DeviceAnnouncement> {
        let mut announcements = Vec::new();
        let mut matched = HashSet::new();

        for report in reports {
            let Some(key) = report.match_keys().find(|key| beacons.contains_key(key)) else {
                continue;
            };
            if !matched.insert(key.clone()) {
                continue;
            }
            let Some(beacon) = beacons.get_mut(&key) else {
                continue;
            };
            beacon.mark_seen(now);
            if !beacon.present {
                beacon.present = true;
                info!("iBeacon {} now present", key);
            }
            if beacon.report_due(now, self.min_report_idle) {
                beacon.mark_reported(now);
                announcements.push(DeviceAnnouncement {
                    controller_id: beacon.controller_id.clone(),
                    address: key.to_string(),
                    kind: DeviceKind::IBeacon,
                    presence: DevicePresence::Present(report.rssi),
                });
            }
        }

        for (key, beacon) in beacons.iter_mut() {
            if matched.contains(key) {
                continue;
            }
            if beacon.present && beacon.hold_expired(now, self.found_hold) {
                beacon.present = false;
                info!("iBeacon {} is now not present", key);
                announcements.push(DeviceAnnouncement {
                    controller_id: beacon.controller_id.clone(),
                    address: key.to_string(),
                    kind: DeviceKind::IBeacon,
                    presence: DevicePresence::Absent,
                });
            }
        }
        announcements
    }
}
