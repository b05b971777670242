//! Presence for classic Bluetooth devices, found by probing each address on
//! its own schedule.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info};
use mac_address::MacAddress;

use crate::config::Timing;
use crate::devices::TrackedPhone;
use crate::messages::{DeviceAnnouncement, DeviceKind, DevicePresence, ScanRequest};
use crate::probe::{ProbeOutcome, Prober};

#[derive(Clone, Copy, Debug)]
pub struct ProbePoller {
    poll_period_live: Duration,
    poll_period_dead: Duration,
    found_hold: Duration,
}

impl ProbePoller {
    pub fn new(timing: &Timing) -> Self {
        ProbePoller {
            poll_period_live: timing.poll_period_live,
            poll_period_dead: timing.poll_period_dead,
            found_hold: timing.found_hold,
        }
    }

    /// Probes every phone whose `next_poll` has passed, one at a time.
    ///
    /// A pending `request` also makes due the phones it targets: absent
    /// ones for [`ScanRequest::Arrive`], present ones for
    /// [`ScanRequest::Depart`].
    pub async fn poll_due<P: Prober>(
        &self,
        prober: &P,
        phones: &mut HashMap<MacAddress, TrackedPhone>,
        now: Instant,
        request: Option<ScanRequest>,
    ) -> Vec<DeviceAnnouncement> {
        let due: Vec<MacAddress> = phones
            .iter()
            .filter(|(_, phone)| {
                phone.poll_due(now)
                    || match request {
                        Some(ScanRequest::Arrive) => !phone.present,
                        Some(ScanRequest::Depart) => phone.present,
                        None => false,
                    }
            })
            .map(|(address, _)| *address)
            .collect();

        let mut announcements = Vec::new();
        for address in due {
            let outcome = prober.probe(&address).await;
            let Some(phone) = phones.get_mut(&address) else {
                continue;
            };
            if let Some(announcement) = self.apply(&address, phone, outcome, now) {
                announcements.push(announcement);
            }
        }
        announcements
    }

    fn apply(
        &self,
        address: &MacAddress,
        phone: &mut TrackedPhone,
        outcome: ProbeOutcome,
        now: Instant,
    ) -> Option<DeviceAnnouncement> {
        let presence = match outcome {
            ProbeOutcome::Found(rssi) => {
                if !phone.present {
                    phone.present = true;
                    info!("Bluetooth {} now present", address);
                }
                phone.mark_seen(now);
                phone.next_poll = Some(now + self.poll_period_live);
                DevicePresence::Present(rssi)
            }
            ProbeOutcome::Absent => {
                phone.next_poll = Some(now + self.poll_period_dead);
                if !(phone.present && phone.hold_expired(now, self.found_hold)) {
                    debug!("Bluetooth {} not found", address);
                    return None;
                }
                phone.present = false;
                info!("Bluetooth {} is now not present", address);
                DevicePresence::Absent
            }
        };
        Some(DeviceAnnouncement {
            controller_id: phone.controller_id.clone(),
            address: address.to_string(),
            kind: DeviceKind::Bluetooth,
            presence,
        })
    }
}
