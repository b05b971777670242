//! Single-threaded scheduler driving registry sync, beacon scanning and
//! phone probing from one loop.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::Timing;
use crate::devices::TrackedDevices;
use crate::messages::{DeviceAnnouncement, ScanRequest};
use crate::notify::Notifier;
use crate::poller::ProbePoller;
use crate::probe::Prober;
use crate::registry::{self, Directory};
use crate::scanner::{ScanError, ScanSource, Scanner as _};
use crate::tracker::BeaconTracker;

pub struct Manager<D, N, S: ScanSource, P> {
    directory: D,
    notifier: N,
    scan_source: S,
    scanner: Option<S::Scanner>,
    prober: P,
    tracker: BeaconTracker,
    poller: ProbePoller,
    timing: Timing,
    scanner_name: String,
    devices: TrackedDevices,
    next_sync: Instant,
    next_beacon_scan: Instant,
    pending_request: Option<ScanRequest>,
    requests: Option<broadcast::Receiver<ScanRequest>>,
}

/// Rounds up to whole seconds so the loop never wakes just before work is due.
fn ceil_secs(duration: Duration) -> Duration {
    let extra = u64::from(duration.subsec_nanos() > 0);
    Duration::from_secs(duration.as_secs() + extra)
}

async fn next_request(requests: &mut Option<broadcast::Receiver<ScanRequest>>) -> ScanRequest {
    loop {
        let Some(rx) = requests.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Ok(request) => return request,
            Err(RecvError::Lagged(_)) => debug!("Scan request receiver lagged"),
            Err(RecvError::Closed) => {
                debug!("Scan request channel closed");
                *requests = None;
            }
        }
    }
}

impl<D, N, S, P> Manager<D, N, S, P>
where
    D: Directory,
    N: Notifier,
    S: ScanSource,
    P: Prober,
{
    pub fn new(
        directory: D,
        notifier: N,
        scan_source: S,
        prober: P,
        timing: Timing,
        scanner_name: String,
    ) -> Self {
        let now = Instant::now();
        Manager {
            directory,
            notifier,
            scan_source,
            scanner: None,
            prober,
            tracker: BeaconTracker::new(&timing),
            poller: ProbePoller::new(&timing),
            timing,
            scanner_name,
            devices: TrackedDevices::default(),
            next_sync: now,
            next_beacon_scan: now,
            pending_request: None,
            requests: None,
        }
    }

    pub fn with_scan_requests(mut self, rx: broadcast::Receiver<ScanRequest>) -> Self {
        self.requests = Some(rx);
        self
    }

    /// Runs until Ctrl-C. Only a radio that cannot be acquired ends the
    /// loop with an error.
    pub async fn run_loop(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Error waiting for Ctrl-C: {}", err);
            }
        })
        .await
    }

    /// Runs until `shutdown` completes, whether the loop is busy or asleep.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.tick(Instant::now()) => result?,
                _ = &mut shutdown => break,
            }

            let sleep = self.sleep_duration(Instant::now());
            debug!("Sleeping for {}s", sleep.as_secs());
            let request = tokio::select! {
                _ = tokio::time::sleep(sleep) => None,
                request = next_request(&mut self.requests) => Some(request),
                _ = &mut shutdown => break,
            };
            if let Some(request) = request {
                self.request_scan(request, Instant::now());
            }
        }
        info!("Exiting manager event loop");
        Ok(())
    }

    /// One scheduler iteration at `now`.
    pub async fn tick(&mut self, now: Instant) -> Result<(), ScanError> {
        if now >= self.next_sync {
            self.sync_registry(now).await;
        }

        if !self.devices.beacons.is_empty() && now >= self.next_beacon_scan {
            self.scan_beacons(now).await?;
        }

        let request = self.pending_request.take();
        let announcements = self
            .poller
            .poll_due(&self.prober, &mut self.devices.phones, now, request)
            .await;
        self.announce(&announcements).await;
        Ok(())
    }

    async fn sync_registry(&mut self, now: Instant) {
        match registry::sync(&self.directory, &mut self.devices).await {
            Ok(_) if self.devices.is_empty() => {
                debug!(
                    "No devices to search for, retrying in {}s",
                    self.timing.registry_sync_retry.as_secs()
                );
                self.next_sync = now + self.timing.registry_sync_retry;
            }
            Ok(_) => self.next_sync = now + self.timing.registry_sync_period,
            Err(err) => {
                warn!(
                    "Registry sync failed, retrying in {}s: {}",
                    self.timing.registry_sync_retry.as_secs(),
                    err
                );
                self.next_sync = now + self.timing.registry_sync_retry;
            }
        }
    }

    async fn scan_beacons(&mut self, now: Instant) -> Result<(), ScanError> {
        if self.scanner.is_none() {
            self.scanner = Some(self.scan_source.acquire_scanner().await?);
        }
        let Some(scanner) = self.scanner.as_mut() else {
            return Ok(());
        };
        let reports = match scanner
            .read_reports(
                self.timing.beacon_listen_quantity,
                self.timing.beacon_listen_timeout,
            )
            .await
        {
            Ok(reports) => reports,
            Err(err) => {
                warn!("Error reading beacon reports: {}", err);
                Vec::new()
            }
        };
        debug!("Received {} beacon reports", reports.len());

        let announcements = self
            .tracker
            .on_scan_batch(&reports, &mut self.devices.beacons, now);
        self.next_beacon_scan = now + self.timing.beacon_listen_period;
        self.announce(&announcements).await;
        Ok(())
    }

    async fn announce(&self, announcements: &[DeviceAnnouncement]) {
        for announcement in announcements {
            if let Err(err) = self
                .notifier
                .notify_presence(&self.scanner_name, self.timing.found_hold, announcement)
                .await
            {
                warn!(
                    "Failed to report {} {}: {}",
                    announcement.kind, announcement.address, err
                );
            }
        }
    }

    /// Makes the next beacon scan due now; the request itself is handed
    /// to the poller on the next tick.
    pub fn request_scan(&mut self, request: ScanRequest, now: Instant) {
        info!("Received {:?} scan request", request);
        self.pending_request = Some(request);
        self.next_beacon_scan = now;
    }

    /// Earliest time any scheduled work is due.
    pub fn next_wake(&self, now: Instant) -> Instant {
        let mut wake = self.next_sync;
        if !self.devices.beacons.is_empty() {
            wake = wake.min(self.next_beacon_scan);
        }
        if let Some(poll) = self.devices.next_phone_poll(now) {
            wake = wake.min(poll);
        }
        wake
    }

    pub fn sleep_duration(&self, now: Instant) -> Duration {
        if self.pending_request.is_some() {
            return Duration::ZERO;
        }
        ceil_secs(self.next_wake(now).saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use mac_address::MacAddress;
    use tokio::sync::oneshot;

    use super::*;
    use crate::devices::BeaconKey;
    use crate::messages::DevicePresence;
    use crate::probe::ProbeOutcome;
    use crate::registry::DirectoryEntry;
    use crate::scanner::ScanReport;
    use crate::testing::{FakeDirectory, FakeProber, FakeScanSource, RecordingNotifier};

    type TestManager = Manager<FakeDirectory, RecordingNotifier, FakeScanSource, FakeProber>;

    const BEACON: &str = "AA:BB:CC:DD:EE:FF";
    const PHONE: &str = "11:22:33:44:55:66";

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn build(entries: Option<Vec<DirectoryEntry>>) -> (TestManager, Instant) {
        let directory = FakeDirectory::default();
        directory.set(entries);
        let manager = Manager::new(
            directory,
            RecordingNotifier::default(),
            FakeScanSource::default(),
            FakeProber::default(),
            Timing::default(),
            "Basement".to_string(),
        );
        (manager, Instant::now())
    }

    fn beacon_entry() -> DirectoryEntry {
        DirectoryEntry::presence_sensor("7", BEACON, "ibeacon")
    }

    fn phone_entry() -> DirectoryEntry {
        DirectoryEntry::presence_sensor("8", PHONE, "bluetooth")
    }

    fn sighting() -> ScanReport {
        ScanReport {
            address: BEACON.parse().unwrap(),
            beacon: None,
            rssi: Some(-65),
        }
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), Duration::ZERO);
        assert_eq!(ceil_secs(Duration::from_millis(1)), secs(1));
        assert_eq!(ceil_secs(Duration::from_millis(9_400)), secs(10));
        assert_eq!(ceil_secs(secs(4)), secs(4));
    }

    #[tokio::test]
    async fn test_beacon_arrives_and_departs() {
        let (mut manager, t0) = build(Some(vec![beacon_entry()]));
        let key = BeaconKey::normalize(BEACON);

        manager.scan_source.push(vec![sighting(), sighting()]);
        manager.tick(t0).await.unwrap();
        let sent = manager.notifier.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].controller_id, "7");
        assert_eq!(sent[0].presence, DevicePresence::Present(Some(-65)));
        assert_eq!(manager.scan_source.acquired, 1);

        // next scan is one listen period later, inside the idle window
        assert_eq!(manager.next_wake(t0), t0 + secs(10));
        manager.scan_source.push(vec![sighting()]);
        manager.tick(t0 + secs(10)).await.unwrap();
        assert!(manager.notifier.take().is_empty());
        assert_eq!(manager.devices.beacons[&key].last_seen, Some(t0 + secs(10)));

        manager.tick(t0 + secs(100)).await.unwrap();
        assert!(manager.devices.beacons[&key].present);

        manager.tick(t0 + secs(131)).await.unwrap();
        let sent = manager.notifier.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].presence, DevicePresence::Absent);
        assert!(!manager.devices.beacons[&key].present);
        assert_eq!(manager.scan_source.acquired, 1);
    }

    #[tokio::test]
    async fn test_scan_not_due_is_skipped() {
        let (mut manager, t0) = build(Some(vec![beacon_entry()]));
        manager.tick(t0).await.unwrap();

        manager.scan_source.push(vec![sighting()]);
        manager.tick(t0 + secs(5)).await.unwrap();
        assert!(manager.notifier.take().is_empty());
        assert_eq!(manager.scan_source.batches.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_backs_off_without_radio() {
        let (mut manager, t0) = build(Some(vec![]));
        manager.scan_source.radio_missing = true;

        manager.tick(t0).await.unwrap();
        assert!(manager.devices.is_empty());
        assert_eq!(manager.next_wake(t0), t0 + secs(10));
        assert_eq!(manager.sleep_duration(t0), secs(10));

        // nothing happens until the retry is due
        manager.tick(t0 + secs(5)).await.unwrap();
        assert_eq!(manager.directory.fetches(), 1);

        manager.directory.set(Some(vec![phone_entry()]));
        manager.tick(t0 + secs(10)).await.unwrap();
        assert_eq!(manager.directory.fetches(), 2);
        assert_eq!(manager.devices.phones.len(), 1);
        assert_eq!(manager.prober.calls(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_registry_keeps_devices() {
        let (mut manager, t0) = build(Some(vec![beacon_entry(), phone_entry()]));
        manager.tick(t0).await.unwrap();
        assert_eq!(manager.next_wake(t0), t0 + secs(10));

        manager.directory.set(None);
        manager.tick(t0 + secs(600)).await.unwrap();
        assert_eq!(manager.devices.beacons.len(), 1);
        assert_eq!(manager.devices.phones.len(), 1);
        // retried on the short period
        assert_eq!(manager.next_sync, t0 + secs(610));
    }

    #[tokio::test]
    async fn test_missing_radio_is_fatal_only_for_beacons() {
        let (mut manager, t0) = build(Some(vec![phone_entry()]));
        manager.scan_source.radio_missing = true;
        assert!(manager.tick(t0).await.is_ok());

        let (mut manager, t0) = build(Some(vec![beacon_entry()]));
        manager.scan_source.radio_missing = true;
        let err = manager.tick(t0).await.unwrap_err();
        assert!(matches!(err, ScanError::NoAdapter));
    }

    #[tokio::test]
    async fn test_scan_read_failure_is_transient() {
        let (mut manager, t0) = build(Some(vec![beacon_entry()]));
        manager.scan_source.batches.borrow_mut().push_back(None);
        manager.tick(t0).await.unwrap();
        assert!(manager.notifier.take().is_empty());
        assert_eq!(manager.next_beacon_scan, t0 + secs(10));

        manager.scan_source.push(vec![sighting()]);
        manager.tick(t0 + secs(10)).await.unwrap();
        assert_eq!(manager.notifier.take().len(), 1);
    }

    #[tokio::test]
    async fn test_phone_schedule_drives_wake_time() {
        let (mut manager, t0) = build(Some(vec![phone_entry()]));
        let phone: MacAddress = PHONE.parse().unwrap();
        manager.prober.push(phone, ProbeOutcome::Found(Some(-1)));

        manager.tick(t0).await.unwrap();
        assert_eq!(manager.notifier.take().len(), 1);
        // beacon scan deadline is ignored without beacons
        assert_eq!(manager.next_wake(t0), t0 + secs(60));

        manager.tick(t0 + secs(60)).await.unwrap();
        assert!(manager.notifier.take().is_empty());
        assert_eq!(manager.next_wake(t0 + secs(60)), t0 + secs(70));
        assert_eq!(manager.prober.calls(), 2);
    }

    #[tokio::test]
    async fn test_scan_request_expedites_work() {
        let (mut manager, t0) = build(Some(vec![beacon_entry(), phone_entry()]));
        manager.tick(t0).await.unwrap();
        assert_eq!(manager.prober.calls(), 1);

        manager.request_scan(ScanRequest::Arrive, t0 + secs(2));
        assert_eq!(manager.sleep_duration(t0 + secs(2)), Duration::ZERO);

        manager.scan_source.push(vec![sighting()]);
        manager.tick(t0 + secs(2)).await.unwrap();
        assert_eq!(manager.prober.calls(), 2);
        assert!(manager.devices.beacons[&BeaconKey::normalize(BEACON)].present);
        assert!(manager.pending_request.is_none());
    }

    #[tokio::test]
    async fn test_run_loop_ends_on_closed_radio() {
        let (mut manager, _) = build(Some(vec![beacon_entry()]));
        manager.scan_source.radio_missing = true;
        let (tx, rx) = broadcast::channel(4);
        drop(tx);
        let result = manager.with_scan_requests(rx).run_loop().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let (manager, _) = build(Some(vec![phone_entry()]));
        let (tx, rx) = oneshot::channel::<()>();
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(()).unwrap();
        };
        let run = manager.run_until(async {
            let _ = rx.await;
        });
        // the next phone poll is ten seconds away
        let (result, ()) = tokio::time::timeout(secs(5), async { tokio::join!(run, stop) })
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_busy_tick() {
        let (manager, _) = build(Some(vec![phone_entry()]));
        // the registry never answers
        manager.directory.stall();
        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        let result = tokio::time::timeout(secs(5), manager.run_until(shutdown))
            .await
            .unwrap();
        assert!(result.is_ok());
    }
}
