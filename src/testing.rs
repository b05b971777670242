//! In-process stand-ins for the radio, the registry and the controller.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use mac_address::MacAddress;

use crate::messages::DeviceAnnouncement;
use crate::notify::{Notifier, NotifyError};
use crate::probe::{ProbeOutcome, Prober};
use crate::registry::{Directory, DirectoryEntry, RegistryError};
use crate::scanner::{ScanError, ScanReport, ScanSource, Scanner};

/// Serves a fixed listing, or fails with HTTP 503 when `entries` is `None`.
/// A stalled directory never answers.
#[derive(Default)]
pub struct FakeDirectory {
    pub entries: RefCell<Option<Vec<DirectoryEntry>>>,
    fetches: Cell<usize>,
    stalled: Cell<bool>,
}

impl FakeDirectory {
    pub fn with_entries(entries: Vec<DirectoryEntry>) -> Self {
        FakeDirectory {
            entries: RefCell::new(Some(entries)),
            ..FakeDirectory::default()
        }
    }

    pub fn unreachable() -> Self {
        FakeDirectory::default()
    }

    pub fn set(&self, entries: Option<Vec<DirectoryEntry>>) {
        *self.entries.borrow_mut() = entries;
    }

    pub fn stall(&self) {
        self.stalled.set(true);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.get()
    }
}

impl Directory for FakeDirectory {
    async fn fetch_devices(&self) -> Result<Vec<DirectoryEntry>, RegistryError> {
        self.fetches.set(self.fetches.get() + 1);
        if self.stalled.get() {
            std::future::pending::<()>().await;
        }
        self.entries.borrow().clone().ok_or(RegistryError::Status(503))
    }
}

/// Answers from per-address queues; an empty queue means absent.
#[derive(Default)]
pub struct FakeProber {
    outcomes: RefCell<HashMap<MacAddress, VecDeque<ProbeOutcome>>>,
    calls: RefCell<Vec<MacAddress>>,
}

impl FakeProber {
    pub fn push(&self, address: MacAddress, outcome: ProbeOutcome) {
        self.outcomes
            .borrow_mut()
            .entry(address)
            .or_default()
            .push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn calls_for(&self, address: &MacAddress) -> usize {
        self.calls.borrow().iter().filter(|a| *a == address).count()
    }
}

impl Prober for FakeProber {
    async fn probe(&self, address: &MacAddress) -> ProbeOutcome {
        self.calls.borrow_mut().push(*address);
        self.outcomes
            .borrow_mut()
            .get_mut(address)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ProbeOutcome::Absent)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: RefCell<Vec<DeviceAnnouncement>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<DeviceAnnouncement> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }
}

impl Notifier for RecordingNotifier {
    async fn notify_presence(
        &self,
        _scanner_name: &str,
        _hold_time: Duration,
        announcement: &DeviceAnnouncement,
    ) -> Result<(), NotifyError> {
        self.sent.borrow_mut().push(announcement.clone());
        Ok(())
    }
}

/// Hands out scanners that replay queued batches; `None` in the queue
/// simulates a read failure.
#[derive(Default)]
pub struct FakeScanSource {
    pub batches: Rc<RefCell<VecDeque<Option<Vec<ScanReport>>>>>,
    pub radio_missing: bool,
    pub acquired: usize,
}

impl FakeScanSource {
    pub fn push(&self, batch: Vec<ScanReport>) {
        self.batches.borrow_mut().push_back(Some(batch));
    }
}

impl ScanSource for FakeScanSource {
    type Scanner = FakeScanner;

    async fn acquire_scanner(&mut self) -> Result<FakeScanner, ScanError> {
        if self.radio_missing {
            return Err(ScanError::NoAdapter);
        }
        self.acquired += 1;
        Ok(FakeScanner {
            batches: Rc::clone(&self.batches),
        })
    }
}

pub struct FakeScanner {
    batches: Rc<RefCell<VecDeque<Option<Vec<ScanReport>>>>>,
}

impl Scanner for FakeScanner {
    async fn read_reports(
        &mut self,
        max_count: usize,
        _timeout: Duration,
    ) -> Result<Vec<ScanReport>, ScanError> {
        match self.batches.borrow_mut().pop_front() {
            Some(Some(mut batch)) => {
                batch.truncate(max_count);
                Ok(batch)
            }
            Some(None) => Err(ScanError::Read(btleplug::Error::NotConnected)),
            None => Ok(Vec::new()),
        }
    }
}
