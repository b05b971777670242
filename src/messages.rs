use std::fmt;

/// On-demand scan requests received from the controller side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanRequest {
    /// Look for devices that are currently absent.
    Arrive,
    /// Re-check devices that are currently present.
    Depart,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    IBeacon,
    Bluetooth,
}

impl DeviceKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ibeacon" => Some(DeviceKind::IBeacon),
            "bluetooth" => Some(DeviceKind::Bluetooth),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::IBeacon => "ibeacon",
            DeviceKind::Bluetooth => "bluetooth",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DevicePresence {
    Present(/* signal strength */ Option<i16>),
    Absent,
}

/// A presence notification bound for the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAnnouncement {
    pub controller_id: String,
    pub address: String,
    pub kind: DeviceKind,
    pub presence: DevicePresence,
}

impl DeviceAnnouncement {
    pub fn is_present(&self) -> bool {
        matches!(self.presence, DevicePresence::Present(_))
    }

    /// Trailing field of the controller's presence value: the signal
    /// strength when known, empty otherwise.
    pub fn detail(&self) -> String {
        match self.presence {
            DevicePresence::Present(Some(rssi)) => rssi.to_string(),
            _ => String::new(),
        }
    }
}
