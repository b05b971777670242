//! HTTP client for a Vera home-automation controller, which acts as both
//! the device registry and the destination of presence notifications.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use serde_derive::Deserialize;
use serde_json::Value;

use crate::config::VeraConfig;
use crate::messages::DeviceAnnouncement;
use crate::notify::{Notifier, NotifyError};
use crate::registry::{Directory, DirectoryEntry, RegistryError};

/// Service id under which presence sensor variables and actions live.
pub const PRESENCE_SERVICE_ID: &str = "urn:afoyi-com:serviceId:PresenceSensor1";

const NOTIFY_ATTEMPTS: usize = 2;

#[derive(Deserialize, Debug)]
struct UserData {
    #[serde(default)]
    devices: Vec<VeraDevice>,
}

#[derive(Deserialize, Debug)]
struct VeraDevice {
    id: Value,
    #[serde(default)]
    device_type: String,
    #[serde(default)]
    states: Vec<VeraState>,
}

#[derive(Deserialize, Debug)]
struct VeraState {
    service: String,
    variable: String,
    value: Value,
}

/// Vera mixes strings and numbers freely for ids and values.
fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn directory_entry(device: VeraDevice) -> DirectoryEntry {
    let attributes: HashMap<String, String> = device
        .states
        .into_iter()
        .filter(|state| state.service == PRESENCE_SERVICE_ID)
        .map(|state| (state.variable, value_string(&state.value)))
        .collect();
    DirectoryEntry {
        id: value_string(&device.id),
        kind: device.device_type,
        attributes,
    }
}

pub fn parse_user_data(body: &str) -> Result<Vec<DirectoryEntry>, serde_json::Error> {
    let data: UserData = serde_json::from_str(body)?;
    Ok(data.devices.into_iter().map(directory_entry).collect())
}

/// Value of the `SetPresent` action: `<scanner>,<hold seconds>,<detail>`.
/// Absence is sent with a zero hold time.
pub fn present_value(
    scanner_name: &str,
    hold_time: Duration,
    announcement: &DeviceAnnouncement,
) -> String {
    let hold = if announcement.is_present() {
        hold_time.as_secs()
    } else {
        0
    };
    format!("{},{},{}", scanner_name, hold, announcement.detail())
}

#[derive(Clone, Debug)]
pub struct VeraClient {
    client: reqwest::Client,
    base_url: String,
}

impl VeraClient {
    pub fn new(config: &VeraConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds.unwrap_or(5)))
            .build()?;
        Ok(VeraClient {
            client,
            base_url: format!("http://{}:{}", config.host, config.port.unwrap_or(3480)),
        })
    }

    async fn data_request(&self, query: &[(&str, &str)]) -> Result<String, RegistryError> {
        let response = self
            .client
            .get(format!("{}/data_request", self.base_url))
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }

    async fn set_present(&self, device_id: &str, value: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .get(format!("{}/data_request", self.base_url))
            .query(&[
                ("id", "action"),
                ("DeviceNum", device_id),
                ("serviceId", PRESENCE_SERVICE_ID),
                ("action", "SetPresent"),
                ("newPresentValue", value),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

impl Directory for VeraClient {
    async fn fetch_devices(&self) -> Result<Vec<DirectoryEntry>, RegistryError> {
        debug!("Checking Vera device list");
        let body = self.data_request(&[("id", "user_data")]).await?;
        Ok(parse_user_data(&body)?)
    }
}

impl Notifier for VeraClient {
    async fn notify_presence(
        &self,
        scanner_name: &str,
        hold_time: Duration,
        announcement: &DeviceAnnouncement,
    ) -> Result<(), NotifyError> {
        let value = present_value(scanner_name, hold_time, announcement);
        let mut result = Ok(());
        for attempt in 1..=NOTIFY_ATTEMPTS {
            result = self.set_present(&announcement.controller_id, &value).await;
            match &result {
                Ok(()) => break,
                Err(err) => debug!(
                    "Failed to notify Vera of {} (attempt {}): {}",
                    announcement.address, attempt, err
                ),
            }
        }
        result
    }
}
