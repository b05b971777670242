use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::messages::DeviceAnnouncement;
use crate::mqtt::MqttClient;
use crate::vera::VeraClient;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("controller request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("controller replied with HTTP status {0}")]
    Status(u16),
    #[error("MQTT publish failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("could not encode announcement: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination of presence notifications.
pub trait Notifier {
    async fn notify_presence(
        &self,
        scanner_name: &str,
        hold_time: Duration,
        announcement: &DeviceAnnouncement,
    ) -> Result<(), NotifyError>;
}

/// Sends each announcement to every configured sink. A failing sink does
/// not stop the others.
#[derive(Clone, Debug, Default)]
pub struct Notifiers {
    pub vera: Option<VeraClient>,
    pub mqtt: Option<MqttClient>,
}

impl Notifier for Notifiers {
    async fn notify_presence(
        &self,
        scanner_name: &str,
        hold_time: Duration,
        announcement: &DeviceAnnouncement,
    ) -> Result<(), NotifyError> {
        let mut result = Ok(());
        if let Some(vera) = &self.vera {
            if let Err(err) = vera.notify_presence(scanner_name, hold_time, announcement).await {
                result = Err(err);
            }
        }
        if let Some(mqtt) = &self.mqtt {
            if let Err(err) = mqtt.notify_presence(scanner_name, hold_time, announcement).await {
                // only one error goes back to the caller
                if result.is_ok() {
                    result = Err(err);
                } else {
                    warn!("Error announcing {} on MQTT: {}", announcement.address, err);
                }
            }
        }
        if self.vera.is_none() && self.mqtt.is_none() {
            info!(
                "{} {} is {}",
                announcement.kind,
                announcement.address,
                if announcement.is_present() { "present" } else { "absent" }
            );
        }
        result
    }
}
