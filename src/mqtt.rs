use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::config;
use crate::messages::{DeviceAnnouncement, DevicePresence, ScanRequest};
use crate::notify::{Notifier, NotifyError};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage<'a> {
    #[serde(rename = "id")]
    address: &'a str,
    #[serde(rename = "device")]
    controller_id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    confidence: u8,
    scanner: &'a str,
    hold_time: u64,
    rssi: Option<i16>,
    retained: bool,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"presence-rs".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("monitor".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(format!("{}/scan/arrive", self.topic_path), QoS::AtMostOnce),
                SubscribeFilter::new(format!("{}/scan/depart", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    /// Drives the MQTT connection, forwarding scan requests to `tx`.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<ScanRequest>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(request) = scan_request(&p.topic) else {
                            continue;
                        };
                        if let Err(err) = tx.send(request) {
                            error!("Error forwarding scan request: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

impl Notifier for MqttClient {
    async fn notify_presence(
        &self,
        scanner_name: &str,
        hold_time: Duration,
        announcement: &DeviceAnnouncement,
    ) -> Result<(), NotifyError> {
        let confidence = if announcement.is_present() { 100 } else { 0 };
        info!(
            "Announcing {} {} (confidence: {}) on MQTT",
            announcement.kind, announcement.address, confidence
        );
        let message = device_message(scanner_name, hold_time, announcement);
        let payload = serde_json::to_string(&message)?;
        self.client
            .publish(
                format!(
                    "{}/{}/{}",
                    self.topic_path,
                    self.publisher_id,
                    sanitize_name(&announcement.address)
                ),
                QoS::AtMostOnce,
                false,
                payload,
            )
            .await?;
        Ok(())
    }
}

fn device_message<'a>(
    scanner_name: &'a str,
    hold_time: Duration,
    announcement: &'a DeviceAnnouncement,
) -> DeviceMqttMessage<'a> {
    let (confidence, rssi, hold_time) = match announcement.presence {
        DevicePresence::Present(rssi) => (100, rssi, hold_time.as_secs()),
        DevicePresence::Absent => (0, None, 0),
    };
    DeviceMqttMessage {
        address: &announcement.address,
        controller_id: &announcement.controller_id,
        kind: announcement.kind.as_str(),
        confidence,
        scanner: scanner_name,
        hold_time,
        rssi,
        retained: false,
    }
}

fn scan_request(topic: &str) -> Option<ScanRequest> {
    match topic {
        t if t.ends_with("/scan/arrive") => Some(ScanRequest::Arrive),
        t if t.ends_with("/scan/depart") => Some(ScanRequest::Depart),
        _ => None,
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
