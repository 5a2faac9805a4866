//! MQTT binding for the OCR backend protocol.
//!
//! Outbound messages are published as JSON on the request topic. The event
//! pump polls the broker connection, subscribes to the event topic once
//! connected and forwards decoded events to the orchestrator.

use crate::config::MqttConfig;
use crate::error::TransportError;
use crate::protocol::{InboundEvent, OutboundMessage};
use crate::transport::Transport;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Publishes orchestrator requests to the broker
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    request_topic: String,
}

impl MqttTransport {
    /// Create the transport and the pump that must be run to drive the connection
    pub fn new(config: &MqttConfig) -> (Self, MqttEventPump) {
        let mut mqttoptions =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(mqttoptions, 10);

        let pump = MqttEventPump {
            client: client.clone(),
            eventloop,
            event_topic: config.event_topic.clone(),
        };

        (
            Self {
                client,
                request_topic: config.request_topic.clone(),
            },
            pump,
        )
    }
}

impl Transport for MqttTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let payload = message.encode()?;
        tracing::debug!(
            job_id = %message.job_id(),
            kind = message.kind(),
            payload_size = payload.len(),
            "Publishing to OCR backend"
        );
        self.client
            .publish(self.request_topic.clone(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|source| TransportError::Publish {
                topic: self.request_topic.clone(),
                source,
            })
    }
}

/// Drives the MQTT connection and decodes backend events
pub struct MqttEventPump {
    client: AsyncClient,
    eventloop: EventLoop,
    event_topic: String,
}

impl MqttEventPump {
    async fn subscribe(
        client: &AsyncClient,
        event_topic: &str,
    ) -> Result<(), rumqttc::ClientError> {
        tracing::info!("Subscribing to OCR event topic: {}", event_topic);
        client.subscribe(event_topic, QoS::AtLeastOnce).await
    }

    /// Run until the inbound receiver is dropped
    pub async fn run(mut self, inbound: mpsc::UnboundedSender<InboundEvent>) {
        tracing::info!("MQTT event pump started");

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic != self.event_topic {
                        continue;
                    }
                    match InboundEvent::decode(&publish.payload) {
                        Ok(event) => {
                            if inbound.send(event).is_err() {
                                tracing::info!("Orchestrator gone, stopping MQTT event pump");
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                payload_size = publish.payload.len(),
                                "Dropping undecodable OCR event: {}",
                                e
                            );
                        }
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("Connected to MQTT broker");

                    // Subscriptions do not survive a clean reconnect
                    if let Err(e) = Self::subscribe(&self.client, &self.event_topic).await {
                        tracing::error!("Failed to subscribe to OCR events after connection: {}", e);
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    tracing::info!("Disconnected from MQTT broker");
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    tracing::info!("Subscribed to OCR events: {:?}", suback);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("MQTT connection error: {}", e);
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }
}
