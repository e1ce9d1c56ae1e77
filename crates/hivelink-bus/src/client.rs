//! MQTT client over rumqttc.
//!
//! One persistent connection per bridge process. A spawned task drives the
//! rumqttc event loop: inbound publishes are forwarded to an mpsc channel
//! for the consumer loop, and connection errors trigger a sleep-and-repoll
//! cycle so the connection heals without any core-level signalling. Message
//! handlers must tolerate redelivery during reconnect windows; the transport
//! is at-least-once, not exactly-once.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{BusError, Result};
use crate::publisher::{MessagePublisher, Qos};

/// An inbound message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Full topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusClientConfig {
    /// Broker host.
    pub broker: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client id. A random one is generated when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Delay before re-polling after a connection error, in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Inbound channel capacity.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_reconnect_delay() -> u64 {
    1_000
}

fn default_channel_capacity() -> usize {
    1_024
}

impl BusClientConfig {
    /// Create a configuration for the given broker host.
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_ms: default_reconnect_delay(),
            channel_capacity: default_channel_capacity(),
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set credentials.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Handle to the broker connection.
///
/// Cloning is cheap; all clones share the same underlying connection.
#[derive(Clone)]
pub struct BusClient {
    client: AsyncClient,
}

impl BusClient {
    /// Connect to the broker.
    ///
    /// Returns the client handle plus the inbound message stream. The event
    /// loop task runs until the returned receiver and all client clones are
    /// dropped.
    pub fn connect(config: BusClientConfig) -> (Self, mpsc::Receiver<InboundMessage>) {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("hivelink_{}", uuid::Uuid::new_v4()));

        let mut opts = MqttOptions::new(client_id, &config.broker, config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            opts.set_credentials(username, password);
        }

        let (client, mut event_loop) = AsyncClient::new(opts, config.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);

        let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        };
                        if inbound_tx.send(msg).await.is_err() {
                            debug!("inbound channel closed, stopping bus event loop");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("broker connection established");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("bus connection error: {e}, re-polling in {reconnect_delay:?}");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });

        (Self { client }, inbound_rx)
    }

    /// Subscribe to a topic pattern.
    pub async fn subscribe(&self, pattern: &str, qos: Qos) -> Result<()> {
        self.client
            .subscribe(pattern, qos.into())
            .await
            .map_err(|e| BusError::ConnectionReset(e.to_string()))
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BusError::ConnectionReset(e.to_string()))
    }
}

#[async_trait::async_trait]
impl MessagePublisher for BusClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
        self.client
            .publish(topic, qos.into(), false, payload)
            .await
            .map_err(|e| BusError::ConnectionReset(e.to_string()))
    }
}
