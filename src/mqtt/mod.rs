//! MQTT v5 Transport Client
//!
//! [`MqttClient`] implements [`PubSubClient`](crate::pubsub::PubSubClient)
//! against a single broker. A background task owns the connection: it
//! connects, restores subscriptions, serves commands from the client handle,
//! dispatches inbound messages and reconnects with exponential backoff.

mod client;
mod connection;
mod registry;

pub use client::MqttClient;
pub use registry::SubscriptionRegistry;

use std::time::Duration;

use uuid::Uuid;

use crate::config::{ClientConfig, ResolvedBroker};
use crate::protocol::QoS;
use crate::transport::{BrokerAuth, Endpoint, TransportError};

/// Connection state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Opening the stream or waiting for CONNACK
    Connecting,
    /// CONNACK received; commands are served
    Connected,
    /// Waiting before the next connection attempt
    Backoff,
    /// Stopped for good
    Stopped,
}

/// Settings of one broker connection
#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// Name used in logs
    pub name: String,
    pub endpoint: Endpoint,
    pub auth: BrokerAuth,
    pub client_id: String,
    /// Keep alive in seconds; 0 disables PINGREQ
    pub keep_alive: u16,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub command_channel_capacity: usize,
    pub qos: QoS,
}

impl MqttOptions {
    /// Options with the default client settings
    pub fn new(name: impl Into<String>, endpoint: Endpoint, auth: BrokerAuth) -> Self {
        Self::with_client_config(name, endpoint, auth, &ClientConfig::default())
    }

    fn with_client_config(
        name: impl Into<String>,
        endpoint: Endpoint,
        auth: BrokerAuth,
        client: &ClientConfig,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            auth,
            client_id: generate_client_id(&client.client_id_prefix),
            keep_alive: client.keep_alive_secs(),
            connect_timeout: client.connect_timeout,
            ack_timeout: client.ack_timeout,
            reconnect_interval: client.reconnect_interval,
            max_reconnect_interval: client.max_reconnect_interval,
            command_channel_capacity: client.command_channel_capacity.max(1),
            qos: client.qos(),
        }
    }

    /// Options for a configured broker. The endpoint scheme comes from the
    /// host string, or from the broker's authentication kind when absent.
    pub fn from_config(broker: &ResolvedBroker, client: &ClientConfig) -> Result<Self, TransportError> {
        let endpoint = Endpoint::parse(&broker.host, broker.auth.default_scheme())?;
        Ok(Self::with_client_config(
            broker.name.clone(),
            endpoint,
            broker.auth.clone(),
            client,
        ))
    }
}

/// `<prefix>-<uuid>`, or just the uuid for an empty prefix
fn generate_client_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    if prefix.is_empty() {
        id
    } else {
        format!("{}-{}", prefix, id)
    }
}
