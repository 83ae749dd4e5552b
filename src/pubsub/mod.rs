//! Publish/Subscribe Abstraction
//!
//! [`PubSubClient`] is the contract every transport fulfils: the raw MQTT
//! client, the rate-limited wrapper around it, and the redundant fan-out
//! client built on top of several of them.

mod error;
pub mod factory;
mod redundant;


pub use error::{AggregateError, MemberFailure, PubSubError};
pub use factory::{
    create_redundant_client, create_redundant_client_from_env, MqttTransportFactory,
    TransportFactory,
};
pub use redundant::{MemberEntry, RedundantPubSubClient};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// One message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubPayload {
    pub topic: String,
    pub data: Bytes,
}

impl PubSubPayload {
    pub fn new(topic: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }
}

/// Encoding of published payloads, sent as the MQTT content-type property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentType {
    #[default]
    Json,
    Deflate,
    Binary,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Deflate => "application/deflate",
            ContentType::Binary => "application/octet-stream",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = PubSubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "application/json" => Ok(ContentType::Json),
            "deflate" | "application/deflate" => Ok(ContentType::Deflate),
            "binary" | "application/octet-stream" => Ok(ContentType::Binary),
            other => Err(PubSubError::InvalidConfig(format!(
                "unknown content type '{}'",
                other
            ))),
        }
    }
}

/// Callback invoked with `(topic, payload)` for every received message.
/// It may be called concurrently from several connections.
pub type SubscribeCallback = Arc<dyn Fn(String, Bytes) + Send + Sync>;

/// Publish/subscribe against a broker (or a set of brokers)
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Stable identifier for logs and metrics
    fn unique_name(&self) -> &str;

    /// Publish every payload with the given content type
    async fn publish(
        &self,
        payloads: &[PubSubPayload],
        content_type: ContentType,
    ) -> Result<(), PubSubError>;

    /// Subscribe to `topics`; `on_message` is called for each delivery
    /// for as long as the subscription is active
    async fn subscribe(
        &self,
        topics: &[String],
        on_message: SubscribeCallback,
    ) -> Result<(), PubSubError>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), PubSubError>;

    /// Tear down the connection(s). Never fails; problems are logged.
    fn stop(&self);
}

#[async_trait]
impl<T: PubSubClient + ?Sized> PubSubClient for Box<T> {
    fn unique_name(&self) -> &str {
        (**self).unique_name()
    }

    async fn publish(
        &self,
        payloads: &[PubSubPayload],
        content_type: ContentType,
    ) -> Result<(), PubSubError> {
        (**self).publish(payloads, content_type).await
    }

    async fn subscribe(
        &self,
        topics: &[String],
        on_message: SubscribeCallback,
    ) -> Result<(), PubSubError> {
        (**self).subscribe(topics, on_message).await
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), PubSubError> {
        (**self).unsubscribe(topics).await
    }

    fn stop(&self) {
        (**self).stop()
    }
}
