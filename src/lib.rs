//! FanMQ - Redundant MQTT publish/subscribe client
//!
//! Publishes and subscribes through several independent MQTT v5 brokers at
//! once. An operation succeeds as long as one broker accepts it, and only
//! reports failure, with every broker's reason, when all of them failed.

pub mod codec;
pub mod config;
pub mod mqtt;
pub mod protocol;
pub mod pubsub;
pub mod ratelimit;
pub mod topic;
pub mod transport;

pub use config::Config;
pub use mqtt::{MqttClient, MqttOptions};
pub use protocol::QoS;
pub use pubsub::{
    create_redundant_client, create_redundant_client_from_env, AggregateError, ContentType,
    PubSubClient, PubSubError, PubSubPayload, RedundantPubSubClient, SubscribeCallback,
};
pub use ratelimit::RateLimitedClient;
