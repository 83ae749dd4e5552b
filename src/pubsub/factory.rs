//! Fan-out client construction
//!
//! Every configured broker becomes one member: a raw transport client from
//! a [`TransportFactory`], wrapped in a [`RateLimitedClient`] sized by the
//! broker's expected request rate, named `<type>::<host>`.

use tracing::info;

use super::{MemberEntry, PubSubClient, PubSubError, RedundantPubSubClient};
use crate::config::{Config, ConfigError, ResolvedBroker};
use crate::mqtt::{MqttClient, MqttOptions};
use crate::ratelimit::RateLimitedClient;

/// Builds the raw transport client for one broker
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        broker: &ResolvedBroker,
        config: &Config,
    ) -> Result<Box<dyn PubSubClient>, PubSubError>;
}

/// Spawns an [`MqttClient`] per broker. Needs a Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    fn create(
        &self,
        broker: &ResolvedBroker,
        config: &Config,
    ) -> Result<Box<dyn PubSubClient>, PubSubError> {
        let options = MqttOptions::from_config(broker, &config.client)
            .map_err(|e| PubSubError::InvalidConfig(format!("'{}': {}", broker.name, e)))?;
        Ok(Box::new(MqttClient::spawn(options)))
    }
}

/// Build the fan-out client over `brokers`, in order
pub fn create_redundant_client<F>(
    brokers: &[ResolvedBroker],
    config: &Config,
    factory: &F,
) -> Result<RedundantPubSubClient, PubSubError>
where
    F: TransportFactory + ?Sized,
{
    let members = brokers
        .iter()
        .map(|broker| {
            let client = factory.create(broker, config)?;
            let limited = RateLimitedClient::new(
                client,
                broker.expected_requests_per_second_per_topic,
                config.rate_limit.clone(),
            );
            Ok(MemberEntry::new(broker.name.clone(), Box::new(limited)))
        })
        .collect::<Result<Vec<_>, PubSubError>>()?;

    RedundantPubSubClient::new(members)
}

/// Build the fan-out client from the broker list in the environment.
///
/// `Ok(None)` when no broker list is configured. Configuration problems,
/// including a certificate variable that is not set, fail before any
/// connection is attempted.
pub fn create_redundant_client_from_env(
    config: &Config,
) -> Result<Option<RedundantPubSubClient>, ConfigError> {
    let Some(brokers) = config.brokers()? else {
        info!(
            "'{}' is not set, redundant pub/sub client disabled",
            config.pub_sub.env_var
        );
        return Ok(None);
    };

    create_redundant_client(&brokers, config, &MqttTransportFactory)
        .map(Some)
        .map_err(|e| ConfigError::Validation(e.to_string()))
}
