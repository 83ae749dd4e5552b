//! MQTT client handle

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info};

use super::connection::{Command, Connection};
use super::{ConnectionStatus, MqttOptions, SubscriptionRegistry};
use crate::protocol::{Properties, Publish, QoS, ReasonCode, SubscriptionOptions, Subscription};
use crate::pubsub::{ContentType, PubSubClient, PubSubError, PubSubPayload, SubscribeCallback};
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Handle to a background MQTT connection
///
/// Cheap operations on the handle send commands to the connection task and
/// wait for the broker's acknowledgement, bounded by the ack timeout.
pub struct MqttClient {
    name: String,
    qos: QoS,
    connect_timeout: Duration,
    ack_timeout: Duration,
    status: watch::Receiver<ConnectionStatus>,
    registry: Arc<RwLock<SubscriptionRegistry>>,
    command_tx: mpsc::Sender<Command>,
    stop_tx: watch::Sender<bool>,
}

impl MqttClient {
    /// Start the connection task and return immediately.
    ///
    /// Must be called within a Tokio runtime.
    pub fn spawn(options: MqttOptions) -> Self {
        let (command_tx, command_rx) = mpsc::channel(options.command_channel_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let registry = Arc::new(RwLock::new(SubscriptionRegistry::new()));

        let client = Self {
            name: options.name.clone(),
            qos: options.qos,
            connect_timeout: options.connect_timeout,
            ack_timeout: options.ack_timeout,
            status: status_rx,
            registry: registry.clone(),
            command_tx,
            stop_tx,
        };

        info!(
            "'{}': starting client {} for {}",
            options.name, options.client_id, options.endpoint
        );
        let connection = Connection::new(options, status_tx, registry, command_rx, stop_rx);
        tokio::spawn(connection.run());

        client
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Filters currently registered, in sorted order
    pub fn subscriptions(&self) -> Vec<String> {
        self.registry.read().filters()
    }

    /// Wait until the first connection attempt has settled, then require
    /// a live connection.
    async fn ready(&self) -> Result<(), PubSubError> {
        if *self.stop_tx.borrow() {
            return Err(PubSubError::Stopped);
        }

        let mut status = self.status.clone();
        let settled = timeout(
            self.connect_timeout,
            status.wait_for(|s| *s != ConnectionStatus::Connecting),
        )
        .await;

        match settled {
            Ok(Ok(state)) if *state == ConnectionStatus::Connected => Ok(()),
            Ok(Ok(state)) if *state == ConnectionStatus::Stopped => Err(PubSubError::Stopped),
            Ok(Err(_)) => Err(PubSubError::Stopped),
            _ => Err(PubSubError::ConnectionLost(format!(
                "'{}' is not connected",
                self.name
            ))),
        }
    }

    fn submit(&self, command: Command) -> Result<(), PubSubError> {
        self.command_tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => PubSubError::QueueFull,
            TrySendError::Closed(_) => PubSubError::Stopped,
        })
    }

    async fn await_reply<T>(
        &self,
        reply: oneshot::Receiver<Result<T, PubSubError>>,
    ) -> Result<T, PubSubError> {
        match timeout(self.ack_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PubSubError::ConnectionLost(
                "connection closed before acknowledgement".to_string(),
            )),
            Err(_) => Err(PubSubError::Timeout),
        }
    }

    /// Send a SUBSCRIBE or UNSUBSCRIBE and collect per-filter reason codes
    async fn request_codes(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<Vec<ReasonCode>, PubSubError>>) -> Command,
    ) -> Result<Vec<ReasonCode>, PubSubError> {
        self.ready().await?;
        let (tx, rx) = oneshot::channel();
        self.submit(make(tx))?;
        self.await_reply(rx).await
    }
}

/// Filters whose reason code is an error, as "filter (reason)"
fn refused_filters(filters: &[String], codes: &[ReasonCode]) -> Vec<String> {
    filters
        .iter()
        .enumerate()
        .filter_map(|(i, filter)| {
            let code = codes.get(i).copied().unwrap_or(ReasonCode::UnspecifiedError);
            code.is_error().then(|| format!("{} ({})", filter, code))
        })
        .collect()
}

#[async_trait]
impl PubSubClient for MqttClient {
    fn unique_name(&self) -> &str {
        &self.name
    }

    async fn publish(
        &self,
        payloads: &[PubSubPayload],
        content_type: ContentType,
    ) -> Result<(), PubSubError> {
        for payload in payloads {
            validate_topic_name(&payload.topic)
                .map_err(|e| PubSubError::InvalidTopic(format!("'{}': {}", payload.topic, e)))?;
        }
        if payloads.is_empty() {
            return Ok(());
        }
        self.ready().await?;

        let mut replies = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let (tx, rx) = oneshot::channel();
            self.submit(Command::Publish {
                publish: Publish {
                    qos: self.qos,
                    topic: payload.topic.clone(),
                    payload: payload.data.clone(),
                    properties: Properties::with_content_type(content_type.as_str()),
                    ..Default::default()
                },
                reply: tx,
            })?;
            replies.push(rx);
        }

        join_all(replies.into_iter().map(|rx| self.await_reply(rx)))
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()?;

        debug!("'{}': published {} messages", self.name, payloads.len());
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
        on_message: SubscribeCallback,
    ) -> Result<(), PubSubError> {
        for filter in topics {
            validate_topic_filter(filter)
                .map_err(|e| PubSubError::InvalidTopic(format!("'{}': {}", filter, e)))?;
        }
        if topics.is_empty() {
            return Ok(());
        }

        // A filter registered before the connection is up would also be
        // restored on CONNACK and subscribed twice
        self.ready().await?;

        // Registered before SUBSCRIBE so messages right after SUBACK are not missed
        let ids: Vec<u64> = {
            let mut registry = self.registry.write();
            topics
                .iter()
                .map(|filter| registry.add(filter, on_message.clone()))
                .collect()
        };

        let subscriptions: Vec<Subscription> = topics
            .iter()
            .map(|filter| Subscription {
                filter: filter.clone(),
                options: SubscriptionOptions::with_qos(self.qos),
            })
            .collect();
        let result = self
            .request_codes(|reply| Command::Subscribe {
                subscriptions,
                reply,
            })
            .await;

        let codes = match result {
            Ok(codes) => codes,
            Err(e) => {
                let mut registry = self.registry.write();
                for (filter, id) in topics.iter().zip(&ids) {
                    registry.remove(filter, *id);
                }
                return Err(e);
            }
        };

        let refused = refused_filters(topics, &codes);
        if refused.is_empty() {
            debug!("'{}': subscribed to {:?}", self.name, topics);
            return Ok(());
        }

        let mut registry = self.registry.write();
        for (i, (filter, id)) in topics.iter().zip(&ids).enumerate() {
            let code = codes.get(i).copied().unwrap_or(ReasonCode::UnspecifiedError);
            if code.is_error() {
                registry.remove(filter, *id);
            }
        }
        Err(PubSubError::Rejected(format!(
            "subscription refused: {}",
            refused.join(", ")
        )))
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), PubSubError> {
        for filter in topics {
            validate_topic_filter(filter)
                .map_err(|e| PubSubError::InvalidTopic(format!("'{}': {}", filter, e)))?;
        }
        if topics.is_empty() {
            return Ok(());
        }

        // Dropped locally even if the broker cannot be told
        {
            let mut registry = self.registry.write();
            for filter in topics {
                registry.remove_filter(filter);
            }
        }

        let filters = topics.to_vec();
        let codes = self
            .request_codes(|reply| Command::Unsubscribe { filters, reply })
            .await?;

        let refused = refused_filters(topics, &codes);
        if refused.is_empty() {
            debug!("'{}': unsubscribed from {:?}", self.name, topics);
            Ok(())
        } else {
            Err(PubSubError::Rejected(format!(
                "unsubscribe refused: {}",
                refused.join(", ")
            )))
        }
    }

    fn stop(&self) {
        if !self.stop_tx.send_replace(true) {
            info!("'{}': stopping", self.name);
        }
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
