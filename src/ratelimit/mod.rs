//! Per-Topic Rate Limiting
//!
//! [`RateLimitedClient`] decorates a [`PubSubClient`] with an admission
//! policy on publish. Every topic gets a token bucket refilled at the
//! broker's expected request rate and a circuit breaker that trips after
//! repeated failures. Rejections are returned as errors, never delayed.

mod breaker;
mod bucket;


pub use breaker::{CircuitBreaker, CircuitState};
pub use bucket::TokenBucket;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::pubsub::{ContentType, PubSubClient, PubSubError, PubSubPayload, SubscribeCallback};

/// Rate limiting configuration shared by all brokers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity as a multiple of the expected per-second rate
    pub burst_multiplier: f64,
    /// Consecutive failures that open a topic's circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls (e.g., "30s")
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,
    /// Successes in half-open state needed to close the circuit
    pub success_threshold: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_multiplier: 2.0,
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

/// Admission state of one topic
struct TopicState {
    bucket: TokenBucket,
    breaker: CircuitBreaker,
}

/// Client wrapper enforcing per-topic publish limits
pub struct RateLimitedClient<C> {
    inner: C,
    config: RateLimitConfig,
    /// Expected requests per second per topic
    rate: f64,
    capacity: u32,
    topics: DashMap<String, TopicState>,
}

impl<C: PubSubClient> RateLimitedClient<C> {
    pub fn new(inner: C, expected_requests_per_second: f64, config: RateLimitConfig) -> Self {
        let capacity = TokenBucket::capacity_for(expected_requests_per_second, config.burst_multiplier);
        debug!(
            "'{}': rate limit {}/s per topic, burst {}",
            inner.unique_name(),
            expected_requests_per_second,
            capacity
        );
        Self {
            inner,
            config,
            rate: expected_requests_per_second,
            capacity,
            topics: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Circuit state of a topic (closed for topics never published to)
    pub fn circuit_state(&self, topic: &str) -> CircuitState {
        match self.topics.get_mut(topic) {
            Some(mut state) => state.breaker.state_at(Instant::now()),
            None => CircuitState::Closed,
        }
    }

    fn new_topic_state(&self, now: Instant) -> TopicState {
        TopicState {
            bucket: TokenBucket::new(self.capacity, self.rate, now),
            breaker: CircuitBreaker::new(
                self.config.failure_threshold,
                self.config.success_threshold,
                self.config.open_duration,
            ),
        }
    }

    /// Admit every topic of a publish or none of them.
    /// `demand` maps topic to the number of payloads for it.
    fn admit(&self, demand: &BTreeMap<&str, u32>) -> Result<(), PubSubError> {
        let now = Instant::now();
        let mut taken: Vec<(&str, u32)> = Vec::with_capacity(demand.len());

        for (&topic, &count) in demand {
            let mut state = self
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| self.new_topic_state(now));

            let rejection = if !state.breaker.allows(now) {
                Some(PubSubError::CircuitOpen {
                    topic: topic.to_string(),
                })
            } else if !state.bucket.try_acquire(count, now) {
                if state.breaker.record_failure(now) {
                    warn!("'{}': circuit opened for topic '{}'", self.inner.unique_name(), topic);
                }
                Some(PubSubError::RateLimited {
                    topic: topic.to_string(),
                })
            } else {
                None
            };
            drop(state);

            if let Some(err) = rejection {
                self.refund(&taken);
                warn!("'{}': {}", self.inner.unique_name(), err);
                return Err(err);
            }
            taken.push((topic, count));
        }

        Ok(())
    }

    fn refund(&self, taken: &[(&str, u32)]) {
        for (topic, count) in taken {
            if let Some(mut state) = self.topics.get_mut(*topic) {
                state.bucket.refund(*count);
            }
        }
    }

    fn record_outcome(&self, demand: &BTreeMap<&str, u32>, success: bool) {
        let now = Instant::now();
        for topic in demand.keys() {
            let Some(mut state) = self.topics.get_mut(*topic) else {
                continue;
            };
            if success {
                state.breaker.record_success();
            } else if state.breaker.record_failure(now) {
                warn!(
                    "'{}': circuit opened for topic '{}' after publish failures",
                    self.inner.unique_name(),
                    topic
                );
            }
        }
    }
}

#[async_trait]
impl<C: PubSubClient> PubSubClient for RateLimitedClient<C> {
    fn unique_name(&self) -> &str {
        self.inner.unique_name()
    }

    async fn publish(
        &self,
        payloads: &[PubSubPayload],
        content_type: ContentType,
    ) -> Result<(), PubSubError> {
        let mut demand: BTreeMap<&str, u32> = BTreeMap::new();
        for payload in payloads {
            *demand.entry(payload.topic.as_str()).or_insert(0) += 1;
        }

        self.admit(&demand)?;

        let result = self.inner.publish(payloads, content_type).await;
        self.record_outcome(&demand, result.is_ok());
        result
    }

    async fn subscribe(
        &self,
        topics: &[String],
        on_message: SubscribeCallback,
    ) -> Result<(), PubSubError> {
        self.inner.subscribe(topics, on_message).await
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), PubSubError> {
        self.inner.unsubscribe(topics).await
    }

    fn stop(&self) {
        self.inner.stop()
    }
}
