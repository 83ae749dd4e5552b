//! Redundant fan-out client
//!
//! Broadcasts every operation to all member clients concurrently, waits
//! for every outcome, then folds them:
//! - publish and subscribe succeed when at least one member succeeds
//! - unsubscribe fails when any member fails
//! - stop is called on every member unconditionally
//!
//! Subscriptions are registered on every member, so a message carried by
//! several brokers reaches the callback once per member. Deduplication is
//! left to the caller.

use std::panic::{catch_unwind, AssertUnwindSafe};

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use super::{
    AggregateError, ContentType, MemberFailure, PubSubClient, PubSubError, PubSubPayload,
    SubscribeCallback,
};

/// Separator between member names in the fan-out client's unique name
pub const NAME_SEPARATOR: &str = "#";

/// A member client and the name it is reported under
pub struct MemberEntry {
    name: String,
    client: Box<dyn PubSubClient>,
}

impl MemberEntry {
    pub fn new(name: impl Into<String>, client: Box<dyn PubSubClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &dyn PubSubClient {
        self.client.as_ref()
    }
}

impl std::fmt::Debug for MemberEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberEntry")
            .field("name", &self.name)
            .field("client", &self.client.unique_name())
            .finish()
    }
}

/// Publish/subscribe client that fans out over several members
#[derive(Debug)]
pub struct RedundantPubSubClient {
    members: Vec<MemberEntry>,
    unique_name: String,
}

impl RedundantPubSubClient {
    /// Build from a non-empty, ordered member list
    pub fn new(members: Vec<MemberEntry>) -> Result<Self, PubSubError> {
        if members.is_empty() {
            return Err(PubSubError::InvalidConfig(
                "redundant client requires at least one member".to_string(),
            ));
        }

        let unique_name = members
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(NAME_SEPARATOR);

        info!(
            "Redundant client '{}' created with {} members",
            unique_name,
            members.len()
        );

        Ok(Self {
            members,
            unique_name,
        })
    }

    pub fn members(&self) -> &[MemberEntry] {
        &self.members
    }

    /// Pair each outcome with its member and keep the failures, in member order
    fn failures(&self, outcomes: Vec<Result<(), PubSubError>>) -> Vec<MemberFailure> {
        self.members
            .iter()
            .zip(outcomes)
            .filter_map(|(member, outcome)| {
                outcome.err().map(|error| MemberFailure {
                    member: member.name.clone(),
                    error,
                })
            })
            .collect()
    }

    /// Succeed if at least one member succeeded
    fn any_success(
        &self,
        operation: &str,
        outcomes: Vec<Result<(), PubSubError>>,
    ) -> Result<(), PubSubError> {
        let failures = self.failures(outcomes);

        if failures.len() < self.members.len() {
            for failure in &failures {
                warn!(
                    "'{}': member '{}' failed to {}: {}",
                    self.unique_name, failure.member, operation, failure.error
                );
            }
            debug!(
                "'{}': {} succeeded on {}/{} members",
                self.unique_name,
                operation,
                self.members.len() - failures.len(),
                self.members.len()
            );
            return Ok(());
        }

        let err = AggregateError::new(format!("all members failed to {}", operation), failures);
        error!("'{}': {}", self.unique_name, err);
        Err(err.into())
    }

    /// Succeed only if every member succeeded
    fn all_success(
        &self,
        operation: &str,
        outcomes: Vec<Result<(), PubSubError>>,
    ) -> Result<(), PubSubError> {
        let failures = self.failures(outcomes);
        if failures.is_empty() {
            return Ok(());
        }

        let err = AggregateError::new(
            format!("one or more members failed to {}", operation),
            failures,
        );
        error!("'{}': {}", self.unique_name, err);
        Err(err.into())
    }
}

#[async_trait]
impl PubSubClient for RedundantPubSubClient {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    async fn publish(
        &self,
        payloads: &[PubSubPayload],
        content_type: ContentType,
    ) -> Result<(), PubSubError> {
        let outcomes = join_all(
            self.members
                .iter()
                .map(|m| m.client.publish(payloads, content_type)),
        )
        .await;
        self.any_success("publish", outcomes)
    }

    async fn subscribe(
        &self,
        topics: &[String],
        on_message: SubscribeCallback,
    ) -> Result<(), PubSubError> {
        let outcomes = join_all(
            self.members
                .iter()
                .map(|m| m.client.subscribe(topics, on_message.clone())),
        )
        .await;
        self.any_success("subscribe", outcomes)
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), PubSubError> {
        let outcomes = join_all(self.members.iter().map(|m| m.client.unsubscribe(topics))).await;
        self.all_success("unsubscribe", outcomes)
    }

    fn stop(&self) {
        info!("'{}': stopping {} members", self.unique_name, self.members.len());
        for member in &self.members {
            // A panicking member must not keep the rest from stopping
            if catch_unwind(AssertUnwindSafe(|| member.client.stop())).is_err() {
                error!("'{}': member '{}' panicked while stopping", self.unique_name, member.name);
            }
        }
    }
}
