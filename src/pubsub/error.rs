//! Publish/subscribe error types

use std::fmt;

/// Error type for a single publish/subscribe operation
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubError {
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker rejected the operation
    Rejected(String),
    /// Operation timed out waiting for an acknowledgement
    Timeout,
    /// Command queue to the connection task is full
    QueueFull,
    /// Per-topic rate limit exceeded
    RateLimited { topic: String },
    /// Per-topic circuit breaker is open
    CircuitOpen { topic: String },
    /// Topic name or filter is not valid MQTT
    InvalidTopic(String),
    /// Invalid configuration
    InvalidConfig(String),
    /// Client has been stopped
    Stopped,
    /// Other error
    Other(String),
    /// Failures of several fan-out members
    Aggregate(AggregateError),
}

impl fmt::Display for PubSubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PubSubError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            PubSubError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            PubSubError::Timeout => write!(f, "Operation timed out"),
            PubSubError::QueueFull => write!(f, "Message queue full"),
            PubSubError::RateLimited { topic } => write!(f, "Rate limit exceeded for topic '{}'", topic),
            PubSubError::CircuitOpen { topic } => write!(f, "Circuit open for topic '{}'", topic),
            PubSubError::InvalidTopic(msg) => write!(f, "Invalid topic: {}", msg),
            PubSubError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            PubSubError::Stopped => write!(f, "Client stopped"),
            PubSubError::Other(msg) => write!(f, "{}", msg),
            PubSubError::Aggregate(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PubSubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PubSubError::Aggregate(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AggregateError> for PubSubError {
    fn from(e: AggregateError) -> Self {
        PubSubError::Aggregate(e)
    }
}

/// One member's failure inside an [`AggregateError`]
#[derive(Debug, Clone, PartialEq)]
pub struct MemberFailure {
    /// Name of the member that failed
    pub member: String,
    pub error: PubSubError,
}

/// Composite error keeping every member failure of one fan-out call,
/// in member order
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateError {
    message: String,
    failures: Vec<MemberFailure>,
}

impl AggregateError {
    pub fn new(message: impl Into<String>, failures: Vec<MemberFailure>) -> Self {
        Self {
            message: message.into(),
            failures,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn failures(&self) -> &[MemberFailure] {
        &self.failures
    }

    /// Stringified failure reasons, one per failed member
    pub fn reasons(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.error.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}[{}] {}", sep, failure.member, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
