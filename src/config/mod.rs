//! Configuration Module
//!
//! Provides TOML-based configuration for FanMQ with support for:
//! - Logging
//! - MQTT client behaviour (timeouts, reconnect backoff, QoS)
//! - Per-topic rate limiting and circuit breaking
//! - The broker list, read as JSON from an environment variable
//! - Environment variable overrides (FANMQ__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use broker::{parse_broker_list, BrokerConfig, ResolvedBroker};

use crate::protocol::QoS;
use crate::ratelimit::RateLimitConfig;

mod broker;

#[cfg(test)]
mod tests;

/// Substitute `${VAR}` and `${VAR:-default}` references using `lookup`.
fn substitute_vars<F>(content: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            lookup(&caps[1]).unwrap_or_else(|| default.to_string())
        })
        .into_owned())
}

/// Substitute environment variables in a string.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    substitute_vars(content, |name| std::env::var(name).ok())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Broker list is not valid JSON or does not match the schema
    Json(serde_json::Error),
    /// Validation error
    Validation(String),
    /// Value the crate does not support, such as an unknown broker type
    UnsupportedParameter(String),
    /// Environment variable referenced by the configuration is unset or empty
    MissingEnv {
        variable: String,
        field: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Json(e) => write!(f, "Broker list error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ConfigError::UnsupportedParameter(msg) => write!(f, "Unsupported parameter: {}", msg),
            ConfigError::MissingEnv { variable, field } => write!(
                f,
                "Environment variable '{}' referenced by '{}' is not set",
                variable, field
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// MQTT client configuration, shared by every broker connection
    pub client: ClientConfig,
    /// Per-topic publish limits
    pub rate_limit: RateLimitConfig,
    /// Where the broker list comes from
    pub pub_sub: PubSubConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// MQTT client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client identifiers are `<prefix>-<uuid>`
    pub client_id_prefix: String,
    /// Keep alive interval sent in CONNECT (e.g., "60s")
    #[serde(with = "humantime_serde")]
    pub keepalive: Duration,
    /// Bound on opening the stream and receiving CONNACK
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on waiting for PUBACK, SUBACK or UNSUBACK
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// First reconnect delay; doubles after every failed attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Upper bound of the reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
    /// Commands that may wait for the connection task
    pub command_channel_capacity: usize,
    /// QoS for publish and subscribe (0 or 1)
    pub qos: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "fanmq".to_string(),
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
            command_channel_capacity: 1024,
            qos: 1,
        }
    }
}

impl ClientConfig {
    pub fn qos(&self) -> QoS {
        if self.qos == 0 {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        }
    }

    /// Keep alive in whole seconds, as carried by CONNECT
    pub fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keepalive.as_secs()).unwrap_or(u16::MAX)
    }
}

/// Broker list source
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Environment variable holding the JSON broker list
    pub env_var: String,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            env_var: "PUB_SUB_CONFIGS".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `FANMQ__` prefix with double underscores for nesting:
    ///    - `FANMQ__LOG__LEVEL=debug` overrides `log.level`
    ///    - `FANMQ__CLIENT__ACK_TIMEOUT=5s` overrides `client.ack_timeout`
    ///    - `FANMQ__PUB_SUB__ENV_VAR=BROKERS` overrides `pub_sub.env_var`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("client.client_id_prefix", "fanmq")?
            .set_default("client.keepalive", "60s")?
            .set_default("client.connect_timeout", "10s")?
            .set_default("client.ack_timeout", "10s")?
            .set_default("client.reconnect_interval", "1s")?
            .set_default("client.max_reconnect_interval", "30s")?
            .set_default("client.command_channel_capacity", 1024)?
            .set_default("client.qos", 1)?
            .set_default("rate_limit.burst_multiplier", 2.0)?
            .set_default("rate_limit.failure_threshold", 5)?
            .set_default("rate_limit.open_duration", "30s")?
            .set_default("rate_limit.success_threshold", 1)?
            .set_default("pub_sub.env_var", "PUB_SUB_CONFIGS")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("FANMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.qos > 1 {
            return Err(ConfigError::Validation(
                "client.qos must be 0 or 1".to_string(),
            ));
        }

        if self.client.keepalive.as_secs() > u64::from(u16::MAX) {
            return Err(ConfigError::Validation(
                "client.keepalive cannot exceed 65535 seconds".to_string(),
            ));
        }

        for (name, value) in [
            ("client.connect_timeout", self.client.connect_timeout),
            ("client.ack_timeout", self.client.ack_timeout),
            ("client.reconnect_interval", self.client.reconnect_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!("{} must be non-zero", name)));
            }
        }

        if self.client.max_reconnect_interval < self.client.reconnect_interval {
            return Err(ConfigError::Validation(
                "client.max_reconnect_interval must not be less than client.reconnect_interval"
                    .to_string(),
            ));
        }

        if self.client.command_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "client.command_channel_capacity must be at least 1".to_string(),
            ));
        }

        let multiplier = self.rate_limit.burst_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(ConfigError::Validation(
                "rate_limit.burst_multiplier must be a positive number".to_string(),
            ));
        }

        if self.pub_sub.env_var.trim().is_empty() {
            return Err(ConfigError::Validation(
                "pub_sub.env_var cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Broker list from the process environment.
    ///
    /// `Ok(None)` when the variable is unset or blank: the fan-out client is
    /// optional and simply not built.
    pub fn brokers(&self) -> Result<Option<Vec<ResolvedBroker>>, ConfigError> {
        self.brokers_with(|name| std::env::var(name).ok())
    }

    /// Broker list with variables read through `lookup`
    pub fn brokers_with<F>(&self, lookup: F) -> Result<Option<Vec<ResolvedBroker>>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(json) = lookup(&self.pub_sub.env_var).filter(|v| !v.trim().is_empty()) else {
            return Ok(None);
        };

        let brokers = parse_broker_list(&json)?
            .iter()
            .map(|broker| broker.resolve_with(&lookup))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(brokers))
    }
}
