//! Broker list configuration
//!
//! The broker list is a JSON array held in an environment variable. Each
//! record is tagged by `type`:
//!
//! ```json
//! [
//!   { "type": "signature-v4", "host": "abc-ats.iot.eu-west-1.amazonaws.com",
//!     "expectedRequestsPerSecondPerTopic": 10 },
//!   { "type": "certificate", "host": "mqtts://broker.example.com",
//!     "expectedRequestsPerSecondPerTopic": 5,
//!     "privateKeyVariableName": "BROKER_KEY", "certificateVariableName": "BROKER_CERT" }
//! ]
//! ```
//!
//! Records are resolved once at load time into [`ResolvedBroker`], which
//! carries the credentials themselves instead of variable names.

use serde::Deserialize;
use serde_json::Value;

use super::ConfigError;
use crate::transport::sigv4::{self, AwsCredentials};
use crate::transport::BrokerAuth;

const SIGNATURE_V4: &str = "signature-v4";
const CERTIFICATE: &str = "certificate";

/// `type` values accepted for each kind, canonical name first
const SIGNATURE_V4_TAGS: [&str; 2] = [SIGNATURE_V4, "mqttAWSV4Sig"];
const CERTIFICATE_TAGS: [&str; 2] = [CERTIFICATE, "mqttCert"];

/// One broker record as written in the configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerConfig {
    /// AWS IoT style broker reached over WebSocket with a SigV4 presigned URL
    #[serde(rename = "signature-v4", alias = "mqttAWSV4Sig", rename_all = "camelCase")]
    SignatureV4 {
        host: String,
        #[serde(alias = "expectedRequestPerSecondPerTopic")]
        expected_requests_per_second_per_topic: f64,
        /// Signing region; derived from the host or `AWS_REGION` when absent
        #[serde(default)]
        region: Option<String>,
    },
    /// Broker reached over TLS with a client certificate
    #[serde(rename = "certificate", alias = "mqttCert", rename_all = "camelCase")]
    Certificate {
        host: String,
        #[serde(alias = "expectedRequestPerSecondPerTopic")]
        expected_requests_per_second_per_topic: f64,
        /// Environment variable holding the PEM private key
        #[serde(alias = "privateKeyEnvPath")]
        private_key_variable_name: String,
        /// Environment variable holding the PEM certificate
        #[serde(alias = "certEnvPath")]
        certificate_variable_name: String,
    },
}

/// A broker record with its credentials looked up
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBroker {
    /// Member name, `<type>::<host>`
    pub name: String,
    pub host: String,
    pub expected_requests_per_second_per_topic: f64,
    pub auth: BrokerAuth,
}

impl BrokerConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            BrokerConfig::SignatureV4 { .. } => SIGNATURE_V4,
            BrokerConfig::Certificate { .. } => CERTIFICATE,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            BrokerConfig::SignatureV4 { host, .. } | BrokerConfig::Certificate { host, .. } => host,
        }
    }

    pub fn expected_requests_per_second_per_topic(&self) -> f64 {
        match self {
            BrokerConfig::SignatureV4 {
                expected_requests_per_second_per_topic,
                ..
            }
            | BrokerConfig::Certificate {
                expected_requests_per_second_per_topic,
                ..
            } => *expected_requests_per_second_per_topic,
        }
    }

    /// Member name used in logs and in the fan-out client's unique name
    pub fn member_name(&self) -> String {
        format!("{}::{}", self.type_name(), self.host())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host().trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{} broker has an empty host",
                self.type_name()
            )));
        }
        let rate = self.expected_requests_per_second_per_topic();
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "'{}': expectedRequestsPerSecondPerTopic must be a positive number, got {}",
                self.member_name(),
                rate
            )));
        }
        if let BrokerConfig::Certificate {
            private_key_variable_name,
            certificate_variable_name,
            ..
        } = self
        {
            for (field, variable) in [
                ("privateKeyVariableName", private_key_variable_name),
                ("certificateVariableName", certificate_variable_name),
            ] {
                if variable.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "'{}': {} cannot be empty",
                        self.member_name(),
                        field
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve credentials through `lookup` (normally the process environment).
    ///
    /// Certificate records fail when a referenced variable is unset or empty.
    /// Signature records pick up AWS credentials if present; their absence
    /// shows up later as a connection failure of that broker only.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<ResolvedBroker, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.validate()?;

        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let auth = match self {
            BrokerConfig::SignatureV4 { host, region, .. } => {
                let credentials = match (
                    non_empty("AWS_ACCESS_KEY_ID"),
                    non_empty("AWS_SECRET_ACCESS_KEY"),
                ) {
                    (Some(access_key_id), Some(secret_access_key)) => Some(AwsCredentials {
                        access_key_id,
                        secret_access_key,
                        session_token: non_empty("AWS_SESSION_TOKEN"),
                    }),
                    _ => None,
                };
                let region = region
                    .clone()
                    .or_else(|| sigv4::region_from_host(host))
                    .or_else(|| non_empty("AWS_REGION"));
                BrokerAuth::SignatureV4 {
                    credentials,
                    region,
                }
            }
            BrokerConfig::Certificate {
                private_key_variable_name,
                certificate_variable_name,
                ..
            } => {
                let key_pem = non_empty(private_key_variable_name).ok_or_else(|| {
                    ConfigError::MissingEnv {
                        variable: private_key_variable_name.clone(),
                        field: "privateKeyVariableName",
                    }
                })?;
                let cert_pem = non_empty(certificate_variable_name).ok_or_else(|| {
                    ConfigError::MissingEnv {
                        variable: certificate_variable_name.clone(),
                        field: "certificateVariableName",
                    }
                })?;
                BrokerAuth::ClientCertificate { cert_pem, key_pem }
            }
        };

        Ok(ResolvedBroker {
            name: self.member_name(),
            host: self.host().to_string(),
            expected_requests_per_second_per_topic: self.expected_requests_per_second_per_topic(),
            auth,
        })
    }
}

/// Parse the JSON broker list. At least one record is required and every
/// `type` must be known.
pub fn parse_broker_list(json: &str) -> Result<Vec<BrokerConfig>, ConfigError> {
    let value: Value = serde_json::from_str(json)?;
    let Value::Array(entries) = value else {
        return Err(ConfigError::Validation(
            "broker list must be a JSON array".to_string(),
        ));
    };
    if entries.is_empty() {
        return Err(ConfigError::Validation(
            "broker list must contain at least one entry".to_string(),
        ));
    }

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let tag = entry.get("type").and_then(Value::as_str).ok_or_else(|| {
                ConfigError::Validation(format!("broker entry {} has no string 'type'", index))
            })?;
            if !SIGNATURE_V4_TAGS.contains(&tag) && !CERTIFICATE_TAGS.contains(&tag) {
                return Err(ConfigError::UnsupportedParameter(format!(
                    "unsupported broker type '{}' in entry {}",
                    tag, index
                )));
            }
            let broker: BrokerConfig = serde_json::from_value(entry)?;
            broker.validate()?;
            Ok(broker)
        })
        .collect()
}
