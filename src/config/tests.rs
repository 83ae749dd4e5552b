//! Config module tests

use std::collections::HashMap;
use std::io::Write;

use pretty_assertions::assert_eq;

use super::*;
use crate::transport::BrokerAuth;

fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn test_substitute_vars_simple_and_default() {
    let lookup = lookup_from(&[("HOST", "localhost")]);
    let result = substitute_vars("a = \"${HOST}\"\nb = \"${PORT:-1883}\"", lookup).unwrap();
    assert_eq!(result, "a = \"localhost\"\nb = \"1883\"");
}

#[test]
fn test_substitute_vars_set_value_wins_over_default() {
    let lookup = lookup_from(&[("LEVEL", "debug")]);
    let result = substitute_vars("level = \"${LEVEL:-info}\"", lookup).unwrap();
    assert_eq!(result, "level = \"debug\"");
}

#[test]
fn test_substitute_vars_missing_no_default() {
    let result = substitute_vars("value = \"${NOPE}\"", lookup_from(&[])).unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_substitute_env_vars_reads_process_env() {
    std::env::set_var("FANMQ_TEST_SUBST_PREFIX", "edge");
    let result = substitute_env_vars("prefix = \"${FANMQ_TEST_SUBST_PREFIX}\"").unwrap();
    assert_eq!(result, "prefix = \"edge\"");
    std::env::remove_var("FANMQ_TEST_SUBST_PREFIX");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.client.client_id_prefix, "fanmq");
    assert_eq!(config.client.keepalive, Duration::from_secs(60));
    assert_eq!(config.client.qos(), QoS::AtLeastOnce);
    assert_eq!(config.client.command_channel_capacity, 1024);
    assert_eq!(config.rate_limit.failure_threshold, 5);
    assert_eq!(config.pub_sub.env_var, "PUB_SUB_CONFIGS");
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[client]
client_id_prefix = "oracle"
keepalive = "30s"
ack_timeout = "2s 500ms"
qos = 0

[rate_limit]
burst_multiplier = 4.0
open_duration = "1m"

[pub_sub]
env_var = "BROKERS"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.client.client_id_prefix, "oracle");
    assert_eq!(config.client.keep_alive_secs(), 30);
    assert_eq!(config.client.ack_timeout, Duration::from_millis(2500));
    assert_eq!(config.client.qos(), QoS::AtMostOnce);
    // Unset fields keep their defaults
    assert_eq!(config.client.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.rate_limit.burst_multiplier, 4.0);
    assert_eq!(config.rate_limit.open_duration, Duration::from_secs(60));
    assert_eq!(config.pub_sub.env_var, "BROKERS");
}

#[test]
fn test_validate_rejects_bad_values() {
    for content in [
        "[client]\nqos = 2",
        "[client]\nack_timeout = \"0s\"",
        "[client]\nreconnect_interval = \"10s\"\nmax_reconnect_interval = \"5s\"",
        "[client]\ncommand_channel_capacity = 0",
        "[client]\nkeepalive = \"20h\"",
        "[rate_limit]\nburst_multiplier = 0.0",
        "[pub_sub]\nenv_var = \"\"",
    ] {
        match Config::parse(content) {
            Err(ConfigError::Validation(_)) => {}
            other => panic!("expected validation error for {:?}, got {:?}", content, other),
        }
    }
}

#[test]
fn test_load_file_with_env_substitution() {
    std::env::set_var("FANMQ_TEST_LOAD_PREFIX", "from-env");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[client]
client_id_prefix = "${{FANMQ_TEST_LOAD_PREFIX}}"
ack_timeout = "${{FANMQ_TEST_LOAD_UNSET:-3s}}"
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.client.client_id_prefix, "from-env");
    assert_eq!(config.client.ack_timeout, Duration::from_secs(3));
    assert_eq!(config.client.keepalive, Duration::from_secs(60));

    std::env::remove_var("FANMQ_TEST_LOAD_PREFIX");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.client.max_reconnect_interval, Duration::from_secs(30));
    assert_eq!(config.rate_limit.open_duration, Duration::from_secs(30));
}

#[test]
fn test_load_rejects_invalid_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[client]\nqos = 5").unwrap();
    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::Validation(_))
    ));
}

const SIGNATURE_ENTRY: &str = r#"{
    "type": "signature-v4",
    "host": "abc-ats.iot.eu-west-1.amazonaws.com",
    "expectedRequestsPerSecondPerTopic": 10
}"#;

const CERTIFICATE_ENTRY: &str = r#"{
    "type": "certificate",
    "host": "broker.example.com",
    "expectedRequestsPerSecondPerTopic": 2.5,
    "privateKeyVariableName": "BROKER_KEY",
    "certificateVariableName": "BROKER_CERT"
}"#;

#[test]
fn test_parse_broker_list_both_kinds() {
    let json = format!("[{}, {}]", SIGNATURE_ENTRY, CERTIFICATE_ENTRY);
    let brokers = parse_broker_list(&json).unwrap();

    assert_eq!(
        brokers,
        vec![
            BrokerConfig::SignatureV4 {
                host: "abc-ats.iot.eu-west-1.amazonaws.com".to_string(),
                expected_requests_per_second_per_topic: 10.0,
                region: None,
            },
            BrokerConfig::Certificate {
                host: "broker.example.com".to_string(),
                expected_requests_per_second_per_topic: 2.5,
                private_key_variable_name: "BROKER_KEY".to_string(),
                certificate_variable_name: "BROKER_CERT".to_string(),
            },
        ]
    );
    assert_eq!(
        brokers[0].member_name(),
        "signature-v4::abc-ats.iot.eu-west-1.amazonaws.com"
    );
    assert_eq!(brokers[1].member_name(), "certificate::broker.example.com");
}

#[test]
fn test_parse_broker_list_legacy_names() {
    let json = r#"[
        {"type": "mqttAWSV4Sig", "host": "a.example.com", "expectedRequestPerSecondPerTopic": 1},
        {"type": "mqttCert", "host": "b.example.com", "expectedRequestPerSecondPerTopic": 1,
         "privateKeyEnvPath": "KEY", "certEnvPath": "CERT"}
    ]"#;
    let brokers = parse_broker_list(json).unwrap();
    assert_eq!(brokers[0].type_name(), "signature-v4");
    assert_eq!(brokers[1].type_name(), "certificate");
}

#[test]
fn test_parse_broker_list_unknown_type() {
    let json = r#"[{"type": "carrier-pigeon", "host": "x", "expectedRequestsPerSecondPerTopic": 1}]"#;
    match parse_broker_list(json) {
        Err(ConfigError::UnsupportedParameter(msg)) => assert!(msg.contains("carrier-pigeon")),
        other => panic!("expected unsupported parameter, got {:?}", other),
    }
}

#[test]
fn test_parse_broker_list_rejects_empty_and_malformed() {
    assert!(matches!(parse_broker_list("[]"), Err(ConfigError::Validation(_))));
    assert!(matches!(parse_broker_list("{}"), Err(ConfigError::Validation(_))));
    assert!(matches!(parse_broker_list("not json"), Err(ConfigError::Json(_))));
    // Missing required field
    assert!(matches!(
        parse_broker_list(r#"[{"type": "signature-v4", "host": "x"}]"#),
        Err(ConfigError::Json(_))
    ));
    // Non-positive rate
    assert!(matches!(
        parse_broker_list(
            r#"[{"type": "signature-v4", "host": "x", "expectedRequestsPerSecondPerTopic": 0}]"#
        ),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_resolve_certificate_reads_both_variables() {
    let broker = parse_broker_list(&format!("[{}]", CERTIFICATE_ENTRY))
        .unwrap()
        .remove(0);
    let resolved = broker
        .resolve_with(lookup_from(&[("BROKER_KEY", "key-pem"), ("BROKER_CERT", "cert-pem")]))
        .unwrap();

    assert_eq!(resolved.name, "certificate::broker.example.com");
    assert_eq!(resolved.expected_requests_per_second_per_topic, 2.5);
    assert_eq!(
        resolved.auth,
        BrokerAuth::ClientCertificate {
            cert_pem: "cert-pem".to_string(),
            key_pem: "key-pem".to_string(),
        }
    );
}

#[test]
fn test_resolve_certificate_missing_variable_names_it() {
    let broker = parse_broker_list(&format!("[{}]", CERTIFICATE_ENTRY))
        .unwrap()
        .remove(0);

    let err = broker
        .resolve_with(lookup_from(&[("BROKER_KEY", "key-pem")]))
        .unwrap_err();
    assert!(err.to_string().contains("BROKER_CERT"), "{}", err);

    // Empty counts as missing
    let err = broker
        .resolve_with(lookup_from(&[("BROKER_KEY", ""), ("BROKER_CERT", "cert")]))
        .unwrap_err();
    match err {
        ConfigError::MissingEnv { variable, field } => {
            assert_eq!(variable, "BROKER_KEY");
            assert_eq!(field, "privateKeyVariableName");
        }
        other => panic!("expected MissingEnv, got {:?}", other),
    }
}

#[test]
fn test_resolve_signature_credentials_and_region() {
    let broker = parse_broker_list(&format!("[{}]", SIGNATURE_ENTRY))
        .unwrap()
        .remove(0);

    let resolved = broker
        .resolve_with(lookup_from(&[
            ("AWS_ACCESS_KEY_ID", "AKID"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("AWS_REGION", "us-east-1"),
        ]))
        .unwrap();
    match resolved.auth {
        BrokerAuth::SignatureV4 {
            credentials: Some(credentials),
            region,
        } => {
            assert_eq!(credentials.access_key_id, "AKID");
            assert_eq!(credentials.session_token, None);
            // Host wins over AWS_REGION
            assert_eq!(region.as_deref(), Some("eu-west-1"));
        }
        other => panic!("unexpected auth {:?}", other),
    }
}

#[test]
fn test_resolve_signature_without_credentials_is_not_an_error() {
    let json = r#"[{"type": "signature-v4", "host": "broker.example.com",
                    "expectedRequestsPerSecondPerTopic": 1}]"#;
    let broker = parse_broker_list(json).unwrap().remove(0);
    let resolved = broker.resolve_with(lookup_from(&[])).unwrap();
    assert_eq!(
        resolved.auth,
        BrokerAuth::SignatureV4 {
            credentials: None,
            region: None,
        }
    );
}

#[test]
fn test_brokers_with_absent_variable_disables_feature() {
    let config = Config::default();
    assert!(config.brokers_with(lookup_from(&[])).unwrap().is_none());
    assert!(config
        .brokers_with(lookup_from(&[("PUB_SUB_CONFIGS", "  ")]))
        .unwrap()
        .is_none());
}

#[test]
fn test_brokers_with_resolves_every_entry() {
    let json = format!("[{}, {}]", SIGNATURE_ENTRY, CERTIFICATE_ENTRY);
    let config = Config::default();
    let brokers = config
        .brokers_with(lookup_from(&[
            ("PUB_SUB_CONFIGS", json.as_str()),
            ("BROKER_KEY", "k"),
            ("BROKER_CERT", "c"),
        ]))
        .unwrap()
        .unwrap();

    let names: Vec<&str> = brokers.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "signature-v4::abc-ats.iot.eu-west-1.amazonaws.com",
            "certificate::broker.example.com"
        ]
    );
}

#[test]
fn test_brokers_with_custom_variable_and_missing_cert() {
    let mut config = Config::default();
    config.pub_sub.env_var = "MY_BROKERS".to_string();

    let json = format!("[{}]", CERTIFICATE_ENTRY);
    let err = config
        .brokers_with(lookup_from(&[("MY_BROKERS", json.as_str()), ("BROKER_CERT", "c")]))
        .unwrap_err();
    assert!(err.to_string().contains("BROKER_KEY"), "{}", err);
}
