//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use ssproto::config::{AppConfig, IndexRule, LoggingConfig};
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = AppConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = AppConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = AppConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_short_connection_deadline() {
    let mut config = AppConfig::default();
    config.server.connection_deadline = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection deadline too short")));
}

#[test]
fn test_long_connection_deadline() {
    let mut config = AppConfig::default();
    config.server.connection_deadline = Duration::from_secs(4000);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection deadline too long")));
}

#[test]
fn test_rebuild_delay_bounds() {
    let mut config = AppConfig::default();
    config.server.rebuild_delay = Duration::from_millis(1);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Rebuild delay too short")));

    config.server.rebuild_delay = Duration::from_secs(3600);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Rebuild delay too long")));
}

#[test]
fn test_zero_metrics_size() {
    let mut config = AppConfig::default();
    config.server.max_metrics_size = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max metrics size must be greater than 0")));
}

#[test]
fn test_empty_rule_set() {
    let mut config = AppConfig::default();
    config.index.rules.clear();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one index rule is required")));
}

#[test]
fn test_rule_target_escaping_install_dir() {
    let mut config = AppConfig::default();
    config.index.rules.push(IndexRule::new("extra", "../outside"));
    config.index.rules.push(IndexRule::new("other", "/abs"));

    let errors = config.validate();
    let escaping = errors
        .iter()
        .filter(|e| e.contains("must stay inside the install directory"))
        .count();
    assert_eq!(escaping, 2);
}

#[test]
fn test_invalid_client_address() {
    let mut config = AppConfig::default();
    config.client.address = "no-port".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid client address")));
}

#[test]
fn test_client_deadline_shorter_than_connect_timeout() {
    let mut config = AppConfig::default();
    config.client.connect_timeout = Duration::from_secs(20);
    config.client.connection_deadline = Duration::from_secs(5);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("must not be shorter than the connect timeout")));
}

#[test]
fn test_absolute_identifier_path() {
    let mut config = AppConfig::default();
    config.client.identifier_path = std::env::temp_dir().join("uuid.bin");

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("must be relative to the install directory")));
}

#[test]
fn test_empty_app_name() {
    let mut config = AppConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = AppConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = AppConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = AppConfig::default();
    config.server.address = String::new();

    let result = config.validate_strict();
    assert!(result.is_err());

    if let Err(e) = result {
        assert!(e.to_string().contains("Configuration validation failed"));
    }
}

#[test]
fn test_multiple_validation_errors() {
    let config = AppConfig::default_with_overrides(|config| {
        config.server.address = String::new();
        config.server.max_metrics_size = 0;
        config.index.max_file_size = 0;
        config.client.address = String::new();
        config.logging.app_name = String::new();
    });

    let errors = config.validate();
    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_toml_round_trip_keeps_durations_and_rules() {
    let config = AppConfig::default_with_overrides(|config| {
        config.server.rebuild_delay = Duration::from_millis(1500);
        config.logging = LoggingConfig {
            log_level: Level::DEBUG,
            ..LoggingConfig::default()
        };
    });

    let text = toml::to_string_pretty(&config).expect("serialize");
    let parsed = AppConfig::from_toml(&text).expect("parse");
    assert_eq!(parsed.server.rebuild_delay, Duration::from_millis(1500));
    assert_eq!(parsed.logging.log_level, Level::DEBUG);
    assert_eq!(parsed.index.rules, config.index.rules);
}

#[test]
fn test_partial_toml_uses_defaults() {
    let parsed = AppConfig::from_toml(
        r#"
        [server]
        address = "127.0.0.1:9000"

        [[index.rules]]
        path = "/srv/bundle/mods"
        target = "mods"
        extensions = ["jar"]
        "#,
    )
    .expect("parse");

    assert_eq!(parsed.server.address, "127.0.0.1:9000");
    assert_eq!(parsed.server.server_name, "localhost");
    assert_eq!(parsed.index.rules.len(), 1);
    assert!(!parsed.index.rules[0].recursive);
    assert!(!parsed.index.rules[0].mandatory);
    assert_eq!(parsed.index.ignored, AppConfig::default().index.ignored);
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_invalid_log_level_is_rejected() {
    let result = AppConfig::from_toml(
        r#"
        [logging]
        log_level = "loud"
        "#,
    );
    assert!(result.is_err());
}
