//! Tests for configuration validation

use std::time::Duration;

use prometheus_core_pool::config::{
    MultipleSourceConfig, SingleSourceConfig, WorkerPoolConfig, DEFAULT_OBTAINMENT_SLACK,
};

#[test]
fn test_single_source_defaults() {
    let config = SingleSourceConfig::default();
    assert!(config.fulfills_local_requests);
    assert_eq!(config.remote_delay(), None);
    assert!(config.validate().is_ok());
}

#[test]
fn test_single_source_invalid_retry_delay() {
    let invalid = SingleSourceConfig::new().with_retry_delay(Duration::ZERO);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_remote_delay_requires_local_fulfiller() {
    let invalid = SingleSourceConfig::new()
        .with_fulfills_local_requests(false)
        .with_remote_delay(Duration::from_millis(500));
    assert!(invalid.validate().is_err());

    let valid = SingleSourceConfig::new().with_remote_delay(Duration::from_millis(500));
    assert!(valid.validate().is_ok());
    assert_eq!(valid.remote_delay(), Some(Duration::from_millis(500)));
}

#[test]
fn test_multiple_source_defaults() {
    let config = MultipleSourceConfig::default();
    assert!(!config.fulfills_local_requests);
    assert_eq!(config.obtainment_slack, DEFAULT_OBTAINMENT_SLACK);
    assert!(config.validate().is_ok());
}

#[test]
fn test_pool_config_rejects_remote_only_local_section() {
    let invalid = WorkerPoolConfig::new()
        .with_local(SingleSourceConfig::new().with_fulfills_local_requests(false));
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_from_json() {
    let config = WorkerPoolConfig::from_json_str(
        r#"{
            "enable_remote": true,
            "local": { "remote_delay_ms": 2000 },
            "remote": { "obtainment_slack": 5, "fulfills_local_requests": true }
        }"#,
    )
    .unwrap();

    assert!(config.enable_remote);
    assert_eq!(config.local.remote_delay(), Some(Duration::from_secs(2)));
    assert!(config.local.fulfills_local_requests);
    assert_eq!(config.remote.obtainment_slack, 5);
    assert!(config.remote.fulfills_local_requests);
}

#[test]
fn test_pool_config_from_json_rejects_invalid() {
    assert!(WorkerPoolConfig::from_json_str(r#"{ "local": { "retry_delay_ms": 0 } }"#).is_err());
    assert!(WorkerPoolConfig::from_json_str("not json").is_err());
}
