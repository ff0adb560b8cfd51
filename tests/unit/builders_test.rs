//! Tests for builder modules

use std::sync::Arc;

use prometheus_core_pool::builders::WorkerPoolBuilder;
use prometheus_core_pool::config::{MultipleSourceConfig, WorkerPoolConfig};
use prometheus_core_pool::core::PoolError;
use prometheus_core_pool::infra::{SemaphoreCoreProvider, SlotCore};

#[test]
fn test_builder_without_sources_fails() {
    let result = WorkerPoolBuilder::<SlotCore>::new(WorkerPoolConfig::default()).build();
    match result {
        Err(PoolError::InvalidConfig(message)) => {
            assert!(message.contains("local provider or remote"));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("pool built without any source"),
    }
}

#[test]
fn test_builder_validates_remote_section() {
    let config = WorkerPoolConfig::new()
        .with_remote_enabled(true)
        .with_remote(MultipleSourceConfig {
            retry_delay_ms: 0,
            ..MultipleSourceConfig::default()
        });
    let result = WorkerPoolBuilder::<SlotCore>::new(config)
        .with_local_provider(Arc::new(SemaphoreCoreProvider::new("local", 1)))
        .build();
    assert!(matches!(result, Err(PoolError::InvalidConfig(message)) if message.contains("remote")));
}
