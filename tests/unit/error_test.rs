//! Tests for error types

use prometheus_core_pool::core::{FulfillRejected, PoolError};
use uuid::Uuid;

#[test]
fn test_already_fulfilled_error() {
    let id = Uuid::nil();
    let err = PoolError::AlreadyFulfilled(id);
    assert_eq!(
        format!("{}", err),
        "request 00000000-0000-0000-0000-000000000000 has already been fulfilled"
    );
}

#[test]
fn test_request_disposed_error() {
    let err = PoolError::RequestDisposed(Uuid::nil());
    assert!(format!("{}", err).ends_with("was disposed before it was fulfilled"));
}

#[test]
fn test_cancelled_error() {
    let err = PoolError::Cancelled;
    assert_eq!(format!("{}", err), "operation cancelled");
    assert!(err.is_cancelled());
    assert!(!PoolError::NoCoreAssigned(Uuid::nil()).is_cancelled());
}

#[test]
fn test_invalid_config_error() {
    let err = PoolError::InvalidConfig("retry_delay_ms must be greater than 0".to_string());
    assert_eq!(
        format!("{}", err),
        "invalid configuration: retry_delay_ms must be greater than 0"
    );
}

#[test]
fn test_fulfill_rejected_returns_core() {
    let rejected = FulfillRejected {
        core: 42_u32,
        reason: PoolError::Cancelled,
    };
    assert_eq!(format!("{}", rejected), "core rejected: operation cancelled");

    let (core, reason) = rejected.into_parts();
    assert_eq!(core, 42);
    assert!(reason.is_cancelled());
}
