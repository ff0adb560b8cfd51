//! Tests for utility functions

use prometheus_core_pool::core::{ConcurrentWorkerPoolTracer, WorkerPoolTracer};
use prometheus_core_pool::util::{init_test_tracing, init_tracing, now_ms, DEFAULT_LOG_FILTER};

#[test]
fn test_now_ms_is_monotonic_enough() {
    let first = now_ms();
    let second = now_ms();
    assert!(second >= first);
    // Well after 2020-01-01.
    assert!(first > 1_577_836_800_000);
}

#[test]
fn test_default_log_filter_targets_crate() {
    assert!(DEFAULT_LOG_FILTER.starts_with("prometheus_core_pool="));
}

#[test]
fn test_tracer_dump_format() {
    let tracer = ConcurrentWorkerPoolTracer::new(8);
    tracer.add_tracing_message("requests", "created request 1");

    let dump = tracer.dump_all_messages();
    assert_eq!(dump.len(), 1);
    assert!(dump[0].starts_with("[+"));
    assert!(dump[0].ends_with("ms] requests: created request 1"));
    assert_eq!(tracer.entries()[0].source, "requests");
}

#[test]
fn test_tracing_init_is_idempotent() {
    init_test_tracing();
    init_test_tracing();
    init_tracing();
    tracing::info!(target: "prometheus_core_pool", "subscriber installed");
}
