//! Tests for error types

use prometheus_slot_scheduler::core::{FlushErrors, SchedulerError};

#[test]
fn test_config_error_display() {
    let err = SchedulerError::Config("lease repository is required".into());
    assert_eq!(
        err.to_string(),
        "configuration error: lease repository is required"
    );
}

#[test]
fn test_flush_error_display() {
    let err = SchedulerError::Flush {
        key: "t1/s/a/".into(),
        reason: "sink unavailable".into(),
    };
    assert_eq!(err.to_string(), "flush failed for t1/s/a/: sink unavailable");
}

#[test]
fn test_shut_down_error_names_component() {
    let err = SchedulerError::ShutDown("batch buffer manager");
    assert_eq!(err.to_string(), "component shut down: batch buffer manager");
}

#[test]
fn test_backend_error_from_anyhow() {
    let err = SchedulerError::backend("list queues", &anyhow::anyhow!("timeout"));
    assert!(matches!(err, SchedulerError::Backend(ref msg) if msg == "list queues: timeout"));
}

#[test]
fn test_empty_flush_errors() {
    let errs = FlushErrors::default();
    assert!(errs.is_empty());
    assert_eq!(errs.to_string(), "0 buffer flush(es) failed");
}
