//! Tests for configuration parsing and validation

use std::time::Duration;

use prometheus_slot_scheduler::config::{SchedulerConfig, StepBatchConfig};

#[test]
fn test_partial_json_keeps_defaults() {
    let cfg = SchedulerConfig::from_json_str(r#"{"single_queue_limit": 20, "slot_ttl_ms": 500}"#)
        .unwrap();
    assert_eq!(cfg.single_queue_limit, 20);
    assert_eq!(cfg.slot_ttl(), Duration::from_millis(500));
    assert_eq!(cfg.assign_batch_size, SchedulerConfig::default().assign_batch_size);
}

#[test]
fn test_json_with_zero_interval_is_rejected() {
    let err = SchedulerConfig::from_json_str(r#"{"lease_interval_ms": 0}"#).unwrap_err();
    assert!(err.contains("lease_interval_ms"));
}

#[test]
fn test_malformed_json_is_a_parse_error() {
    let err = SchedulerConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_zero_sizes_are_invalid() {
    for cfg in [
        SchedulerConfig {
            single_queue_limit: 0,
            ..SchedulerConfig::default()
        },
        SchedulerConfig {
            assign_batch_size: 0,
            ..SchedulerConfig::default()
        },
        SchedulerConfig {
            max_concurrent_flushes: 0,
            ..SchedulerConfig::default()
        },
    ] {
        assert!(cfg.validate().is_err());
    }
}

#[test]
fn test_duration_getters_follow_millisecond_fields() {
    let cfg = SchedulerConfig {
        lease_interval_ms: 250,
        replenish_interval_ms: 300,
        queue_poll_interval_ms: 350,
        batch_retry_interval_ms: 400,
        ..SchedulerConfig::default()
    };
    assert_eq!(cfg.lease_interval(), Duration::from_millis(250));
    assert_eq!(cfg.replenish_interval(), Duration::from_millis(300));
    assert_eq!(cfg.queue_poll_interval(), Duration::from_millis(350));
    assert_eq!(cfg.batch_retry_interval(), Duration::from_millis(400));
}

#[test]
fn test_step_batch_config_validation() {
    assert!(StepBatchConfig::new(4).validate().is_ok());
    assert!(StepBatchConfig::new(0).validate().is_err());
    assert!(StepBatchConfig::new(4).with_max_runs(0).validate().is_err());
    assert!(StepBatchConfig::new(4).with_max_runs(2).validate().is_ok());
}

#[test]
fn test_zero_flush_interval_counts_as_unset() {
    assert_eq!(StepBatchConfig::new(4).flush_interval(), None);
    assert_eq!(
        StepBatchConfig::new(4).with_flush_interval_ms(0).flush_interval(),
        None
    );
    assert_eq!(
        StepBatchConfig::new(4).with_flush_interval_ms(75).flush_interval(),
        Some(Duration::from_millis(75))
    );
}

#[test]
fn test_step_batch_config_from_json() {
    let cfg: StepBatchConfig =
        serde_json::from_str(r#"{"batch_size": 8, "flush_interval_ms": 100, "max_runs": null}"#)
            .unwrap();
    assert_eq!(cfg, StepBatchConfig::new(8).with_flush_interval_ms(100));
}
