//! Tests for clock helpers and shared types

use std::time::Duration;

use prometheus_slot_scheduler::util::{
    deadline_after, now_ms, DesiredLabel, LabelComparator, LeaseKind, StickyStrategy, WorkerLabel,
    DEFAULT_LOG_FILTER,
};

#[test]
fn test_deadline_after_is_in_the_future() {
    let before = now_ms();
    let deadline = deadline_after(Duration::from_secs(5));
    assert!(deadline >= before + 5_000);
    assert!(deadline <= now_ms() + 5_000);
}

#[test]
fn test_now_ms_is_monotonic_enough() {
    let a = now_ms();
    std::thread::sleep(Duration::from_millis(2));
    assert!(now_ms() > a);
}

#[test]
fn test_lease_kind_names() {
    assert_eq!(LeaseKind::Worker.as_str(), "worker");
    assert_eq!(LeaseKind::Queue.as_str(), "queue");
    assert_eq!(serde_json::to_string(&LeaseKind::Queue).unwrap(), "\"queue\"");
}

#[test]
fn test_sticky_strategy_serde() {
    assert_eq!(StickyStrategy::default(), StickyStrategy::None);
    let hard: StickyStrategy = serde_json::from_str("\"hard\"").unwrap();
    assert_eq!(hard, StickyStrategy::Hard);
}

#[test]
fn test_desired_label_builders() {
    let label = DesiredLabel::int("memory_gb", LabelComparator::GreaterThanOrEqual, 16)
        .required()
        .with_weight(-5);
    assert!(label.required);
    assert_eq!(label.weight, -5);
    assert_eq!(label.int_value, Some(16));
    assert_eq!(label.str_value, None);

    let soft = DesiredLabel::string("zone", "eu");
    assert!(!soft.required);
    assert_eq!(soft.weight, DesiredLabel::DEFAULT_WEIGHT);
    assert_eq!(soft.comparator, LabelComparator::Equal);
}

#[test]
fn test_worker_label_builders() {
    assert_eq!(WorkerLabel::int("gpus", 2).int_value, Some(2));
    assert_eq!(WorkerLabel::string("zone", "eu").str_value.as_deref(), Some("eu"));
}

#[test]
fn test_default_log_filter_targets_the_crate() {
    assert!(DEFAULT_LOG_FILTER.starts_with("prometheus_slot_scheduler"));
}
