//! Identifiers and small serializable types shared across components.

use serde::{Deserialize, Serialize};

/// Tenant identifier. Every lease, slot, queue and buffer is scoped to one tenant.
pub type TenantId = String;
/// Worker identifier as advertised by the worker registry.
pub type WorkerId = String;
/// Dispatcher identifier: the process a worker is connected through.
pub type DispatcherId = String;
/// Action identifier: the unit-of-work type a worker supports.
pub type ActionId = String;
/// Step identifier used to look up affinity labels and batch settings.
pub type StepId = String;
/// Monotonic identifier of a queue item inside its queue.
pub type QueueItemId = i64;
/// Identifier of the task a queue item schedules.
pub type TaskId = i64;

/// Kind of resource a lease can be held on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseKind {
    /// A worker process.
    Worker,
    /// A named queue.
    Queue,
}

impl LeaseKind {
    /// Stable lowercase name, used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Queue => "queue",
        }
    }
}

/// How strongly a queue item wants to land on a specific worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickyStrategy {
    /// No preference.
    #[default]
    None,
    /// Prefer the desired worker but accept any other.
    Soft,
    /// Only the desired worker is eligible.
    Hard,
}

/// Comparison applied between a worker label and a desired label value.
///
/// The worker's value is the left-hand side: `GreaterThan` with a desired value
/// of 4 is satisfied by a worker label of 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelComparator {
    /// Values are equal.
    #[default]
    Equal,
    /// Values differ.
    NotEqual,
    /// Worker value is strictly greater.
    GreaterThan,
    /// Worker value is greater or equal.
    GreaterThanOrEqual,
    /// Worker value is strictly smaller.
    LessThan,
    /// Worker value is smaller or equal.
    LessThanOrEqual,
}

/// A label advertised by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLabel {
    /// Label key.
    pub key: String,
    /// String value, if the label is textual.
    pub str_value: Option<String>,
    /// Integer value, if the label is numeric.
    pub int_value: Option<i32>,
}

impl WorkerLabel {
    /// Textual label.
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            str_value: Some(value.into()),
            int_value: None,
        }
    }

    /// Numeric label.
    pub fn int(key: impl Into<String>, value: i32) -> Self {
        Self {
            key: key.into(),
            str_value: None,
            int_value: Some(value),
        }
    }
}

/// Affinity requirement declared by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLabel {
    /// Label key to look up on the worker.
    pub key: String,
    /// Desired string value.
    pub str_value: Option<String>,
    /// Desired integer value; takes precedence over `str_value` when set.
    pub int_value: Option<i32>,
    /// When true, a worker not satisfying this label is ineligible.
    pub required: bool,
    /// Comparison to apply.
    pub comparator: LabelComparator,
    /// Weight added to a worker's rank when satisfied. May be negative.
    pub weight: i32,
}

impl DesiredLabel {
    /// Default weight used by [`DesiredLabel::string`] and [`DesiredLabel::int`].
    pub const DEFAULT_WEIGHT: i32 = 100;

    /// Optional equality requirement on a string value.
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            str_value: Some(value.into()),
            int_value: None,
            required: false,
            comparator: LabelComparator::Equal,
            weight: Self::DEFAULT_WEIGHT,
        }
    }

    /// Optional requirement on an integer value.
    pub fn int(key: impl Into<String>, comparator: LabelComparator, value: i32) -> Self {
        Self {
            key: key.into(),
            str_value: None,
            int_value: Some(value),
            required: false,
            comparator,
            weight: Self::DEFAULT_WEIGHT,
        }
    }

    /// Mark the label as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Override the weight.
    #[must_use]
    pub const fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }
}
