//! Scheduler loop and capacity configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "SCHEDULER_";

/// Tunables for one tenant's lease, replenish, queue and batching loops.
///
/// Every field has a default, so a partial JSON document or an empty
/// environment yields a usable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often worker and queue leases are acquired and extended.
    pub lease_interval_ms: u64,
    /// How often slot replenishment runs when nothing forces it.
    pub replenish_interval_ms: u64,
    /// How often each queuer polls when it is not nudged.
    pub queue_poll_interval_ms: u64,
    /// Working-set size of one queuer.
    pub single_queue_limit: usize,
    /// Maximum age of a queuer's working set before it is re-listed.
    pub refill_max_age_ms: u64,
    /// Items per scheduling sub-batch.
    pub assign_batch_size: usize,
    /// Sub-batches assigned and persisted concurrently.
    pub max_concurrent_flushes: usize,
    /// Lifetime of a slot before it must be replenished.
    pub slot_ttl_ms: u64,
    /// Retry delay after a declined batch flush when the step has no interval.
    pub batch_retry_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_interval_ms: 1_000,
            replenish_interval_ms: 1_000,
            queue_poll_interval_ms: 1_000,
            single_queue_limit: 100,
            refill_max_age_ms: 990,
            assign_batch_size: 50,
            max_concurrent_flushes: num_cpus::get().clamp(1, 8),
            slot_ttl_ms: 2_000,
            batch_retry_interval_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        let intervals = [
            ("lease_interval_ms", self.lease_interval_ms),
            ("replenish_interval_ms", self.replenish_interval_ms),
            ("queue_poll_interval_ms", self.queue_poll_interval_ms),
            ("refill_max_age_ms", self.refill_max_age_ms),
            ("slot_ttl_ms", self.slot_ttl_ms),
            ("batch_retry_interval_ms", self.batch_retry_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        if self.single_queue_limit == 0 {
            return Err("single_queue_limit must be greater than 0".into());
        }
        if self.assign_batch_size == 0 {
            return Err("assign_batch_size must be greater than 0".into());
        }
        if self.max_concurrent_flushes == 0 {
            return Err("max_concurrent_flushes must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `SCHEDULER_*` environment variables, loading a
    /// `.env` file first when one exists. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`SchedulerConfig::from_env`] with an explicit variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        override_from(&lookup, "LEASE_INTERVAL_MS", &mut cfg.lease_interval_ms)?;
        override_from(&lookup, "REPLENISH_INTERVAL_MS", &mut cfg.replenish_interval_ms)?;
        override_from(&lookup, "QUEUE_POLL_INTERVAL_MS", &mut cfg.queue_poll_interval_ms)?;
        override_from(&lookup, "SINGLE_QUEUE_LIMIT", &mut cfg.single_queue_limit)?;
        override_from(&lookup, "REFILL_MAX_AGE_MS", &mut cfg.refill_max_age_ms)?;
        override_from(&lookup, "ASSIGN_BATCH_SIZE", &mut cfg.assign_batch_size)?;
        override_from(&lookup, "MAX_CONCURRENT_FLUSHES", &mut cfg.max_concurrent_flushes)?;
        override_from(&lookup, "SLOT_TTL_MS", &mut cfg.slot_ttl_ms)?;
        override_from(&lookup, "BATCH_RETRY_INTERVAL_MS", &mut cfg.batch_retry_interval_ms)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Lease loop period.
    pub const fn lease_interval(&self) -> Duration {
        Duration::from_millis(self.lease_interval_ms)
    }

    /// Replenish loop period.
    pub const fn replenish_interval(&self) -> Duration {
        Duration::from_millis(self.replenish_interval_ms)
    }

    /// Queuer poll period.
    pub const fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    /// Maximum working-set age.
    pub const fn refill_max_age(&self) -> Duration {
        Duration::from_millis(self.refill_max_age_ms)
    }

    /// Slot lifetime.
    pub const fn slot_ttl(&self) -> Duration {
        Duration::from_millis(self.slot_ttl_ms)
    }

    /// Declined-flush retry delay.
    pub const fn batch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.batch_retry_interval_ms)
    }
}

fn override_from<F, T>(lookup: &F, suffix: &str, target: &mut T) -> Result<(), String>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{suffix}");
    if let Some(raw) = lookup(&name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| format!("{name}={raw:?} is invalid: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.single_queue_limit, 100);
        assert_eq!(cfg.assign_batch_size, 50);
        assert_eq!(cfg.refill_max_age(), Duration::from_millis(990));
        assert!((1..=8).contains(&cfg.max_concurrent_flushes));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("SCHEDULER_SINGLE_QUEUE_LIMIT", "250"),
            ("SCHEDULER_LEASE_INTERVAL_MS", " 500 "),
        ]
        .into_iter()
        .collect();
        let cfg = SchedulerConfig::from_lookup(|k| vars.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(cfg.single_queue_limit, 250);
        assert_eq!(cfg.lease_interval(), Duration::from_millis(500));
        assert_eq!(cfg.slot_ttl_ms, 2_000);
    }

    #[test]
    fn lookup_rejects_garbage_and_zero() {
        let bad = SchedulerConfig::from_lookup(|k| {
            (k == "SCHEDULER_SLOT_TTL_MS").then(|| "soon".to_string())
        });
        assert!(bad.unwrap_err().contains("SCHEDULER_SLOT_TTL_MS"));

        let zero = SchedulerConfig::from_lookup(|k| {
            (k == "SCHEDULER_ASSIGN_BATCH_SIZE").then(|| "0".to_string())
        });
        assert!(zero.is_err());
    }
}
