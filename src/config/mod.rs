//! Configuration models for the scheduler loops and step batching.

pub mod batch;
pub mod scheduler;

pub use batch::StepBatchConfig;
pub use scheduler::SchedulerConfig;
