//! Builders that assemble scheduler components from configuration.

pub mod batch_builder;
pub mod tenant_builder;

pub use batch_builder::build_batch_buffer;
pub use tenant_builder::TenantSchedulerBuilder;
