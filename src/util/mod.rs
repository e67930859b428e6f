//! Shared utilities: clock, telemetry, shared model types, and deferred timers.

pub mod clock;
pub mod telemetry;
pub mod timer;
pub mod types;

pub use clock::*;
pub use telemetry::*;
pub use timer::DeferredAction;
pub use types::*;
