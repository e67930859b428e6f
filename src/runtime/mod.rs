//! Runtime adapters used to run the scheduler's background loops.

pub mod tokio_spawner;

pub use tokio_spawner::{Spawn, TokioSpawner};
