//! Runtime adapters: the spawn abstraction and the Tokio implementation.

pub mod tokio_spawner;

use std::future::Future;

pub use tokio_spawner::TokioSpawner;

/// Abstraction for spawning background futures on a runtime.
pub trait Spawn {
    /// Spawn an async task.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
