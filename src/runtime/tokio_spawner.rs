//! Tokio runtime spawner implementation.

use std::future::Future;
use std::sync::Arc;

use crate::runtime::Spawn;

/// Tokio-based spawner that executes tasks on a tokio runtime.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: Arc<tokio::runtime::Handle>,
}

impl TokioSpawner {
    /// Create a spawner from a tokio runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle: Arc::new(handle) }
    }

    /// Create a spawner bound to the current runtime. Panics outside a
    /// runtime context, like `Handle::current`.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Create a spawner with a new multi-threaded runtime.
    pub fn with_worker_threads(worker_threads: usize) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        // Keep the runtime alive for the process lifetime.
        std::mem::forget(runtime);
        Ok(Self { handle: Arc::new(handle) })
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}
