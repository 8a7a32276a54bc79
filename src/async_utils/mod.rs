//! Asynchronous utilities for use with Tokio.
//!
//! These are the small pieces of plumbing that let the rest of the crate be
//! written as straight-line async code.

use std::pin::Pin;

use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A handle for one or more background workers. This can be awaited
/// to wait for all workers to complete normally.
pub struct JoinWorker {
    /// The task handle.
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
///
/// Use this for CPU-heavy image work, so that it doesn't stall the executor.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // Blocking tasks are only cancelled when the runtime shuts down.
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_worker_reports_errors() {
        let worker = JoinWorker::from_handle(tokio::spawn(async { Err(anyhow!("boom")) }));
        assert_eq!(worker.join().await.unwrap_err().to_string(), "boom");
    }

    #[tokio::test]
    #[should_panic(expected = "from a blocking thread")]
    async fn test_blocking_panics_propagate() {
        spawn_blocking_propagating_panics(|| panic!("from a blocking thread")).await
    }
}
