//! Failure classification for page processing.
//!
//! Plumbing code uses [`anyhow`], but every failure that ends a job chain is
//! turned into a [`PipelineError`] first, so that logs and operators can tell
//! a bad configuration from a flaky recognition service from a full disk.

use std::fmt;

use thiserror::Error;

/// The external recognition services we talk to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    /// Finds text regions on a page.
    Detector,
    /// Turns cropped region images into text.
    Recognizer,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Detector => write!(f, "region detector"),
            Service::Recognizer => write!(f, "text recognizer"),
        }
    }
}

/// Errors that end a page step (and therefore the job chain).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed region, job or recognition configuration. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A recognition service failed or returned something we can't use.
    #[error("{service} failed: {message}")]
    Service { service: Service, message: String },

    /// A recognition service call did not finish in time.
    #[error("{service} did not respond within {seconds}s")]
    Timeout { service: Service, seconds: u64 },

    /// Reading a page, persisting a result, or updating shared state failed.
    #[error("storage failed: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Wrap a storage-layer error, keeping its full context chain.
    pub fn storage(err: anyhow::Error) -> Self {
        PipelineError::Storage(format!("{err:#}"))
    }

    /// Wrap a service-layer error, keeping its full context chain.
    pub fn service(service: Service, err: anyhow::Error) -> Self {
        PipelineError::Service {
            service,
            message: format!("{err:#}"),
        }
    }

    /// A short, stable name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Service { .. } => "service",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Storage(_) => "storage",
        }
    }
}
