//! Job records and their status state machine.
//!
//! A [`Job`] is the durable source of truth for a document's OCR run. The
//! shared [`crate::store`] only caches progress for it while it's in flight.

use uuid::Uuid;

use crate::{config::RecognitionConfig, error::PipelineError, prelude::*, recognition::Detection};

pub mod control;
#[cfg(test)]
pub mod memory;
pub mod repository;

pub use self::repository::{FsJobRepository, JobRepository};

/// Identifies a job.
pub type JobId = Uuid;

/// Where the persisted result for one page lives. Opaque to everyone but the
/// [`JobRepository`] that produced it.
pub type ResultRef = String;

/// Processing status of a job.
///
/// `Queued` moves to `Processing` when its first page starts, `Processing`
/// advances one page at a time, and everything ends in one of the three
/// terminal states. Terminal states never change.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued {
        total_pages: usize,
    },
    Processing {
        /// 1-based number of the page being worked on.
        current_page: usize,
        total_pages: usize,
    },
    Completed,
    Errored,
    Cancelled,
}

impl JobStatus {
    /// Is this one of the absorbing end states?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Errored | JobStatus::Cancelled
        )
    }

    /// Check that we may move from `self` to `next`, returning `next`.
    pub fn transition_to(self, next: JobStatus) -> Result<JobStatus, PipelineError> {
        use JobStatus::*;
        let legal = match (self, next) {
            (Queued { total_pages }, Processing { current_page, total_pages: t }) => {
                current_page == 1 && t == total_pages
            }
            (Queued { .. }, Errored | Cancelled) => true,
            (
                Processing {
                    current_page,
                    total_pages,
                },
                Processing {
                    current_page: next_page,
                    total_pages: t,
                },
            ) => {
                t == total_pages
                    && next_page <= total_pages
                    && (next_page == current_page || next_page == current_page + 1)
            }
            (Processing { .. }, Completed | Errored | Cancelled) => true,
            _ => false,
        };
        if legal {
            Ok(next)
        } else {
            Err(PipelineError::Validation(format!(
                "illegal status transition from {self:?} to {next:?}"
            )))
        }
    }
}

/// One user-submitted document's processing run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,

    /// Who gets charged for the pages.
    pub owner_id: String,

    /// Page images in processing order. Fixed at creation.
    pub page_refs: Vec<PathBuf>,

    pub status: JobStatus,

    /// Set when the job ended because somebody cancelled it.
    #[serde(default)]
    pub is_cancelled: bool,

    /// One entry per page processed so far, in page order.
    #[serde(default)]
    pub result_refs: Vec<ResultRef>,

    /// Models and options used for every page.
    pub config: RecognitionConfig,
}

impl Job {
    /// Create a new queued job.
    pub fn new(owner_id: impl Into<String>, page_refs: Vec<PathBuf>, config: RecognitionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            status: JobStatus::Queued {
                total_pages: page_refs.len(),
            },
            page_refs,
            is_cancelled: false,
            result_refs: vec![],
            config,
        }
    }

    pub fn total_pages(&self) -> usize {
        self.page_refs.len()
    }

    /// Move to a new status, refusing illegal transitions.
    pub fn set_status(&mut self, next: JobStatus) -> Result<(), PipelineError> {
        self.status = self.status.transition_to(next)?;
        Ok(())
    }

    /// Record the result for the next page.
    pub fn push_result(&mut self, result_ref: ResultRef) -> Result<(), PipelineError> {
        if self.result_refs.len() >= self.page_refs.len() {
            return Err(PipelineError::Validation(format!(
                "job {} already has results for all {} pages",
                self.id,
                self.page_refs.len()
            )));
        }
        self.result_refs.push(result_ref);
        Ok(())
    }
}

/// The persisted outcome of recognizing one page.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PageResult {
    pub job_id: JobId,

    /// 1-based page number.
    pub page_number: usize,

    /// File name of the page image, as submitted.
    pub page_name: String,

    /// Detections in detector order.
    pub detections: Vec<Detection>,

    /// The configuration these detections were produced with.
    pub config: RecognitionConfig,

    /// Were detector regions merged into lines before recognition?
    #[serde(default)]
    pub merged: bool,
}
