//! Shared job state: cancellation flags, live progress, and results of
//! ad-hoc tasks.
//!
//! Any number of worker processes read and write this store at once. Every
//! operation touches a single key and is atomic on its own, so no locks or
//! transactions are needed. Entries are advisory. The [`crate::jobs::Job`]
//! record is the source of truth once a job ends, and entries are removed on
//! every terminal transition.

use std::{fmt, time::Duration};

use uuid::Uuid;

use crate::{
    jobs::{JobId, JobStatus},
    prelude::*,
    recognition::Detection,
};

pub mod memory;
pub mod redis;

pub use self::{memory::MemoryJobQueueStore, redis::RedisJobQueueStore};

/// Identifies an ad-hoc task whose result a caller is waiting for.
pub type TaskId = Uuid;

/// What a job is doing right now, at a finer grain than [`JobStatus`].
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    /// Between pages. For a processing job, the previous page is done and
    /// the current one is queued.
    #[default]
    Waiting,
    /// The current page is being loaded and sent to the detector.
    Page,
    /// Regions of the current page are being recognized.
    Regions { done: usize, total: usize },
}

/// The progress record the store keeps for each in-flight job.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub status: JobStatus,
    #[serde(flatten)]
    pub stage: Stage,
}

impl Progress {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            stage: Stage::Waiting,
        }
    }

    /// Progress for a page that has just started.
    pub fn page_started(status: JobStatus) -> Self {
        Self {
            status,
            stage: Stage::Page,
        }
    }

    /// Progress through the regions of the current page.
    pub fn regions(status: JobStatus, done: usize, total: usize) -> Self {
        Self {
            status,
            stage: Stage::Regions { done, total },
        }
    }

    /// Numeric status code understood by existing clients.
    pub fn status_code(&self) -> u8 {
        match (self.status, self.stage) {
            (JobStatus::Queued { .. }, _) => 0,
            (JobStatus::Processing { .. }, Stage::Waiting) => 1,
            (JobStatus::Processing { .. }, Stage::Page) => 2,
            (JobStatus::Processing { .. }, Stage::Regions { .. }) => 3,
            (JobStatus::Completed, _) => 5,
            (JobStatus::Errored, _) => 6,
            (JobStatus::Cancelled, _) => 7,
        }
    }

    /// A short message for people.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// "Page" or "Pages", as appropriate.
fn pages(count: usize) -> &'static str {
    if count == 1 { "Page" } else { "Pages" }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.stage) {
            (JobStatus::Queued { total_pages }, _) => write!(
                f,
                "{total_pages} {} parsed. Queued for processing...",
                pages(total_pages)
            ),
            (
                JobStatus::Processing {
                    current_page,
                    total_pages,
                },
                Stage::Waiting,
            ) => {
                let done = current_page.saturating_sub(1);
                let queued = total_pages - done;
                write!(
                    f,
                    "{done} {} processed. {queued} {} queued.",
                    pages(done),
                    pages(queued)
                )
            }
            (
                JobStatus::Processing {
                    current_page,
                    total_pages,
                },
                Stage::Page,
            ) => write!(f, "Processing page {current_page}/{total_pages}."),
            (
                JobStatus::Processing {
                    current_page,
                    total_pages,
                },
                Stage::Regions { done, total },
            ) => write!(
                f,
                "Processing page {current_page}/{total_pages}, region {done}/{total}."
            ),
            (JobStatus::Completed, _) => write!(f, "Completed."),
            (JobStatus::Errored, _) => write!(f, "Errored."),
            (JobStatus::Cancelled, _) => write!(f, "Cancelled."),
        }
    }
}

/// The outcome of an ad-hoc task, as handed back to whoever submitted it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResult {
    /// Text recognized for a single region.
    Text { text: String },
    /// Detections for a whole page.
    Detections { detections: Vec<Detection> },
    /// The task failed.
    Failed { error: String },
}

/// Shared, concurrently accessed job state.
#[async_trait]
pub trait JobQueueStore: Send + Sync + 'static {
    /// Ask the job's next step to cancel it.
    async fn mark_cancelled(&self, job_id: JobId) -> Result<()>;

    /// Has cancellation been requested for this job?
    async fn is_cancelled(&self, job_id: JobId) -> Result<bool>;

    /// Forget a cancellation request.
    async fn clear_cancelled(&self, job_id: JobId) -> Result<()>;

    /// Publish a job's progress.
    async fn set_progress(&self, job_id: JobId, progress: &Progress) -> Result<()>;

    /// Look up a job's published progress.
    async fn get_progress(&self, job_id: JobId) -> Result<Option<Progress>>;

    /// Stop tracking a job's progress.
    async fn clear_progress(&self, job_id: JobId) -> Result<()>;

    /// How many jobs currently have published progress.
    async fn count_in_flight(&self) -> Result<usize>;

    /// Store the result of an ad-hoc task. It expires after `ttl`.
    async fn put_task_result(&self, task_id: TaskId, result: &TaskResult, ttl: Duration) -> Result<()>;

    /// Remove and return the result of an ad-hoc task, if it's ready.
    async fn take_task_result(&self, task_id: TaskId) -> Result<Option<TaskResult>>;
}

/// Decode a progress record from its stored form.
fn decode_progress(job_id: JobId, raw: &str) -> Result<Progress> {
    serde_json::from_str(raw)
        .with_context(|| format!("malformed progress record for job {job_id}: {raw:?}"))
}

/// Decode a task result from its stored form.
fn decode_task_result(task_id: TaskId, raw: &str) -> Result<TaskResult> {
    serde_json::from_str(raw)
        .with_context(|| format!("malformed result for task {task_id}: {raw:?}"))
}
