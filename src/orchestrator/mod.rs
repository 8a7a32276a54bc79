//! The page-at-a-time job scheduler.
//!
//! A job is processed as a chain of short steps, one per page. Each step
//! checks for cancellation, recognizes one page, persists the result and
//! returns the next step as [`StepOutcome::Continue`]. The task queue
//! enqueues that continuation only after this step has finished, so pages of
//! one job never overlap and never run out of order, and no lock is needed.

use std::{sync::Arc, time::Duration};

use crate::{
    async_utils::io::remove_file_if_exists,
    config::{RecognitionConfig, invalid_config_keys},
    error::PipelineError,
    geometry::CropOptions,
    jobs::{Job, JobId, JobRepository, JobStatus, PageResult},
    prelude::*,
    recognition::RecognitionClients,
    store::{JobQueueStore, Progress},
};

pub mod page;

/// One step of a job's chain: "process the next page of this job".
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PageTask {
    pub job_id: JobId,
    pub owner_id: String,

    /// 1-based number of the page this step processes.
    pub page_number: usize,
    pub total_pages: usize,

    /// Pages not yet processed, starting with this step's page.
    pub remaining_page_refs: Vec<PathBuf>,

    pub config: RecognitionConfig,
}

impl PageTask {
    /// The first step of a newly created job.
    pub fn first(job: &Job) -> Self {
        Self {
            job_id: job.id,
            owner_id: job.owner_id.clone(),
            page_number: 1,
            total_pages: job.total_pages(),
            remaining_page_refs: job.page_refs.clone(),
            config: job.config.clone(),
        }
    }

    /// The step after this one.
    fn advance(mut self) -> Self {
        if !self.remaining_page_refs.is_empty() {
            self.remaining_page_refs.remove(0);
        }
        self.page_number += 1;
        self
    }
}

/// What a step did.
#[derive(Debug, PartialEq)]
pub enum StepOutcome {
    /// The page succeeded and this step should run next.
    Continue(PageTask),
    /// The chain ended with the job in this terminal state.
    Finished(JobStatus),
    /// The step was stale (job deleted, already finished, or page already
    /// done) and was ignored.
    Dropped,
}

/// Runs job steps and ad-hoc recognition requests.
pub struct Orchestrator {
    store: Arc<dyn JobQueueStore>,
    jobs: Arc<dyn JobRepository>,
    clients: RecognitionClients,
    call_timeout: Duration,
    crop_options: CropOptions,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobQueueStore>,
        jobs: Arc<dyn JobRepository>,
        clients: RecognitionClients,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            jobs,
            clients,
            call_timeout,
            crop_options: CropOptions::default(),
        }
    }

    /// Process the next page of a job.
    ///
    /// Returns `Err` only when the job's state couldn't be loaded or its
    /// failure couldn't be recorded. Page failures are recorded on the job
    /// and reported as `Finished(Errored)`.
    #[instrument(level = "debug", skip_all, fields(job_id = %task.job_id, page = task.page_number))]
    pub async fn process_next_page(&self, task: PageTask) -> Result<StepOutcome> {
        let Some(mut job) = self
            .jobs
            .load_job(task.job_id)
            .await
            .with_context(|| format!("failed to load job {}", task.job_id))?
        else {
            warn!(job_id = %task.job_id, "Job no longer exists, dropping its chain");
            self.release(task.job_id).await?;
            return Ok(StepOutcome::Dropped);
        };
        if job.status.is_terminal() {
            debug!(status = ?job.status, "Job already finished, dropping step");
            return Ok(StepOutcome::Dropped);
        }
        if task.page_number <= job.result_refs.len() {
            warn!(
                done = job.result_refs.len(),
                "Page was already processed, dropping duplicate step"
            );
            return Ok(StepOutcome::Dropped);
        }

        match self.step(&mut job, task).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.fail(&mut job, &err).await,
        }
    }

    /// Record `err` against a job and end its chain. Used when a
    /// continuation can't be enqueued.
    pub async fn abort_job(&self, job_id: JobId, err: PipelineError) -> Result<StepOutcome> {
        match self.jobs.load_job(job_id).await? {
            Some(mut job) if !job.status.is_terminal() => self.fail(&mut job, &err).await,
            _ => Ok(StepOutcome::Dropped),
        }
    }

    async fn step(&self, job: &mut Job, task: PageTask) -> Result<StepOutcome, PipelineError> {
        if self
            .store
            .is_cancelled(job.id)
            .await
            .map_err(PipelineError::storage)?
        {
            return self.cancel(job, &task).await;
        }
        validate_task(job, &task)?;

        let status = JobStatus::Processing {
            current_page: task.page_number,
            total_pages: task.total_pages,
        };
        job.set_status(status)?;
        self.save(job).await?;
        self.publish(job.id, Progress::page_started(status)).await?;

        let page_ref = &task.remaining_page_refs[0];
        let reporter = page::ProgressReporter {
            store: self.store.as_ref(),
            job_id: job.id,
            status,
        };
        let recognized = self
            .recognize_page(page_ref, &task.config, Some(&reporter))
            .await?;
        debug!(detections = recognized.detections.len(), "Recognized page");

        let result = PageResult {
            job_id: job.id,
            page_number: task.page_number,
            page_name: page_ref
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            detections: recognized.detections,
            config: task.config.clone(),
            merged: recognized.merged,
        };
        let result_ref = self
            .jobs
            .persist_page_result(&result)
            .await
            .map_err(PipelineError::storage)?;
        self.jobs
            .archive_page(job.id, task.page_number, page_ref)
            .await
            .map_err(PipelineError::storage)?;
        job.push_result(result_ref)?;
        self.save(job).await?;

        // Billing problems are somebody else's to sort out. The page is done.
        if let Err(err) = self.jobs.charge_owner(&task.owner_id, job.id, 1).await {
            warn!(owner_id = %task.owner_id, "Failed to charge owner: {err:#}");
        }

        let next = task.advance();
        if next.remaining_page_refs.is_empty() {
            job.set_status(JobStatus::Completed)?;
            self.save(job).await?;
            self.release(job.id).await.map_err(PipelineError::storage)?;
            info!(job_id = %job.id, pages = job.total_pages(), "Job completed");
            Ok(StepOutcome::Finished(JobStatus::Completed))
        } else {
            let status = JobStatus::Processing {
                current_page: next.page_number,
                total_pages: next.total_pages,
            };
            job.set_status(status)?;
            self.save(job).await?;
            self.publish(job.id, Progress::new(status)).await?;
            Ok(StepOutcome::Continue(next))
        }
    }

    /// End the chain because somebody cancelled the job.
    async fn cancel(&self, job: &mut Job, task: &PageTask) -> Result<StepOutcome, PipelineError> {
        info!(job_id = %job.id, page = task.page_number, "Job cancelled, stopping");
        job.set_status(JobStatus::Cancelled)?;
        job.is_cancelled = true;
        self.save(job).await?;
        release_pages(&task.remaining_page_refs).await;
        self.release(job.id).await.map_err(PipelineError::storage)?;
        Ok(StepOutcome::Finished(JobStatus::Cancelled))
    }

    /// Mark a job errored after a failed step.
    async fn fail(&self, job: &mut Job, err: &PipelineError) -> Result<StepOutcome> {
        error!(job_id = %job.id, kind = err.kind(), "Job failed: {err}");
        if !job.status.is_terminal() {
            job.set_status(JobStatus::Errored)?;
            job.is_cancelled = false;
            self.jobs
                .save_job(job)
                .await
                .with_context(|| format!("failed to record failure of job {}", job.id))?;
        }
        self.release(job.id).await?;
        Ok(StepOutcome::Finished(job.status))
    }

    async fn save(&self, job: &Job) -> Result<(), PipelineError> {
        self.jobs.save_job(job).await.map_err(PipelineError::storage)
    }

    async fn publish(&self, job_id: JobId, progress: Progress) -> Result<(), PipelineError> {
        self.store
            .set_progress(job_id, &progress)
            .await
            .map_err(PipelineError::storage)
    }

    /// Remove every trace of a job from the shared store.
    async fn release(&self, job_id: JobId) -> Result<()> {
        self.store.clear_progress(job_id).await?;
        self.store.clear_cancelled(job_id).await
    }
}

/// Check that a step agrees with the job it belongs to.
fn validate_task(job: &Job, task: &PageTask) -> Result<(), PipelineError> {
    let invalid = invalid_config_keys(None, &task.config);
    if !invalid.is_empty() {
        return Err(PipelineError::Validation(format!(
            "invalid recognition config keys: {}",
            invalid.join(", ")
        )));
    }
    if task.total_pages != job.total_pages() {
        return Err(PipelineError::Validation(format!(
            "step expects {} pages but job has {}",
            task.total_pages,
            job.total_pages()
        )));
    }
    if task.page_number != job.result_refs.len() + 1 {
        return Err(PipelineError::Validation(format!(
            "step is for page {} but {} pages are done",
            task.page_number,
            job.result_refs.len()
        )));
    }
    let expected_remaining = task.total_pages + 1 - task.page_number.min(task.total_pages + 1);
    if task.remaining_page_refs.is_empty() || task.remaining_page_refs.len() != expected_remaining {
        return Err(PipelineError::Validation(format!(
            "step for page {}/{} carries {} remaining pages",
            task.page_number,
            task.total_pages,
            task.remaining_page_refs.len()
        )));
    }
    Ok(())
}

/// Delete page images that will never be processed. Failures are only
/// logged.
async fn release_pages(pages: &[PathBuf]) {
    for page in pages {
        if let Err(err) = remove_file_if_exists(page).await {
            warn!("Failed to release page: {err:#}");
        }
    }
}
