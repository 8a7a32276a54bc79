//! Operations used by the outside world to drive jobs.
//!
//! These are thin wrappers that put records, store entries and tasks in the
//! shape the orchestrator expects.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;

use super::{Job, JobId, JobRepository, JobStatus};
use crate::{
    config::{ModelCatalog, RecognitionConfig, invalid_config_keys},
    error::PipelineError,
    geometry::Region,
    orchestrator::PageTask,
    prelude::*,
    queues::{Lane, Task, TaskQueue},
    store::{JobQueueStore, Progress, TaskId, TaskResult},
};

/// Why a submission was turned away. Callers can find this with
/// [`anyhow::Error::downcast_ref`].
#[derive(Debug, Error)]
pub enum Rejection {
    #[error(transparent)]
    Invalid(#[from] PipelineError),

    #[error("too many jobs in flight ({in_flight}, limit {limit}), try again later")]
    Busy { in_flight: usize, limit: usize },
}

/// Submits, cancels and inspects jobs.
pub struct JobControl {
    store: Arc<dyn JobQueueStore>,
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn TaskQueue>,
    catalog: Option<ModelCatalog>,
    max_in_flight: usize,
}

impl JobControl {
    pub fn new(
        store: Arc<dyn JobQueueStore>,
        jobs: Arc<dyn JobRepository>,
        queue: Arc<dyn TaskQueue>,
        catalog: Option<ModelCatalog>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            store,
            jobs,
            queue,
            catalog,
            max_in_flight,
        }
    }

    fn check_config(&self, config: &RecognitionConfig) -> Result<(), Rejection> {
        let invalid = invalid_config_keys(self.catalog.as_ref(), config);
        if invalid.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Validation(format!(
                "unknown or empty model for {}",
                invalid.join(", ")
            ))
            .into())
        }
    }

    fn check_region_request(&self, region: &Region, recognizer: &str) -> Result<(), Rejection> {
        region.check_bounds()?;
        if !region.is_at_least(1, 1) {
            return Err(PipelineError::Validation(format!(
                "region is too small to recognize: {region:?}"
            ))
            .into());
        }
        let known = match &self.catalog {
            Some(catalog) => catalog.recognizers.iter().any(|r| r == recognizer),
            None => !recognizer.trim().is_empty(),
        };
        if !known {
            return Err(PipelineError::Validation(format!(
                "unknown or empty model for recognizer: {recognizer:?}"
            ))
            .into());
        }
        Ok(())
    }

    /// Accept a new job and enqueue its first page.
    #[instrument(level = "debug", skip_all, fields(job_id = %job.id, pages = job.total_pages()))]
    pub async fn submit_job(&self, job: Job) -> Result<Job> {
        self.check_config(&job.config)?;
        if job.status != (JobStatus::Queued { total_pages: job.total_pages() }) {
            return Err(Rejection::from(PipelineError::Validation(format!(
                "new jobs must be queued, not {:?}",
                job.status
            )))
            .into());
        }
        if job.total_pages() == 0 {
            return Err(Rejection::from(PipelineError::Validation(
                "a job needs at least one page".to_owned(),
            ))
            .into());
        }
        let in_flight = self.store.count_in_flight().await?;
        if in_flight > self.max_in_flight {
            return Err(Rejection::Busy {
                in_flight,
                limit: self.max_in_flight,
            }
            .into());
        }

        self.jobs.create_job(&job).await?;
        self.store
            .set_progress(job.id, &Progress::new(job.status))
            .await?;
        self.queue
            .push(Lane::NewUpload, &Task::Page(PageTask::first(&job)))
            .await?;
        info!(job_id = %job.id, owner_id = %job.owner_id, "Submitted job");
        Ok(job)
    }

    /// Ask for a job to be cancelled. The running chain notices before its
    /// next page. Returns false if the job is unknown or already finished.
    #[instrument(level = "debug", skip(self))]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        if !self.is_unfinished(job_id).await? {
            return Ok(false);
        }
        self.store.clear_progress(job_id).await?;
        self.store.mark_cancelled(job_id).await?;

        // The chain may have finished and released the job between our check
        // and the mark. It won't look at the flag again, so take it back.
        if !self.is_unfinished(job_id).await? {
            self.store.clear_cancelled(job_id).await?;
            debug!(%job_id, "Job finished before the cancellation landed");
            return Ok(false);
        }
        info!(%job_id, "Requested cancellation");
        Ok(true)
    }

    async fn is_unfinished(&self, job_id: JobId) -> Result<bool> {
        Ok(matches!(
            self.jobs.load_job(job_id).await?,
            Some(job) if !job.status.is_terminal()
        ))
    }

    /// The freshest view of a job's state, or `None` for an unknown job.
    ///
    /// A finished job record always wins. Otherwise a pending cancellation
    /// wins over published progress.
    pub async fn job_status(&self, job_id: JobId) -> Result<Option<Progress>> {
        let job = self.jobs.load_job(job_id).await?;
        if let Some(job) = &job {
            if job.status.is_terminal() {
                return Ok(Some(Progress::new(job.status)));
            }
        }
        if self.store.is_cancelled(job_id).await? {
            return Ok(Some(Progress::new(JobStatus::Cancelled)));
        }
        if let Some(progress) = self.store.get_progress(job_id).await? {
            return Ok(Some(progress));
        }
        Ok(job.map(|job| Progress::new(job.status)))
    }

    /// Queue recognition of one region of an archived page.
    pub async fn submit_single(
        &self,
        image_ref: PathBuf,
        region: Region,
        recognizer: String,
    ) -> Result<TaskId> {
        self.check_region_request(&region, &recognizer)?;
        self.submit_ad_hoc(Lane::ReRecognition, Task::single_region(image_ref, region, recognizer))
            .await
    }

    /// Queue recognition of a page that isn't part of any job.
    pub async fn submit_service_page(
        &self,
        image_ref: PathBuf,
        config: RecognitionConfig,
    ) -> Result<TaskId> {
        self.check_config(&config)?;
        self.submit_ad_hoc(Lane::Service, Task::service_page(image_ref, config))
            .await
    }

    async fn submit_ad_hoc(&self, lane: Lane, task: Task) -> Result<TaskId> {
        let task_id = task
            .task_id()
            .ok_or_else(|| anyhow!("ad-hoc tasks must carry a task ID"))?;
        self.queue.push(lane, &task).await?;
        debug!(%task_id, %lane, "Submitted ad-hoc task");
        Ok(task_id)
    }

    /// Wait for an ad-hoc task's result, checking every `poll` until
    /// `timeout` has passed.
    pub async fn await_task_result(
        &self,
        task_id: TaskId,
        timeout: Duration,
        poll: Duration,
    ) -> Result<TaskResult> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.store.take_task_result(task_id).await? {
                return Ok(result);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "no result for task {task_id} after {}s",
                    timeout.as_secs_f32()
                ));
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        jobs::{PageResult, ResultRef, memory::MemoryJobRepository},
        queues::MemoryTaskQueue,
        store::MemoryJobQueueStore,
    };

    /// Answers its first `load_job` with the record as it was, but only after
    /// the job has finished and been released behind the caller's back.
    struct FinishesDuringLoad {
        inner: Arc<MemoryJobRepository>,
        finished: Mutex<Option<Job>>,
    }

    #[async_trait]
    impl JobRepository for FinishesDuringLoad {
        async fn create_job(&self, job: &Job) -> Result<()> {
            self.inner.create_job(job).await
        }

        async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
            let snapshot = self.inner.load_job(job_id).await?;
            let finished = self.finished.lock().expect("lock poisoned").take();
            if let Some(done) = finished {
                self.inner.save_job(&done).await?;
            }
            Ok(snapshot)
        }

        async fn save_job(&self, job: &Job) -> Result<()> {
            self.inner.save_job(job).await
        }

        async fn persist_page_result(&self, result: &PageResult) -> Result<ResultRef> {
            self.inner.persist_page_result(result).await
        }

        async fn load_page_results(&self, job_id: JobId) -> Result<Vec<PageResult>> {
            self.inner.load_page_results(job_id).await
        }

        async fn archive_page(&self, job_id: JobId, page_number: usize, page: &Path) -> Result<PathBuf> {
            self.inner.archive_page(job_id, page_number, page).await
        }

        async fn charge_owner(&self, owner_id: &str, job_id: JobId, units: u32) -> Result<()> {
            self.inner.charge_owner(owner_id, job_id, units).await
        }
    }

    struct Setup {
        store: Arc<MemoryJobQueueStore>,
        repo: Arc<MemoryJobRepository>,
        queue: Arc<MemoryTaskQueue>,
        control: JobControl,
    }

    fn setup(catalog: Option<ModelCatalog>, max_in_flight: usize) -> Setup {
        let store = Arc::new(MemoryJobQueueStore::new());
        let repo = Arc::new(MemoryJobRepository::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let control = JobControl::new(
            store.clone(),
            repo.clone(),
            queue.clone(),
            catalog,
            max_in_flight,
        );
        Setup {
            store,
            repo,
            queue,
            control,
        }
    }

    fn job(pages: usize) -> Job {
        let refs = (0..pages)
            .map(|n| PathBuf::from(format!("inbox/{n}.png")))
            .collect();
        Job::new("alice", refs, RecognitionConfig::default())
    }

    #[tokio::test]
    async fn test_submit_enqueues_first_page() {
        let s = setup(None, 10);
        let job = s.control.submit_job(job(2)).await.unwrap();

        assert!(s.repo.load_job(job.id).await.unwrap().is_some());
        let progress = s.store.get_progress(job.id).await.unwrap().unwrap();
        assert_eq!(progress.status_code(), 0);
        assert_eq!(progress.message(), "2 Pages parsed. Queued for processing...");

        let (lane, task) = s.queue.pop().await.unwrap().unwrap();
        assert_eq!(lane, Lane::NewUpload);
        let Task::Page(page_task) = task else {
            panic!("expected a page task");
        };
        assert_eq!(page_task.page_number, 1);
        assert_eq!(page_task.remaining_page_refs.len(), 2);
    }

    #[tokio::test]
    async fn test_submit_validates_against_catalog() {
        let catalog = ModelCatalog {
            detectors: vec!["default".to_owned()],
            recognizers: vec!["hi-crnn".to_owned()],
        };
        let s = setup(Some(catalog), 10);
        let err = s.control.submit_job(job(1)).await.unwrap_err();
        match err.downcast_ref::<Rejection>() {
            Some(Rejection::Invalid(PipelineError::Validation(msg))) => {
                assert!(msg.contains("recognizer"), "{msg}");
                assert!(!msg.contains("detector"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(s.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_jobs() {
        let s = setup(None, 10);
        let err = s.control.submit_job(job(0)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Rejection>(),
            Some(Rejection::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_admission_control() {
        let s = setup(None, 1);
        s.control.submit_job(job(1)).await.unwrap();
        // One in flight is not over the limit of one.
        s.control.submit_job(job(1)).await.unwrap();
        let err = s.control.submit_job(job(1)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Rejection>(),
            Some(Rejection::Busy {
                in_flight: 2,
                limit: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_and_status() {
        let s = setup(None, 10);
        let job = s.control.submit_job(job(3)).await.unwrap();
        assert!(s.control.cancel_job(job.id).await.unwrap());
        assert!(s.store.is_cancelled(job.id).await.unwrap());
        assert!(s.store.get_progress(job.id).await.unwrap().is_none());
        let status = s.control.job_status(job.id).await.unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Cancelled);
        assert_eq!(status.status_code(), 7);

        assert!(!s.control.cancel_job(JobId::new_v4()).await.unwrap());
        assert!(s.control.job_status(JobId::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_falls_back_to_job_record() {
        let s = setup(None, 10);
        let mut job = s.control.submit_job(job(1)).await.unwrap();
        job.set_status(JobStatus::Errored).unwrap();
        s.repo.save_job(&job).await.unwrap();
        s.store.clear_progress(job.id).await.unwrap();

        let status = s.control.job_status(job.id).await.unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Errored);
        // Finished jobs can't be cancelled.
        assert!(!s.control.cancel_job(job.id).await.unwrap());
        assert!(!s.store.is_cancelled(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_loses_to_a_job_that_finishes_first() {
        let store = Arc::new(MemoryJobQueueStore::new());
        let inner = Arc::new(MemoryJobRepository::new());
        let job = job(1);
        inner.create_job(&job).await.unwrap();
        let mut done = job.clone();
        done.status = JobStatus::Completed;
        let repo = Arc::new(FinishesDuringLoad {
            inner: inner.clone(),
            finished: Mutex::new(Some(done)),
        });
        let control = JobControl::new(
            store.clone(),
            repo,
            Arc::new(MemoryTaskQueue::new()),
            None,
            10,
        );

        assert!(!control.cancel_job(job.id).await.unwrap());
        assert!(!store.is_cancelled(job.id).await.unwrap());
        let status = control.job_status(job.id).await.unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_status_prefers_finished_record_over_stale_flag() {
        let s = setup(None, 10);
        let mut job = s.control.submit_job(job(1)).await.unwrap();
        job.status = JobStatus::Completed;
        s.repo.save_job(&job).await.unwrap();
        s.store.mark_cancelled(job.id).await.unwrap();

        let status = s.control.job_status(job.id).await.unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_single_region_requests_are_validated() {
        let catalog = ModelCatalog {
            detectors: vec!["default".to_owned()],
            recognizers: vec!["hi-crnn".to_owned()],
        };
        let s = setup(Some(catalog), 10);
        let bad = [
            (Region::new(0, 0, 0, 5), "hi-crnn"),
            (Region::new(0, 0, 5, 5), "default"),
            (Region::new(0, 0, 5, 5), " "),
            (Region::new(-2_000_000_000, 0, 2_000_000_000, 5), "hi-crnn"),
        ];
        for (region, recognizer) in bad {
            let err = s
                .control
                .submit_single(PathBuf::from("b.png"), region.clone(), recognizer.to_owned())
                .await
                .unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<Rejection>(),
                    Some(Rejection::Invalid(PipelineError::Validation(_)))
                ),
                "{region:?} {recognizer:?}: {err}"
            );
        }
        assert_eq!(s.queue.pending_count().await.unwrap(), 0);

        s.control
            .submit_single(
                PathBuf::from("b.png"),
                Region::new(0, 0, 5, 5),
                "hi-crnn".to_owned(),
            )
            .await
            .unwrap();
        assert_eq!(s.queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ad_hoc_tasks_use_their_lanes() {
        let s = setup(None, 10);
        let service_id = s
            .control
            .submit_service_page(PathBuf::from("a.png"), RecognitionConfig::default())
            .await
            .unwrap();
        let single_id = s
            .control
            .submit_single(
                PathBuf::from("b.png"),
                Region::new(0, 0, 5, 5),
                "default".to_owned(),
            )
            .await
            .unwrap();
        let (lane, task) = s.queue.pop().await.unwrap().unwrap();
        assert_eq!((lane, task.task_id()), (Lane::ReRecognition, Some(single_id)));
        let (lane, task) = s.queue.pop().await.unwrap().unwrap();
        assert_eq!((lane, task.task_id()), (Lane::Service, Some(service_id)));
    }

    #[tokio::test]
    async fn test_await_task_result() {
        let s = setup(None, 10);
        let task_id = TaskId::new_v4();
        let err = s
            .control
            .await_task_result(task_id, Duration::ZERO, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no result"));

        let result = TaskResult::Text {
            text: "hello".to_owned(),
        };
        s.store
            .put_task_result(task_id, &result, Duration::from_secs(60))
            .await
            .unwrap();
        let got = s
            .control
            .await_task_result(task_id, Duration::from_secs(1), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(got, result);
    }
}
