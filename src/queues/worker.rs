//! The worker loop: pull tasks from the shared queue and run them.

use std::{sync::Arc, time::Duration};

use futures::{FutureExt as _, StreamExt as _, stream::FuturesUnordered};

use super::{
    Lane, Task, TaskQueue,
    work::{WorkFn, WorkItemProcessor as _, WorkQueue},
};
use crate::{
    async_utils::BoxedFuture,
    error::PipelineError,
    jobs::JobStatus,
    orchestrator::{Orchestrator, StepOutcome},
    prelude::*,
    store::{JobQueueStore, TaskId, TaskResult},
};

/// How long an ad-hoc task's result waits to be collected.
pub const TASK_RESULT_TTL: Duration = Duration::from_secs(600);

/// When should a worker stop?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Keep polling until interrupted with Ctrl-C.
    UntilInterrupted,
    /// Stop once the queue is empty and nothing is running.
    UntilIdle,
}

/// What running one task amounted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskReport {
    /// A job step ran, and the job moved on to its next page.
    Continued,
    /// A job step ran and ended the job's chain.
    Finished(JobStatus),
    /// A job step was stale and ignored.
    Dropped,
    /// An ad-hoc task ran. `ok` is false if it failed.
    AdHoc { ok: bool },
}

/// Counters reported when a worker stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub steps: usize,
    pub completed: usize,
    pub errored: usize,
    pub cancelled: usize,
    pub dropped: usize,
    pub ad_hoc: usize,
    pub ad_hoc_failed: usize,
    /// Tasks that couldn't even be run, such as malformed queue entries.
    pub failures: usize,
}

impl WorkerStats {
    fn record(&mut self, result: Result<TaskReport>) {
        match result {
            Ok(TaskReport::Continued) => self.steps += 1,
            Ok(TaskReport::Finished(status)) => {
                self.steps += 1;
                match status {
                    JobStatus::Completed => self.completed += 1,
                    JobStatus::Cancelled => self.cancelled += 1,
                    _ => self.errored += 1,
                }
            }
            Ok(TaskReport::Dropped) => self.dropped += 1,
            Ok(TaskReport::AdHoc { ok }) => {
                self.ad_hoc += 1;
                if !ok {
                    self.ad_hoc_failed += 1;
                }
            }
            Err(err) => {
                error!("Task failed: {err:#}");
                self.failures += 1;
            }
        }
    }
}

/// Runs a single task, including enqueueing any continuation.
pub struct TaskRunner {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn JobQueueStore>,
}

impl TaskRunner {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn JobQueueStore>,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            store,
        }
    }

    /// Run `task`, which was taken from `lane`.
    #[instrument(level = "debug", skip_all, fields(lane = %lane))]
    pub async fn run(&self, lane: Lane, task: Task) -> Result<TaskReport> {
        match task {
            Task::Page(page_task) => {
                let job_id = page_task.job_id;
                let outcome = match self.orchestrator.process_next_page(page_task).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        // Nothing will pick this chain up again.
                        if let Err(clear_err) = self.store.clear_progress(job_id).await {
                            warn!(%job_id, "Can't clear progress of abandoned job: {clear_err:#}");
                        }
                        return Err(err);
                    }
                };
                match outcome {
                    StepOutcome::Continue(next) => {
                        // The continuation is only visible to other workers
                        // once this step is fully done.
                        if let Err(err) = self.queue.push(lane, &Task::Page(next)).await {
                            let outcome = self
                                .orchestrator
                                .abort_job(job_id, PipelineError::storage(err))
                                .await?;
                            return Ok(match outcome {
                                StepOutcome::Finished(status) => TaskReport::Finished(status),
                                _ => TaskReport::Dropped,
                            });
                        }
                        Ok(TaskReport::Continued)
                    }
                    StepOutcome::Finished(status) => Ok(TaskReport::Finished(status)),
                    StepOutcome::Dropped => Ok(TaskReport::Dropped),
                }
            }
            Task::SingleRegion {
                task_id,
                image_ref,
                region,
                recognizer,
            } => {
                let result = match self
                    .orchestrator
                    .process_single_region(&image_ref, &region, &recognizer)
                    .await
                {
                    Ok(text) => TaskResult::Text { text },
                    Err(err) => failed(err),
                };
                self.finish_ad_hoc(task_id, result).await
            }
            Task::ServicePage {
                task_id,
                image_ref,
                config,
            } => {
                let result = match self
                    .orchestrator
                    .process_service_page(&image_ref, &config)
                    .await
                {
                    Ok(detections) => TaskResult::Detections { detections },
                    Err(err) => failed(err),
                };
                self.finish_ad_hoc(task_id, result).await
            }
        }
    }

    async fn finish_ad_hoc(&self, task_id: TaskId, result: TaskResult) -> Result<TaskReport> {
        let ok = !matches!(result, TaskResult::Failed { .. });
        self.store
            .put_task_result(task_id, &result, TASK_RESULT_TTL)
            .await?;
        Ok(TaskReport::AdHoc { ok })
    }
}

fn failed(err: PipelineError) -> TaskResult {
    warn!(kind = err.kind(), "Ad-hoc task failed: {err}");
    TaskResult::Failed {
        error: err.to_string(),
    }
}

/// Pulls tasks from a [`TaskQueue`] and runs up to `concurrency` at once.
pub struct Worker {
    runner: Arc<TaskRunner>,
    queue: Arc<dyn TaskQueue>,
    concurrency: usize,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        runner: Arc<TaskRunner>,
        queue: Arc<dyn TaskQueue>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runner,
            queue,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Run until `mode` says to stop, then wait for running tasks to finish.
    ///
    /// `on_report` is called after every task, for progress displays.
    #[instrument(level = "debug", skip_all, fields(concurrency = self.concurrency))]
    pub async fn run(
        &self,
        mode: RunMode,
        mut on_report: impl FnMut(&Result<TaskReport>),
    ) -> Result<WorkerStats> {
        let runner = self.runner.clone();
        let work_fn: WorkFn<(Lane, Task), TaskReport> = Arc::new(move |(lane, task)| {
            let runner = runner.clone();
            async move { runner.run(lane, task).await }.boxed()
        });
        let (work_queue, join_worker) = WorkQueue::new(self.concurrency, work_fn);
        let handle = work_queue.handle();

        let mut shutdown: BoxedFuture<()> = match mode {
            RunMode::UntilInterrupted => Box::pin(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Interrupted, finishing running tasks"),
                    Err(err) => {
                        error!("Can't listen for Ctrl-C: {err}");
                        futures::future::pending::<()>().await
                    }
                }
            }),
            RunMode::UntilIdle => Box::pin(futures::future::pending()),
        };

        let mut stats = WorkerStats::default();
        let mut pending = FuturesUnordered::new();
        let mut record = |stats: &mut WorkerStats, result: Result<TaskReport>| {
            on_report(&result);
            stats.record(result);
        };
        let flatten = |received: Result<Result<TaskReport>, futures::channel::oneshot::Canceled>| {
            received.unwrap_or_else(|_| Err(anyhow!("task was dropped before finishing")))
        };

        loop {
            while let Some(Some(received)) = pending.next().now_or_never() {
                record(&mut stats, flatten(received));
            }

            let popped = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                popped = self.queue.pop() => popped,
            };
            match popped {
                Ok(Some((lane, task))) => {
                    trace!(%lane, "Dispatching task");
                    pending.push(handle.submit_input((lane, task)).await?);
                }
                Ok(None) if pending.is_empty() && mode == RunMode::UntilIdle => break,
                Ok(None) if pending.is_empty() => {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Ok(None) => {
                    // Something is still running and may enqueue more work.
                    tokio::select! {
                        _ = &mut shutdown => break,
                        Some(received) = pending.next() => record(&mut stats, flatten(received)),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(err) => {
                    record(&mut stats, Err(err.context("failed to take a task from the queue")));
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        while let Some(received) = pending.next().await {
            record(&mut stats, flatten(received));
        }
        drop(handle);
        drop(work_queue);
        join_worker.join().await?;
        info!(?stats, "Worker stopped");
        Ok(stats)
    }
}
