//! Command-line entry points.

use std::{sync::Arc, time::Duration};

use clap::Args;

use crate::{
    config::{RecognitionConfig, Settings},
    jobs::{FsJobRepository, control::JobControl},
    orchestrator::Orchestrator,
    prelude::*,
    queues::{
        MemoryTaskQueue, RedisTaskQueue, TaskQueue,
        worker::{RunMode, TaskRunner, Worker, WorkerStats},
    },
    recognition::RecognitionClients,
    store::{
        JobQueueStore, MemoryJobQueueStore, RedisJobQueueStore, TaskId, TaskResult,
        redis::connect,
    },
    ui::{Activity, Ui},
};

pub mod cancel;
pub mod recognize;
pub mod rerun;
pub mod run;
pub mod status;
pub mod submit;
pub mod worker;

/// Options describing how to recognize pages.
#[derive(Debug, Clone, Args)]
pub struct RecognitionOpts {
    /// Region detector model ID.
    #[clap(long, default_value = "default")]
    detector: String,

    /// Text recognizer model ID.
    #[clap(long, default_value = "default")]
    recognizer: String,

    /// Language hint for the detector.
    #[clap(long, default_value = "en")]
    language: String,

    /// Don't let the detector pad pages.
    #[clap(long)]
    no_padding: bool,

    /// Merge detected fragments into whole lines before recognition.
    #[clap(long)]
    merge_regions: bool,
}

impl RecognitionOpts {
    pub fn to_config(&self) -> RecognitionConfig {
        RecognitionConfig {
            detector: self.detector.clone(),
            recognizer: self.recognizer.clone(),
            language: self.language.clone(),
            allow_padding: !self.no_padding,
            merge_regions: self.merge_regions,
        }
    }
}

/// The shared state a command works against.
pub struct Services {
    pub store: Arc<dyn JobQueueStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub jobs: Arc<FsJobRepository>,
    /// Is `store` visible to other processes?
    pub shared: bool,
}

impl Services {
    /// Connect to Redis if configured, or fall back to in-process state.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let Some(redis_url) = &settings.redis_url else {
            return Ok(Self::in_process(settings));
        };
        let conn = connect(redis_url).await?;
        debug!(key_prefix = %settings.key_prefix, "Connected to Redis");
        Ok(Self {
            store: Arc::new(RedisJobQueueStore::new(conn.clone(), &settings.key_prefix)),
            queue: Arc::new(RedisTaskQueue::new(conn, &settings.key_prefix)),
            jobs: Arc::new(FsJobRepository::new(&settings.data_dir)),
            shared: true,
        })
    }

    /// State that only this process can see.
    pub fn in_process(settings: &Settings) -> Self {
        Self {
            store: Arc::new(MemoryJobQueueStore::new()),
            queue: Arc::new(MemoryTaskQueue::new()),
            jobs: Arc::new(FsJobRepository::new(&settings.data_dir)),
            shared: false,
        }
    }

    /// Fail unless other processes can see our state.
    pub fn require_shared(&self, what: &str) -> Result<()> {
        if self.shared {
            Ok(())
        } else {
            Err(anyhow!(
                "{what} needs a shared store; set --redis-url (or OCR_REDIS_URL)"
            ))
        }
    }

    pub async fn control(&self, settings: &Settings) -> Result<JobControl> {
        Ok(JobControl::new(
            self.store.clone(),
            self.jobs.clone(),
            self.queue.clone(),
            settings.load_catalog().await?,
            settings.max_in_flight,
        ))
    }

    pub fn worker(&self, settings: &Settings) -> Result<Worker> {
        let orchestrator = Arc::new(Orchestrator::new(
            self.store.clone(),
            self.jobs.clone(),
            RecognitionClients::from_settings(settings)?,
            settings.call_timeout(),
        ));
        let runner = Arc::new(TaskRunner::new(
            orchestrator,
            self.queue.clone(),
            self.store.clone(),
        ));
        Ok(Worker::new(
            runner,
            self.queue.clone(),
            settings.worker_count(),
            settings.poll_interval(),
        ))
    }

    /// Drain the in-process queue, showing a spinner.
    pub async fn drain_locally(&self, ui: &Ui, settings: &Settings) -> Result<WorkerStats> {
        let worker = self.worker(settings)?;
        let spinner = ui.task_spinner(Activity::RecognizingLocally);
        let stats = worker
            .run(RunMode::UntilIdle, |_| spinner.inc(1))
            .await?;
        spinner.finish_using_style();
        Ok(stats)
    }
}

/// Collect the result of an ad-hoc task. Without a shared store, we run the
/// task ourselves first.
pub async fn collect_ad_hoc_result(
    ui: &Ui,
    settings: &Settings,
    services: &Services,
    control: &JobControl,
    task_id: TaskId,
    wait: Duration,
) -> Result<TaskResult> {
    if !services.shared {
        services.drain_locally(ui, settings).await?;
    }
    control
        .await_task_result(task_id, wait, settings.poll_interval())
        .await
}

/// Print an ad-hoc task result as JSON, failing if the task failed.
pub fn print_task_result(result: &TaskResult) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(result).context("failed to serialize task result")?
    );
    match result {
        TaskResult::Failed { error } => Err(anyhow!("task failed: {error}")),
        _ => Ok(()),
    }
}
