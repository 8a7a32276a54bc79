//! In-process [`JobQueueStore`], for single-process runs and tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::{Duration, Instant},
};

use super::{
    JobQueueStore, Progress, TaskId, TaskResult, decode_progress, decode_task_result,
};
use crate::{jobs::JobId, prelude::*};

#[derive(Default)]
struct State {
    cancelled: HashSet<JobId>,
    /// Progress is stored serialized, the same way a shared store holds it.
    progress: HashMap<JobId, String>,
    task_results: HashMap<TaskId, (Instant, String)>,
}

/// A [`JobQueueStore`] that lives in this process's memory.
#[derive(Default)]
pub struct MemoryJobQueueStore {
    state: Mutex<State>,
}

impl MemoryJobQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        // Hold a sync lock, but just for an instant.
        let mut state = self.state.lock().expect("lock poisoned");
        f(&mut state)
    }
}

#[async_trait]
impl JobQueueStore for MemoryJobQueueStore {
    async fn mark_cancelled(&self, job_id: JobId) -> Result<()> {
        self.with_state(|s| s.cancelled.insert(job_id));
        Ok(())
    }

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool> {
        Ok(self.with_state(|s| s.cancelled.contains(&job_id)))
    }

    async fn clear_cancelled(&self, job_id: JobId) -> Result<()> {
        self.with_state(|s| s.cancelled.remove(&job_id));
        Ok(())
    }

    async fn set_progress(&self, job_id: JobId, progress: &Progress) -> Result<()> {
        let raw = serde_json::to_string(progress).context("failed to serialize progress")?;
        self.with_state(|s| s.progress.insert(job_id, raw));
        Ok(())
    }

    async fn get_progress(&self, job_id: JobId) -> Result<Option<Progress>> {
        let raw = self.with_state(|s| s.progress.get(&job_id).cloned());
        raw.map(|raw| decode_progress(job_id, &raw)).transpose()
    }

    async fn clear_progress(&self, job_id: JobId) -> Result<()> {
        self.with_state(|s| s.progress.remove(&job_id));
        Ok(())
    }

    async fn count_in_flight(&self) -> Result<usize> {
        Ok(self.with_state(|s| s.progress.len()))
    }

    async fn put_task_result(&self, task_id: TaskId, result: &TaskResult, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(result).context("failed to serialize task result")?;
        let expires_at = Instant::now() + ttl;
        self.with_state(|s| {
            s.task_results.retain(|_, (expiry, _)| *expiry > Instant::now());
            s.task_results.insert(task_id, (expires_at, raw));
        });
        Ok(())
    }

    async fn take_task_result(&self, task_id: TaskId) -> Result<Option<TaskResult>> {
        let raw = self.with_state(|s| s.task_results.remove(&task_id));
        match raw {
            Some((expires_at, raw)) if expires_at > Instant::now() => {
                Ok(Some(decode_task_result(task_id, &raw)?))
            }
            _ => Ok(None),
        }
    }
}
