//! Redis-backed [`JobQueueStore`], shared by every worker process.
//!
//! Layout, under the configured key prefix:
//!
//! - `cancelled_jobs`: set of job IDs with a pending cancellation.
//! - `job_progress`: hash from job ID to JSON [`Progress`].
//! - `task_result:<task id>`: JSON [`TaskResult`] with an expiry.

use std::time::Duration;

use redis::{AsyncCommands, aio::ConnectionManager};

use super::{
    JobQueueStore, Progress, TaskId, TaskResult, decode_progress, decode_task_result,
};
use crate::{jobs::JobId, prelude::*};

/// Open a managed Redis connection. The manager reconnects on its own and
/// can be cloned cheaply.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)
        .with_context(|| format!("invalid Redis URL {redis_url:?}"))?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("failed to connect to Redis at {redis_url:?}"))
}

/// A [`JobQueueStore`] kept in Redis.
pub struct RedisJobQueueStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisJobQueueStore {
    pub fn new(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.to_owned(),
        }
    }

    fn cancelled_key(&self) -> String {
        format!("{}cancelled_jobs", self.key_prefix)
    }

    fn progress_key(&self) -> String {
        format!("{}job_progress", self.key_prefix)
    }

    fn task_result_key(&self, task_id: TaskId) -> String {
        format!("{}task_result:{}", self.key_prefix, task_id)
    }
}

#[async_trait]
impl JobQueueStore for RedisJobQueueStore {
    async fn mark_cancelled(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(self.cancelled_key(), job_id.to_string())
            .await
            .with_context(|| format!("failed to mark job {job_id} cancelled"))
    }

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(self.cancelled_key(), job_id.to_string())
            .await
            .with_context(|| format!("failed to check cancellation of job {job_id}"))
    }

    async fn clear_cancelled(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(self.cancelled_key(), job_id.to_string())
            .await
            .with_context(|| format!("failed to clear cancellation of job {job_id}"))
    }

    async fn set_progress(&self, job_id: JobId, progress: &Progress) -> Result<()> {
        let raw = serde_json::to_string(progress).context("failed to serialize progress")?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.progress_key(), job_id.to_string(), raw)
            .await
            .with_context(|| format!("failed to set progress of job {job_id}"))
    }

    async fn get_progress(&self, job_id: JobId) -> Result<Option<Progress>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(self.progress_key(), job_id.to_string())
            .await
            .with_context(|| format!("failed to get progress of job {job_id}"))?;
        raw.map(|raw| decode_progress(job_id, &raw)).transpose()
    }

    async fn clear_progress(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(self.progress_key(), job_id.to_string())
            .await
            .with_context(|| format!("failed to clear progress of job {job_id}"))
    }

    async fn count_in_flight(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.hlen(self.progress_key())
            .await
            .context("failed to count in-flight jobs")
    }

    async fn put_task_result(&self, task_id: TaskId, result: &TaskResult, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(result).context("failed to serialize task result")?;
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.task_result_key(task_id))
            .arg(raw)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .with_context(|| format!("failed to store result of task {task_id}"))
    }

    async fn take_task_result(&self, task_id: TaskId) -> Result<Option<TaskResult>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GETDEL")
            .arg(self.task_result_key(task_id))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to fetch result of task {task_id}"))?;
        raw.map(|raw| decode_task_result(task_id, &raw)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::jobs::JobStatus;

    async fn test_store() -> RedisJobQueueStore {
        let url = std::env::var("OCR_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned());
        let prefix = format!("ocr-pipeline-test:{}:", Uuid::new_v4());
        RedisJobQueueStore::new(connect(&url).await.unwrap(), &prefix)
    }

    #[tokio::test]
    #[ignore = "Needs Redis running"]
    async fn test_redis_cancellation_and_progress() {
        let store = test_store().await;
        let job_id = Uuid::new_v4();
        store.mark_cancelled(job_id).await.unwrap();
        assert!(store.is_cancelled(job_id).await.unwrap());
        store.clear_cancelled(job_id).await.unwrap();
        assert!(!store.is_cancelled(job_id).await.unwrap());

        let progress = Progress::new(JobStatus::Queued { total_pages: 4 });
        store.set_progress(job_id, &progress).await.unwrap();
        assert_eq!(store.get_progress(job_id).await.unwrap(), Some(progress));
        assert_eq!(store.count_in_flight().await.unwrap(), 1);
        store.clear_progress(job_id).await.unwrap();
        assert_eq!(store.count_in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "Needs Redis running"]
    async fn test_redis_task_results() {
        let store = test_store().await;
        let task_id = Uuid::new_v4();
        let result = TaskResult::Text {
            text: "abc".to_owned(),
        };
        store
            .put_task_result(task_id, &result, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(store.take_task_result(task_id).await.unwrap(), Some(result));
        assert_eq!(store.take_task_result(task_id).await.unwrap(), None);
    }
}
