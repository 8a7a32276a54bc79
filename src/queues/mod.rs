//! Task queues.
//!
//! Work reaches workers through a shared [`TaskQueue`] with three priority
//! lanes. Inside a worker, a bounded in-process [`work::WorkQueue`] limits
//! how many tasks run at once.

use std::fmt;

use uuid::Uuid;

use crate::{
    config::RecognitionConfig,
    geometry::Region,
    orchestrator::PageTask,
    prelude::*,
    store::TaskId,
};

pub mod memory;
pub mod redis;
pub mod work;
pub mod worker;

pub use self::{memory::MemoryTaskQueue, redis::RedisTaskQueue};

/// A priority class of tasks.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Re-recognition of a single region, usually a user waiting on it.
    ReRecognition,
    /// Service API requests.
    Service,
    /// Bulk processing of new uploads.
    NewUpload,
}

impl Lane {
    /// All lanes, highest priority first.
    pub const BY_PRIORITY: [Lane; 3] = [Lane::ReRecognition, Lane::Service, Lane::NewUpload];

    pub fn name(self) -> &'static str {
        match self {
            Lane::ReRecognition => "re_recognition",
            Lane::Service => "service",
            Lane::NewUpload => "new_upload",
        }
    }

    /// Position in [`Lane::BY_PRIORITY`].
    fn index(self) -> usize {
        match self {
            Lane::ReRecognition => 0,
            Lane::Service => 1,
            Lane::NewUpload => 2,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A unit of work for a worker.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// The next step of a job's chain.
    Page(PageTask),
    /// Recognize one region of an archived page.
    SingleRegion {
        task_id: TaskId,
        image_ref: PathBuf,
        region: Region,
        recognizer: String,
    },
    /// Recognize a whole page outside of any job.
    ServicePage {
        task_id: TaskId,
        image_ref: PathBuf,
        config: RecognitionConfig,
    },
}

impl Task {
    pub fn single_region(image_ref: PathBuf, region: Region, recognizer: String) -> Self {
        Task::SingleRegion {
            task_id: Uuid::new_v4(),
            image_ref,
            region,
            recognizer,
        }
    }

    pub fn service_page(image_ref: PathBuf, config: RecognitionConfig) -> Self {
        Task::ServicePage {
            task_id: Uuid::new_v4(),
            image_ref,
            config,
        }
    }

    /// The ID under which an ad-hoc task's result will be stored.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Task::Page(_) => None,
            Task::SingleRegion { task_id, .. } | Task::ServicePage { task_id, .. } => {
                Some(*task_id)
            }
        }
    }
}

/// A queue shared by every worker.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Add a task to the back of `lane`.
    async fn push(&self, lane: Lane, task: &Task) -> Result<()>;

    /// Take the oldest task from the highest-priority lane that has one.
    async fn pop(&self) -> Result<Option<(Lane, Task)>>;

    /// Number of tasks waiting in all lanes.
    async fn pending_count(&self) -> Result<usize>;
}

fn encode_task(task: &Task) -> Result<String> {
    serde_json::to_string(task).context("failed to serialize task")
}

fn decode_task(lane: Lane, raw: &str) -> Result<Task> {
    serde_json::from_str(raw)
        .with_context(|| format!("malformed task in lane {lane}: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_wire_format() {
        let task = Task::single_region(
            PathBuf::from("archive/0001.png"),
            Region::new(1, 2, 3, 4),
            "hi-crnn".to_owned(),
        );
        let raw = encode_task(&task).unwrap();
        assert!(raw.starts_with(r#"{"kind":"single_region""#));
        assert_eq!(decode_task(Lane::ReRecognition, &raw).unwrap(), task);
        assert!(decode_task(Lane::Service, "{}").is_err());
    }

    #[test]
    fn test_lane_priority() {
        assert_eq!(Lane::BY_PRIORITY[0], Lane::ReRecognition);
        for (idx, lane) in Lane::BY_PRIORITY.iter().enumerate() {
            assert_eq!(lane.index(), idx);
        }
    }
}
