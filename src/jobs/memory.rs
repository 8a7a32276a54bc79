//! In-memory [`JobRepository`], used by tests.

use std::{collections::HashMap, sync::Mutex};

use super::{Job, JobId, JobRepository, PageResult, ResultRef};
use crate::prelude::*;

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    results: Vec<PageResult>,
    archived: Vec<(JobId, usize, PathBuf)>,
    charges: Vec<(String, JobId, u32)>,
    /// Fail to persist the result for this page number.
    fail_persist_on_page: Option<usize>,
    /// Fail to archive the page with this page number.
    fail_archive_on_page: Option<usize>,
    fail_charges: bool,
    fail_loads: bool,
}

/// A [`JobRepository`] held in memory, with knobs for injecting failures.
#[derive(Default)]
pub struct MemoryJobRepository {
    state: Mutex<State>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("lock poisoned");
        f(&mut state)
    }

    pub fn fail_persist_on_page(&self, page_number: usize) {
        self.with_state(|s| s.fail_persist_on_page = Some(page_number));
    }

    pub fn fail_archive_on_page(&self, page_number: usize) {
        self.with_state(|s| s.fail_archive_on_page = Some(page_number));
    }

    pub fn fail_charges(&self) {
        self.with_state(|s| s.fail_charges = true);
    }

    pub fn fail_loads(&self) {
        self.with_state(|s| s.fail_loads = true);
    }

    /// Forget a job, as if an external collaborator deleted it.
    pub fn delete_job(&self, job_id: JobId) {
        self.with_state(|s| s.jobs.remove(&job_id));
    }

    /// Page numbers persisted for `job_id`, in the order they were written.
    pub fn persisted_pages(&self, job_id: JobId) -> Vec<usize> {
        self.with_state(|s| {
            s.results
                .iter()
                .filter(|r| r.job_id == job_id)
                .map(|r| r.page_number)
                .collect()
        })
    }

    pub fn archived(&self) -> Vec<(JobId, usize, PathBuf)> {
        self.with_state(|s| s.archived.clone())
    }

    /// Total units charged to `owner_id`.
    pub fn charged(&self, owner_id: &str) -> u32 {
        self.with_state(|s| {
            s.charges
                .iter()
                .filter(|(owner, _, _)| owner == owner_id)
                .map(|(_, _, units)| units)
                .sum()
        })
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create_job(&self, job: &Job) -> Result<()> {
        self.with_state(|s| {
            if s.jobs.contains_key(&job.id) {
                return Err(anyhow!("job {} already exists", job.id));
            }
            s.jobs.insert(job.id, job.clone());
            Ok(())
        })
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.with_state(|s| {
            if s.fail_loads {
                return Err(anyhow!("connection reset"));
            }
            Ok(s.jobs.get(&job_id).cloned())
        })
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.with_state(|s| s.jobs.insert(job.id, job.clone()));
        Ok(())
    }

    async fn persist_page_result(&self, result: &PageResult) -> Result<ResultRef> {
        self.with_state(|s| {
            if s.fail_persist_on_page == Some(result.page_number) {
                return Err(anyhow!("disk full"));
            }
            s.results.push(result.clone());
            Ok(format!("{}/{}", result.job_id, result.page_number))
        })
    }

    async fn load_page_results(&self, job_id: JobId) -> Result<Vec<PageResult>> {
        let mut results = self.with_state(|s| {
            s.results
                .iter()
                .filter(|r| r.job_id == job_id)
                .cloned()
                .collect::<Vec<_>>()
        });
        results.sort_by_key(|r| r.page_number);
        Ok(results)
    }

    async fn archive_page(&self, job_id: JobId, page_number: usize, page: &Path) -> Result<PathBuf> {
        self.with_state(|s| {
            if s.fail_archive_on_page == Some(page_number) {
                return Err(anyhow!("archive unavailable"));
            }
            s.archived.push((job_id, page_number, page.to_owned()));
            Ok(page.to_owned())
        })
    }

    async fn charge_owner(&self, owner_id: &str, job_id: JobId, units: u32) -> Result<()> {
        self.with_state(|s| {
            if s.fail_charges {
                return Err(anyhow!("billing is down"));
            }
            s.charges.push((owner_id.to_owned(), job_id, units));
            Ok(())
        })
    }
}
