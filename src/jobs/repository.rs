//! Durable storage for job records and page results.

use tokio::fs;

use super::{Job, JobId, PageResult, ResultRef};
use crate::{
    async_utils::io::{append_jsonl, read_json_if_exists, remove_file_if_exists, write_json_atomic},
    prelude::*,
};

/// Durable job storage.
///
/// The core only ever appends page results and rewrites a job's record. It
/// never deletes jobs; that belongs to whoever created them.
#[async_trait]
pub trait JobRepository: Send + Sync + 'static {
    /// Store a new job record.
    async fn create_job(&self, job: &Job) -> Result<()>;

    /// Load a job record, or `None` if it was deleted.
    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Overwrite a job record.
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Persist the result for one page, returning a reference to it.
    async fn persist_page_result(&self, result: &PageResult) -> Result<ResultRef>;

    /// All persisted page results for a job, in page order.
    async fn load_page_results(&self, job_id: JobId) -> Result<Vec<PageResult>>;

    /// Move a processed page image into long-term storage, returning its new
    /// location.
    async fn archive_page(&self, job_id: JobId, page_number: usize, page: &Path) -> Result<PathBuf>;

    /// Charge `owner_id` for `units` processed pages.
    async fn charge_owner(&self, owner_id: &str, job_id: JobId, units: u32) -> Result<()>;
}

/// A charge recorded in the ledger.
#[derive(Debug, Deserialize, Serialize)]
pub struct Charge {
    pub owner_id: String,
    pub job_id: JobId,
    pub units: u32,
}

/// A [`JobRepository`] that keeps everything under one directory:
///
/// ```text
/// <data dir>/jobs/<job id>/job.json
/// <data dir>/jobs/<job id>/pages/0001.json
/// <data dir>/jobs/<job id>/archive/0001.png
/// <data dir>/inbox/<job id>/...       (submitted pages awaiting processing)
/// <data dir>/ledger.jsonl
/// ```
///
/// Every record is written atomically, so several worker processes can
/// share a data directory on one machine.
pub struct FsJobRepository {
    data_dir: PathBuf,
}

impl FsJobRepository {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.data_dir.join("jobs").join(job_id.to_string())
    }

    fn job_path(&self, job_id: JobId) -> PathBuf {
        self.job_dir(job_id).join("job.json")
    }

    fn page_result_name(job_id: JobId, page_number: usize) -> String {
        format!("jobs/{job_id}/pages/{page_number:04}.json")
    }

    fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.jsonl")
    }

    /// Copy submitted page images into the inbox for `job_id`, so the
    /// pipeline can delete them without touching the originals.
    pub async fn stage_pages(&self, job_id: JobId, pages: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let inbox = self.data_dir.join("inbox").join(job_id.to_string());
        fs::create_dir_all(&inbox)
            .await
            .with_context(|| format!("failed to create inbox {:?}", inbox))?;
        let mut staged = Vec::with_capacity(pages.len());
        for (idx, page) in pages.iter().enumerate() {
            let ext = page
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("png");
            let dest = inbox.join(format!("{:04}.{ext}", idx + 1));
            fs::copy(page, &dest)
                .await
                .with_context(|| format!("failed to stage page {:?}", page))?;
            staged.push(dest);
        }
        Ok(staged)
    }

    /// Read back the ledger.
    pub async fn load_charges(&self) -> Result<Vec<Charge>> {
        let path = self.ledger_path();
        let data = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err).with_context(|| format!("failed to read {:?}", path)),
        };
        data.lines()
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("malformed ledger line in {:?}: {line:?}", path))
            })
            .collect()
    }
}

#[async_trait]
impl JobRepository for FsJobRepository {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let path = self.job_path(job.id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Err(anyhow!("job {} already exists", job.id));
        }
        write_json_atomic(&path, job).await
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
        read_json_if_exists(&self.job_path(job_id)).await
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        write_json_atomic(&self.job_path(job.id), job).await
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %result.job_id, page = result.page_number))]
    async fn persist_page_result(&self, result: &PageResult) -> Result<ResultRef> {
        let name = Self::page_result_name(result.job_id, result.page_number);
        write_json_atomic(&self.data_dir.join(&name), result).await?;
        Ok(name)
    }

    async fn load_page_results(&self, job_id: JobId) -> Result<Vec<PageResult>> {
        let dir = self.job_dir(job_id).join("pages");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err).with_context(|| format!("failed to list {:?}", dir)),
        };
        let mut paths = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to list {:?}", dir))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        // Names are zero-padded page numbers, so this is page order.
        paths.sort();
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(result) = read_json_if_exists(&path).await? {
                results.push(result);
            }
        }
        Ok(results)
    }

    async fn archive_page(&self, job_id: JobId, page_number: usize, page: &Path) -> Result<PathBuf> {
        let ext = page
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("png");
        let dir = self.job_dir(job_id).join("archive");
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create archive {:?}", dir))?;
        let dest = dir.join(format!("{page_number:04}.{ext}"));
        if fs::rename(page, &dest).await.is_err() {
            // Probably a different file system. Copy, then delete.
            fs::copy(page, &dest)
                .await
                .with_context(|| format!("failed to archive page {:?}", page))?;
            remove_file_if_exists(page).await?;
        }
        Ok(dest)
    }

    async fn charge_owner(&self, owner_id: &str, job_id: JobId, units: u32) -> Result<()> {
        let charge = Charge {
            owner_id: owner_id.to_owned(),
            job_id,
            units,
        };
        append_jsonl(&self.ledger_path(), &charge).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RecognitionConfig, jobs::JobStatus};

    fn page_result(job_id: JobId, page_number: usize) -> PageResult {
        PageResult {
            job_id,
            page_number,
            page_name: format!("{page_number:04}.png"),
            detections: vec![],
            config: RecognitionConfig::default(),
            merged: false,
        }
    }

    #[tokio::test]
    async fn test_job_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path());
        let mut job = Job::new("alice", vec![PathBuf::from("a.png")], RecognitionConfig::default());
        repo.create_job(&job).await.unwrap();
        assert!(repo.create_job(&job).await.is_err());
        job.set_status(JobStatus::Cancelled).unwrap();
        repo.save_job(&job).await.unwrap();
        assert_eq!(repo.load_job(job.id).await.unwrap(), Some(job));
        assert_eq!(repo.load_job(uuid::Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_page_results_come_back_in_page_order() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path());
        let job_id = uuid::Uuid::new_v4();
        for page in [2, 10, 1] {
            repo.persist_page_result(&page_result(job_id, page)).await.unwrap();
        }
        let pages = repo
            .load_page_results(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.page_number)
            .collect::<Vec<_>>();
        assert_eq!(pages, vec![1, 2, 10]);
    }

    #[tokio::test]
    async fn test_archive_moves_the_page() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path().join("data"));
        let page = dir.path().join("scan.jpg");
        std::fs::write(&page, b"not really a jpeg").unwrap();
        let job_id = uuid::Uuid::new_v4();
        let archived = repo.archive_page(job_id, 3, &page).await.unwrap();
        assert!(!page.exists());
        assert!(archived.ends_with("archive/0003.jpg"));
        assert_eq!(std::fs::read(&archived).unwrap(), b"not really a jpeg");
    }

    #[tokio::test]
    async fn test_ledger_appends() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path());
        let job_id = uuid::Uuid::new_v4();
        repo.charge_owner("alice", job_id, 1).await.unwrap();
        repo.charge_owner("alice", job_id, 1).await.unwrap();
        let charges = repo.load_charges().await.unwrap();
        assert_eq!(charges.len(), 2);
        assert!(charges.iter().all(|c| c.owner_id == "alice" && c.units == 1));
    }

    #[tokio::test]
    async fn test_stage_pages_copies() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsJobRepository::new(dir.path().join("data"));
        let original = dir.path().join("page.png");
        std::fs::write(&original, b"png").unwrap();
        let staged = repo
            .stage_pages(uuid::Uuid::new_v4(), &[original.clone(), original.clone()])
            .await
            .unwrap();
        assert_eq!(staged.len(), 2);
        assert!(staged[1].ends_with("0002.png"));
        assert!(original.exists());
    }
}
