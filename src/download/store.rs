//! On-disk page bytes.
//!
//! Layout: `<work_dir>/<job_id>/page-<index>.bin`. Writes go to a `.tmp`
//! sibling first and are renamed into place, so a crash never leaves a
//! truncated page under its final name.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::{FetchError, JobId};

/// Page byte storage rooted at the engine's work directory.
#[derive(Debug, Clone)]
pub struct PageStore {
    root: PathBuf,
}

impl PageStore {
    /// Creates a store under `root`. Directories are created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one job's pages.
    #[must_use]
    pub fn job_dir(&self, job: &JobId) -> PathBuf {
        self.root.join(job.as_str())
    }

    /// Final path of one page.
    #[must_use]
    pub fn page_path(&self, job: &JobId, index: usize) -> PathBuf {
        self.job_dir(job).join(format!("page-{index:05}.bin"))
    }

    /// Writes `bytes` for `index` atomically and returns the final path.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Io`] when the directory, temp file, or rename fails.
    #[instrument(skip(self, bytes), fields(job_id = %job, page_index = index, bytes = bytes.len()))]
    pub async fn write_page(
        &self,
        job: &JobId,
        index: usize,
        bytes: &[u8],
    ) -> Result<PathBuf, FetchError> {
        let dir = self.job_dir(job);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| FetchError::io(&dir, e))?;

        let final_path = self.page_path(job, index);
        let tmp_path = final_path.with_extension("bin.tmp");
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| FetchError::io(&tmp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| FetchError::io(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| FetchError::io(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| FetchError::io(&final_path, e))?;
        debug!(path = %final_path.display(), "page stored");
        Ok(final_path)
    }

    /// Whether a stored page is present with the recorded length.
    pub async fn verify(path: &Path, expected_len: u64) -> bool {
        fs::metadata(path)
            .await
            .is_ok_and(|meta| meta.is_file() && meta.len() == expected_len)
    }

    /// Deletes a job's page directory. Missing directories are fine.
    ///
    /// # Errors
    ///
    /// Returns the IO error for anything but "not found".
    pub async fn remove_job(&self, job: &JobId) -> std::io::Result<()> {
        match fs::remove_dir_all(self.job_dir(job)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
