//! Persisted job records for resume across process restarts.
//!
//! One `jobs` row per job holds the manifest snapshot and output options;
//! `job_pages` lists completed pages with their storage location. A missing
//! `jobs` row means the job has to start from scratch.

use std::collections::BTreeMap;
use std::path::PathBuf;

use sqlx::FromRow;
use tracing::{debug, instrument, warn};

use crate::assembly::OutputFormat;
use crate::db::Database;
use crate::manifest::CanonicalManifest;

use super::{JobId, JobOptions, JobStatus, OrchestratorError};

/// Raw `jobs` row.
#[derive(Debug, Clone, FromRow)]
struct JobRow {
    job_id: String,
    source_id: String,
    display_name: String,
    manifest_json: String,
    status: String,
    output_path: String,
    output_format: String,
    invert: i64,
    concurrency: Option<i64>,
    created_at: String,
    updated_at: String,
}

/// A decoded persisted job.
#[derive(Debug, Clone)]
pub struct PersistedJob {
    /// Job identity.
    pub job_id: JobId,
    /// Source the manifest came from.
    pub source_id: String,
    /// Manifest display name.
    pub display_name: String,
    /// Manifest snapshot the job was submitted with.
    pub manifest: CanonicalManifest,
    /// Last recorded status.
    pub status: JobStatus,
    /// Output options as submitted.
    pub options: JobOptions,
    /// Creation timestamp (SQLite `datetime('now')`).
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

/// A completed page as recorded in `job_pages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    /// Where the bytes live.
    pub path: PathBuf,
    /// Recorded byte length.
    pub byte_len: u64,
}

#[derive(Debug, FromRow)]
struct PageRow {
    page_index: i64,
    storage_path: String,
    byte_len: i64,
}

/// Job and page records over the shared database.
#[derive(Debug, Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    /// Creates a store on `db`.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts or refreshes the job record and marks it running. Completed
    /// page rows of an existing job are kept.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure and
    /// [`OrchestratorError::CorruptSnapshot`] if the manifest cannot be encoded.
    #[instrument(skip(self, manifest, options), fields(job_id = %job_id))]
    pub async fn upsert_running(
        &self,
        job_id: &JobId,
        manifest: &CanonicalManifest,
        options: &JobOptions,
    ) -> Result<(), OrchestratorError> {
        let manifest_json =
            serde_json::to_string(manifest).map_err(|e| OrchestratorError::CorruptSnapshot {
                job_id: job_id.to_string(),
                reason: e.to_string(),
            })?;
        sqlx::query(
            r"INSERT INTO jobs (job_id, source_id, display_name, manifest_json, status, output_path, output_format, invert, concurrency)
              VALUES (?, ?, ?, ?, 'running', ?, ?, ?, ?)
              ON CONFLICT(job_id) DO UPDATE SET
                display_name = excluded.display_name,
                manifest_json = excluded.manifest_json,
                status = 'running',
                output_path = excluded.output_path,
                output_format = excluded.output_format,
                invert = excluded.invert,
                concurrency = excluded.concurrency,
                updated_at = datetime('now')",
        )
        .bind(job_id.as_str())
        .bind(manifest.source_id())
        .bind(manifest.display_name())
        .bind(manifest_json)
        .bind(options.output.to_string_lossy().to_string())
        .bind(options.format.as_str())
        .bind(i64::from(options.invert))
        .bind(options.concurrency.and_then(|c| i64::try_from(c).ok()))
        .execute(self.db.pool())
        .await?;
        debug!("job record stored");
        Ok(())
    }

    /// Loads a persisted job.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure and
    /// [`OrchestratorError::CorruptSnapshot`] when the row cannot be decoded.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn load(&self, job_id: &JobId) -> Result<Option<PersistedJob>, OrchestratorError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(decode_row).transpose()
    }

    /// All persisted jobs, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure. Rows
    /// that cannot be decoded are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<PersistedJob>, OrchestratorError> {
        let rows = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs ORDER BY updated_at DESC, job_id")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let job_id = row.job_id.clone();
                decode_row(row)
                    .inspect_err(|error| warn!(job_id, error = %error, "skipping unreadable job row"))
                    .ok()
            })
            .collect())
    }

    /// Records the job's status.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure.
    #[instrument(skip(self), fields(job_id = %job_id, status = %status))]
    pub async fn set_status(&self, job_id: &JobId, status: JobStatus) -> Result<(), OrchestratorError> {
        sqlx::query("UPDATE jobs SET status = ?, updated_at = datetime('now') WHERE job_id = ?")
            .bind(status.as_str())
            .bind(job_id.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Records a completed page. Re-recording an index replaces the row.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure.
    #[instrument(skip(self, path), fields(job_id = %job_id, page_index = index))]
    pub async fn record_page(
        &self,
        job_id: &JobId,
        index: usize,
        path: &std::path::Path,
        byte_len: u64,
    ) -> Result<(), OrchestratorError> {
        sqlx::query(
            r"INSERT INTO job_pages (job_id, page_index, storage_path, byte_len)
              VALUES (?, ?, ?, ?)
              ON CONFLICT(job_id, page_index) DO UPDATE SET
                storage_path = excluded.storage_path,
                byte_len = excluded.byte_len,
                completed_at = datetime('now')",
        )
        .bind(job_id.as_str())
        .bind(i64::try_from(index).unwrap_or(i64::MAX))
        .bind(path.to_string_lossy().to_string())
        .bind(i64::try_from(byte_len).unwrap_or(i64::MAX))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Completed pages of a job keyed by index.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure.
    pub async fn completed_pages(
        &self,
        job_id: &JobId,
    ) -> Result<BTreeMap<usize, StoredPage>, OrchestratorError> {
        let rows = sqlx::query_as::<_, PageRow>(
            "SELECT page_index, storage_path, byte_len FROM job_pages WHERE job_id = ? ORDER BY page_index",
        )
        .bind(job_id.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some((
                    usize::try_from(row.page_index).ok()?,
                    StoredPage {
                        path: PathBuf::from(row.storage_path),
                        byte_len: u64::try_from(row.byte_len).ok()?,
                    },
                ))
            })
            .collect())
    }

    /// Drops a page row whose bytes went missing.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure.
    pub async fn forget_page(&self, job_id: &JobId, index: usize) -> Result<(), OrchestratorError> {
        sqlx::query("DELETE FROM job_pages WHERE job_id = ? AND page_index = ?")
            .bind(job_id.as_str())
            .bind(i64::try_from(index).unwrap_or(i64::MAX))
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Deletes a job and (by cascade) its page rows.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure.
    pub async fn delete(&self, job_id: &JobId) -> Result<bool, OrchestratorError> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = ?")
            .bind(job_id.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn decode_row(row: JobRow) -> Result<PersistedJob, OrchestratorError> {
    let corrupt = |reason: String| OrchestratorError::CorruptSnapshot {
        job_id: row.job_id.clone(),
        reason,
    };
    let manifest: CanonicalManifest =
        serde_json::from_str(&row.manifest_json).map_err(|e| corrupt(e.to_string()))?;
    manifest.validate().map_err(|e| corrupt(e.to_string()))?;
    let status = JobStatus::parse(&row.status)
        .ok_or_else(|| corrupt(format!("unknown status '{}'", row.status)))?;
    let format = OutputFormat::parse(&row.output_format)
        .ok_or_else(|| corrupt(format!("unknown output format '{}'", row.output_format)))?;

    let mut options = JobOptions::new(PathBuf::from(&row.output_path))
        .with_format(format)
        .with_invert(row.invert != 0);
    if let Some(concurrency) = row.concurrency.and_then(|c| usize::try_from(c).ok()) {
        options = options.with_concurrency(concurrency);
    }
    Ok(PersistedJob {
        job_id: JobId::from_string(row.job_id),
        source_id: row.source_id,
        display_name: row.display_name,
        manifest,
        status,
        options,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
