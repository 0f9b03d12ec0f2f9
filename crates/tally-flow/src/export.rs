//! Activity value export jobs.
//!
//! An export snapshots the latest activity values for one group and
//! attribute into a CSV artifact and hands the caller a signed download
//! URL. Exports are long-running (multi-minute scans on real stores), so
//! each target is guarded by an `export`-scope lock: a second export for
//! the same target while one is in flight is a conflict, not a queue.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{
    Error as CoreError, JobId, LockManager, LockScope, PipelineId, ScopedStorage,
    WritePrecondition,
};

use crate::aggregation::JobStatus;
use crate::error::{Error, Result};
use crate::metrics::record_lock_conflict;
use crate::paths;
use crate::values::ActivityValueStore;

/// What to export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    /// The group path whose values are exported.
    pub group_id: String,
    /// The activity attribute to export.
    pub attribute: String,
    /// Pipelines whose outputs are included.
    pub pipeline_ids: Vec<PipelineId>,
    /// First date (inclusive).
    pub from: NaiveDate,
    /// Last date (inclusive).
    pub to: NaiveDate,
}

/// Record of one export job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    /// Unique job ID.
    pub id: JobId,
    /// The export request.
    pub request: ExportRequest,
    /// Current status.
    pub status: JobStatus,
    /// Failure detail, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Key of the CSV artifact, once written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_key: Option<String>,
    /// Signed download URL, once available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// When the job started.
    pub created_at: chrono::DateTime<Utc>,
    /// When the job record was last updated.
    pub updated_at: chrono::DateTime<Utc>,
}

/// Runs lock-guarded export jobs.
pub struct ExportService {
    storage: ScopedStorage,
    locks: LockManager,
    activity_store: Arc<dyn ActivityValueStore>,
    lock_ttl: std::time::Duration,
    url_expiry: std::time::Duration,
}

impl ExportService {
    /// Creates a new export service.
    #[must_use]
    pub fn new(
        storage: ScopedStorage,
        locks: LockManager,
        activity_store: Arc<dyn ActivityValueStore>,
        lock_ttl: std::time::Duration,
        url_expiry: std::time::Duration,
    ) -> Self {
        Self {
            storage,
            locks,
            activity_store,
            lock_ttl,
            url_expiry,
        }
    }

    /// Runs one export job to completion.
    ///
    /// # Errors
    ///
    /// Returns a lock conflict if an export for the same target is already
    /// in flight; any other failure marks the job `FAILED` and is returned
    /// after the lock is released.
    #[tracing::instrument(skip(self, request), fields(group_id = %request.group_id, attribute = %request.attribute))]
    pub async fn run(&self, request: ExportRequest) -> Result<ExportJob> {
        let lock_key = format!("{}:{}", request.group_id, request.attribute);
        let guard = match self
            .locks
            .acquire_with_operation(
                LockScope::Export,
                &lock_key,
                self.lock_ttl,
                Some("activity export".to_string()),
            )
            .await
        {
            Ok(guard) => guard,
            Err(e @ CoreError::LockHeld { .. }) => {
                record_lock_conflict(LockScope::Export.as_str());
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut job = ExportJob {
            id: JobId::generate(),
            request: request.clone(),
            status: JobStatus::InProgress,
            status_message: None,
            artifact_key: None,
            download_url: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.save_job(&job).await?;

        let outcome = self.write_artifact(&mut job).await;

        match outcome {
            Ok(()) => {
                job.status = JobStatus::Succeeded;
                job.updated_at = Utc::now();
                self.save_job(&job).await?;
                guard.release().await?;
                Ok(job)
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.status_message = Some(e.to_string());
                job.updated_at = Utc::now();
                self.save_job(&job).await?;
                guard.release().await?;
                Err(e)
            }
        }
    }

    /// Loads an export job record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or unreadable.
    pub async fn get_job(&self, job_id: JobId) -> Result<ExportJob> {
        let data = self
            .storage
            .get(&paths::export_job_path(job_id))
            .await
            .map_err(|e| match e {
                CoreError::NotFound(_) => {
                    Error::Core(CoreError::resource_not_found("exportJob", job_id))
                }
                other => Error::Core(other),
            })?;
        Ok(serde_json::from_slice(&data).map_err(CoreError::serialization)?)
    }

    async fn write_artifact(&self, job: &mut ExportJob) -> Result<()> {
        let request = &job.request;
        let buckets = self
            .activity_store
            .day_values(
                &request.group_id,
                &request.attribute,
                &request.pipeline_ids,
                request.from,
                request.to,
            )
            .await?;

        let mut dates: Vec<NaiveDate> = buckets.keys().copied().collect();
        dates.sort_unstable();

        let mut csv = String::from("date,value\n");
        for date in dates {
            let mut values = buckets[&date].clone();
            values.sort_by(f64::total_cmp);
            for value in values {
                csv.push_str(&format!("{date},{value}\n"));
            }
        }

        let artifact_key = paths::export_artifact_path(job.id);
        self.storage
            .put(&artifact_key, Bytes::from(csv), WritePrecondition::None)
            .await?;

        let url = self.storage.signed_url(&artifact_key, self.url_expiry).await?;
        job.artifact_key = Some(artifact_key);
        job.download_url = Some(url);
        Ok(())
    }

    async fn save_job(&self, job: &ExportJob) -> Result<()> {
        let record = Bytes::from(serde_json::to_vec(job).map_err(CoreError::serialization)?);
        self.storage
            .put(
                &paths::export_job_path(job.id),
                record,
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }
}
