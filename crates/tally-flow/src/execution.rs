//! Pipeline execution records.
//!
//! An execution is one run of a configured pipeline against one uploaded
//! dataset. Executions are an append-only audit trail: they are created
//! once, advanced through their status machine only by the coordinator, and
//! never deleted - a failed execution stays queryable for diagnosis and a
//! re-run creates a fresh execution.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{
    Error as CoreError, ExecutionId, PipelineId, ScopedStorage, WritePrecondition, WriteResult,
};

use crate::error::{Error, Result};
use crate::paths;

/// Execution status machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, waiting for the coordinator to pick it up.
    Waiting,
    /// Actively calculating and merging chunks.
    InProgress,
    /// Merged successfully; metric aggregation still running.
    CalculatingMetrics,
    /// Terminal: all steps completed.
    Success,
    /// Terminal: a step failed; the error is in `status_message`.
    Failed,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    ///
    /// Terminal executions are immutable; subsequent runs create a new
    /// execution.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Waiting => matches!(target, Self::InProgress | Self::Failed),
            Self::InProgress => matches!(
                target,
                Self::CalculatingMetrics | Self::Success | Self::Failed
            ),
            Self::CalculatingMetrics => matches!(target, Self::Success | Self::Failed),
            Self::Success | Self::Failed => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::InProgress => write!(f, "in_progress"),
            Self::CalculatingMetrics => write!(f, "calculating_metrics"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Whether an execution inserts or removes the dataset's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Insert the dataset's rows.
    Create,
    /// Remove a previously inserted dataset's rows.
    Delete,
}

/// The family a pipeline belongs to.
///
/// Data pipelines finish at the merge step; activity and impact pipelines
/// have a follow-on impact-creation step before they are complete, which is
/// why an errorless merge leaves them `in_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineType {
    /// Plain dataset transform; no downstream fan-out.
    Data,
    /// Produces activity rows and downstream impact records.
    Activities,
    /// Produces impact records directly.
    Impacts,
}

/// One run of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// Unique execution ID.
    pub id: ExecutionId,
    /// The pipeline this execution ran.
    pub pipeline_id: PipelineId,
    /// The pipeline definition version in effect for this run.
    pub pipeline_version: u32,
    /// The pipeline family, which decides the post-merge flow.
    pub pipeline_type: PipelineType,
    /// Whether this run creates or deletes the dataset's contribution.
    pub action_type: ActionType,
    /// Current status.
    pub status: ExecutionStatus,
    /// Error or progress detail for the current status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// The owning group path this execution runs under.
    pub group_context_id: String,
    /// When the execution was requested.
    pub created_at: DateTime<Utc>,
    /// Who requested the execution.
    pub created_by: String,
    /// When the execution was last updated.
    pub updated_at: DateTime<Utc>,
    /// Who performed the last update.
    pub updated_by: String,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

impl Execution {
    /// Creates a new execution in the `waiting` state.
    #[must_use]
    pub fn new(
        pipeline_id: PipelineId,
        pipeline_version: u32,
        pipeline_type: PipelineType,
        action_type: ActionType,
        group_context_id: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let created_by = created_by.into();
        Self {
            id: ExecutionId::generate(),
            pipeline_id,
            pipeline_version,
            pipeline_type,
            action_type,
            status: ExecutionStatus::Waiting,
            status_message: None,
            group_context_id: group_context_id.into(),
            created_at: now,
            created_by: created_by.clone(),
            updated_at: now,
            updated_by: created_by,
            tags: HashMap::new(),
        }
    }

    /// Advances the execution to a new status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition is not
    /// permitted by the status machine (including any mutation of a
    /// terminal execution).
    pub fn transition(
        &mut self,
        to: ExecutionStatus,
        message: Option<String>,
        updated_by: &str,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            let reason = if self.status.is_terminal() {
                "terminal executions are immutable"
            } else {
                "not a valid status-machine edge"
            };
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
                reason: reason.to_string(),
            });
        }
        self.status = to;
        self.status_message = message;
        self.updated_at = Utc::now();
        updated_by.clone_into(&mut self.updated_by);
        Ok(())
    }
}

/// Storage-backed store for execution records.
///
/// Records live at a stable key per execution; creation uses a
/// `DoesNotExist` write and updates use version-preconditioned writes, so
/// a re-run transition never silently clobbers a concurrent update.
#[derive(Clone)]
pub struct ExecutionStore {
    storage: ScopedStorage,
}

impl ExecutionStore {
    /// Creates a new execution store over tenant storage.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self { storage }
    }

    /// Persists a newly requested execution.
    ///
    /// # Errors
    ///
    /// Returns an error if an execution with the same ID already exists or
    /// the write fails.
    pub async fn create(&self, execution: &Execution) -> Result<()> {
        let path = paths::execution_record_path(execution.pipeline_id, execution.id);
        let record = Bytes::from(
            serde_json::to_vec(execution).map_err(CoreError::serialization)?,
        );

        match self
            .storage
            .put(&path, record, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(Error::Core(
                CoreError::PreconditionFailed {
                    message: format!("execution {} already exists", execution.id),
                },
            )),
        }
    }

    /// Loads an execution record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionNotFound`] if no record exists.
    pub async fn get(
        &self,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
    ) -> Result<Execution> {
        let path = paths::execution_record_path(pipeline_id, execution_id);
        match self.storage.get(&path).await {
            Ok(data) => {
                Ok(serde_json::from_slice(&data).map_err(CoreError::serialization)?)
            }
            Err(CoreError::NotFound(_)) => Err(Error::ExecutionNotFound { execution_id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies a status transition and persists the updated record.
    ///
    /// The read-validate-write cycle is version-preconditioned; a crashed
    /// step re-running against an already-advanced record sees the
    /// transition rejected instead of double-applying it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing, the transition is
    /// invalid, or a concurrent writer advanced the record first.
    pub async fn update_status(
        &self,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
        to: ExecutionStatus,
        message: Option<String>,
        updated_by: &str,
    ) -> Result<Execution> {
        let path = paths::execution_record_path(pipeline_id, execution_id);

        let meta = self
            .storage
            .head(&path)
            .await?
            .ok_or(Error::ExecutionNotFound { execution_id })?;
        let mut execution = self.get(pipeline_id, execution_id).await?;
        execution.transition(to, message, updated_by)?;

        let record = Bytes::from(
            serde_json::to_vec(&execution).map_err(CoreError::serialization)?,
        );
        match self
            .storage
            .put(&path, record, WritePrecondition::MatchesVersion(meta.version))
            .await?
        {
            WriteResult::Success { .. } => Ok(execution),
            WriteResult::PreconditionFailed { .. } => Err(Error::Core(
                CoreError::PreconditionFailed {
                    message: format!(
                        "execution {execution_id} was updated concurrently"
                    ),
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tally_core::MemoryBackend;

    fn store() -> ExecutionStore {
        let storage =
            ScopedStorage::new(Arc::new(MemoryBackend::new()), "acme").expect("tenant");
        ExecutionStore::new(storage)
    }

    fn execution() -> Execution {
        Execution::new(
            PipelineId::generate(),
            1,
            PipelineType::Activities,
            ActionType::Create,
            "/usa/co",
            "analyst@acme.example",
        )
    }

    #[test]
    fn status_machine_edges() {
        use ExecutionStatus::{CalculatingMetrics, Failed, InProgress, Success, Waiting};

        assert!(Waiting.can_transition_to(InProgress));
        assert!(Waiting.can_transition_to(Failed));
        assert!(!Waiting.can_transition_to(Success));

        assert!(InProgress.can_transition_to(CalculatingMetrics));
        assert!(InProgress.can_transition_to(Success));
        assert!(InProgress.can_transition_to(Failed));

        assert!(CalculatingMetrics.can_transition_to(Success));
        assert!(!CalculatingMetrics.can_transition_to(InProgress));

        for terminal in [Success, Failed] {
            assert!(terminal.is_terminal());
            for target in [Waiting, InProgress, CalculatingMetrics, Success, Failed] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn status_display_is_wire_format() {
        assert_eq!(ExecutionStatus::CalculatingMetrics.to_string(), "calculating_metrics");
        assert_eq!(ExecutionStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn terminal_executions_are_immutable() {
        let mut execution = execution();
        execution
            .transition(ExecutionStatus::Failed, Some("boom".into()), "coordinator")
            .expect("fail");

        let err = execution
            .transition(ExecutionStatus::InProgress, None, "coordinator")
            .expect_err("must reject");
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn create_get_update_roundtrip() {
        let store = store();
        let execution = execution();
        store.create(&execution).await.expect("create");

        let loaded = store
            .get(execution.pipeline_id, execution.id)
            .await
            .expect("get");
        assert_eq!(loaded.status, ExecutionStatus::Waiting);

        let updated = store
            .update_status(
                execution.pipeline_id,
                execution.id,
                ExecutionStatus::InProgress,
                None,
                "coordinator",
            )
            .await
            .expect("update");
        assert_eq!(updated.status, ExecutionStatus::InProgress);
        assert_eq!(updated.updated_by, "coordinator");
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = store();
        let execution = execution();
        store.create(&execution).await.expect("create");
        assert!(store.create(&execution).await.is_err());
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected_by_store() {
        let store = store();
        let execution = execution();
        store.create(&execution).await.expect("create");

        let err = store
            .update_status(
                execution.pipeline_id,
                execution.id,
                ExecutionStatus::Success,
                None,
                "coordinator",
            )
            .await
            .expect_err("waiting -> success is not an edge");
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }
}
