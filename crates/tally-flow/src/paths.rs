//! Object-storage key layout for pipeline executions.
//!
//! The layout is a compatibility contract: chunk sequence numbers are
//! embedded in artifact keys so a re-invoked chunk overwrites its previous
//! artifact rather than duplicating it, and downstream consumers locate
//! merged results at stable keys.

use tally_core::{ExecutionId, JobId, PipelineId};

/// Prefix for everything belonging to one execution.
#[must_use]
pub fn execution_prefix(pipeline_id: PipelineId, execution_id: ExecutionId) -> String {
    format!("pipelines/{pipeline_id}/executions/{execution_id}")
}

/// Key of the uploaded source dataset for an execution.
#[must_use]
pub fn input_path(pipeline_id: PipelineId, execution_id: ExecutionId) -> String {
    format!("{}/input/source.csv", execution_prefix(pipeline_id, execution_id))
}

/// Key of one chunk's transformed output.
#[must_use]
pub fn chunk_output_path(
    pipeline_id: PipelineId,
    execution_id: ExecutionId,
    sequence: u32,
) -> String {
    format!(
        "{}/output/{sequence}.csv",
        execution_prefix(pipeline_id, execution_id)
    )
}

/// Key of one chunk's row-level error artifact.
#[must_use]
pub fn chunk_error_path(
    pipeline_id: PipelineId,
    execution_id: ExecutionId,
    sequence: u32,
) -> String {
    format!(
        "{}/errors/{sequence}.txt",
        execution_prefix(pipeline_id, execution_id)
    )
}

/// Key of one chunk's visited-groups listing.
///
/// The calculator records every group path that contributed rows in the
/// chunk; aggregation reads these to fan out over the right subtree.
#[must_use]
pub fn chunk_groups_path(
    pipeline_id: PipelineId,
    execution_id: ExecutionId,
    sequence: u32,
) -> String {
    format!(
        "{}/groups/{sequence}.txt",
        execution_prefix(pipeline_id, execution_id)
    )
}

/// Prefix under which all visited-groups listings live.
#[must_use]
pub fn groups_prefix(pipeline_id: PipelineId, execution_id: ExecutionId) -> String {
    format!("{}/groups/", execution_prefix(pipeline_id, execution_id))
}

/// Key of the merged execution-level result artifact.
#[must_use]
pub fn merged_output_path(pipeline_id: PipelineId, execution_id: ExecutionId) -> String {
    format!(
        "{}/output/result.csv",
        execution_prefix(pipeline_id, execution_id)
    )
}

/// Key of the merged execution-level error artifact.
#[must_use]
pub fn merged_error_path(pipeline_id: PipelineId, execution_id: ExecutionId) -> String {
    format!(
        "{}/errors/errors.txt",
        execution_prefix(pipeline_id, execution_id)
    )
}

/// Key of the execution record.
#[must_use]
pub fn execution_record_path(pipeline_id: PipelineId, execution_id: ExecutionId) -> String {
    format!(
        "{}/execution.json",
        execution_prefix(pipeline_id, execution_id)
    )
}

/// Key of the persisted coordinator state for crash recovery.
#[must_use]
pub fn coordinator_state_path(pipeline_id: PipelineId, execution_id: ExecutionId) -> String {
    format!("{}/state.json", execution_prefix(pipeline_id, execution_id))
}

/// Key of an export job's CSV artifact.
#[must_use]
pub fn export_artifact_path(job_id: JobId) -> String {
    format!("exports/{job_id}.csv")
}

/// Key of an export job record.
#[must_use]
pub fn export_job_path(job_id: JobId) -> String {
    format!("exports/{job_id}.json")
}

/// Key of an aggregation job record.
#[must_use]
pub fn aggregation_job_path(job_id: JobId) -> String {
    format!("aggregations/{job_id}.json")
}

/// Key of the metrics bulk-load staging artifact for an execution.
#[must_use]
pub fn metrics_staging_path(pipeline_id: PipelineId, execution_id: ExecutionId) -> String {
    format!(
        "{}/metrics/staging.csv",
        execution_prefix(pipeline_id, execution_id)
    )
}
