//! Merging per-chunk artifacts into execution-level results.
//!
//! Once every chunk has terminated, the merger concatenates the chunk
//! output artifacts (in sequence order) into one result artifact and the
//! non-empty error artifacts into one error artifact, then classifies the
//! execution outcome:
//!
//! - any row-level errors → `failed`
//! - no errors, `data` pipeline → `success`
//! - no errors, `activities`/`impacts` pipeline → `in_progress`, because
//!   impact creation still has to run before the execution is complete

use bytes::{Bytes, BytesMut};

use tally_core::{Error as CoreError, ExecutionId, PipelineId, ScopedStorage, WritePrecondition};

use crate::calculator::ObjectLocation;
use crate::error::{Error, Result};
use crate::execution::{ExecutionStatus, PipelineType};
use crate::paths;

/// The artifacts produced by one terminated chunk.
///
/// Artifact keys are tenant-relative storage paths (the calculator writes
/// into the tenant's own namespace).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    /// The chunk's sequence number within the execution.
    pub sequence: u32,
    /// Location of the chunk's transformed output.
    pub output: ObjectLocation,
    /// Location of the chunk's row-level error artifact.
    pub error: ObjectLocation,
}

/// Result of a merge pass.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The status the execution should move to.
    pub status: ExecutionStatus,
    /// Detail message when the merge classifies the execution as failed.
    pub status_message: Option<String>,
    /// Key of the merged execution-level result artifact.
    pub output_path: String,
    /// Key of the merged execution-level error artifact.
    pub error_path: String,
    /// Number of chunks that contributed row-level errors.
    pub chunks_with_errors: u32,
}

/// Concatenates chunk artifacts and classifies the execution outcome.
#[derive(Clone)]
pub struct ResultMerger {
    storage: ScopedStorage,
}

impl ResultMerger {
    /// Creates a new merger over tenant storage.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self { storage }
    }

    /// Merges the full chunk-result set for one execution.
    ///
    /// The set must be complete: sequences 0..N-1 with no gaps or
    /// duplicates. Merging is idempotent - re-running writes the same
    /// merged artifacts at the same keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingChunkResult`] on an incomplete set, or a
    /// storage error if artifacts cannot be read or written.
    #[tracing::instrument(skip(self, results), fields(pipeline_id = %pipeline_id, execution_id = %execution_id, chunks = results.len()))]
    pub async fn merge(
        &self,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
        pipeline_type: PipelineType,
        results: &[ChunkResult],
    ) -> Result<MergeOutcome> {
        let ordered = validate_complete(results)?;

        let mut merged_output = BytesMut::new();
        let mut merged_errors = BytesMut::new();
        let mut chunks_with_errors = 0u32;

        for result in &ordered {
            let output = self.read_artifact(&result.output).await?;
            append_line_terminated(&mut merged_output, &output);

            let errors = self.read_artifact(&result.error).await?;
            if !errors.is_empty() {
                chunks_with_errors += 1;
                append_line_terminated(&mut merged_errors, &errors);
            }
        }

        let output_path = paths::merged_output_path(pipeline_id, execution_id);
        let error_path = paths::merged_error_path(pipeline_id, execution_id);
        self.storage
            .put(&output_path, merged_output.freeze(), WritePrecondition::None)
            .await?;
        self.storage
            .put(&error_path, merged_errors.freeze(), WritePrecondition::None)
            .await?;

        let (status, status_message) = if chunks_with_errors > 0 {
            (
                ExecutionStatus::Failed,
                Some(
                    "error when performing calculation, review the execution error log for further info"
                        .to_string(),
                ),
            )
        } else if matches!(pipeline_type, PipelineType::Data) {
            (ExecutionStatus::Success, None)
        } else {
            (ExecutionStatus::InProgress, None)
        };

        tracing::info!(
            status = %status,
            chunks_with_errors,
            "merged chunk artifacts"
        );

        Ok(MergeOutcome {
            status,
            status_message,
            output_path,
            error_path,
            chunks_with_errors,
        })
    }

    /// Reads an artifact, treating a missing object as empty.
    ///
    /// A chunk that produced no rows (or no errors) may legitimately have
    /// written nothing.
    async fn read_artifact(&self, location: &ObjectLocation) -> Result<Bytes> {
        match self.storage.get(&location.key).await {
            Ok(data) => Ok(data),
            Err(CoreError::NotFound(_)) => Ok(Bytes::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Validates the chunk-result set is gap-free and returns it in sequence
/// order.
fn validate_complete(results: &[ChunkResult]) -> Result<Vec<ChunkResult>> {
    let mut ordered: Vec<ChunkResult> = results.to_vec();
    ordered.sort_by_key(|r| r.sequence);

    let expected = u32::try_from(ordered.len())
        .map_err(|_| Error::internal("chunk count exceeds supported range"))?;
    for (index, result) in ordered.iter().enumerate() {
        let expected_sequence = u32::try_from(index)
            .map_err(|_| Error::internal("chunk count exceeds supported range"))?;
        if result.sequence != expected_sequence {
            return Err(Error::MissingChunkResult {
                sequence: expected_sequence,
                expected,
            });
        }
    }
    Ok(ordered)
}

fn append_line_terminated(buffer: &mut BytesMut, data: &Bytes) {
    if data.is_empty() {
        return;
    }
    buffer.extend_from_slice(data);
    if !data.ends_with(b"\n") {
        buffer.extend_from_slice(b"\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tally_core::MemoryBackend;

    fn merger() -> (ResultMerger, ScopedStorage) {
        let storage =
            ScopedStorage::new(Arc::new(MemoryBackend::new()), "acme").expect("tenant");
        (ResultMerger::new(storage.clone()), storage)
    }

    fn location(key: &str) -> ObjectLocation {
        ObjectLocation {
            bucket: "data".into(),
            key: key.into(),
        }
    }

    async fn seed_chunks(
        storage: &ScopedStorage,
        count: u32,
        error_on: Option<u32>,
    ) -> Vec<ChunkResult> {
        let mut results = Vec::new();
        for sequence in 0..count {
            let output_key = format!("output/{sequence}.csv");
            let error_key = format!("errors/{sequence}.txt");
            storage
                .put(
                    &output_key,
                    Bytes::from(format!("row-{sequence}\n")),
                    WritePrecondition::None,
                )
                .await
                .expect("seed output");
            if error_on == Some(sequence) {
                storage
                    .put(
                        &error_key,
                        Bytes::from(format!("bad row in chunk {sequence}\n")),
                        WritePrecondition::None,
                    )
                    .await
                    .expect("seed error");
            }
            results.push(ChunkResult {
                sequence,
                output: location(&output_key),
                error: location(&error_key),
            });
        }
        results
    }

    #[tokio::test]
    async fn one_error_chunk_fails_the_execution() {
        let (merger, storage) = merger();
        let results = seed_chunks(&storage, 5, Some(3)).await;

        let outcome = merger
            .merge(
                PipelineId::generate(),
                ExecutionId::generate(),
                PipelineType::Data,
                &results,
            )
            .await
            .expect("merge");

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.chunks_with_errors, 1);
        assert!(outcome.status_message.is_some());

        let merged_errors = storage.get(&outcome.error_path).await.expect("errors");
        assert_eq!(merged_errors, Bytes::from("bad row in chunk 3\n"));
    }

    #[tokio::test]
    async fn clean_data_pipeline_succeeds() {
        let (merger, storage) = merger();
        let results = seed_chunks(&storage, 5, None).await;

        let outcome = merger
            .merge(
                PipelineId::generate(),
                ExecutionId::generate(),
                PipelineType::Data,
                &results,
            )
            .await
            .expect("merge");
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert!(outcome.status_message.is_none());
    }

    #[tokio::test]
    async fn clean_activities_pipeline_stays_in_progress() {
        let (merger, storage) = merger();
        let results = seed_chunks(&storage, 5, None).await;

        let outcome = merger
            .merge(
                PipelineId::generate(),
                ExecutionId::generate(),
                PipelineType::Activities,
                &results,
            )
            .await
            .expect("merge");
        assert_eq!(outcome.status, ExecutionStatus::InProgress);
    }

    #[tokio::test]
    async fn output_preserves_sequence_order() {
        let (merger, storage) = merger();
        let mut results = seed_chunks(&storage, 3, None).await;
        // Shuffle the input - merge must sort by sequence
        results.reverse();

        let outcome = merger
            .merge(
                PipelineId::generate(),
                ExecutionId::generate(),
                PipelineType::Data,
                &results,
            )
            .await
            .expect("merge");

        let merged = storage.get(&outcome.output_path).await.expect("output");
        assert_eq!(merged, Bytes::from("row-0\nrow-1\nrow-2\n"));
    }

    #[tokio::test]
    async fn gap_in_sequences_is_rejected() {
        let (merger, storage) = merger();
        let mut results = seed_chunks(&storage, 3, None).await;
        results.remove(1);

        let err = merger
            .merge(
                PipelineId::generate(),
                ExecutionId::generate(),
                PipelineType::Data,
                &results,
            )
            .await
            .expect_err("gap");
        assert!(matches!(
            err,
            Error::MissingChunkResult { sequence: 1, expected: 2 }
        ));
    }

    #[tokio::test]
    async fn empty_execution_merges_to_empty_success() {
        let (merger, storage) = merger();
        let outcome = merger
            .merge(
                PipelineId::generate(),
                ExecutionId::generate(),
                PipelineType::Data,
                &[],
            )
            .await
            .expect("merge");
        assert_eq!(outcome.status, ExecutionStatus::Success);
        let merged = storage.get(&outcome.output_path).await.expect("output");
        assert!(merged.is_empty());
    }
}
