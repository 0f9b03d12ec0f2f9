//! The execution coordinator state machine.
//!
//! One run of a pipeline is driven through an explicit state machine:
//!
//! ```text
//! Verify → Calculate (fan-out, bounded) → Merge ─┬→ Complete
//!                                                └→ CreateImpacts ⟲ → AggregateMetrics → Complete
//! ```
//!
//! Each transition is an independent, idempotent unit of work: the
//! coordinator persists its state after every transition, so a crashed
//! step re-runs against the same inputs and overwrites the same artifacts
//! rather than duplicating them. The `Calculate` state is the only place
//! with intra-step parallelism - up to a configured number of chunk
//! invocations run concurrently, and a chunk's failure never cancels its
//! siblings; failures are aggregated by the merger.
//!
//! `CreateImpacts` re-enters itself while the impact writer reports more
//! work, polling with a fixed interval and a configurable iteration cap.
//! Any unhandled error moves the execution to `failed` with the error
//! captured verbatim in its status message; failed executions remain
//! queryable for diagnosis.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use tally_core::{
    Error as CoreError, ExecutionId, PipelineId, ScopedStorage, WritePrecondition,
};

use crate::aggregation::{DateRange, MetricAggregator, MetricCatalog};
use crate::calculator::{
    CalculatorRequest, ObjectLocation, Parameter, RetryingCalculator, SourceDataLocation,
    Transform,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::execution::{Execution, ExecutionStatus, ExecutionStore};
use crate::merge::{ChunkResult, MergeOutcome, ResultMerger};
use crate::metrics::{
    observe_step_duration, record_chunk_outcome, record_execution_terminal, TimingGuard,
};
use crate::paths;
use crate::values::ActivityValueStore;

/// Identity recorded on execution updates made by the coordinator.
const UPDATED_BY: &str = "pipeline-processor";

/// One independently processable slice of the source dataset.
///
/// Byte ranges are inclusive on both ends. Chunks exist only within one
/// execution's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Position of the chunk within the execution (0-based, gap-free).
    pub sequence: u32,
    /// First byte of the slice (inclusive).
    pub start_byte: u64,
    /// Last byte of the slice (inclusive).
    pub end_byte: u64,
    /// Whether the slice begins with the CSV header row.
    pub contains_header: bool,
}

/// Splits a source object into chunk byte ranges.
///
/// An empty object produces no chunks; only the first chunk carries the
/// header row.
#[must_use]
pub fn plan_chunks(object_size: u64, chunk_size: u64) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    if object_size == 0 || chunk_size == 0 {
        return chunks;
    }

    let mut start = 0u64;
    let mut sequence = 0u32;
    while start < object_size {
        let end = object_size.min(start + chunk_size) - 1;
        chunks.push(Chunk {
            sequence,
            start_byte: start,
            end_byte: end,
            contains_header: sequence == 0,
        });
        start = end + 1;
        sequence += 1;
    }
    chunks
}

/// One page of impact-creation work.
#[derive(Debug, Clone, Default)]
pub struct ImpactPage {
    /// Per-record failures encountered in this page.
    pub errors: Vec<String>,
    /// Whether another page remains to be processed.
    pub more_to_process: bool,
}

/// Derives downstream impact records from an execution's merged output.
///
/// The writer is paged: one call processes as much as fits one invocation
/// and reports whether more remains. Calls must be idempotent per
/// (execution, iteration) - a re-run after a crash processes the same page
/// again.
#[async_trait]
pub trait ImpactWriter: Send + Sync {
    /// Processes the next page of impact records.
    async fn create_impacts(
        &self,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
        iteration: u32,
    ) -> Result<ImpactPage>;
}

/// The full request the coordinator drives to completion.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The execution record (already created, in `waiting`).
    pub execution: Execution,
    /// Location of the uploaded source dataset.
    pub source: ObjectLocation,
    /// Pipeline input parameters, passed through to the calculator.
    pub parameters: Vec<Parameter>,
    /// Per-row transform definitions, passed through to the calculator.
    pub transforms: Vec<Transform>,
    /// Unique-key columns of the dataset, if any.
    pub unique_key: Option<Vec<String>>,
}

/// Coordinator state, persisted after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "camelCase")]
pub enum ExecutionState {
    /// Validate the request and produce the chunk plan.
    Verify,
    /// Fan out chunk calculations with bounded concurrency.
    Calculate {
        /// The chunk plan produced by verification.
        chunks: Vec<Chunk>,
    },
    /// Merge per-chunk artifacts and classify the outcome.
    Merge {
        /// The full, gap-free chunk result set.
        results: Vec<ChunkResult>,
    },
    /// Derive downstream impact records (re-entrant while more remains).
    CreateImpacts {
        /// 0-based iteration counter, bounded by the configured cap.
        iteration: u32,
    },
    /// Run the lock-guarded metric aggregation pass.
    AggregateMetrics,
    /// Terminal state; the execution record is immutable from here.
    Complete {
        /// The terminal execution status.
        status: ExecutionStatus,
    },
}

impl ExecutionState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    fn step_name(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Calculate { .. } => "calculate",
            Self::Merge { .. } => "merge",
            Self::CreateImpacts { .. } => "create_impacts",
            Self::AggregateMetrics => "aggregate_metrics",
            Self::Complete { .. } => "complete",
        }
    }
}

/// Drives executions through the state machine.
pub struct ExecutionCoordinator {
    storage: ScopedStorage,
    executions: ExecutionStore,
    calculator: Arc<RetryingCalculator>,
    merger: ResultMerger,
    impact_writer: Arc<dyn ImpactWriter>,
    metric_catalog: Arc<dyn MetricCatalog>,
    aggregator: Arc<MetricAggregator>,
    activity_store: Arc<dyn ActivityValueStore>,
    config: EngineConfig,
}

impl ExecutionCoordinator {
    /// Creates a new coordinator.
    ///
    /// All collaborators are injected; the coordinator owns no global
    /// state and multiple instances may drive different executions
    /// concurrently.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        storage: ScopedStorage,
        executions: ExecutionStore,
        calculator: Arc<RetryingCalculator>,
        merger: ResultMerger,
        impact_writer: Arc<dyn ImpactWriter>,
        metric_catalog: Arc<dyn MetricCatalog>,
        aggregator: Arc<MetricAggregator>,
        activity_store: Arc<dyn ActivityValueStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            executions,
            calculator,
            merger,
            impact_writer,
            metric_catalog,
            aggregator,
            activity_store,
            config,
        }
    }

    /// Drives an execution to a terminal state.
    ///
    /// Resumes from persisted state if a previous driver crashed mid-run.
    /// Returns the final execution record; a `failed` record is a normal
    /// completion, not an `Err`.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable orchestration failures
    /// (storage unavailable, state corruption); the execution is moved to
    /// `failed` first whenever possible.
    #[tracing::instrument(
        skip(self, request),
        fields(pipeline_id = %request.execution.pipeline_id, execution_id = %request.execution.id)
    )]
    pub async fn run(&self, request: &ExecutionRequest) -> Result<Execution> {
        let pipeline_id = request.execution.pipeline_id;
        let execution_id = request.execution.id;

        let mut state = self
            .load_state(pipeline_id, execution_id)
            .await?
            .unwrap_or(ExecutionState::Verify);

        while !state.is_terminal() {
            let step = state.step_name();
            let _timing = TimingGuard::new(move |duration| {
                observe_step_duration(step, duration);
            });

            let next = match self.step(request, &state).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(step, error = %e, "execution step failed");
                    self.fail_execution(pipeline_id, execution_id, &e.to_string())
                        .await;
                    let terminal = ExecutionState::Complete {
                        status: ExecutionStatus::Failed,
                    };
                    self.persist_state(pipeline_id, execution_id, &terminal)
                        .await?;
                    record_execution_terminal("failed");
                    return Err(e);
                }
            };

            self.persist_state(pipeline_id, execution_id, &next).await?;
            state = next;
        }

        let execution = self.executions.get(pipeline_id, execution_id).await?;
        if execution.status.is_terminal() {
            record_execution_terminal(&execution.status.to_string());
        }
        Ok(execution)
    }

    async fn step(
        &self,
        request: &ExecutionRequest,
        state: &ExecutionState,
    ) -> Result<ExecutionState> {
        match state {
            ExecutionState::Verify => self.verify(request).await,
            ExecutionState::Calculate { chunks } => self.calculate(request, chunks).await,
            ExecutionState::Merge { results } => self.merge(request, results).await,
            ExecutionState::CreateImpacts { iteration } => {
                self.create_impacts(request, *iteration).await
            }
            ExecutionState::AggregateMetrics => self.aggregate_metrics(request).await,
            ExecutionState::Complete { status } => Ok(ExecutionState::Complete { status: *status }),
        }
    }

    /// Validates the request and produces the chunk plan.
    async fn verify(&self, request: &ExecutionRequest) -> Result<ExecutionState> {
        if request.source.key.is_empty() {
            return Err(Error::internal("execution request has no source object"));
        }
        if request.transforms.is_empty() {
            return Err(Error::internal("execution request has no transforms"));
        }

        let pipeline_id = request.execution.pipeline_id;
        let execution_id = request.execution.id;

        let meta = self
            .storage
            .head(&request.source.key)
            .await?
            .ok_or_else(|| {
                Error::Core(CoreError::NotFound(format!(
                    "source object not found: {}",
                    request.source.key
                )))
            })?;

        let chunks = plan_chunks(meta.size, self.config.chunk_size_bytes);
        tracing::info!(
            source_bytes = meta.size,
            chunk_count = chunks.len(),
            "verified execution request"
        );

        // Idempotent on re-run: only advance out of `waiting` once.
        let current = self.executions.get(pipeline_id, execution_id).await?;
        if current.status == ExecutionStatus::Waiting {
            self.executions
                .update_status(
                    pipeline_id,
                    execution_id,
                    ExecutionStatus::InProgress,
                    None,
                    UPDATED_BY,
                )
                .await?;
        }

        Ok(ExecutionState::Calculate { chunks })
    }

    /// Fans calculation out over chunks with bounded concurrency.
    ///
    /// Every chunk runs to termination: invocation failures (after the
    /// retry budget) become synthesized error artifacts so the merger
    /// aggregates them with the row-level errors, instead of one chunk
    /// cancelling its siblings.
    async fn calculate(
        &self,
        request: &ExecutionRequest,
        chunks: &[Chunk],
    ) -> Result<ExecutionState> {
        let outcomes: Vec<Result<ChunkResult>> = stream::iter(chunks.iter().cloned())
            .map(|chunk| self.run_chunk(request, chunk))
            .buffer_unordered(self.config.max_concurrent_chunks)
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            results.push(outcome?);
        }
        results.sort_by_key(|r| r.sequence);

        Ok(ExecutionState::Merge { results })
    }

    /// Runs one chunk to termination.
    ///
    /// Only storage failures surface as `Err`; calculator failures are
    /// folded into the chunk's error artifact.
    async fn run_chunk(&self, request: &ExecutionRequest, chunk: Chunk) -> Result<ChunkResult> {
        let pipeline_id = request.execution.pipeline_id;
        let execution_id = request.execution.id;

        let calculator_request = CalculatorRequest {
            group_context_id: request.execution.group_context_id.clone(),
            pipeline_id,
            execution_id,
            username: request.execution.created_by.clone(),
            action_type: request.execution.action_type,
            parameters: request.parameters.clone(),
            transforms: request.transforms.clone(),
            source_data_location: SourceDataLocation {
                bucket: request.source.bucket.clone(),
                key: request.source.key.clone(),
                contains_header: chunk.contains_header,
                start_byte: chunk.start_byte,
                end_byte: chunk.end_byte,
            },
            chunk_no: chunk.sequence,
            unique_key: request.unique_key.clone(),
        };

        match self.calculator.process(&calculator_request).await {
            Ok(response) => {
                record_chunk_outcome("succeeded");
                Ok(ChunkResult {
                    sequence: chunk.sequence,
                    output: response.csv_output_data_location,
                    error: response.error_location,
                })
            }
            Err(Error::CalculatorUnavailable { message }) => {
                record_chunk_outcome("failed");
                tracing::error!(
                    sequence = chunk.sequence,
                    error = %message,
                    "chunk failed after exhausting retries"
                );

                let error_key = paths::chunk_error_path(pipeline_id, execution_id, chunk.sequence);
                self.storage
                    .put(
                        &error_key,
                        Bytes::from(format!("chunk {}: {message}\n", chunk.sequence)),
                        WritePrecondition::None,
                    )
                    .await?;

                Ok(ChunkResult {
                    sequence: chunk.sequence,
                    output: ObjectLocation {
                        bucket: request.source.bucket.clone(),
                        key: paths::chunk_output_path(pipeline_id, execution_id, chunk.sequence),
                    },
                    error: ObjectLocation {
                        bucket: request.source.bucket.clone(),
                        key: error_key,
                    },
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Merges chunk artifacts and routes on the classified outcome.
    async fn merge(
        &self,
        request: &ExecutionRequest,
        results: &[ChunkResult],
    ) -> Result<ExecutionState> {
        let pipeline_id = request.execution.pipeline_id;
        let execution_id = request.execution.id;

        let outcome: MergeOutcome = self
            .merger
            .merge(
                pipeline_id,
                execution_id,
                request.execution.pipeline_type,
                results,
            )
            .await?;

        match outcome.status {
            ExecutionStatus::Failed => {
                self.executions
                    .update_status(
                        pipeline_id,
                        execution_id,
                        ExecutionStatus::Failed,
                        outcome.status_message,
                        UPDATED_BY,
                    )
                    .await?;
                Ok(ExecutionState::Complete {
                    status: ExecutionStatus::Failed,
                })
            }
            ExecutionStatus::Success => {
                self.executions
                    .update_status(
                        pipeline_id,
                        execution_id,
                        ExecutionStatus::Success,
                        None,
                        UPDATED_BY,
                    )
                    .await?;
                Ok(ExecutionState::Complete {
                    status: ExecutionStatus::Success,
                })
            }
            // Activity/impact pipelines still have downstream work.
            _ => Ok(ExecutionState::CreateImpacts { iteration: 0 }),
        }
    }

    /// Processes one page of impact creation, re-entering while more
    /// remains.
    async fn create_impacts(
        &self,
        request: &ExecutionRequest,
        iteration: u32,
    ) -> Result<ExecutionState> {
        let pipeline_id = request.execution.pipeline_id;
        let execution_id = request.execution.id;

        if iteration >= self.config.max_impact_iterations {
            return Err(Error::ImpactIterationCapExceeded {
                max_iterations: self.config.max_impact_iterations,
            });
        }

        let page = self
            .impact_writer
            .create_impacts(pipeline_id, execution_id, iteration)
            .await?;

        if !page.errors.is_empty() {
            let message = page.errors.join(", ");
            self.executions
                .update_status(
                    pipeline_id,
                    execution_id,
                    ExecutionStatus::Failed,
                    Some(message),
                    UPDATED_BY,
                )
                .await?;
            return Ok(ExecutionState::Complete {
                status: ExecutionStatus::Failed,
            });
        }

        if page.more_to_process {
            tokio::time::sleep(self.config.impact_poll_interval).await;
            return Ok(ExecutionState::CreateImpacts {
                iteration: iteration + 1,
            });
        }

        if metric_names(&request.transforms).is_empty() {
            self.executions
                .update_status(
                    pipeline_id,
                    execution_id,
                    ExecutionStatus::Success,
                    None,
                    UPDATED_BY,
                )
                .await?;
            return Ok(ExecutionState::Complete {
                status: ExecutionStatus::Success,
            });
        }

        Ok(ExecutionState::AggregateMetrics)
    }

    /// Runs the lock-guarded aggregation pass for every metric the
    /// pipeline's transforms feed.
    async fn aggregate_metrics(&self, request: &ExecutionRequest) -> Result<ExecutionState> {
        let pipeline_id = request.execution.pipeline_id;
        let execution_id = request.execution.id;

        let current = self.executions.get(pipeline_id, execution_id).await?;
        if current.status == ExecutionStatus::InProgress {
            self.executions
                .update_status(
                    pipeline_id,
                    execution_id,
                    ExecutionStatus::CalculatingMetrics,
                    None,
                    UPDATED_BY,
                )
                .await?;
        }

        let group_paths = self.contributing_groups(request).await?;
        let range = self
            .activity_store
            .affected_date_range(pipeline_id, execution_id)
            .await?;
        let Some((from, to)) = range else {
            tracing::info!("no activities recorded for execution, skipping aggregation");
            self.executions
                .update_status(
                    pipeline_id,
                    execution_id,
                    ExecutionStatus::Success,
                    None,
                    UPDATED_BY,
                )
                .await?;
            return Ok(ExecutionState::Complete {
                status: ExecutionStatus::Success,
            });
        };

        for name in metric_names(&request.transforms) {
            let metric = self
                .metric_catalog
                .get_by_name(&name)
                .await?
                .ok_or(Error::MetricNotFound { name })?;

            self.aggregator
                .aggregate(
                    &metric,
                    &group_paths,
                    DateRange { from, to },
                    pipeline_id,
                    execution_id,
                )
                .await?;
        }

        self.executions
            .update_status(
                pipeline_id,
                execution_id,
                ExecutionStatus::Success,
                None,
                UPDATED_BY,
            )
            .await?;
        Ok(ExecutionState::Complete {
            status: ExecutionStatus::Success,
        })
    }

    /// Collects the deduplicated group paths visited during calculation.
    ///
    /// The calculator writes one listing per chunk; the execution's own
    /// group context is the fallback when none were written.
    async fn contributing_groups(&self, request: &ExecutionRequest) -> Result<Vec<String>> {
        let prefix = paths::groups_prefix(request.execution.pipeline_id, request.execution.id);
        let mut listings = self.storage.list(&prefix).await?;
        listings.sort_by(|a, b| a.path.cmp(&b.path));

        let mut groups: Vec<String> = Vec::new();
        for meta in listings {
            let data = self.storage.get(&meta.path).await?;
            for line in String::from_utf8_lossy(&data).lines() {
                let line = line.trim();
                if !line.is_empty() && !groups.iter().any(|g| g == line) {
                    groups.push(line.to_string());
                }
            }
        }

        if groups.is_empty() {
            groups.push(request.execution.group_context_id.clone());
        }
        Ok(groups)
    }

    /// Moves the execution to `failed`, capturing the triggering error.
    ///
    /// Best-effort: an execution already in a terminal state is left
    /// untouched.
    async fn fail_execution(
        &self,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
        message: &str,
    ) {
        match self.executions.get(pipeline_id, execution_id).await {
            Ok(current) if !current.status.is_terminal() => {
                if let Err(e) = self
                    .executions
                    .update_status(
                        pipeline_id,
                        execution_id,
                        ExecutionStatus::Failed,
                        Some(message.to_string()),
                        UPDATED_BY,
                    )
                    .await
                {
                    tracing::error!(error = %e, "could not record execution failure");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "could not load execution to record failure");
            }
        }
    }

    async fn load_state(
        &self,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionState>> {
        let path = paths::coordinator_state_path(pipeline_id, execution_id);
        match self.storage.get(&path).await {
            Ok(data) => Ok(Some(
                serde_json::from_slice(&data).map_err(CoreError::serialization)?,
            )),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_state(
        &self,
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
        state: &ExecutionState,
    ) -> Result<()> {
        let path = paths::coordinator_state_path(pipeline_id, execution_id);
        let record = Bytes::from(serde_json::to_vec(state).map_err(CoreError::serialization)?);
        self.storage
            .put(&path, record, WritePrecondition::None)
            .await?;
        Ok(())
    }
}

/// Extracts the deduplicated metric names fed by a pipeline's transforms,
/// in discovery order.
#[must_use]
pub fn metric_names(transforms: &[Transform]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut names = Vec::new();
    for transform in transforms {
        for output in &transform.outputs {
            for metric in &output.metrics {
                if seen.insert(metric.as_str()) {
                    names.push(metric.clone());
                }
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::TransformOutput;

    #[test]
    fn empty_object_plans_no_chunks() {
        assert!(plan_chunks(0, 1_000_000).is_empty());
    }

    #[test]
    fn small_object_is_one_chunk() {
        let chunks = plan_chunks(100, 1_000_000);
        assert_eq!(
            chunks,
            vec![Chunk {
                sequence: 0,
                start_byte: 0,
                end_byte: 99,
                contains_header: true,
            }]
        );
    }

    #[test]
    fn ranges_are_contiguous_and_inclusive() {
        let chunks = plan_chunks(250, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].start_byte, chunks[0].end_byte), (0, 99));
        assert_eq!((chunks[1].start_byte, chunks[1].end_byte), (100, 199));
        assert_eq!((chunks[2].start_byte, chunks[2].end_byte), (200, 249));
        assert!(chunks[0].contains_header);
        assert!(!chunks[1].contains_header);
        // Every byte is covered exactly once
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_byte, pair[0].end_byte + 1);
        }
    }

    #[test]
    fn exact_multiple_has_no_empty_tail_chunk() {
        let chunks = plan_chunks(200, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[1].start_byte, chunks[1].end_byte), (100, 199));
    }

    #[test]
    fn state_serialization_roundtrip() {
        let states = vec![
            ExecutionState::Verify,
            ExecutionState::Calculate {
                chunks: plan_chunks(250, 100),
            },
            ExecutionState::CreateImpacts { iteration: 3 },
            ExecutionState::Complete {
                status: ExecutionStatus::Success,
            },
        ];
        for state in states {
            let json = serde_json::to_string(&state).unwrap();
            let back: ExecutionState = serde_json::from_str(&json).unwrap();
            assert_eq!(state, back);
        }
    }

    #[test]
    fn metric_names_dedupe_in_discovery_order() {
        let transforms = vec![
            Transform {
                index: 0,
                formula: ":reading*:factor".into(),
                outputs: vec![TransformOutput {
                    key: "co2e".into(),
                    output_type: "number".into(),
                    metrics: vec!["ghg:emissions".into(), "ghg:scope1".into()],
                }],
            },
            Transform {
                index: 1,
                formula: ":reading".into(),
                outputs: vec![TransformOutput {
                    key: "raw".into(),
                    output_type: "number".into(),
                    metrics: vec!["ghg:emissions".into()],
                }],
            },
        ];
        assert_eq!(metric_names(&transforms), vec!["ghg:emissions", "ghg:scope1"]);
    }
}
