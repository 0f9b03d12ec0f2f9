//! Calculation-engine invocation contract.
//!
//! The formula engine itself is an external collaborator; this module owns
//! its request/response contract and the retry discipline around it. The
//! engine distinguishes two failure shapes:
//!
//! - **Row-level errors**: per-record transform failures, captured in the
//!   chunk's error artifact. The invocation still succeeds and the
//!   execution continues.
//! - **Invocation errors**: the engine could not run at all (service
//!   failure, throttle, timeout). Transient ones are retried with bounded
//!   exponential backoff before escalating to a fatal chunk failure.
//!
//! Per invocation the engine writes exactly one output artifact and one
//! (possibly empty) error artifact, at keys namespaced by
//! pipeline/execution/sequence - re-invocation overwrites, never appends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tally_core::{ExecutionId, PipelineId};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::metrics::record_calculator_retry;

/// A bucket/key pair naming one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectLocation {
    /// Storage bucket.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
}

/// The byte slice of the source dataset one invocation processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDataLocation {
    /// Storage bucket of the uploaded dataset.
    pub bucket: String,
    /// Object key of the uploaded dataset.
    pub key: String,
    /// Whether the slice begins with the CSV header row.
    pub contains_header: bool,
    /// First byte of the slice (inclusive).
    pub start_byte: u64,
    /// Last byte of the slice (inclusive).
    pub end_byte: u64,
}

/// One typed output column of a transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOutput {
    /// Output column name.
    pub key: String,
    /// Output value type (`number`, `string`, `boolean`, `timestamp`).
    #[serde(rename = "type")]
    pub output_type: String,
    /// Metric names this output contributes to, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<String>,
}

/// One per-row transform expression with its outputs.
///
/// The formula DSL is opaque to the engine; it is passed through to the
/// calculator verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    /// Position of the transform in the pipeline definition.
    pub index: u32,
    /// The transform formula, opaque to the engine.
    pub formula: String,
    /// Outputs produced by the formula.
    pub outputs: Vec<TransformOutput>,
}

/// A named input parameter of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    /// Source column name.
    pub key: String,
    /// Value type of the column.
    #[serde(rename = "type")]
    pub parameter_type: String,
}

/// Request sent to the calculation engine for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatorRequest {
    /// The group path the execution runs under.
    pub group_context_id: String,
    /// The pipeline being executed.
    pub pipeline_id: PipelineId,
    /// The execution this chunk belongs to.
    pub execution_id: ExecutionId,
    /// The user the execution runs as.
    pub username: String,
    /// Whether the run creates or deletes the dataset's contribution.
    pub action_type: crate::execution::ActionType,
    /// Pipeline input parameters.
    pub parameters: Vec<Parameter>,
    /// Per-row transform definitions.
    pub transforms: Vec<Transform>,
    /// The byte slice of the source this chunk covers.
    pub source_data_location: SourceDataLocation,
    /// The chunk's sequence number within the execution.
    pub chunk_no: u32,
    /// Column names forming the unique key of a row, if the dataset has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<Vec<String>>,
}

/// Response from the calculation engine for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatorResponse {
    /// Echo of the processed source slice.
    pub source_data_location: SourceDataLocation,
    /// Location of the chunk's transformed output artifact.
    pub csv_output_data_location: ObjectLocation,
    /// Location of the chunk's row-level error artifact (possibly empty).
    pub error_location: ObjectLocation,
}

/// Invocation-level failure calling the calculation engine.
///
/// Row-level errors never surface here; they land in the error artifact of
/// an otherwise successful response.
#[derive(Debug, thiserror::Error)]
pub enum CalculatorError {
    /// The engine was temporarily unavailable; the invocation may be
    /// retried.
    #[error("transient calculator failure: {0}")]
    Transient(String),
    /// The invocation can never succeed (bad request, missing source).
    #[error("fatal calculator failure: {0}")]
    Fatal(String),
}

/// The calculation engine, seen through its invocation contract.
#[async_trait]
pub trait Calculator: Send + Sync {
    /// Runs the engine over one chunk.
    ///
    /// # Errors
    ///
    /// Returns a [`CalculatorError`] for invocation-level failures only.
    async fn process(
        &self,
        request: &CalculatorRequest,
    ) -> std::result::Result<CalculatorResponse, CalculatorError>;
}

/// Wraps a [`Calculator`] with bounded exponential-backoff retry.
///
/// Transient failures are retried up to the configured attempt budget
/// (default: base 2s, multiplier 2, 6 attempts) with a little jitter;
/// fatal failures and exhausted budgets escalate to
/// [`Error::CalculatorUnavailable`]. Retries are safe because the engine
/// overwrites its per-chunk artifacts at stable keys.
pub struct RetryingCalculator {
    inner: Arc<dyn Calculator>,
    base_delay: Duration,
    multiplier: u32,
    max_attempts: u32,
}

impl RetryingCalculator {
    /// Creates a retrying wrapper from engine configuration.
    #[must_use]
    pub fn new(inner: Arc<dyn Calculator>, config: &EngineConfig) -> Self {
        Self {
            inner,
            base_delay: config.calculator_retry_base,
            multiplier: config.calculator_retry_multiplier,
            max_attempts: config.calculator_max_attempts,
        }
    }

    /// Runs the engine over one chunk, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CalculatorUnavailable`] once the attempt budget is
    /// exhausted or a fatal invocation failure occurs.
    pub async fn process(&self, request: &CalculatorRequest) -> Result<CalculatorResponse> {
        let mut delay = self.base_delay;
        let mut attempt = 1;

        loop {
            match self.inner.process(request).await {
                Ok(response) => return Ok(response),
                Err(CalculatorError::Fatal(message)) => {
                    return Err(Error::CalculatorUnavailable { message });
                }
                Err(CalculatorError::Transient(message)) => {
                    if attempt >= self.max_attempts {
                        return Err(Error::CalculatorUnavailable {
                            message: format!(
                                "{message} (after {attempt} attempts)"
                            ),
                        });
                    }
                    tracing::warn!(
                        chunk_no = request.chunk_no,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %message,
                        "transient calculator failure, retrying"
                    );
                    record_calculator_retry();
                    tokio::time::sleep(delay + Duration::from_millis(rand_jitter())).await;
                    delay = delay.saturating_mul(self.multiplier);
                    attempt += 1;
                }
            }
        }
    }
}

/// Generates random jitter for backoff (0-50ms).
fn rand_jitter() -> u64 {
    // Simple nanosecond-seeded jitter (avoids a full rand dependency)
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ActionType;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyCalculator {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Calculator for FlakyCalculator {
        async fn process(
            &self,
            request: &CalculatorRequest,
        ) -> std::result::Result<CalculatorResponse, CalculatorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(CalculatorError::Transient("throttled".into()));
            }
            Ok(CalculatorResponse {
                source_data_location: request.source_data_location.clone(),
                csv_output_data_location: ObjectLocation {
                    bucket: "data".into(),
                    key: format!("output/{}.csv", request.chunk_no),
                },
                error_location: ObjectLocation {
                    bucket: "data".into(),
                    key: format!("errors/{}.txt", request.chunk_no),
                },
            })
        }
    }

    fn request() -> CalculatorRequest {
        CalculatorRequest {
            group_context_id: "/usa/co".into(),
            pipeline_id: PipelineId::generate(),
            execution_id: ExecutionId::generate(),
            username: "analyst@acme.example".into(),
            action_type: ActionType::Create,
            parameters: vec![],
            transforms: vec![],
            source_data_location: SourceDataLocation {
                bucket: "data".into(),
                key: "input/source.csv".into(),
                contains_header: true,
                start_byte: 0,
                end_byte: 99,
            },
            chunk_no: 0,
            unique_key: None,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            calculator_retry_base: Duration::from_millis(1),
            calculator_max_attempts: 3,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calculator = Arc::new(FlakyCalculator {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        });
        let retrying = RetryingCalculator::new(calculator.clone(), &fast_config());

        let response = retrying.process(&request()).await.expect("succeeds");
        assert_eq!(response.csv_output_data_location.key, "output/0.csv");
        assert_eq!(calculator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_escalates() {
        let calculator = Arc::new(FlakyCalculator {
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let retrying = RetryingCalculator::new(calculator.clone(), &fast_config());

        let err = retrying.process(&request()).await.expect_err("exhausted");
        assert!(matches!(err, Error::CalculatorUnavailable { .. }));
        assert_eq!(calculator.calls.load(Ordering::SeqCst), 3);
    }

    struct FatalCalculator;

    #[async_trait]
    impl Calculator for FatalCalculator {
        async fn process(
            &self,
            _request: &CalculatorRequest,
        ) -> std::result::Result<CalculatorResponse, CalculatorError> {
            Err(CalculatorError::Fatal("source object missing".into()))
        }
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let retrying = RetryingCalculator::new(Arc::new(FatalCalculator), &fast_config());
        let err = retrying.process(&request()).await.expect_err("fatal");
        assert!(matches!(err, Error::CalculatorUnavailable { .. }));
    }
}
