//! Error types for the execution and aggregation engine.

use tally_core::ExecutionId;

/// The result type used throughout tally-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An execution was not found.
    #[error("execution not found: {execution_id}")]
    ExecutionNotFound {
        /// The execution ID that was not found.
        execution_id: ExecutionId,
    },

    /// An invalid execution state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A chunk failed after exhausting its retry budget.
    #[error("chunk {sequence} failed: {message}")]
    ChunkFailed {
        /// The chunk sequence number.
        sequence: u32,
        /// Description of the failure.
        message: String,
    },

    /// The calculation engine could not be invoked (infrastructure failure).
    ///
    /// Distinct from row-level errors, which land in the chunk's error
    /// artifact and never surface as an `Err`.
    #[error("calculator invocation failed: {message}")]
    CalculatorUnavailable {
        /// Description of the invocation failure.
        message: String,
    },

    /// A chunk result set had gaps and cannot be merged.
    #[error("incomplete chunk results: missing sequence {sequence} of {expected}")]
    MissingChunkResult {
        /// The first missing sequence number.
        sequence: u32,
        /// The expected number of chunks.
        expected: u32,
    },

    /// The impact-creation loop exceeded its iteration safety cap.
    #[error("impact creation exceeded {max_iterations} iterations without draining")]
    ImpactIterationCapExceeded {
        /// The configured iteration cap.
        max_iterations: u32,
    },

    /// Engine configuration was invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A metric definition was not found.
    #[error("metric not found: {name}")]
    MetricNotFound {
        /// The metric name that was looked up.
        name: String,
    },

    /// A core-layer error (storage, locking, identifiers).
    #[error(transparent)]
    Core(#[from] tally_core::Error),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error is a lock conflict from the core layer.
    #[must_use]
    pub const fn is_lock_held(&self) -> bool {
        matches!(self, Self::Core(tally_core::Error::LockHeld { .. }))
    }
}
