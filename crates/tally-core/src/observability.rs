//! Observability infrastructure for tally.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so every engine component
//! logs with the same shape.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tally_flow=debug`)
///
/// # Example
///
/// ```rust
/// use tally_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for pipeline-execution operations with standard fields.
///
/// # Example
///
/// ```rust
/// use tally_core::observability::execution_span;
///
/// let span = execution_span("calculate_chunk", "acme", "pipe-1", "exec-1");
/// let _guard = span.enter();
/// // ... do execution work
/// ```
#[must_use]
pub fn execution_span(
    operation: &str,
    tenant_id: &str,
    pipeline_id: &str,
    execution_id: &str,
) -> Span {
    tracing::info_span!(
        "execution",
        operation = operation,
        tenant_id = tenant_id,
        pipeline_id = pipeline_id,
        execution_id = execution_id,
    )
}

/// Creates a span for aggregation operations with standard fields.
#[must_use]
pub fn aggregation_span(operation: &str, tenant_id: &str, metric_name: &str) -> Span {
    tracing::info_span!(
        "aggregation",
        operation = operation,
        tenant_id = tenant_id,
        metric_name = metric_name,
    )
}
