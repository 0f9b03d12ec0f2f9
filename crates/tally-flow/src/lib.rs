//! # tally-flow
//!
//! The execution and aggregation engine for tally.
//!
//! Tenant-uploaded datasets are transformed in parallel chunks by a
//! calculation engine and the numeric outputs are rolled up an
//! organizational group tree into versioned, time-bucketed metrics:
//!
//! - **Execution coordination**: an explicit state machine
//!   (verify → calculate → merge → create-impacts) with persisted state
//!   after every transition and bounded-concurrency chunk fan-out
//! - **Hierarchical aggregation**: lock-guarded bottom-up rollups of
//!   group/sub-group values across day/week/month/quarter/year buckets
//! - **Latest-value projection**: a conditional upsert that keeps a
//!   "latest value by key" materialization current without ever
//!   regressing on out-of-order writes
//!
//! ## Architecture
//!
//! ```text
//! ExecutionCoordinator ──▶ Calculator (fan-out, bounded)
//!         │                     │
//!         ▼                     ▼
//!    ResultMerger ◀── per-chunk output/error artifacts
//!         │
//!         ▼
//!  MetricAggregator ──▶ GroupHierarchy (fan-out targets)
//!         │           ──▶ LockManager (one pass per target)
//!         ▼
//!    value stores (append-only + latest projection)
//! ```
//!
//! All state lives in tenant-scoped object storage (`tally-core`); records
//! are append-only and every overwrite is a conditional write, so crashed
//! steps can re-run idempotently.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aggregation;
pub mod bulk;
pub mod calculator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod execution;
pub mod export;
pub mod hierarchy;
pub mod merge;
pub mod metrics;
pub mod paths;
pub mod values;

pub use config::EngineConfig;
pub use coordinator::{ExecutionCoordinator, ExecutionState};
pub use error::{Error, Result};
pub use execution::{ActionType, Execution, ExecutionStatus, ExecutionStore, PipelineType};
pub use hierarchy::GroupHierarchy;
