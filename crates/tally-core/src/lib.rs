//! # tally-core
//!
//! Core abstractions for the tally metrics engine.
//!
//! This crate provides the foundational types and traits used across the
//! workspace:
//!
//! - **Identifiers**: Strongly-typed IDs for pipelines, executions, metrics
//! - **Storage**: Abstract object-storage interface with conditional writes
//! - **Locking**: A named, scoped distributed lock over object storage
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `tally-core` is the only crate allowed to define shared primitives. The
//! engine crate (`tally-flow`) builds on these contracts and never reaches
//! around them to a concrete storage service.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod scoped_storage;
pub mod storage;

pub use error::{Error, Result};
pub use id::{ActivityId, ExecutionId, JobId, MetricId, PipelineId};
pub use lock::{LockGuard, LockInfo, LockManager, LockScope};
pub use scoped_storage::ScopedStorage;
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ActivityId, ExecutionId, JobId, MetricId, PipelineId};
    pub use crate::lock::{LockGuard, LockManager, LockScope};
    pub use crate::scoped_storage::ScopedStorage;
    pub use crate::storage::{
        MemoryBackend, StorageBackend, WritePrecondition, WriteResult,
    };
}
