//! Scoped, named locks over object storage.
//!
//! Aggregation and export jobs must not run concurrently against the same
//! target: two interleaved aggregation passes for one metric would
//! double-count partial sums. This module serializes them with a lock file
//! per (scope, key) in object storage:
//!
//! - **CAS (Compare-and-Swap)**: Atomic acquisition via preconditioned writes;
//!   there is no read-then-write window
//! - **TTL (Time-to-Live)**: Automatic expiry so a crashed holder cannot
//!   block the resource forever
//! - **Single-shot acquisition**: A held lock is reported to the caller as a
//!   [`Error::LockHeld`] conflict, never retried behind the caller's back
//!
//! # How It Works
//!
//! 1. Acquisition writes a lock record with the holder's identity, a fresh
//!    token, and an expiry time, using a `DoesNotExist` precondition -
//!    only one writer can succeed
//! 2. If the lock exists but has expired, it is taken over with a
//!    version-preconditioned write bound to the observed record
//! 3. Release writes an already-expired record (ownership-checked CAS) so a
//!    racing takeover is never clobbered
//!
//! # Example
//!
//! ```rust,ignore
//! let locks = LockManager::new(storage.clone());
//!
//! let guard = locks
//!     .acquire(LockScope::MetricAggregation, "ghg:emissions:/usa", DEFAULT_LOCK_TTL)
//!     .await?;
//!
//! // Critical section - one aggregation pass at a time
//! // ... roll up metric values ...
//!
//! guard.release().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::scoped_storage::ScopedStorage;
use crate::storage::{WritePrecondition, WriteResult};

/// Default lock TTL (5 minutes).
///
/// Aggregation passes are multi-second jobs; the TTL bounds how long a
/// crashed holder can block the target before expiry-based reclaim.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// The scope a lock belongs to.
///
/// Scopes partition the lock namespace by job family; the same key in two
/// scopes names two independent locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LockScope {
    /// Serializes metric-aggregation passes per (metric, time unit, group).
    MetricAggregation,
    /// Serializes long-running activity download/export jobs per job key.
    Export,
}

impl LockScope {
    /// Returns the wire/path name of the scope.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MetricAggregation => "metricAggregation",
            Self::Export => "export",
        }
    }
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Identity of the lock holder.
    pub holder_id: String,

    /// Token proving ownership; required for release.
    pub token: String,

    /// When the lock expires.
    pub expires_at: DateTime<Utc>,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Optional description of the guarded operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    fn new(holder_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            token: Ulid::new().to_string(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300)),
            acquired_at: now,
            operation: None,
        }
    }

    /// Returns whether this lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns the remaining TTL, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        let remaining = self.expires_at - Utc::now();
        let millis = remaining.num_milliseconds();
        if millis <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
        }
    }
}

/// Returns the storage path of the lock file for a (scope, key) pair.
#[must_use]
pub fn lock_path(scope: LockScope, key: &str) -> String {
    format!("locks/{}/{key}.lock.json", scope.as_str())
}

/// A manager for scoped locks backed by tenant storage.
///
/// Each manager instance gets a unique holder ID; every lock it acquires
/// records that identity.
#[derive(Clone)]
pub struct LockManager {
    storage: ScopedStorage,
    holder_id: Arc<str>,
}

impl LockManager {
    /// Creates a new lock manager over the given tenant storage.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self {
            storage,
            holder_id: Ulid::new().to_string().into(),
        }
    }

    /// Returns the holder ID recorded for locks acquired by this manager.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Attempts to acquire the lock for (scope, key) with the given TTL.
    ///
    /// Acquisition is single-shot: if the lock is held and unexpired the
    /// call fails immediately with [`Error::LockHeld`] so the caller can
    /// surface the conflict. An expired lock is taken over atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockHeld`] if the lock is held, or a storage error
    /// if the lock record could not be read or written.
    pub async fn acquire(&self, scope: LockScope, key: &str, ttl: Duration) -> Result<LockGuard> {
        self.acquire_with_operation(scope, key, ttl, None).await
    }

    /// Attempts to acquire the lock, recording a description of the guarded
    /// operation in the lock file.
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::acquire`].
    pub async fn acquire_with_operation(
        &self,
        scope: LockScope,
        key: &str,
        ttl: Duration,
        operation: Option<String>,
    ) -> Result<LockGuard> {
        let path = lock_path(scope, key);

        let mut info = LockInfo::new(self.holder_id.as_ref(), ttl);
        info.operation.clone_from(&operation);
        let record = Bytes::from(serde_json::to_vec(&info).map_err(Error::serialization)?);

        // Fast path: the lock file does not exist yet.
        match self
            .storage
            .put(&path, record, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { version } => {
                return Ok(LockGuard {
                    storage: self.storage.clone(),
                    scope,
                    key: key.to_string(),
                    path,
                    info,
                    version,
                    released: false,
                });
            }
            WriteResult::PreconditionFailed { .. } => {
                // Lock record exists - inspect it below.
            }
        }

        // The expiry decision must be bound to the version used for the
        // takeover CAS: HEAD first, then read. If another writer slips in
        // between, the MatchesVersion write below fails and the caller sees
        // a conflict - never a double acquisition.
        let meta = self.storage.head(&path).await?.ok_or(Error::LockHeld {
            scope: scope.as_str().to_string(),
            key: key.to_string(),
            holder: "unknown".to_string(),
        })?;

        let existing = self.read_lock(&path).await?.ok_or(Error::LockHeld {
            scope: scope.as_str().to_string(),
            key: key.to_string(),
            holder: "unknown".to_string(),
        })?;

        if !existing.is_expired() {
            return Err(Error::LockHeld {
                scope: scope.as_str().to_string(),
                key: key.to_string(),
                holder: existing.holder_id,
            });
        }

        // Expired - take it over, bound to the version observed above.
        let mut takeover = LockInfo::new(self.holder_id.as_ref(), ttl);
        takeover.operation = operation;
        let record = Bytes::from(serde_json::to_vec(&takeover).map_err(Error::serialization)?);

        match self
            .storage
            .put(&path, record, WritePrecondition::MatchesVersion(meta.version))
            .await?
        {
            WriteResult::Success { version } => Ok(LockGuard {
                storage: self.storage.clone(),
                scope,
                key: key.to_string(),
                path,
                info: takeover,
                version,
                released: false,
            }),
            WriteResult::PreconditionFailed { .. } => Err(Error::LockHeld {
                scope: scope.as_str().to_string(),
                key: key.to_string(),
                holder: "unknown".to_string(),
            }),
        }
    }

    /// Checks whether the lock for (scope, key) is currently held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be read.
    pub async fn is_locked(&self, scope: LockScope, key: &str) -> Result<bool> {
        Ok(self
            .read_lock(&lock_path(scope, key))
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    /// Reads the current lock record without acquiring it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be read or parsed.
    pub async fn read_lock_info(&self, scope: LockScope, key: &str) -> Result<Option<LockInfo>> {
        self.read_lock(&lock_path(scope, key)).await
    }

    /// Forcefully breaks an existing lock (admin operation).
    ///
    /// # Warning
    ///
    /// Only for recovery when a lock is known to be stale but hasn't
    /// expired (e.g. crashed holder with a long TTL).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be deleted.
    pub async fn force_break(&self, scope: LockScope, key: &str) -> Result<()> {
        tracing::warn!(scope = %scope, key, "force-breaking lock");
        self.storage.delete(&lock_path(scope, key)).await
    }

    async fn read_lock(&self, path: &str) -> Result<Option<LockInfo>> {
        match self.storage.get(path).await {
            Ok(data) => {
                let info: LockInfo =
                    serde_json::from_slice(&data).map_err(Error::serialization)?;
                Ok(Some(info))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// RAII guard for a held lock.
///
/// The lock is released automatically when the guard is dropped, but
/// `release()` should be called explicitly so a failed release surfaces as
/// an error instead of a background log line. A lock that cannot be
/// released blocks its target until the TTL reclaims it, so release
/// failures are loud.
pub struct LockGuard {
    storage: ScopedStorage,
    scope: LockScope,
    key: String,
    path: String,
    info: LockInfo,
    /// Opaque version token for CAS operations.
    version: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("scope", &self.scope)
            .field("key", &self.key)
            .field("path", &self.path)
            .field("info", &self.info)
            .field("version", &self.version)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    /// Returns the scope of the held lock.
    #[must_use]
    pub fn scope(&self) -> LockScope {
        self.scope
    }

    /// Returns the key of the held lock.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the ownership token for this acquisition.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.info.token
    }

    /// Returns when the held lock expires.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.info.expires_at
    }

    /// Explicitly releases the lock.
    ///
    /// Called automatically on drop, but calling explicitly allows handling
    /// release errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be rewritten.
    pub async fn release(mut self) -> Result<()> {
        self.do_release().await
    }

    /// Internal release implementation.
    ///
    /// Writes an already-expired record via CAS instead of deleting: a
    /// delete could remove a new holder's lock if a takeover happened
    /// between our ownership check and the delete.
    async fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        if let Some(current) = read_info(&self.storage, &self.path).await? {
            if current.token == self.info.token {
                let expired = LockInfo {
                    expires_at: Utc::now() - chrono::Duration::seconds(1),
                    ..current
                };
                let record =
                    Bytes::from(serde_json::to_vec(&expired).map_err(Error::serialization)?);

                // On PreconditionFailed another holder took over after
                // expiry - their lock must be left intact.
                let _ = self
                    .storage
                    .put(
                        &self.path,
                        record,
                        WritePrecondition::MatchesVersion(self.version.clone()),
                    )
                    .await?;
            }
        }

        self.released = true;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort async release in the destructor. Prefer calling
            // release() explicitly; if no runtime is available the TTL
            // handles eventual cleanup.
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };

            let storage = self.storage.clone();
            let path = self.path.clone();
            let token = self.info.token.clone();
            let version = self.version.clone();
            let scope = self.scope;
            let key = self.key.clone();

            handle.spawn(async move {
                let released = release_by_token(&storage, &path, &token, &version).await;
                if let Err(e) = released {
                    tracing::error!(
                        scope = %scope,
                        key,
                        error = %e,
                        "failed to release lock on drop; target blocked until TTL expiry"
                    );
                }
            });
        }
    }
}

async fn read_info(storage: &ScopedStorage, path: &str) -> Result<Option<LockInfo>> {
    match storage.get(path).await {
        Ok(data) => {
            let info: LockInfo = serde_json::from_slice(&data).map_err(Error::serialization)?;
            Ok(Some(info))
        }
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn release_by_token(
    storage: &ScopedStorage,
    path: &str,
    token: &str,
    version: &str,
) -> Result<()> {
    if let Some(current) = read_info(storage, path).await? {
        if current.token == token {
            let expired = LockInfo {
                expires_at: Utc::now() - chrono::Duration::seconds(1),
                ..current
            };
            let record = Bytes::from(serde_json::to_vec(&expired).map_err(Error::serialization)?);
            let _ = storage
                .put(
                    path,
                    record,
                    WritePrecondition::MatchesVersion(version.to_string()),
                )
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn manager() -> LockManager {
        let storage =
            ScopedStorage::new(Arc::new(MemoryBackend::new()), "acme").expect("tenant");
        LockManager::new(storage)
    }

    fn shared_managers() -> (LockManager, LockManager) {
        let backend = Arc::new(MemoryBackend::new());
        let storage_a = ScopedStorage::new(backend.clone(), "acme").expect("tenant");
        let storage_b = ScopedStorage::new(backend, "acme").expect("tenant");
        (LockManager::new(storage_a), LockManager::new(storage_b))
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let locks = manager();

        let guard = locks
            .acquire(LockScope::MetricAggregation, "ghg:/usa", DEFAULT_LOCK_TTL)
            .await
            .expect("acquire");
        assert!(!guard.token().is_empty());
        assert!(guard.expires_at() > Utc::now());

        guard.release().await.expect("release");

        assert!(!locks
            .is_locked(LockScope::MetricAggregation, "ghg:/usa")
            .await
            .expect("check"));
    }

    #[tokio::test]
    async fn second_acquire_conflicts() {
        let (locks_a, locks_b) = shared_managers();

        let _guard = locks_a
            .acquire(LockScope::MetricAggregation, "ghg:/usa", DEFAULT_LOCK_TTL)
            .await
            .expect("acquire");

        let conflict = locks_b
            .acquire(LockScope::MetricAggregation, "ghg:/usa", DEFAULT_LOCK_TTL)
            .await;
        match conflict {
            Err(Error::LockHeld { holder, .. }) => {
                assert_eq!(holder, locks_a.holder_id());
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_acquire_exactly_one_wins() {
        let (locks_a, locks_b) = shared_managers();

        let (a, b) = tokio::join!(
            locks_a.acquire(LockScope::Export, "job-1", DEFAULT_LOCK_TTL),
            locks_b.acquire(LockScope::Export, "job-1", DEFAULT_LOCK_TTL),
        );
        assert_eq!(
            u8::from(a.is_ok()) + u8::from(b.is_ok()),
            1,
            "exactly one acquisition must succeed"
        );
    }

    #[tokio::test]
    async fn release_allows_reacquire() {
        let locks = manager();

        let guard = locks
            .acquire(LockScope::Export, "job-2", DEFAULT_LOCK_TTL)
            .await
            .expect("acquire");
        guard.release().await.expect("release");

        let again = locks
            .acquire(LockScope::Export, "job-2", DEFAULT_LOCK_TTL)
            .await
            .expect("reacquire after release");
        again.release().await.expect("release 2");
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let (locks_a, locks_b) = shared_managers();

        let guard_a = locks_a
            .acquire(
                LockScope::MetricAggregation,
                "ghg:/usa",
                Duration::from_millis(1),
            )
            .await
            .expect("acquire a");

        tokio::time::sleep(Duration::from_millis(10)).await;

        let guard_b = locks_b
            .acquire(LockScope::MetricAggregation, "ghg:/usa", DEFAULT_LOCK_TTL)
            .await
            .expect("takeover of expired lock");
        assert_ne!(guard_a.token(), guard_b.token());

        guard_b.release().await.expect("release");
    }

    #[tokio::test]
    async fn stale_release_leaves_new_holder_intact() {
        let (locks_a, locks_b) = shared_managers();

        let guard_a = locks_a
            .acquire(LockScope::Export, "job-3", Duration::from_millis(1))
            .await
            .expect("acquire a");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let guard_b = locks_b
            .acquire(LockScope::Export, "job-3", DEFAULT_LOCK_TTL)
            .await
            .expect("takeover");

        // The stale holder's release must not unlock the new holder.
        guard_a.release().await.expect("stale release is a no-op");
        assert!(locks_b
            .is_locked(LockScope::Export, "job-3")
            .await
            .expect("check"));

        guard_b.release().await.expect("release b");
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let (locks_a, locks_b) = shared_managers();

        let _agg = locks_a
            .acquire(LockScope::MetricAggregation, "shared-key", DEFAULT_LOCK_TTL)
            .await
            .expect("acquire agg");

        // Same key under a different scope is a different lock.
        let export = locks_b
            .acquire(LockScope::Export, "shared-key", DEFAULT_LOCK_TTL)
            .await
            .expect("acquire export");
        export.release().await.expect("release");
    }

    #[tokio::test]
    async fn force_break_clears_lock() {
        let locks = manager();
        let _guard = locks
            .acquire(LockScope::Export, "job-4", DEFAULT_LOCK_TTL)
            .await
            .expect("acquire");

        locks
            .force_break(LockScope::Export, "job-4")
            .await
            .expect("break");
        assert!(!locks
            .is_locked(LockScope::Export, "job-4")
            .await
            .expect("check"));
    }

    #[test]
    fn lock_info_expiry() {
        let info = LockInfo::new("holder-1", Duration::from_secs(1));
        assert!(!info.is_expired());
        assert!(info.remaining_ttl() > Duration::ZERO);

        let expired = LockInfo {
            expires_at: Utc::now() - chrono::Duration::seconds(10),
            ..info
        };
        assert!(expired.is_expired());
        assert_eq!(expired.remaining_ttl(), Duration::ZERO);
    }

    #[test]
    fn lock_paths_are_stable() {
        assert_eq!(
            lock_path(LockScope::MetricAggregation, "ghg:d:/usa"),
            "locks/metricAggregation/ghg:d:/usa.lock.json"
        );
        assert_eq!(
            lock_path(LockScope::Export, "job-1"),
            "locks/export/job-1.lock.json"
        );
    }
}
