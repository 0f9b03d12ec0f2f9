//! Tenant-scoped storage with a validated path layout.
//!
//! Every tenant's datasets, execution artifacts, and lock records live under
//! a `tenant={tenant}/` prefix. All engine components receive a
//! [`ScopedStorage`] rather than a raw backend, so a path can never escape
//! its tenant.
//!
//! The key=value prefix format provides:
//! - Operational ergonomics (grep-friendly: `tenant=acme` is self-documenting)
//! - Consistency with Hive partition conventions
//!
//! # Security
//!
//! This module enforces strict path isolation:
//! - All paths are prefixed with the tenant scope
//! - Path traversal attempts (`..`) are rejected
//! - Tenant IDs are validated at construction

use bytes::Bytes;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Tenant-scoped storage wrapper.
///
/// Enforces isolation by prefixing all paths with `tenant={tenant}/`.
#[derive(Clone)]
pub struct ScopedStorage {
    backend: Arc<dyn StorageBackend>,
    tenant_id: String,
}

impl ScopedStorage {
    /// Creates a new scoped storage wrapper.
    ///
    /// # Errors
    ///
    /// Returns an error if `tenant_id` is invalid. IDs must be non-empty,
    /// ASCII lowercase alphanumeric (plus `-` and `_`), and must not contain
    /// path separators or control characters.
    pub fn new(backend: Arc<dyn StorageBackend>, tenant_id: impl Into<String>) -> Result<Self> {
        let tenant_id = tenant_id.into();
        Self::validate_tenant_id(&tenant_id)?;
        Ok(Self { backend, tenant_id })
    }

    fn validate_tenant_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "tenant_id cannot be empty".into(),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(Error::InvalidId {
                message: "tenant_id contains invalid characters (allowed: a-z, 0-9, '-', '_')"
                    .into(),
            });
        }

        Ok(())
    }

    /// Validates a relative path for path traversal attacks.
    fn validate_path(path: &str) -> Result<()> {
        if path.starts_with('/') || path.starts_with('\\') {
            return Err(Error::InvalidInput(format!(
                "absolute paths not allowed: {path}"
            )));
        }

        if path.contains('\\') {
            return Err(Error::InvalidInput(format!(
                "backslashes not allowed in paths: {path}"
            )));
        }

        if path.contains('\n') || path.contains('\r') || path.contains('\0') {
            return Err(Error::InvalidInput(format!(
                "control characters not allowed in paths: {path}"
            )));
        }

        for segment in path.split('/') {
            if segment == "." || segment == ".." {
                return Err(Error::InvalidInput(format!(
                    "path traversal not allowed: {path}"
                )));
            }
        }

        Ok(())
    }

    /// Returns the tenant ID.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Returns the backend for advanced operations.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    fn scoped_path(&self, path: &str) -> String {
        format!("tenant={}/{path}", self.tenant_id)
    }

    /// Reads an entire object at a tenant-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the object doesn't exist.
    pub async fn get(&self, path: &str) -> Result<Bytes> {
        Self::validate_path(path)?;
        self.backend.get(&self.scoped_path(path)).await
    }

    /// Reads a byte range from an object at a tenant-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path or range is invalid.
    pub async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        Self::validate_path(path)?;
        self.backend.get_range(&self.scoped_path(path), range).await
    }

    /// Writes an object at a tenant-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the write fails.
    pub async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        Self::validate_path(path)?;
        self.backend
            .put(&self.scoped_path(path), data, precondition)
            .await
    }

    /// Deletes an object at a tenant-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub async fn delete(&self, path: &str) -> Result<()> {
        Self::validate_path(path)?;
        self.backend.delete(&self.scoped_path(path)).await
    }

    /// Lists objects under a tenant-relative prefix.
    ///
    /// Returned metadata paths are stripped back to tenant-relative form.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is invalid.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Self::validate_path(prefix)?;
        let scope = format!("tenant={}/", self.tenant_id);
        let mut metas = self.backend.list(&self.scoped_path(prefix)).await?;
        for meta in &mut metas {
            if let Some(stripped) = meta.path.strip_prefix(&scope) {
                meta.path = stripped.to_string();
            }
        }
        Ok(metas)
    }

    /// Gets object metadata at a tenant-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Self::validate_path(path)?;
        let scope = format!("tenant={}/", self.tenant_id);
        let meta = self.backend.head(&self.scoped_path(path)).await?;
        Ok(meta.map(|mut m| {
            if let Some(stripped) = m.path.strip_prefix(&scope) {
                m.path = stripped.to_string();
            }
            m
        }))
    }

    /// Generates a signed download URL for a tenant-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub async fn signed_url(&self, path: &str, expiry: Duration) -> Result<String> {
        Self::validate_path(path)?;
        self.backend.signed_url(&self.scoped_path(path), expiry).await
    }
}
