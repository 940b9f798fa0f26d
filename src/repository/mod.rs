//! Metadata repository contract for depot.
//!
//! The repository holds the application-level overlay: directory
//! permission policies, protection flags, and usage records. The storage
//! service consumes this trait; two implementations ship with the crate
//! (in-memory and SQLite). Batched lookups exist so bulk operations can
//! keep their repository round-trips independent of batch size.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryMetadataRepository;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMetadataRepository;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{DirectoryPermissions, UsageRecord};
use crate::path;

/// Database record for a file.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Unique record ID.
    pub id: i64,
    /// Logical path.
    pub path: String,
    /// Path of the containing directory (empty for root-level files).
    pub directory_path: String,
    /// Basename.
    pub name: String,
    /// Protection override.
    pub is_protected: bool,
    /// Content hash recorded at upload time, when known.
    pub content_hash: Option<String>,
    /// When the record was created.
    pub created: DateTime<Utc>,
    /// When the record was last updated.
    pub updated: Option<DateTime<Utc>>,
}

/// Data for creating a new file record.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    /// Logical path.
    pub path: String,
    /// Protection override.
    pub is_protected: bool,
    /// Content hash, when known.
    pub content_hash: Option<String>,
}

impl NewFileRecord {
    /// Create a new unprotected file record for a path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_protected: false,
            content_hash: None,
        }
    }

    /// Mark the record as protected.
    pub fn protected(mut self, is_protected: bool) -> Self {
        self.is_protected = is_protected;
        self
    }

    /// Set the content hash.
    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Directory part of the path.
    pub fn directory_path(&self) -> &str {
        path::parent_path(&self.path)
    }

    /// Basename part of the path.
    pub fn name(&self) -> &str {
        path::file_name(&self.path)
    }
}

/// Builder for updating a file record.
#[derive(Debug, Clone, Default)]
pub struct FileRecordUpdate {
    /// New logical path (rename/move).
    pub path: Option<String>,
    /// New protection flag.
    pub is_protected: Option<bool>,
    /// New content hash.
    pub content_hash: Option<Option<String>>,
}

impl FileRecordUpdate {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a new path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the protection flag.
    pub fn protected(mut self, is_protected: bool) -> Self {
        self.is_protected = Some(is_protected);
        self
    }

    /// Set the content hash.
    pub fn content_hash(mut self, hash: Option<String>) -> Self {
        self.content_hash = Some(hash);
        self
    }

    /// Check if any fields are set.
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.is_protected.is_none() && self.content_hash.is_none()
    }
}

/// Database record for a directory.
#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    /// Unique record ID.
    pub id: i64,
    /// Logical path.
    pub path: String,
    /// Parent directory path (empty for top-level directories).
    pub parent_path: String,
    /// Basename.
    pub name: String,
    /// Policy flags.
    pub permissions: DirectoryPermissions,
    /// Protection override.
    pub is_protected: bool,
    /// Whether protection cascades to new children.
    pub protect_children: bool,
    /// When the record was created.
    pub created: DateTime<Utc>,
    /// When the record was last updated.
    pub updated: Option<DateTime<Utc>>,
}

/// Data for creating a new directory record.
#[derive(Debug, Clone)]
pub struct NewDirectoryRecord {
    /// Logical path.
    pub path: String,
    /// Policy flags.
    pub permissions: DirectoryPermissions,
    /// Protection override.
    pub is_protected: bool,
    /// Whether protection cascades to new children.
    pub protect_children: bool,
}

impl NewDirectoryRecord {
    /// Create a new permissive, unprotected directory record.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            permissions: DirectoryPermissions::default(),
            is_protected: false,
            protect_children: false,
        }
    }

    /// Set the policy flags.
    pub fn with_permissions(mut self, permissions: DirectoryPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Mark the record as protected.
    pub fn protected(mut self, is_protected: bool) -> Self {
        self.is_protected = is_protected;
        self
    }

    /// Set whether protection cascades to new children.
    pub fn protect_children(mut self, protect_children: bool) -> Self {
        self.protect_children = protect_children;
        self
    }

    /// Parent directory part of the path.
    pub fn parent_path(&self) -> &str {
        path::parent_path(&self.path)
    }

    /// Basename part of the path.
    pub fn name(&self) -> &str {
        path::file_name(&self.path)
    }
}

/// Builder for updating a directory record.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRecordUpdate {
    /// New logical path (rename/move).
    pub path: Option<String>,
    /// New policy flags.
    pub permissions: Option<DirectoryPermissions>,
    /// New protection flag.
    pub is_protected: Option<bool>,
    /// New cascade flag.
    pub protect_children: Option<bool>,
}

impl DirectoryRecordUpdate {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a new path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the policy flags.
    pub fn permissions(mut self, permissions: DirectoryPermissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Set the protection flag.
    pub fn protected(mut self, is_protected: bool) -> Self {
        self.is_protected = Some(is_protected);
        self
    }

    /// Set the cascade flag.
    pub fn protect_children(mut self, protect_children: bool) -> Self {
        self.protect_children = Some(protect_children);
        self
    }

    /// Check if any fields are set.
    pub fn is_empty(&self) -> bool {
        self.path.is_none()
            && self.permissions.is_none()
            && self.is_protected.is_none()
            && self.protect_children.is_none()
    }
}

/// Data for registering a new usage record.
#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    /// Logical path of the referenced file.
    pub file_path: String,
    /// Free-form usage tag.
    pub usage_type: String,
    /// Identifier of the referencing entity.
    pub reference_id: String,
    /// Table/collection the referencing entity lives in.
    pub reference_table: String,
}

impl NewUsageRecord {
    /// Create a new usage record.
    pub fn new(
        file_path: impl Into<String>,
        usage_type: impl Into<String>,
        reference_id: impl Into<String>,
        reference_table: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            usage_type: usage_type.into(),
            reference_id: reference_id.into(),
            reference_table: reference_table.into(),
        }
    }
}

/// Result of a usage check for one file path.
#[derive(Debug, Clone)]
pub struct FileUsage {
    /// Whether at least one usage record exists.
    pub is_in_use: bool,
    /// The usage records, ordered by creation time.
    pub usages: Vec<UsageRecord>,
    /// Human-readable reason deletion is blocked, when in use.
    pub delete_block_reason: Option<String>,
}

impl FileUsage {
    /// Build the check result from a set of usage records.
    pub fn from_usages(usages: Vec<UsageRecord>) -> Self {
        let is_in_use = !usages.is_empty();
        let delete_block_reason = usages.first().map(|u| {
            format!(
                "file is in use as '{}' by {} ({})",
                u.usage_type, u.reference_id, u.reference_table
            )
        });
        Self {
            is_in_use,
            usages,
            delete_block_reason,
        }
    }

    /// An unused file.
    pub fn unused() -> Self {
        Self {
            is_in_use: false,
            usages: Vec::new(),
            delete_block_reason: None,
        }
    }
}

/// Persistence contract consumed by the storage service.
///
/// Implementations must keep the batched lookups to a bounded number of
/// queries per call, independent of the input size.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Get a file record by path.
    async fn file_by_path(&self, path: &str) -> Result<Option<FileRecord>>;

    /// Get many file records in one round trip, keyed by path.
    async fn files_by_paths(&self, paths: &[String]) -> Result<HashMap<String, FileRecord>>;

    /// Get a directory record by path.
    async fn directory_by_path(&self, path: &str) -> Result<Option<DirectoryRecord>>;

    /// Get many directory records in one round trip, keyed by path.
    async fn directories_by_paths(
        &self,
        paths: &[String],
    ) -> Result<HashMap<String, DirectoryRecord>>;

    /// List directory records directly under a parent path.
    async fn directories_by_parent_path(&self, parent: &str) -> Result<Vec<DirectoryRecord>>;

    /// Create a file record.
    async fn create_file(&self, file: &NewFileRecord) -> Result<FileRecord>;

    /// Update a file record by path. Returns the updated record, or
    /// `None` when no record exists for the path.
    async fn update_file(
        &self,
        path: &str,
        update: &FileRecordUpdate,
    ) -> Result<Option<FileRecord>>;

    /// Delete a file record (and its usage records) by path.
    async fn delete_file(&self, path: &str) -> Result<bool>;

    /// Create a directory record.
    async fn create_directory(&self, dir: &NewDirectoryRecord) -> Result<DirectoryRecord>;

    /// Update a directory record by path.
    async fn update_directory(
        &self,
        path: &str,
        update: &DirectoryRecordUpdate,
    ) -> Result<Option<DirectoryRecord>>;

    /// Delete a directory record by path.
    async fn delete_directory(&self, path: &str) -> Result<bool>;

    /// Check usage for one file path.
    async fn check_file_usage(&self, path: &str) -> Result<FileUsage>;

    /// Check usage for many file paths in one round trip. Paths with no
    /// usages are absent from the result map.
    async fn usages_by_paths(&self, paths: &[String]) -> Result<HashMap<String, Vec<UsageRecord>>>;

    /// Register a usage record for a file path.
    async fn add_usage(&self, usage: &NewUsageRecord) -> Result<UsageRecord>;

    /// Remove a usage record by ID.
    async fn remove_usage(&self, id: i64) -> Result<bool>;
}
