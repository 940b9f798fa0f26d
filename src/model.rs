//! Unified view models for depot.
//!
//! These types are derived, ephemeral read models: every query rebuilds
//! them by merging live backend state with the current database record.
//! They are never persisted themselves.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path;

/// Enumerated file category derived from the content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Other,
}

impl FileType {
    /// Derive the category from a MIME content type.
    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();

        if ct.starts_with("image/") {
            FileType::Image
        } else if ct.starts_with("video/") {
            FileType::Video
        } else if ct.starts_with("audio/") {
            FileType::Audio
        } else if ct.starts_with("text/")
            || matches!(
                ct.as_str(),
                "application/pdf" | "application/json" | "application/msword"
            )
            || ct.starts_with("application/vnd.openxmlformats-officedocument")
            || ct.starts_with("application/vnd.ms-")
        {
            FileType::Document
        } else if matches!(
            ct.as_str(),
            "application/zip"
                | "application/gzip"
                | "application/x-tar"
                | "application/x-7z-compressed"
                | "application/x-rar-compressed"
                | "application/vnd.rar"
        ) {
            FileType::Archive
        } else {
            FileType::Other
        }
    }

    /// String representation (matches the serialized form).
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Image => "IMAGE",
            FileType::Video => "VIDEO",
            FileType::Audio => "AUDIO",
            FileType::Document => "DOCUMENT",
            FileType::Archive => "ARCHIVE",
            FileType::Other => "OTHER",
        }
    }
}

/// The six directory policy flags.
///
/// Absence of a database record implies all flags true: the model is
/// opt-in to restriction, not opt-in to access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryPermissions {
    /// Allow uploading files into this directory.
    pub allow_uploads: bool,
    /// Allow deleting this directory itself.
    pub allow_delete: bool,
    /// Allow creating subdirectories.
    pub allow_create_sub_dirs: bool,
    /// Allow moving this directory itself.
    pub allow_move: bool,
    /// Allow deleting direct file children.
    pub allow_delete_files: bool,
    /// Allow moving direct file children.
    pub allow_move_files: bool,
}

impl Default for DirectoryPermissions {
    fn default() -> Self {
        Self {
            allow_uploads: true,
            allow_delete: true,
            allow_create_sub_dirs: true,
            allow_move: true,
            allow_delete_files: true,
            allow_move_files: true,
        }
    }
}

impl DirectoryPermissions {
    /// Fully permissive flags (the default for unrecorded directories).
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Fully restrictive flags.
    pub fn locked() -> Self {
        Self {
            allow_uploads: false,
            allow_delete: false,
            allow_create_sub_dirs: false,
            allow_move: false,
            allow_delete_files: false,
            allow_move_files: false,
        }
    }
}

/// A cross-reference from another subsystem into a file.
///
/// The mere existence of a usage record is sufficient grounds to block
/// unforced deletion of the referenced file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Unique record ID.
    pub id: i64,
    /// Logical path of the referenced file.
    pub file_path: String,
    /// Free-form usage tag, e.g. "template-background".
    pub usage_type: String,
    /// Identifier of the referencing entity.
    pub reference_id: String,
    /// Table/collection the referencing entity lives in.
    pub reference_table: String,
    /// When the reference was registered.
    pub created: DateTime<Utc>,
}

/// Unified view of a file, merged from backend state and database record.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    /// Logical path.
    pub path: String,
    /// Basename derived from the path.
    pub name: String,
    /// Path of the containing directory (empty for root-level files).
    pub directory_path: String,
    /// Size in bytes as reported by the backend.
    pub size: u64,
    /// MIME content type.
    pub content_type: String,
    /// Backend-dependent content hash, when available.
    pub content_hash: Option<String>,
    /// Access URL.
    pub url: String,
    /// Category derived from the content type.
    pub file_type: FileType,
    /// Whether the path falls under the public prefix.
    pub is_public: bool,
    /// Explicit protection override; a protected file cannot be deleted
    /// even with force.
    pub is_protected: bool,
    /// Whether at least one usage record exists for this path.
    pub is_in_use: bool,
    /// Usage records, ordered by creation time.
    pub usages: Vec<UsageRecord>,
    /// Whether the file was observed in the physical backend at query
    /// time (false for orphaned database records).
    pub is_from_backend: bool,
    /// Creation timestamp, when the backend reports one.
    pub created: Option<DateTime<Utc>>,
    /// Last modification timestamp, when the backend reports one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Unified view of a directory.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryInfo {
    /// Logical path.
    pub path: String,
    /// Basename derived from the path.
    pub name: String,
    /// Policy flags (fully permissive when no record exists).
    pub permissions: DirectoryPermissions,
    /// Explicit protection override.
    pub is_protected: bool,
    /// Whether protection cascades to newly created children.
    pub protect_children: bool,
    /// Number of descendant files.
    pub file_count: u64,
    /// Number of immediate subdirectories.
    pub folder_count: u64,
    /// Total size of descendant files in bytes.
    pub total_size: u64,
    /// Whether the directory was observed in the physical backend at
    /// query time.
    pub is_from_backend: bool,
    /// Earliest observed timestamp among descendants, when available.
    pub created: Option<DateTime<Utc>>,
    /// Latest observed timestamp among descendants, when available.
    pub last_modified: Option<DateTime<Utc>>,
}

/// A file or a directory.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageItem {
    File(FileInfo),
    Directory(DirectoryInfo),
}

impl StorageItem {
    /// Logical path of the item.
    pub fn path(&self) -> &str {
        match self {
            StorageItem::File(f) => &f.path,
            StorageItem::Directory(d) => &d.path,
        }
    }

    /// Basename of the item.
    pub fn name(&self) -> &str {
        match self {
            StorageItem::File(f) => &f.name,
            StorageItem::Directory(d) => &d.name,
        }
    }

    /// Whether the item carries the protection override.
    pub fn is_protected(&self) -> bool {
        match self {
            StorageItem::File(f) => f.is_protected,
            StorageItem::Directory(d) => d.is_protected,
        }
    }

    /// The file view, if this is a file.
    pub fn as_file(&self) -> Option<&FileInfo> {
        match self {
            StorageItem::File(f) => Some(f),
            StorageItem::Directory(_) => None,
        }
    }

    /// The directory view, if this is a directory.
    pub fn as_directory(&self) -> Option<&DirectoryInfo> {
        match self {
            StorageItem::Directory(d) => Some(d),
            StorageItem::File(_) => None,
        }
    }
}

/// Sort key for file listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Name,
    Size,
    Modified,
    Type,
}

/// Sort direction for file listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Options for [`crate::service::StorageService::list_files`].
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Maximum number of files to return.
    pub limit: usize,
    /// Number of files to skip.
    pub offset: usize,
    /// Case-insensitive substring filter on file names. A search term
    /// widens the listing to the whole subtree.
    pub search_term: Option<String>,
    /// Restrict results to one file category.
    pub file_type: Option<FileType>,
    /// Sort key.
    pub sort_by: SortBy,
    /// Sort direction.
    pub sort_direction: SortDirection,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
            search_term: None,
            file_type: None,
            sort_by: SortBy::default(),
            sort_direction: SortDirection::default(),
        }
    }
}

impl ListOptions {
    /// Create options with the default page size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the page offset.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the search term.
    pub fn with_search_term(mut self, term: impl Into<String>) -> Self {
        self.search_term = Some(term.into());
        self
    }

    /// Restrict to one file category.
    pub fn with_file_type(mut self, file_type: FileType) -> Self {
        self.file_type = Some(file_type);
        self
    }

    /// Set the sort key and direction.
    pub fn with_sort(mut self, sort_by: SortBy, direction: SortDirection) -> Self {
        self.sort_by = sort_by;
        self.sort_direction = direction;
        self
    }
}

/// Result of a file listing: one page of files plus the immediate
/// subdirectories of the listed path.
#[derive(Debug, Clone, Serialize)]
pub struct FileListing {
    /// Files on the requested page, after filtering and sorting.
    pub files: Vec<FileInfo>,
    /// Immediate subdirectories of the listed path.
    pub directories: Vec<DirectoryInfo>,
    /// Total number of matching files before pagination.
    pub total_files: usize,
}

/// Aggregated statistics for a storage subtree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    /// Number of files in the subtree.
    pub file_count: u64,
    /// Number of directories in the subtree.
    pub folder_count: u64,
    /// Total size of all files in bytes.
    pub total_size: u64,
    /// File counts broken down by category.
    pub files_by_type: BTreeMap<FileType, u64>,
}

/// Structured outcome of a single-item mutation.
///
/// Business failures (permission, protection, usage, conflict) are
/// reported here rather than as errors, so callers always receive an
/// explainable result.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult<T> {
    /// Whether the operation took effect.
    pub success: bool,
    /// Human-readable outcome message.
    pub message: String,
    /// The resulting item, on success.
    pub data: Option<T>,
}

impl<T> OperationResult<T> {
    /// A successful outcome.
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// A failed outcome.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// A per-item failure inside a bulk operation.
#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    /// The source path that failed.
    pub path: String,
    /// Human-readable failure reason.
    pub message: String,
}

/// Aggregate result of a bulk move/copy/delete.
///
/// `success` is true only when zero items failed; partial success is
/// representable and distinct from total failure.
#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    /// Whether every item succeeded.
    pub success: bool,
    /// Number of items that succeeded.
    pub success_count: usize,
    /// Number of items that failed.
    pub failure_count: usize,
    /// Per-item failures, in input order.
    pub failures: Vec<BulkFailure>,
    /// Freshly recomputed views of the successful items.
    pub successful_items: Vec<StorageItem>,
}

impl BulkResult {
    /// Build the aggregate from per-item outcomes.
    pub fn from_outcomes(failures: Vec<BulkFailure>, successful_items: Vec<StorageItem>) -> Self {
        Self {
            success: failures.is_empty(),
            success_count: successful_items.len(),
            failure_count: failures.len(),
            failures,
            successful_items,
        }
    }
}

/// Build the name/directory/visibility fields shared by file views.
pub(crate) fn file_identity(logical_path: &str) -> (String, String, bool) {
    (
        path::file_name(logical_path).to_string(),
        path::parent_path(logical_path).to_string(),
        path::is_public(logical_path),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_from_content_type() {
        assert_eq!(FileType::from_content_type("image/png"), FileType::Image);
        assert_eq!(FileType::from_content_type("video/mp4"), FileType::Video);
        assert_eq!(FileType::from_content_type("audio/mpeg"), FileType::Audio);
        assert_eq!(
            FileType::from_content_type("application/pdf"),
            FileType::Document
        );
        assert_eq!(
            FileType::from_content_type("text/plain; charset=utf-8"),
            FileType::Document
        );
        assert_eq!(
            FileType::from_content_type("application/zip"),
            FileType::Archive
        );
        assert_eq!(
            FileType::from_content_type("application/octet-stream"),
            FileType::Other
        );
    }

    #[test]
    fn test_permissions_default_is_permissive() {
        let perms = DirectoryPermissions::default();
        assert!(perms.allow_uploads);
        assert!(perms.allow_delete);
        assert!(perms.allow_create_sub_dirs);
        assert!(perms.allow_move);
        assert!(perms.allow_delete_files);
        assert!(perms.allow_move_files);
    }

    #[test]
    fn test_permissions_locked() {
        let perms = DirectoryPermissions::locked();
        assert!(!perms.allow_uploads);
        assert!(!perms.allow_move_files);
    }

    #[test]
    fn test_list_options_builder() {
        let options = ListOptions::new()
            .with_limit(10)
            .with_offset(20)
            .with_search_term("logo")
            .with_file_type(FileType::Image)
            .with_sort(SortBy::Size, SortDirection::Descending);

        assert_eq!(options.limit, 10);
        assert_eq!(options.offset, 20);
        assert_eq!(options.search_term.as_deref(), Some("logo"));
        assert_eq!(options.file_type, Some(FileType::Image));
        assert_eq!(options.sort_by, SortBy::Size);
        assert_eq!(options.sort_direction, SortDirection::Descending);
    }

    #[test]
    fn test_bulk_result_aggregation() {
        let result = BulkResult::from_outcomes(
            vec![BulkFailure {
                path: "a.txt".to_string(),
                message: "source path not found".to_string(),
            }],
            vec![],
        );

        assert!(!result.success);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.success_count, 0);

        let result = BulkResult::from_outcomes(vec![], vec![]);
        assert!(result.success);
    }

    #[test]
    fn test_operation_result() {
        let ok: OperationResult<u32> = OperationResult::ok("done", 7);
        assert!(ok.success);
        assert_eq!(ok.data, Some(7));

        let failed: OperationResult<u32> = OperationResult::failed("denied");
        assert!(!failed.success);
        assert!(failed.data.is_none());
    }

    #[test]
    fn test_file_identity() {
        let (name, dir, public) = file_identity("public/img/a.png");
        assert_eq!(name, "a.png");
        assert_eq!(dir, "public/img");
        assert!(public);
    }

    #[test]
    fn test_bulk_result_serializes_for_transport() {
        let result = BulkResult::from_outcomes(
            vec![BulkFailure {
                path: "a.txt".to_string(),
                message: "source path not found".to_string(),
            }],
            vec![],
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["failure_count"], 1);
        assert_eq!(json["failures"][0]["path"], "a.txt");
    }

    #[test]
    fn test_file_type_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&FileType::Image).unwrap(),
            "\"IMAGE\""
        );
        let parsed: FileType = serde_json::from_str("\"ARCHIVE\"").unwrap();
        assert_eq!(parsed, FileType::Archive);
    }
}
