//! depot - unified storage service
//!
//! One facade over interchangeable physical backends (local filesystem,
//! S3-compatible buckets, shared-key blob services), overlaying the
//! database-backed permission, protection, and usage-tracking model.

pub mod backend;
pub mod bulk;
pub mod config;
pub mod error;
pub mod logging;
pub mod merge;
pub mod model;
pub mod path;
pub mod repository;
pub mod service;
pub mod upload;

pub use backend::{
    BackendObject, BlobBackend, BlobConfig, BucketBackend, BucketConfig, LocalBackend,
    ObjectListing, SignedUpload, StoragePort,
};
pub use bulk::{BulkEngine, CopyRequest, DeleteRequest, MoveRequest};
pub use config::Config;
pub use error::{DepotError, Result};
pub use model::{
    BulkFailure, BulkResult, DirectoryInfo, DirectoryPermissions, FileInfo, FileListing, FileType,
    ListOptions, OperationResult, SortBy, SortDirection, StorageItem, StorageStats, UsageRecord,
};
#[cfg(feature = "sqlite")]
pub use repository::SqliteMetadataRepository;
pub use repository::{
    DirectoryRecord, DirectoryRecordUpdate, FileRecord, FileRecordUpdate, FileUsage,
    MemoryMetadataRepository, MetadataRepository, NewDirectoryRecord, NewFileRecord,
    NewUsageRecord,
};
pub use service::{
    CreateFolderRequest, RenameFileRequest, SetProtectionRequest, SignedUploadRequest,
    StorageService, UpdatePermissionsRequest,
};
