//! Storage service facade.
//!
//! The single entry point other subsystems call. Holds exactly one
//! configured backend adapter and one metadata repository handle, and
//! delegates to the validation, merge, and bulk-engine layers. Single-item
//! mutations return [`OperationResult`] so callers always receive an
//! explainable outcome; bulk operations return [`BulkResult`] with
//! per-item failures. Callers needing mid-batch cancellation can drive
//! [`BulkEngine`] directly with their own token.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{
    list_all, BackendObject, BlobBackend, BucketBackend, LocalBackend, SignedUpload, StoragePort,
};
use crate::bulk::{BulkEngine, CopyRequest, DeleteRequest, MoveRequest};
use crate::config::Config;
use crate::error::{DepotError, Result};
use crate::merge::{combine_directory_data, combine_file_data, DirectoryTally};
use crate::model::{
    BulkResult, DirectoryInfo, DirectoryPermissions, FileInfo, FileListing, FileType, ListOptions,
    OperationResult, SortBy, SortDirection, StorageItem, StorageStats,
};
use crate::path;
use crate::repository::{
    DirectoryRecordUpdate, FileRecordUpdate, FileUsage, MetadataRepository, NewDirectoryRecord,
    NewFileRecord,
};
use crate::upload;

/// Request to rename a file in place.
#[derive(Debug, Clone)]
pub struct RenameFileRequest {
    /// Current logical path.
    pub current_path: String,
    /// New basename (not a path).
    pub new_name: String,
}

/// Request to create a folder.
#[derive(Debug, Clone, Default)]
pub struct CreateFolderRequest {
    /// Logical path of the new folder.
    pub path: String,
    /// Custom policy flags. Omitting them keeps the permissive default
    /// (and no database record).
    pub permissions: Option<DirectoryPermissions>,
    /// Protect the folder itself.
    pub protected: Option<bool>,
    /// Cascade protection to new children.
    pub protect_children: Option<bool>,
}

/// Request for a signed upload URL.
#[derive(Debug, Clone)]
pub struct SignedUploadRequest {
    /// Logical destination path.
    pub path: String,
    /// Content type the client will send.
    pub content_type: String,
    /// Declared upload size in bytes.
    pub file_size: u64,
    /// Optional base64 MD5 the client will send.
    pub content_md5: Option<String>,
}

/// Request to replace a directory's policy flags.
#[derive(Debug, Clone)]
pub struct UpdatePermissionsRequest {
    /// Directory path.
    pub path: String,
    /// New policy flags.
    pub permissions: DirectoryPermissions,
}

/// Request to set or clear protection on an item.
#[derive(Debug, Clone)]
pub struct SetProtectionRequest {
    /// Item path (file or directory).
    pub path: String,
    /// New protection flag.
    pub is_protected: bool,
    /// For directories: cascade protection to new children.
    pub protect_children: Option<bool>,
}

/// Storage service facade over one backend and one repository.
pub struct StorageService {
    port: Arc<dyn StoragePort>,
    repo: Arc<dyn MetadataRepository>,
    max_upload_size: u64,
    signed_url_ttl_secs: u64,
}

impl StorageService {
    /// Create a service over an already-constructed adapter and
    /// repository.
    pub fn new(port: Arc<dyn StoragePort>, repo: Arc<dyn MetadataRepository>) -> Self {
        Self {
            port,
            repo,
            max_upload_size: upload::DEFAULT_MAX_UPLOAD_SIZE,
            signed_url_ttl_secs: 900,
        }
    }

    /// Construct the configured adapter and wrap it in a service.
    ///
    /// An invalid or missing backend selection is a fatal configuration
    /// error; nothing is served in that case.
    pub fn from_config(config: &Config, repo: Arc<dyn MetadataRepository>) -> Result<Self> {
        config.validate()?;

        let port: Arc<dyn StoragePort> = match config.storage.backend.as_str() {
            "local" => {
                let mut backend = LocalBackend::new(&config.storage.local.root)?;
                if let Some(public_url) = &config.storage.local.public_url {
                    backend = backend.with_public_url(public_url);
                }
                Arc::new(backend)
            }
            "bucket" => {
                let bucket = config.storage.bucket.clone().ok_or_else(|| {
                    DepotError::Config("backend 'bucket' selected but [storage.bucket] is missing".to_string())
                })?;
                Arc::new(BucketBackend::new(bucket)?)
            }
            "blob" => {
                let blob = config.storage.blob.clone().ok_or_else(|| {
                    DepotError::Config("backend 'blob' selected but [storage.blob] is missing".to_string())
                })?;
                Arc::new(BlobBackend::new(blob)?)
            }
            other => {
                return Err(DepotError::Config(format!(
                    "unknown storage backend '{other}' (expected local, bucket, or blob)"
                )))
            }
        };

        info!(backend = port.name(), "storage service configured");
        Ok(Self {
            port,
            repo,
            max_upload_size: config.limits.max_upload_size_mb * 1024 * 1024,
            signed_url_ttl_secs: config.limits.signed_url_ttl_secs,
        })
    }

    /// Override the upload size ceiling.
    pub fn with_max_upload_size(mut self, max_size: u64) -> Self {
        self.max_upload_size = max_size;
        self
    }

    /// The backend adapter in use.
    pub fn port(&self) -> &dyn StoragePort {
        self.port.as_ref()
    }

    /// The metadata repository in use.
    pub fn repository(&self) -> &dyn MetadataRepository {
        self.repo.as_ref()
    }

    fn engine(&self) -> BulkEngine<'_> {
        BulkEngine::new(self.port.as_ref(), self.repo.as_ref())
    }

    fn validate_listing_path(dir_path: &str) -> Result<()> {
        if dir_path.is_empty() {
            // Empty means root
            return Ok(());
        }
        path::validate_path(dir_path)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// List the immediate children of a directory: one page of files
    /// plus every immediate subdirectory with its aggregated counts.
    ///
    /// A search term widens the file listing to the whole subtree.
    pub async fn list_files(&self, dir_path: &str, options: &ListOptions) -> Result<FileListing> {
        Self::validate_listing_path(dir_path)?;

        let (walk, child_records) = tokio::join!(
            list_all(self.port.as_ref(), dir_path, false),
            self.repo.directories_by_parent_path(dir_path)
        );
        let walk = walk?;
        let child_records = child_records?;
        let level = LevelView::partition(dir_path, &walk.objects);

        // Candidate files for the page
        let mut candidates: Vec<&BackendObject> = if options.search_term.is_some() {
            walk.objects.iter().filter(|o| !o.is_marker()).collect()
        } else {
            level.files.clone()
        };
        if let Some(term) = &options.search_term {
            let term = term.to_lowercase();
            candidates.retain(|o| path::file_name(&o.path).to_lowercase().contains(&term));
        }
        if let Some(file_type) = options.file_type {
            candidates.retain(|o| FileType::from_content_type(&o.content_type) == file_type);
        }

        // One batched lookup per record kind for the whole candidate set
        let candidate_paths: Vec<String> = candidates.iter().map(|o| o.path.clone()).collect();
        let (file_records, usage_map) = tokio::join!(
            self.repo.files_by_paths(&candidate_paths),
            self.repo.usages_by_paths(&candidate_paths)
        );
        let (file_records, mut usage_map) = (file_records?, usage_map?);

        let mut files: Vec<FileInfo> = candidates
            .iter()
            .map(|&object| {
                combine_file_data(
                    &object.path,
                    Some(object),
                    file_records.get(&object.path),
                    usage_map.remove(&object.path).unwrap_or_default(),
                )
            })
            .collect();
        sort_files(&mut files, options.sort_by, options.sort_direction);

        let total_files = files.len();
        let files: Vec<FileInfo> = files
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .collect();

        let directories = level.merge_directories(child_records);

        Ok(FileListing {
            files,
            directories,
            total_files,
        })
    }

    /// Unified view of a single file.
    ///
    /// Present when the backend reports it or an orphaned database
    /// record still exists.
    pub async fn file_info(&self, file_path: &str) -> Result<FileInfo> {
        path::validate_path(file_path)?;

        let (object, record, usage) = tokio::join!(
            self.port.metadata(file_path),
            self.repo.file_by_path(file_path),
            self.repo.check_file_usage(file_path)
        );
        let (object, record, usage) = (object?, record?, usage?);

        if object.is_none() && record.is_none() {
            return Err(DepotError::NotFound(format!("file '{file_path}'")));
        }
        Ok(combine_file_data(
            file_path,
            object.as_ref(),
            record.as_ref(),
            usage.usages,
        ))
    }

    /// Unified view of a single directory with aggregated counts.
    pub async fn folder_info(&self, dir_path: &str) -> Result<DirectoryInfo> {
        path::validate_path(dir_path)?;

        let (walk, record, exists) = tokio::join!(
            list_all(self.port.as_ref(), dir_path, false),
            self.repo.directory_by_path(dir_path),
            self.port.exists(dir_path)
        );
        let (walk, record, exists) = (walk?, record?, exists?);

        let is_from_backend = exists || !walk.objects.is_empty();
        if !is_from_backend && record.is_none() {
            return Err(DepotError::NotFound(format!("folder '{dir_path}'")));
        }

        let tally = subtree_tally(dir_path, &walk.objects);
        Ok(combine_directory_data(
            dir_path,
            record.as_ref(),
            &tally,
            is_from_backend,
        ))
    }

    /// Search files by name. Delegates to [`Self::list_files`] with a
    /// search-term filter over the subtree of `folder` (root when
    /// absent).
    pub async fn search_files(
        &self,
        term: &str,
        file_type: Option<FileType>,
        folder: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<FileInfo>> {
        let mut options = ListOptions::new().with_search_term(term);
        if let Some(file_type) = file_type {
            options = options.with_file_type(file_type);
        }
        if let Some(limit) = limit {
            options = options.with_limit(limit);
        }
        let listing = self
            .list_files(folder.unwrap_or_default(), &options)
            .await?;
        Ok(listing.files)
    }

    /// Aggregated statistics for a subtree (the whole store when no
    /// path is given).
    pub async fn storage_stats(&self, dir_path: Option<&str>) -> Result<StorageStats> {
        let dir_path = dir_path.unwrap_or_default();
        Self::validate_listing_path(dir_path)?;

        let walk = list_all(self.port.as_ref(), dir_path, false).await?;

        let mut stats = StorageStats::default();
        let mut folders: HashSet<String> = HashSet::new();
        for object in &walk.objects {
            if object.is_marker() {
                folders.insert(object.path.trim_end_matches('/').to_string());
                continue;
            }
            stats.file_count += 1;
            stats.total_size += object.size;
            *stats
                .files_by_type
                .entry(FileType::from_content_type(&object.content_type))
                .or_insert(0) += 1;

            // Every ancestor between the file and the listed prefix is a
            // folder, marker blob or not
            let mut ancestor = path::parent_path(&object.path);
            while !ancestor.is_empty() && ancestor != dir_path {
                if !folders.insert(ancestor.to_string()) {
                    break;
                }
                ancestor = path::parent_path(ancestor);
            }
        }
        stats.folder_count = folders.len() as u64;
        Ok(stats)
    }

    /// Immediate subdirectories of a directory (the root when no path
    /// is given), for lazy tree expansion.
    pub async fn directory_children(&self, dir_path: Option<&str>) -> Result<Vec<DirectoryInfo>> {
        let dir_path = dir_path.unwrap_or_default();
        Self::validate_listing_path(dir_path)?;

        let (walk, child_records) = tokio::join!(
            list_all(self.port.as_ref(), dir_path, false),
            self.repo.directories_by_parent_path(dir_path)
        );
        let (walk, child_records) = (walk?, child_records?);

        let level = LevelView::partition(dir_path, &walk.objects);
        Ok(level.merge_directories(child_records))
    }

    /// Usage check for a file, without side effects.
    pub async fn file_usage(&self, file_path: &str) -> Result<FileUsage> {
        path::validate_path(file_path)?;
        self.repo.check_file_usage(file_path).await
    }

    // ------------------------------------------------------------------
    // Single-item mutations
    // ------------------------------------------------------------------

    /// Rename a file in place.
    pub async fn rename_file(&self, request: &RenameFileRequest) -> OperationResult<FileInfo> {
        match self.try_rename_file(request).await {
            Ok(result) => result,
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    async fn try_rename_file(
        &self,
        request: &RenameFileRequest,
    ) -> Result<OperationResult<FileInfo>> {
        path::validate_path(&request.current_path)?;
        path::validate_file_name(&request.new_name)?;

        let parent = path::parent_path(&request.current_path).to_string();
        let new_path = path::join(&parent, &request.new_name);
        if new_path == request.current_path {
            return Ok(OperationResult::failed(
                "the new name matches the current name",
            ));
        }

        if self.port.metadata(&request.current_path).await?.is_none() {
            return Ok(OperationResult::failed(format!(
                "file '{}' not found",
                request.current_path
            )));
        }
        let parent_record = self.repo.directory_by_path(&parent).await?;
        let permissions = parent_record
            .map(|r| r.permissions)
            .unwrap_or_default();
        if !permissions.allow_move_files {
            return Ok(OperationResult::failed(format!(
                "renaming files in '{parent}' is not allowed"
            )));
        }

        if let Err(e) = self
            .engine()
            .transfer_single_file(&request.current_path, &new_path)
            .await
        {
            return Ok(OperationResult::failed(e.to_string()));
        }

        if let Err(e) = self
            .repo
            .update_file(
                &request.current_path,
                &FileRecordUpdate::new().path(&new_path),
            )
            .await
        {
            warn!(
                source = %request.current_path,
                dest = %new_path,
                error = %e,
                "metadata path update failed after rename, reconciliation needed"
            );
        }

        let info = self.file_info(&new_path).await?;
        info!(from = %request.current_path, to = %new_path, "file renamed");
        Ok(OperationResult::ok("file renamed", info))
    }

    /// Delete a single file, honoring usage and protection rules.
    pub async fn delete_file(&self, file_path: &str) -> OperationResult<FileInfo> {
        if let Err(e) = path::validate_path(file_path) {
            return OperationResult::failed(DepotError::from(e).to_string());
        }
        match self.port.metadata(file_path).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return OperationResult::failed(format!("file '{file_path}' not found"));
            }
            Err(e) => return OperationResult::failed(e.to_string()),
        }

        let request = DeleteRequest {
            paths: vec![file_path.to_string()],
            force: false,
        };
        let result = match self
            .engine()
            .delete_items(&request, &CancellationToken::new())
            .await
        {
            Ok(result) => result,
            Err(e) => return OperationResult::failed(e.to_string()),
        };

        if result.success {
            let item = result
                .successful_items
                .into_iter()
                .next()
                .and_then(|item| match item {
                    StorageItem::File(info) => Some(info),
                    StorageItem::Directory(_) => None,
                });
            match item {
                Some(info) => OperationResult::ok("file deleted", info),
                None => OperationResult::failed(format!("'{file_path}' is not a file")),
            }
        } else {
            let message = result
                .failures
                .into_iter()
                .next()
                .map(|f| f.message)
                .unwrap_or_else(|| "delete failed".to_string());
            OperationResult::failed(message)
        }
    }

    /// Create a folder, optionally with custom permissions and
    /// protection. A database record is only written when the folder
    /// departs from the permissive defaults (or a parent cascades
    /// protection onto it).
    pub async fn create_folder(
        &self,
        request: &CreateFolderRequest,
    ) -> OperationResult<DirectoryInfo> {
        match self.try_create_folder(request).await {
            Ok(result) => result,
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    async fn try_create_folder(
        &self,
        request: &CreateFolderRequest,
    ) -> Result<OperationResult<DirectoryInfo>> {
        path::validate_path(&request.path)?;
        path::validate_file_name(path::file_name(&request.path))?;

        let parent = path::parent_path(&request.path).to_string();
        let (parent_record, existing, exists) = tokio::join!(
            self.repo.directory_by_path(&parent),
            self.repo.directory_by_path(&request.path),
            self.port.exists(&request.path)
        );
        let (parent_record, existing, exists) = (parent_record?, existing?, exists?);

        if exists || existing.is_some() {
            return Ok(OperationResult::failed(format!(
                "'{}' already exists",
                request.path
            )));
        }
        let parent_permissions = parent_record
            .as_ref()
            .map(|r| r.permissions)
            .unwrap_or_default();
        if !parent_permissions.allow_create_sub_dirs {
            return Ok(OperationResult::failed(format!(
                "creating folders in '{parent}' is not allowed"
            )));
        }

        self.port.create_marker(&request.path).await?;

        let inherits_protection = parent_record
            .map(|r| r.protect_children)
            .unwrap_or(false);
        let is_protected = request.protected.unwrap_or(inherits_protection);
        let needs_record = request.permissions.is_some()
            || is_protected
            || request.protect_children.unwrap_or(false);

        let record = if needs_record {
            let new_record = NewDirectoryRecord::new(&request.path)
                .with_permissions(request.permissions.unwrap_or_default())
                .protected(is_protected)
                .protect_children(request.protect_children.unwrap_or(false));
            match self.repo.create_directory(&new_record).await {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        path = %request.path,
                        error = %e,
                        "directory record creation failed after marker creation, reconciliation needed"
                    );
                    None
                }
            }
        } else {
            None
        };

        let info = combine_directory_data(
            &request.path,
            record.as_ref(),
            &DirectoryTally::default(),
            true,
        );
        info!(path = %request.path, "folder created");
        Ok(OperationResult::ok("folder created", info))
    }

    /// Issue a signed upload URL after validating the upload against
    /// the location policy and the destination directory's permissions.
    pub async fn generate_upload_signed_url(
        &self,
        request: &SignedUploadRequest,
    ) -> OperationResult<SignedUpload> {
        match self.try_generate_upload_signed_url(request).await {
            Ok(result) => result,
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    async fn try_generate_upload_signed_url(
        &self,
        request: &SignedUploadRequest,
    ) -> Result<OperationResult<SignedUpload>> {
        upload::validate_upload(
            &request.path,
            request.file_size,
            &request.content_type,
            self.max_upload_size,
        )?;

        let parent = path::parent_path(&request.path).to_string();
        let parent_record = self.repo.directory_by_path(&parent).await?;
        let inherits_protection = parent_record
            .as_ref()
            .map(|r| r.protect_children)
            .unwrap_or(false);
        let permissions = parent_record
            .map(|r| r.permissions)
            .unwrap_or_default();
        if !permissions.allow_uploads {
            return Ok(OperationResult::failed(format!(
                "uploads are not allowed in '{parent}'"
            )));
        }

        let signed = self
            .port
            .signed_upload_url(
                &request.path,
                &request.content_type,
                request.content_md5.as_deref(),
                self.signed_url_ttl_secs,
            )
            .await?;

        // The physical upload happens out-of-band, so the record (and
        // any inherited protection) is ensured at issuance time.
        if self.repo.file_by_path(&request.path).await?.is_none() {
            if let Err(e) = self
                .repo
                .create_file(&NewFileRecord::new(&request.path).protected(inherits_protection))
                .await
            {
                warn!(
                    path = %request.path,
                    error = %e,
                    "file record creation failed at signed-url issuance, reconciliation needed"
                );
            }
        }

        info!(path = %request.path, "signed upload URL issued");
        Ok(OperationResult::ok("signed upload URL issued", signed))
    }

    /// Replace a directory's policy flags, creating the record when the
    /// directory had none.
    pub async fn update_directory_permissions(
        &self,
        request: &UpdatePermissionsRequest,
    ) -> OperationResult<DirectoryInfo> {
        match self.try_update_directory_permissions(request).await {
            Ok(result) => result,
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    async fn try_update_directory_permissions(
        &self,
        request: &UpdatePermissionsRequest,
    ) -> Result<OperationResult<DirectoryInfo>> {
        path::validate_path(&request.path)?;

        if !self.port.exists(&request.path).await?
            && self.repo.directory_by_path(&request.path).await?.is_none()
        {
            return Ok(OperationResult::failed(format!(
                "folder '{}' not found",
                request.path
            )));
        }

        let updated = self
            .repo
            .update_directory(
                &request.path,
                &DirectoryRecordUpdate::new().permissions(request.permissions),
            )
            .await?;
        if updated.is_none() {
            self.repo
                .create_directory(
                    &NewDirectoryRecord::new(&request.path)
                        .with_permissions(request.permissions),
                )
                .await?;
        }

        let info = self.folder_info(&request.path).await?;
        info!(path = %request.path, "directory permissions updated");
        Ok(OperationResult::ok("permissions updated", info))
    }

    /// Set or clear the protection override on a file or directory.
    pub async fn set_storage_item_protection(
        &self,
        request: &SetProtectionRequest,
    ) -> OperationResult<StorageItem> {
        match self.try_set_protection(request).await {
            Ok(result) => result,
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    async fn try_set_protection(
        &self,
        request: &SetProtectionRequest,
    ) -> Result<OperationResult<StorageItem>> {
        path::validate_path(&request.path)?;

        let (object, file_record) = tokio::join!(
            self.port.metadata(&request.path),
            self.repo.file_by_path(&request.path)
        );
        let (object, file_record) = (object?, file_record?);

        if object.is_some() || file_record.is_some() {
            if file_record.is_some() {
                self.repo
                    .update_file(
                        &request.path,
                        &FileRecordUpdate::new().protected(request.is_protected),
                    )
                    .await?;
            } else {
                self.repo
                    .create_file(&NewFileRecord::new(&request.path).protected(request.is_protected))
                    .await?;
            }
            let info = self.file_info(&request.path).await?;
            info!(path = %request.path, protected = request.is_protected, "file protection updated");
            return Ok(OperationResult::ok(
                "protection updated",
                StorageItem::File(info),
            ));
        }

        let (exists, dir_record) = tokio::join!(
            self.port.exists(&request.path),
            self.repo.directory_by_path(&request.path)
        );
        let (exists, dir_record) = (exists?, dir_record?);
        if !exists && dir_record.is_none() {
            return Ok(OperationResult::failed(format!(
                "'{}' not found",
                request.path
            )));
        }

        let mut update = DirectoryRecordUpdate::new().protected(request.is_protected);
        if let Some(protect_children) = request.protect_children {
            update = update.protect_children(protect_children);
        }
        let updated = self.repo.update_directory(&request.path, &update).await?;
        if updated.is_none() {
            self.repo
                .create_directory(
                    &NewDirectoryRecord::new(&request.path)
                        .protected(request.is_protected)
                        .protect_children(request.protect_children.unwrap_or(false)),
                )
                .await?;
        }

        let info = self.folder_info(&request.path).await?;
        info!(path = %request.path, protected = request.is_protected, "folder protection updated");
        Ok(OperationResult::ok(
            "protection updated",
            StorageItem::Directory(info),
        ))
    }

    // ------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------

    /// Move many items under a destination directory.
    pub async fn move_storage_items(&self, request: &MoveRequest) -> Result<BulkResult> {
        self.engine()
            .move_items(request, &CancellationToken::new())
            .await
    }

    /// Copy many items under a destination directory.
    pub async fn copy_storage_items(&self, request: &CopyRequest) -> Result<BulkResult> {
        self.engine()
            .copy_items(request, &CancellationToken::new())
            .await
    }

    /// Delete many items, each honoring usage and protection rules.
    pub async fn delete_storage_items(&self, request: &DeleteRequest) -> Result<BulkResult> {
        self.engine()
            .delete_items(request, &CancellationToken::new())
            .await
    }
}

/// Files and subdirectory tallies at one directory level, derived from a
/// full subtree walk.
struct LevelView<'a> {
    prefix: String,
    files: Vec<&'a BackendObject>,
    subdirs: BTreeMap<String, DirectoryTally>,
    child_subdir_names: HashMap<String, HashSet<String>>,
}

impl<'a> LevelView<'a> {
    /// Split a subtree walk into level files and per-child aggregates.
    fn partition(dir_path: &str, objects: &'a [BackendObject]) -> Self {
        let mut view = LevelView {
            prefix: dir_path.to_string(),
            files: Vec::new(),
            subdirs: BTreeMap::new(),
            child_subdir_names: HashMap::new(),
        };

        for object in objects {
            let logical = object.path.trim_end_matches('/');
            if logical == dir_path {
                continue;
            }
            let Some(rel) = path::relative_to(logical, dir_path) else {
                continue;
            };

            match rel.split_once('/') {
                None => {
                    if object.is_marker() {
                        // Immediate empty subdirectory
                        let child = path::join(&view.prefix, rel);
                        let tally = view.subdirs.entry(child).or_default();
                        tally.observe_timestamps(object.created, object.last_modified);
                    } else {
                        view.files.push(object);
                    }
                }
                Some((child, rest)) => {
                    let child_path = path::join(&view.prefix, child);
                    let tally = view.subdirs.entry(child_path.clone()).or_default();
                    if object.is_marker() {
                        tally.observe_timestamps(object.created, object.last_modified);
                    } else {
                        tally.observe_file(object);
                    }
                    if let Some((grandchild, _)) = rest.split_once('/') {
                        view.child_subdir_names
                            .entry(child_path)
                            .or_default()
                            .insert(grandchild.to_string());
                    } else if object.is_marker() {
                        view.child_subdir_names
                            .entry(child_path)
                            .or_default()
                            .insert(rest.to_string());
                    }
                }
            }
        }

        for (child, names) in &view.child_subdir_names {
            if let Some(tally) = view.subdirs.get_mut(child) {
                tally.folder_count = names.len() as u64;
            }
        }
        view
    }

    /// Merge observed subdirectories with the database records of the
    /// level's children (including orphaned records the backend no
    /// longer reports).
    fn merge_directories(
        &self,
        child_records: Vec<crate::repository::DirectoryRecord>,
    ) -> Vec<DirectoryInfo> {
        let records: HashMap<&str, &crate::repository::DirectoryRecord> = child_records
            .iter()
            .map(|r| (r.path.as_str(), r))
            .collect();

        let mut directories: Vec<DirectoryInfo> = self
            .subdirs
            .iter()
            .map(|(child, tally)| {
                combine_directory_data(child, records.get(child.as_str()).copied(), tally, true)
            })
            .collect();

        for record in &child_records {
            if !self.subdirs.contains_key(&record.path) {
                directories.push(combine_directory_data(
                    &record.path,
                    Some(record),
                    &DirectoryTally::default(),
                    false,
                ));
            }
        }

        directories.sort_by(|a, b| a.name.cmp(&b.name));
        directories
    }
}

/// Tally the whole subtree under a prefix.
fn subtree_tally(dir_path: &str, objects: &[BackendObject]) -> DirectoryTally {
    let mut tally = DirectoryTally::default();
    let mut immediate_children: HashSet<String> = HashSet::new();

    for object in objects {
        let logical = object.path.trim_end_matches('/');
        if logical == dir_path {
            tally.observe_timestamps(object.created, object.last_modified);
            continue;
        }
        let Some(rel) = path::relative_to(logical, dir_path) else {
            continue;
        };
        let first = rel.split('/').next().unwrap_or(rel);
        if rel.contains('/') || object.is_marker() {
            immediate_children.insert(first.to_string());
        }
        if !object.is_marker() {
            tally.observe_file(object);
        }
    }

    tally.folder_count = immediate_children.len() as u64;
    tally
}

fn sort_files(files: &mut [FileInfo], sort_by: SortBy, direction: SortDirection) {
    files.sort_by(|a, b| {
        let ordering = match sort_by {
            SortBy::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortBy::Size => a.size.cmp(&b.size),
            SortBy::Modified => a.last_modified.cmp(&b.last_modified),
            SortBy::Type => a.file_type.cmp(&b.file_type).then(a.name.cmp(&b.name)),
        };
        match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
}
