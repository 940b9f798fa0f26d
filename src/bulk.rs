//! Bulk operation engine.
//!
//! Orchestrates move/copy/delete across many paths: existence pre-checks
//! and batched metadata loads run before any mutation, each surviving
//! item is processed independently, and failures never abort the batch.
//! Moves are copy-then-delete with rollback, so a partial failure never
//! leaves both copies committed.

use std::collections::HashMap;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{list_all, BackendObject, StoragePort};
use crate::error::{DepotError, Result};
use crate::merge::{combine_directory_data, combine_file_data, DirectoryTally};
use crate::model::{BulkFailure, BulkResult, StorageItem, UsageRecord};
use crate::path;
use crate::repository::{
    DirectoryRecord, DirectoryRecordUpdate, FileRecord, FileRecordUpdate, MetadataRepository,
};

/// How many items of one batch mutate concurrently.
const MAX_CONCURRENT_ITEMS: usize = 4;

/// Request to move items under a destination directory.
#[derive(Debug, Clone)]
pub struct MoveRequest {
    /// Source paths, files or directories.
    pub source_paths: Vec<String>,
    /// Destination directory path.
    pub destination_path: String,
}

/// Request to copy items under a destination directory.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    /// Source paths, files or directories.
    pub source_paths: Vec<String>,
    /// Destination directory path.
    pub destination_path: String,
}

/// Request to delete items.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    /// Paths to delete, files or directories.
    pub paths: Vec<String>,
    /// Delete in-use files anyway. Protected items stay undeletable.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Move,
    Copy,
    Delete,
}

impl Op {
    fn verb(&self) -> &'static str {
        match self {
            Op::Move => "move",
            Op::Copy => "copy",
            Op::Delete => "delete",
        }
    }
}

/// Classification of one source path before processing.
enum Check {
    File(BackendObject),
    Directory,
    Missing,
    Invalid(String),
    Error(String),
}

/// Batched repository state loaded before any mutation.
struct BatchContext {
    files: HashMap<String, FileRecord>,
    directories: HashMap<String, DirectoryRecord>,
    usages: HashMap<String, Vec<UsageRecord>>,
    force: bool,
}

impl BatchContext {
    fn permissions_of(&self, dir_path: &str) -> crate::model::DirectoryPermissions {
        self.directories
            .get(dir_path)
            .map(|r| r.permissions)
            .unwrap_or_default()
    }

    fn usages_of(&self, file_path: &str) -> Vec<UsageRecord> {
        self.usages.get(file_path).cloned().unwrap_or_default()
    }
}

enum ItemOutcome {
    Success(Box<StorageItem>),
    Failure(String),
}

/// Engine executing one bulk request against a port and a repository.
pub struct BulkEngine<'a> {
    port: &'a dyn StoragePort,
    repo: &'a dyn MetadataRepository,
}

impl<'a> BulkEngine<'a> {
    /// Create an engine over a backend and a repository.
    pub fn new(port: &'a dyn StoragePort, repo: &'a dyn MetadataRepository) -> Self {
        Self { port, repo }
    }

    /// Move many items under a destination directory.
    pub async fn move_items(
        &self,
        request: &MoveRequest,
        cancel: &CancellationToken,
    ) -> Result<BulkResult> {
        self.execute(
            &request.source_paths,
            Some(&request.destination_path),
            Op::Move,
            false,
            cancel,
        )
        .await
    }

    /// Copy many items under a destination directory.
    pub async fn copy_items(
        &self,
        request: &CopyRequest,
        cancel: &CancellationToken,
    ) -> Result<BulkResult> {
        self.execute(
            &request.source_paths,
            Some(&request.destination_path),
            Op::Copy,
            false,
            cancel,
        )
        .await
    }

    /// Delete many items.
    pub async fn delete_items(
        &self,
        request: &DeleteRequest,
        cancel: &CancellationToken,
    ) -> Result<BulkResult> {
        self.execute(&request.paths, None, Op::Delete, request.force, cancel)
            .await
    }

    async fn execute(
        &self,
        paths: &[String],
        destination: Option<&str>,
        op: Op,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<BulkResult> {
        if let Some(dest) = destination {
            path::validate_path(dest)?;
        }

        // Existence pre-check and classification, one concurrent probe
        // per source. Validation failures never reach the backend.
        let checks_fut = join_all(paths.iter().map(|p| self.classify(p)));

        // Batched metadata load: exact paths, their parents, and the
        // destination, each in a single repository round trip.
        let mut dir_lookup: Vec<String> = paths.to_vec();
        for p in paths {
            let parent = path::parent_path(p).to_string();
            if !dir_lookup.contains(&parent) {
                dir_lookup.push(parent);
            }
        }
        if let Some(dest) = destination {
            if !dir_lookup.contains(&dest.to_string()) {
                dir_lookup.push(dest.to_string());
            }
        }

        let need_usages = matches!(op, Op::Move) || (matches!(op, Op::Delete) && !force);
        let (checks, files, directories, usages) = tokio::join!(
            checks_fut,
            self.repo.files_by_paths(paths),
            self.repo.directories_by_paths(&dir_lookup),
            async {
                if need_usages {
                    self.repo.usages_by_paths(paths).await
                } else {
                    Ok(HashMap::new())
                }
            }
        );

        let context = BatchContext {
            files: files?,
            directories: directories?,
            usages: usages?,
            force,
        };

        // Destination-level gate: a destination that forbids uploads
        // fails the whole batch with zero successes.
        if let Some(dest) = destination {
            if let Some(record) = context.directories.get(dest) {
                if !record.permissions.allow_uploads {
                    let failures = paths
                        .iter()
                        .map(|p| BulkFailure {
                            path: p.clone(),
                            message: format!("uploads are not allowed in '{dest}'"),
                        })
                        .collect();
                    return Ok(BulkResult::from_outcomes(failures, Vec::new()));
                }
            }
        }

        // Per-item processing. Items already running finish their own
        // commit/rollback; cancellation only stops new items.
        let outcomes: Vec<(usize, String, ItemOutcome)> =
            stream::iter(checks.into_iter().enumerate().zip(paths.iter()))
                .map(|((index, check), source)| {
                    let context = &context;
                    async move {
                        if cancel.is_cancelled() {
                            return (
                                index,
                                source.clone(),
                                ItemOutcome::Failure("operation cancelled".to_string()),
                            );
                        }
                        let outcome = match check {
                            Check::Invalid(message) | Check::Error(message) => {
                                ItemOutcome::Failure(message)
                            }
                            Check::Missing => {
                                ItemOutcome::Failure("source path not found".to_string())
                            }
                            Check::File(object) => {
                                self.process_file(source, object, destination, op, context)
                                    .await
                            }
                            Check::Directory => {
                                self.process_directory(source, destination, op, context)
                                    .await
                            }
                        };
                        (index, source.clone(), outcome)
                    }
                })
                .buffer_unordered(MAX_CONCURRENT_ITEMS)
                .collect()
                .await;

        let mut ordered = outcomes;
        ordered.sort_by_key(|(index, _, _)| *index);

        let mut failures = Vec::new();
        let mut successful_items = Vec::new();
        for (_, source, outcome) in ordered {
            match outcome {
                ItemOutcome::Success(item) => successful_items.push(*item),
                ItemOutcome::Failure(message) => failures.push(BulkFailure {
                    path: source,
                    message,
                }),
            }
        }

        Ok(BulkResult::from_outcomes(failures, successful_items))
    }

    async fn classify(&self, source: &str) -> Check {
        if let Err(e) = path::validate_path(source) {
            return Check::Invalid(e.to_string());
        }
        match self.port.metadata(source).await {
            Ok(Some(object)) => Check::File(object),
            Ok(None) => match self.port.exists(source).await {
                Ok(true) => Check::Directory,
                Ok(false) => Check::Missing,
                Err(e) => Check::Error(e.to_string()),
            },
            Err(e) => Check::Error(e.to_string()),
        }
    }

    async fn process_file(
        &self,
        source: &str,
        object: BackendObject,
        destination: Option<&str>,
        op: Op,
        context: &BatchContext,
    ) -> ItemOutcome {
        match op {
            Op::Delete => self.delete_file_item(source, object, context).await,
            Op::Move | Op::Copy => {
                let dest_dir = destination.unwrap_or_default();
                let dest_path = path::join(dest_dir, path::file_name(source));
                if dest_path == source {
                    return ItemOutcome::Failure(
                        "source and destination are the same".to_string(),
                    );
                }

                if op == Op::Move {
                    let parent = path::parent_path(source);
                    if !context.permissions_of(parent).allow_move_files {
                        return ItemOutcome::Failure(format!(
                            "moving files out of '{parent}' is not allowed"
                        ));
                    }
                }

                match self.transfer_file(source, &dest_path, op).await {
                    Ok(()) => {}
                    Err(e) => return ItemOutcome::Failure(e.to_string()),
                }

                let (record, usages) = if op == Op::Move {
                    // Physical change is authoritative; a repository
                    // failure here is a reconciliation event, not an
                    // item failure.
                    let record = self
                        .repo
                        .update_file(source, &FileRecordUpdate::new().path(&dest_path))
                        .await
                        .unwrap_or_else(|e| {
                            warn!(
                                source,
                                dest = %dest_path,
                                error = %e,
                                "metadata path update failed after move, reconciliation needed"
                            );
                            None
                        });
                    (record, context.usages_of(source))
                } else {
                    // Copies are not database-tracked
                    (None, Vec::new())
                };

                let final_object = match self.port.metadata(&dest_path).await {
                    Ok(Some(obj)) => obj,
                    _ => BackendObject {
                        path: dest_path.clone(),
                        ..object
                    },
                };
                let mut usages = usages;
                for usage in &mut usages {
                    usage.file_path = dest_path.clone();
                }
                let info = combine_file_data(
                    &dest_path,
                    Some(&final_object),
                    record.as_ref(),
                    usages,
                );
                ItemOutcome::Success(Box::new(StorageItem::File(info)))
            }
        }
    }

    async fn delete_file_item(
        &self,
        source: &str,
        object: BackendObject,
        context: &BatchContext,
    ) -> ItemOutcome {
        let record = context.files.get(source);
        if record.map(|r| r.is_protected).unwrap_or(false) {
            return ItemOutcome::Failure(format!("'{source}' is protected"));
        }
        if !context.force {
            let usages = context.usages_of(source);
            if !usages.is_empty() {
                let reason = crate::repository::FileUsage::from_usages(usages)
                    .delete_block_reason
                    .unwrap_or_else(|| "file is in use".to_string());
                return ItemOutcome::Failure(reason);
            }
        }
        let parent = path::parent_path(source);
        if !context.permissions_of(parent).allow_delete_files {
            return ItemOutcome::Failure(format!(
                "deleting files in '{parent}' is not allowed"
            ));
        }

        // Snapshot the view before the item disappears
        let info = combine_file_data(source, Some(&object), record, context.usages_of(source));

        if let Err(e) = self.port.delete(source).await {
            return ItemOutcome::Failure(e.to_string());
        }
        if record.is_some() {
            if let Err(e) = self.repo.delete_file(source).await {
                warn!(
                    source,
                    error = %e,
                    "metadata delete failed after file removal, reconciliation needed"
                );
            }
        }

        ItemOutcome::Success(Box::new(StorageItem::File(info)))
    }

    /// Single-file move for the facade's rename path. Same
    /// copy-verify-delete-rollback sequence as bulk moves.
    pub(crate) async fn transfer_single_file(&self, source: &str, dest_path: &str) -> Result<()> {
        self.transfer_file(source, dest_path, Op::Move).await
    }

    /// Copy-then-delete for one file, with rollback on a failed source
    /// delete so both copies are never left committed.
    async fn transfer_file(&self, source: &str, dest_path: &str, op: Op) -> Result<()> {
        match self.port.exists(dest_path).await {
            Ok(false) => {}
            Ok(true) => {
                return Err(DepotError::Conflict(format!(
                    "destination '{dest_path}' already exists"
                )))
            }
            Err(e) => return Err(e),
        }

        self.port.copy(source, dest_path).await?;

        // Verify the copy landed before touching the source
        match self.port.metadata(dest_path).await? {
            Some(_) => {}
            None => {
                return Err(DepotError::Backend(format!(
                    "copy of '{source}' to '{dest_path}' did not materialize"
                )))
            }
        }

        if op == Op::Move {
            if let Err(delete_err) = self.port.delete(source).await {
                // Roll the copy back; the source stays authoritative
                if let Err(rollback_err) = self.port.delete(dest_path).await {
                    warn!(
                        source,
                        dest = %dest_path,
                        error = %rollback_err,
                        "rollback of copied file failed after source delete error"
                    );
                }
                return Err(DepotError::Backend(format!(
                    "failed to delete source '{source}' after copy: {delete_err}"
                )));
            }
        }

        Ok(())
    }

    async fn process_directory(
        &self,
        source: &str,
        destination: Option<&str>,
        op: Op,
        context: &BatchContext,
    ) -> ItemOutcome {
        match op {
            Op::Delete => self.delete_directory_item(source, context).await,
            Op::Move | Op::Copy => {
                let dest_dir = destination.unwrap_or_default();
                let dest_path = path::join(dest_dir, path::file_name(source));
                if dest_path == source {
                    return ItemOutcome::Failure(
                        "source and destination are the same".to_string(),
                    );
                }
                if dest_dir == source || dest_dir.starts_with(&format!("{source}/")) {
                    return ItemOutcome::Failure(format!(
                        "cannot {} a directory into itself",
                        op.verb()
                    ));
                }

                if op == Op::Move {
                    let parent = path::parent_path(source);
                    if !context.permissions_of(parent).allow_move {
                        return ItemOutcome::Failure(format!(
                            "moving folders out of '{parent}' is not allowed"
                        ));
                    }
                }

                match self.port.exists(&dest_path).await {
                    Ok(false) => {}
                    Ok(true) => {
                        return ItemOutcome::Failure(format!(
                            "destination '{dest_path}' already exists"
                        ))
                    }
                    Err(e) => return ItemOutcome::Failure(e.to_string()),
                }

                self.transfer_directory(source, &dest_path, op, context)
                    .await
            }
        }
    }

    /// Move or copy a directory as a unit: every descendant file is
    /// processed with its relative sub-path preserved. Descendant moves
    /// complete (or fail individually) before the directory's own
    /// record is updated.
    async fn transfer_directory(
        &self,
        source: &str,
        dest_path: &str,
        op: Op,
        _context: &BatchContext,
    ) -> ItemOutcome {
        let walk = match list_all(self.port, source, false).await {
            Ok(walk) => walk,
            Err(e) => return ItemOutcome::Failure(e.to_string()),
        };

        let mut tally = DirectoryTally::default();
        let mut descendant_errors: Vec<String> = Vec::new();
        let mut moved_files: Vec<(String, String)> = Vec::new();
        let mut marker_dirs: Vec<String> = Vec::new();

        for object in &walk.objects {
            if object.is_marker() {
                let logical = object.path.trim_end_matches('/');
                if let Some(rel) = path::relative_to(logical, source) {
                    marker_dirs.push(rel.to_string());
                    if path::parent_path(logical) == source {
                        tally.folder_count += 1;
                    }
                }
                continue;
            }
            let Some(rel) = path::relative_to(&object.path, source) else {
                continue;
            };
            let target = format!("{dest_path}/{rel}");
            match self.transfer_file(&object.path, &target, op).await {
                Ok(()) => {
                    tally.observe_file(object);
                    moved_files.push((object.path.clone(), target));
                }
                Err(e) => descendant_errors.push(format!("{}: {e}", object.path)),
            }
        }

        // Recreate empty-directory markers at the destination
        for rel in &marker_dirs {
            if let Err(e) = self.port.create_marker(&format!("{dest_path}/{rel}")).await {
                debug!(dir = %rel, error = %e, "marker creation at destination failed");
            }
        }

        if op == Op::Move {
            // Clean up now-empty source markers, deepest first
            let mut markers = marker_dirs.clone();
            markers.sort_by_key(|m| std::cmp::Reverse(m.matches('/').count()));
            for rel in markers {
                let marker = format!("{source}/{rel}/");
                if let Err(e) = self.port.delete(&marker).await {
                    debug!(marker = %marker, error = %e, "source marker cleanup failed");
                }
            }

            // Database paths follow the physical moves, best effort
            for (old_path, new_path) in &moved_files {
                if let Err(e) = self
                    .repo
                    .update_file(old_path, &FileRecordUpdate::new().path(new_path))
                    .await
                {
                    warn!(
                        source = %old_path,
                        dest = %new_path,
                        error = %e,
                        "metadata path update failed after move, reconciliation needed"
                    );
                }
            }
            for rel in &marker_dirs {
                let old_dir = format!("{source}/{rel}");
                let new_dir = format!("{dest_path}/{rel}");
                if let Err(e) = self
                    .repo
                    .update_directory(&old_dir, &DirectoryRecordUpdate::new().path(&new_dir))
                    .await
                {
                    warn!(
                        source = %old_dir,
                        dest = %new_dir,
                        error = %e,
                        "directory record update failed after move, reconciliation needed"
                    );
                }
            }
        }

        if !descendant_errors.is_empty() {
            return ItemOutcome::Failure(format!(
                "{} of {} files failed to {}: {}",
                descendant_errors.len(),
                descendant_errors.len() + moved_files.len(),
                op.verb(),
                descendant_errors[0]
            ));
        }

        let record = if op == Op::Move {
            // All descendants are in place; the source directory itself
            // can go, then its record follows.
            if let Err(e) = self.port.delete(&format!("{source}/")).await {
                debug!(source, error = %e, "source directory cleanup failed");
            }
            self.repo
                .update_directory(source, &DirectoryRecordUpdate::new().path(dest_path))
                .await
                .unwrap_or_else(|e| {
                    warn!(
                        source,
                        dest = %dest_path,
                        error = %e,
                        "directory record update failed after move, reconciliation needed"
                    );
                    None
                })
        } else {
            None
        };

        let info = combine_directory_data(dest_path, record.as_ref(), &tally, true);
        ItemOutcome::Success(Box::new(StorageItem::Directory(info)))
    }

    /// Delete a directory as a unit. All descendants are pre-checked
    /// before the first mutation, so a blocked descendant leaves the
    /// whole subtree untouched.
    async fn delete_directory_item(&self, source: &str, context: &BatchContext) -> ItemOutcome {
        let record = context.directories.get(source);
        if record.map(|r| r.is_protected).unwrap_or(false) {
            return ItemOutcome::Failure(format!("'{source}' is protected"));
        }
        let parent = path::parent_path(source);
        if !context.permissions_of(parent).allow_delete {
            return ItemOutcome::Failure(format!(
                "deleting folders in '{parent}' is not allowed"
            ));
        }

        let walk = match list_all(self.port, source, false).await {
            Ok(walk) => walk,
            Err(e) => return ItemOutcome::Failure(e.to_string()),
        };

        let mut files: Vec<&BackendObject> = Vec::new();
        let mut markers: Vec<String> = Vec::new();
        let mut tally = DirectoryTally::default();
        for object in &walk.objects {
            if object.is_marker() {
                markers.push(object.path.clone());
                if path::parent_path(object.path.trim_end_matches('/')) == source {
                    tally.folder_count += 1;
                }
            } else {
                files.push(object);
                tally.observe_file(object);
            }
        }

        // One batched lookup per input set over the discovered subtree
        let file_paths: Vec<String> = files.iter().map(|o| o.path.clone()).collect();
        let (records, usages) = tokio::join!(self.repo.files_by_paths(&file_paths), async {
            if context.force {
                Ok(HashMap::new())
            } else {
                self.repo.usages_by_paths(&file_paths).await
            }
        });
        let (records, usages) = match (records, usages) {
            (Ok(r), Ok(u)) => (r, u),
            (Err(e), _) | (_, Err(e)) => return ItemOutcome::Failure(e.to_string()),
        };

        for file_path in &file_paths {
            if records
                .get(file_path)
                .map(|r| r.is_protected)
                .unwrap_or(false)
            {
                return ItemOutcome::Failure(format!(
                    "'{file_path}' inside the folder is protected"
                ));
            }
            if !context.force {
                if let Some(file_usages) = usages.get(file_path) {
                    if !file_usages.is_empty() {
                        let reason =
                            crate::repository::FileUsage::from_usages(file_usages.clone())
                                .delete_block_reason
                                .unwrap_or_else(|| "file is in use".to_string());
                        return ItemOutcome::Failure(format!("{file_path}: {reason}"));
                    }
                }
            }
        }

        // Snapshot the view before deletion
        let info = combine_directory_data(source, record, &tally, true);

        for file_path in &file_paths {
            if let Err(e) = self.port.delete(file_path).await {
                return ItemOutcome::Failure(format!("failed to delete '{file_path}': {e}"));
            }
            if records.contains_key(file_path) {
                if let Err(e) = self.repo.delete_file(file_path).await {
                    warn!(
                        path = %file_path,
                        error = %e,
                        "metadata delete failed after file removal, reconciliation needed"
                    );
                }
            }
        }

        // Markers deepest first, then the directory itself
        markers.sort_by_key(|m| std::cmp::Reverse(m.matches('/').count()));
        for marker in markers {
            if let Err(e) = self.port.delete(&marker).await {
                debug!(marker = %marker, error = %e, "marker cleanup failed");
            }
            let logical = marker.trim_end_matches('/');
            match self.repo.delete_directory(logical).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        path = logical,
                        error = %e,
                        "directory record delete failed, reconciliation needed"
                    );
                }
            }
        }
        if let Err(e) = self.port.delete(&format!("{source}/")).await {
            debug!(source, error = %e, "directory cleanup failed");
        }
        if record.is_some() {
            if let Err(e) = self.repo.delete_directory(source).await {
                warn!(
                    source,
                    error = %e,
                    "directory record delete failed, reconciliation needed"
                );
            }
        }

        ItemOutcome::Success(Box::new(StorageItem::Directory(info)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalBackend, ObjectListing, SignedUpload};
    use crate::model::DirectoryPermissions;
    use crate::repository::{MemoryMetadataRepository, NewDirectoryRecord, NewFileRecord, NewUsageRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn seed(backend: &LocalBackend, paths: &[&str]) {
        for p in paths {
            backend.upload(p, b"payload", "text/plain").await.unwrap();
        }
    }

    fn setup() -> (TempDir, LocalBackend, MemoryMetadataRepository) {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();
        (temp, backend, MemoryMetadataRepository::new())
    }

    #[tokio::test]
    async fn test_move_batch_with_missing_source() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["in/a.txt", "in/c.txt"]).await;

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .move_items(
                &MoveRequest {
                    source_paths: vec![
                        "in/a.txt".to_string(),
                        "in/b.txt".to_string(),
                        "in/c.txt".to_string(),
                    ],
                    destination_path: "out".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.failures[0].path, "in/b.txt");
        assert_eq!(result.failures[0].message, "source path not found");

        assert!(backend.exists("out/a.txt").await.unwrap());
        assert!(backend.exists("out/c.txt").await.unwrap());
        assert!(!backend.exists("in/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_updates_file_record_path() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["in/a.txt"]).await;
        repo.create_file(&NewFileRecord::new("in/a.txt").protected(true))
            .await
            .unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .move_items(
                &MoveRequest {
                    source_paths: vec!["in/a.txt".to_string()],
                    destination_path: "out".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        let record = repo.file_by_path("out/a.txt").await.unwrap().unwrap();
        assert!(record.is_protected);
        let item = result.successful_items[0].as_file().unwrap();
        assert_eq!(item.path, "out/a.txt");
        assert!(item.is_protected);
    }

    #[tokio::test]
    async fn test_copy_leaves_source_and_database_untouched() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["in/a.txt"]).await;
        repo.create_file(&NewFileRecord::new("in/a.txt")).await.unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .copy_items(
                &CopyRequest {
                    source_paths: vec!["in/a.txt".to_string()],
                    destination_path: "out".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(backend.exists("in/a.txt").await.unwrap());
        assert!(backend.exists("out/a.txt").await.unwrap());
        // Copies are not database-tracked
        assert!(repo.file_by_path("out/a.txt").await.unwrap().is_none());
        assert!(repo.file_by_path("in/a.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_destination_gate_fails_whole_batch() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["in/a.txt", "in/b.txt"]).await;
        repo.create_directory(
            &NewDirectoryRecord::new("locked").with_permissions(DirectoryPermissions {
                allow_uploads: false,
                ..DirectoryPermissions::default()
            }),
        )
        .await
        .unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .move_items(
                &MoveRequest {
                    source_paths: vec!["in/a.txt".to_string(), "in/b.txt".to_string()],
                    destination_path: "locked".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.success_count, 0);
        assert_eq!(result.failure_count, 2);
        assert!(result.failures[0].message.contains("not allowed"));
        // Nothing moved
        assert!(backend.exists("in/a.txt").await.unwrap());
        assert!(backend.exists("in/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_denied_by_source_parent_permissions() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["pinned/a.txt"]).await;
        repo.create_directory(
            &NewDirectoryRecord::new("pinned").with_permissions(DirectoryPermissions {
                allow_move_files: false,
                ..DirectoryPermissions::default()
            }),
        )
        .await
        .unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .move_items(
                &MoveRequest {
                    source_paths: vec!["pinned/a.txt".to_string()],
                    destination_path: "out".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failure_count, 1);
        assert!(result.failures[0].message.contains("pinned"));
        assert!(backend.exists("pinned/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_ignores_move_permissions() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["pinned/a.txt"]).await;
        repo.create_directory(
            &NewDirectoryRecord::new("pinned").with_permissions(DirectoryPermissions {
                allow_move_files: false,
                ..DirectoryPermissions::default()
            }),
        )
        .await
        .unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .copy_items(
                &CopyRequest {
                    source_paths: vec!["pinned/a.txt".to_string()],
                    destination_path: "out".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
    }

    #[tokio::test]
    async fn test_move_conflict_on_existing_destination() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["in/a.txt", "out/a.txt"]).await;

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .move_items(
                &MoveRequest {
                    source_paths: vec!["in/a.txt".to_string()],
                    destination_path: "out".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failure_count, 1);
        assert!(result.failures[0].message.contains("already exists"));
        assert!(backend.exists("in/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_in_use_requires_force() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["assets/bg.png"]).await;
        repo.create_file(&NewFileRecord::new("assets/bg.png")).await.unwrap();
        repo.add_usage(&NewUsageRecord::new(
            "assets/bg.png",
            "template-background",
            "tpl-1",
            "templates",
        ))
        .await
        .unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .delete_items(
                &DeleteRequest {
                    paths: vec!["assets/bg.png".to_string()],
                    force: false,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.failure_count, 1);
        assert!(result.failures[0].message.contains("in use"));
        assert!(backend.exists("assets/bg.png").await.unwrap());

        let result = engine
            .delete_items(
                &DeleteRequest {
                    paths: vec!["assets/bg.png".to_string()],
                    force: true,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(!backend.exists("assets/bg.png").await.unwrap());
        assert!(repo.file_by_path("assets/bg.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_protected_file_survives_forced_delete() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["assets/logo.png"]).await;
        repo.create_file(&NewFileRecord::new("assets/logo.png").protected(true))
            .await
            .unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .delete_items(
                &DeleteRequest {
                    paths: vec!["assets/logo.png".to_string()],
                    force: true,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failure_count, 1);
        assert!(result.failures[0].message.contains("protected"));
        assert!(backend.exists("assets/logo.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_directory_move_preserves_subpaths() {
        let (_temp, backend, repo) = setup();
        seed(
            &backend,
            &["proj/a.txt", "proj/sub/b.txt", "proj/sub/deep/c.txt"],
        )
        .await;
        repo.create_directory(&NewDirectoryRecord::new("proj")).await.unwrap();
        repo.create_file(&NewFileRecord::new("proj/sub/b.txt")).await.unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .move_items(
                &MoveRequest {
                    source_paths: vec!["proj".to_string()],
                    destination_path: "archive".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success, "failures: {:?}", result.failures);
        assert!(backend.exists("archive/proj/a.txt").await.unwrap());
        assert!(backend.exists("archive/proj/sub/deep/c.txt").await.unwrap());
        assert!(!backend.exists("proj").await.unwrap());

        // Records followed the move
        assert!(repo.file_by_path("archive/proj/sub/b.txt").await.unwrap().is_some());
        assert!(repo.directory_by_path("archive/proj").await.unwrap().is_some());

        let dir = result.successful_items[0].as_directory().unwrap();
        assert_eq!(dir.path, "archive/proj");
        assert_eq!(dir.file_count, 3);
    }

    #[tokio::test]
    async fn test_directory_move_into_itself_fails() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["proj/a.txt"]).await;

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .move_items(
                &MoveRequest {
                    source_paths: vec!["proj".to_string()],
                    destination_path: "proj/inner".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failure_count, 1);
        assert!(result.failures[0].message.contains("into itself"));
    }

    #[tokio::test]
    async fn test_directory_delete_blocked_by_protected_descendant() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["proj/a.txt", "proj/keep.txt"]).await;
        repo.create_file(&NewFileRecord::new("proj/keep.txt").protected(true))
            .await
            .unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .delete_items(
                &DeleteRequest {
                    paths: vec!["proj".to_string()],
                    force: true,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failure_count, 1);
        assert!(result.failures[0].message.contains("protected"));
        // Pre-check means nothing was deleted
        assert!(backend.exists("proj/a.txt").await.unwrap());
        assert!(backend.exists("proj/keep.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_directory_delete_removes_subtree() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["proj/a.txt", "proj/sub/b.txt"]).await;
        repo.create_file(&NewFileRecord::new("proj/a.txt")).await.unwrap();
        repo.create_directory(&NewDirectoryRecord::new("proj")).await.unwrap();

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .delete_items(
                &DeleteRequest {
                    paths: vec!["proj".to_string()],
                    force: false,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success, "failures: {:?}", result.failures);
        assert!(!backend.exists("proj").await.unwrap());
        assert!(repo.file_by_path("proj/a.txt").await.unwrap().is_none());
        assert!(repo.directory_by_path("proj").await.unwrap().is_none());

        let dir = result.successful_items[0].as_directory().unwrap();
        assert_eq!(dir.file_count, 2);
    }

    #[tokio::test]
    async fn test_invalid_path_is_per_item_failure() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["ok.txt"]).await;

        let engine = BulkEngine::new(&backend, &repo);
        let result = engine
            .delete_items(
                &DeleteRequest {
                    paths: vec!["../escape".to_string(), "ok.txt".to_string()],
                    force: false,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.failure_count, 1);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failures[0].path, "../escape");
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_items() {
        let (_temp, backend, repo) = setup();
        seed(&backend, &["a.txt", "b.txt"]).await;

        let engine = BulkEngine::new(&backend, &repo);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine
            .delete_items(
                &DeleteRequest {
                    paths: vec!["a.txt".to_string(), "b.txt".to_string()],
                    force: false,
                },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(result.failure_count, 2);
        assert!(result.failures.iter().all(|f| f.message.contains("cancelled")));
        assert!(backend.exists("a.txt").await.unwrap());
    }

    /// Port wrapper that fails source deletes to exercise move rollback.
    struct DeleteFailingPort {
        inner: LocalBackend,
        fail_on: String,
        delete_calls: AtomicUsize,
    }

    #[async_trait]
    impl StoragePort for DeleteFailingPort {
        fn name(&self) -> &'static str {
            self.inner.name()
        }
        fn url_for(&self, path: &str) -> String {
            self.inner.url_for(path)
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
        async fn upload(
            &self,
            path: &str,
            content: &[u8],
            content_type: &str,
        ) -> Result<BackendObject> {
            self.inner.upload(path, content, content_type).await
        }
        async fn list(
            &self,
            prefix: &str,
            delimited: bool,
            cursor: Option<&str>,
            max_keys: usize,
        ) -> Result<ObjectListing> {
            self.inner.list(prefix, delimited, cursor, max_keys).await
        }
        async fn create_marker(&self, path: &str) -> Result<()> {
            self.inner.create_marker(path).await
        }
        async fn copy(&self, from: &str, to: &str) -> Result<()> {
            self.inner.copy(from, to).await
        }
        async fn delete(&self, path: &str) -> Result<bool> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            if path == self.fail_on {
                return Err(DepotError::Backend("simulated delete failure".to_string()));
            }
            self.inner.delete(path).await
        }
        async fn metadata(&self, path: &str) -> Result<Option<BackendObject>> {
            self.inner.metadata(path).await
        }
        async fn signed_upload_url(
            &self,
            path: &str,
            content_type: &str,
            content_md5: Option<&str>,
            expires_secs: u64,
        ) -> Result<SignedUpload> {
            self.inner
                .signed_upload_url(path, content_type, content_md5, expires_secs)
                .await
        }
    }

    #[tokio::test]
    async fn test_move_rolls_back_copy_when_source_delete_fails() {
        let temp = TempDir::new().unwrap();
        let inner = LocalBackend::new(temp.path()).unwrap();
        inner.upload("in/a.txt", b"x", "text/plain").await.unwrap();
        let port = DeleteFailingPort {
            inner: LocalBackend::new(temp.path()).unwrap(),
            fail_on: "in/a.txt".to_string(),
            delete_calls: AtomicUsize::new(0),
        };
        let repo = MemoryMetadataRepository::new();

        let engine = BulkEngine::new(&port, &repo);
        let result = engine
            .move_items(
                &MoveRequest {
                    source_paths: vec!["in/a.txt".to_string()],
                    destination_path: "out".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.failure_count, 1);
        assert!(result.failures[0]
            .message
            .contains("failed to delete source"));
        // Source intact, rollback removed the destination copy
        assert!(port.exists("in/a.txt").await.unwrap());
        assert!(!port.exists("out/a.txt").await.unwrap());
        // Copy verified + failed delete + rollback delete
        assert!(port.delete_calls.load(Ordering::SeqCst) >= 2);
    }
}
