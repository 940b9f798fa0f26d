//! Bulk operation integration tests.
//!
//! Facade-level flows over a local backend and an in-memory repository:
//! partial failure semantics, the destination gate, directory-as-unit
//! operations, and the batched-lookup invariant.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{create_test_service, seed_files};
use depot::{
    CopyRequest, DeleteRequest, DirectoryPermissions, DirectoryRecord, DirectoryRecordUpdate,
    FileRecord, FileRecordUpdate, FileUsage, MemoryMetadataRepository, MetadataRepository,
    MoveRequest, NewDirectoryRecord, NewFileRecord, NewUsageRecord, Result, StoragePort,
    StorageService, UsageRecord,
};
use tempfile::TempDir;

#[tokio::test]
async fn test_move_reports_partial_failure() {
    let h = create_test_service();
    seed_files(&h.backend, &["in/a.txt", "in/c.txt"]).await;

    let result = h
        .service
        .move_storage_items(&MoveRequest {
            source_paths: vec![
                "in/a.txt".to_string(),
                "in/missing.txt".to_string(),
                "in/c.txt".to_string(),
            ],
            destination_path: "out".to_string(),
        })
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.success_count, 2);
    assert_eq!(result.failure_count, 1);
    assert_eq!(result.failures[0].path, "in/missing.txt");
    assert_eq!(result.failures[0].message, "source path not found");
}

#[tokio::test]
async fn test_copy_then_sources_remain() {
    let h = create_test_service();
    seed_files(&h.backend, &["in/a.txt", "in/b.txt"]).await;

    let result = h
        .service
        .copy_storage_items(&CopyRequest {
            source_paths: vec!["in/a.txt".to_string(), "in/b.txt".to_string()],
            destination_path: "backup".to_string(),
        })
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.success_count, 2);
    assert!(h.backend.exists("in/a.txt").await.unwrap());
    assert!(h.backend.exists("backup/a.txt").await.unwrap());
}

#[tokio::test]
async fn test_bulk_delete_force_semantics() {
    let h = create_test_service();
    seed_files(&h.backend, &["x/in-use.png", "x/protected.png", "x/plain.png"]).await;
    h.repo
        .create_file(&NewFileRecord::new("x/in-use.png"))
        .await
        .unwrap();
    h.repo
        .add_usage(&NewUsageRecord::new(
            "x/in-use.png",
            "template-background",
            "tpl-1",
            "templates",
        ))
        .await
        .unwrap();
    h.repo
        .create_file(&NewFileRecord::new("x/protected.png").protected(true))
        .await
        .unwrap();

    // Without force: the in-use and protected files fail, the plain one
    // goes away.
    let result = h
        .service
        .delete_storage_items(&DeleteRequest {
            paths: vec![
                "x/in-use.png".to_string(),
                "x/protected.png".to_string(),
                "x/plain.png".to_string(),
            ],
            force: false,
        })
        .await
        .unwrap();

    assert_eq!(result.success_count, 1);
    assert_eq!(result.failure_count, 2);
    assert!(!h.backend.exists("x/plain.png").await.unwrap());

    // With force: the in-use file goes, the protected one still fails.
    let result = h
        .service
        .delete_storage_items(&DeleteRequest {
            paths: vec!["x/in-use.png".to_string(), "x/protected.png".to_string()],
            force: true,
        })
        .await
        .unwrap();

    assert_eq!(result.success_count, 1);
    assert_eq!(result.failure_count, 1);
    assert!(!h.backend.exists("x/in-use.png").await.unwrap());
    assert!(h.backend.exists("x/protected.png").await.unwrap());
}

#[tokio::test]
async fn test_destination_gate_zero_successes() {
    let h = create_test_service();
    seed_files(&h.backend, &["in/a.txt", "in/b.txt", "in/c.txt"]).await;
    h.repo
        .create_directory(
            &NewDirectoryRecord::new("sealed").with_permissions(DirectoryPermissions {
                allow_uploads: false,
                ..DirectoryPermissions::default()
            }),
        )
        .await
        .unwrap();

    let result = h
        .service
        .copy_storage_items(&CopyRequest {
            source_paths: vec![
                "in/a.txt".to_string(),
                "in/b.txt".to_string(),
                "in/c.txt".to_string(),
            ],
            destination_path: "sealed".to_string(),
        })
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.success_count, 0);
    assert_eq!(result.failure_count, 3);
}

#[tokio::test]
async fn test_directory_move_as_unit() {
    let h = create_test_service();
    seed_files(
        &h.backend,
        &["proj/readme.md", "proj/src/main.rs", "proj/src/util/helper.rs"],
    )
    .await;
    h.repo
        .create_file(&NewFileRecord::new("proj/src/main.rs"))
        .await
        .unwrap();
    h.repo
        .create_directory(&NewDirectoryRecord::new("proj"))
        .await
        .unwrap();

    let result = h
        .service
        .move_storage_items(&MoveRequest {
            source_paths: vec!["proj".to_string()],
            destination_path: "archive/2026".to_string(),
        })
        .await
        .unwrap();

    assert!(result.success, "failures: {:?}", result.failures);
    assert!(h
        .backend
        .exists("archive/2026/proj/src/util/helper.rs")
        .await
        .unwrap());
    assert!(!h.backend.exists("proj").await.unwrap());
    assert!(h
        .repo
        .file_by_path("archive/2026/proj/src/main.rs")
        .await
        .unwrap()
        .is_some());
    assert!(h
        .repo
        .directory_by_path("archive/2026/proj")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_directory_delete_blocked_by_in_use_descendant() {
    let h = create_test_service();
    seed_files(&h.backend, &["media/a.png", "media/b.png"]).await;
    h.repo
        .add_usage(&NewUsageRecord::new(
            "media/b.png",
            "template-cover",
            "tpl-3",
            "templates",
        ))
        .await
        .unwrap();

    let result = h
        .service
        .delete_storage_items(&DeleteRequest {
            paths: vec!["media".to_string()],
            force: false,
        })
        .await
        .unwrap();

    assert_eq!(result.failure_count, 1);
    assert!(result.failures[0].message.contains("in use"));
    // Pre-checks run before the first mutation
    assert!(h.backend.exists("media/a.png").await.unwrap());
    assert!(h.backend.exists("media/b.png").await.unwrap());
}

/// Repository wrapper counting read round-trips, to pin the
/// batched-lookup invariant.
struct CountingRepository {
    inner: MemoryMetadataRepository,
    read_calls: AtomicUsize,
}

impl CountingRepository {
    fn new() -> Self {
        Self {
            inner: MemoryMetadataRepository::new(),
            read_calls: AtomicUsize::new(0),
        }
    }

    fn count(&self) {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataRepository for CountingRepository {
    async fn file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        self.count();
        self.inner.file_by_path(path).await
    }
    async fn files_by_paths(&self, paths: &[String]) -> Result<HashMap<String, FileRecord>> {
        self.count();
        self.inner.files_by_paths(paths).await
    }
    async fn directory_by_path(&self, path: &str) -> Result<Option<DirectoryRecord>> {
        self.count();
        self.inner.directory_by_path(path).await
    }
    async fn directories_by_paths(
        &self,
        paths: &[String],
    ) -> Result<HashMap<String, DirectoryRecord>> {
        self.count();
        self.inner.directories_by_paths(paths).await
    }
    async fn directories_by_parent_path(&self, parent: &str) -> Result<Vec<DirectoryRecord>> {
        self.count();
        self.inner.directories_by_parent_path(parent).await
    }
    async fn create_file(&self, file: &NewFileRecord) -> Result<FileRecord> {
        self.inner.create_file(file).await
    }
    async fn update_file(
        &self,
        path: &str,
        update: &FileRecordUpdate,
    ) -> Result<Option<FileRecord>> {
        self.inner.update_file(path, update).await
    }
    async fn delete_file(&self, path: &str) -> Result<bool> {
        self.inner.delete_file(path).await
    }
    async fn create_directory(&self, dir: &NewDirectoryRecord) -> Result<DirectoryRecord> {
        self.inner.create_directory(dir).await
    }
    async fn update_directory(
        &self,
        path: &str,
        update: &DirectoryRecordUpdate,
    ) -> Result<Option<DirectoryRecord>> {
        self.inner.update_directory(path, update).await
    }
    async fn delete_directory(&self, path: &str) -> Result<bool> {
        self.inner.delete_directory(path).await
    }
    async fn check_file_usage(&self, path: &str) -> Result<FileUsage> {
        self.count();
        self.inner.check_file_usage(path).await
    }
    async fn usages_by_paths(
        &self,
        paths: &[String],
    ) -> Result<HashMap<String, Vec<UsageRecord>>> {
        self.count();
        self.inner.usages_by_paths(paths).await
    }
    async fn add_usage(&self, usage: &NewUsageRecord) -> Result<UsageRecord> {
        self.inner.add_usage(usage).await
    }
    async fn remove_usage(&self, id: i64) -> Result<bool> {
        self.inner.remove_usage(id).await
    }
}

#[tokio::test]
async fn test_bulk_delete_read_round_trips_independent_of_batch_size() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(depot::LocalBackend::new(temp.path()).unwrap());
    let repo = Arc::new(CountingRepository::new());
    let service = StorageService::new(backend.clone(), repo.clone());

    // Small batch
    seed_files(&backend, &["f/0.txt", "f/1.txt"]).await;
    repo.read_calls.store(0, Ordering::SeqCst);
    service
        .delete_storage_items(&DeleteRequest {
            paths: (0..2).map(|i| format!("f/{i}.txt")).collect(),
            force: false,
        })
        .await
        .unwrap();
    let small_batch_reads = repo.read_calls.load(Ordering::SeqCst);

    // Much larger batch
    let paths: Vec<String> = (0..20).map(|i| format!("g/{i}.txt")).collect();
    for p in &paths {
        backend.upload(p, b"x", "text/plain").await.unwrap();
    }
    repo.read_calls.store(0, Ordering::SeqCst);
    service
        .delete_storage_items(&DeleteRequest {
            paths,
            force: false,
        })
        .await
        .unwrap();
    let large_batch_reads = repo.read_calls.load(Ordering::SeqCst);

    // Read round-trips are bounded by a small constant, not O(N)
    assert_eq!(small_batch_reads, large_batch_reads);
    assert!(large_batch_reads <= 3);
}
