//! Test helpers for service-level integration tests.
//!
//! Provides a StorageService wired to a tempdir-backed local backend and
//! an in-memory metadata repository.

use std::sync::Arc;

use tempfile::TempDir;

use depot::{LocalBackend, MemoryMetadataRepository, StoragePort, StorageService};

/// A service over a throwaway local backend and in-memory repository.
pub struct TestHarness {
    /// Keeps the backing directory alive for the test's duration.
    pub _temp_dir: TempDir,
    pub service: StorageService,
    pub backend: Arc<LocalBackend>,
    pub repo: Arc<MemoryMetadataRepository>,
}

/// Create a test service with an empty backend and repository.
pub fn create_test_service() -> TestHarness {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(temp_dir.path()).unwrap());
    let repo = Arc::new(MemoryMetadataRepository::new());
    let service = StorageService::new(backend.clone(), repo.clone());
    TestHarness {
        _temp_dir: temp_dir,
        service,
        backend,
        repo,
    }
}

/// Upload a set of small files through the backend.
pub async fn seed_files(backend: &LocalBackend, paths: &[&str]) {
    for path in paths {
        let content = format!("content of {path}");
        backend
            .upload(path, content.as_bytes(), &content_type_of(path))
            .await
            .unwrap();
    }
}

fn content_type_of(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
