//! In-memory metadata repository.
//!
//! Reference implementation of [`MetadataRepository`] backed by hash maps
//! behind an `RwLock`. Used by the test suites and by embedders that do
//! not need persistence.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{DepotError, Result};
use crate::model::UsageRecord;
use crate::path;

use super::{
    DirectoryRecord, DirectoryRecordUpdate, FileRecord, FileRecordUpdate, FileUsage,
    MetadataRepository, NewDirectoryRecord, NewFileRecord, NewUsageRecord,
};

#[derive(Default)]
struct State {
    files: HashMap<String, FileRecord>,
    directories: HashMap<String, DirectoryRecord>,
    usages: HashMap<i64, UsageRecord>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory [`MetadataRepository`] implementation.
#[derive(Default)]
pub struct MemoryMetadataRepository {
    state: RwLock<State>,
}

impl MemoryMetadataRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| DepotError::Database("repository lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| DepotError::Database("repository lock poisoned".to_string()))
    }

    fn usages_for(state: &State, path: &str) -> Vec<UsageRecord> {
        let mut usages: Vec<UsageRecord> = state
            .usages
            .values()
            .filter(|u| u.file_path == path)
            .cloned()
            .collect();
        usages.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        usages
    }
}

#[async_trait]
impl MetadataRepository for MemoryMetadataRepository {
    async fn file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        Ok(self.read()?.files.get(path).cloned())
    }

    async fn files_by_paths(&self, paths: &[String]) -> Result<HashMap<String, FileRecord>> {
        let state = self.read()?;
        Ok(paths
            .iter()
            .filter_map(|p| state.files.get(p).map(|r| (p.clone(), r.clone())))
            .collect())
    }

    async fn directory_by_path(&self, path: &str) -> Result<Option<DirectoryRecord>> {
        Ok(self.read()?.directories.get(path).cloned())
    }

    async fn directories_by_paths(
        &self,
        paths: &[String],
    ) -> Result<HashMap<String, DirectoryRecord>> {
        let state = self.read()?;
        Ok(paths
            .iter()
            .filter_map(|p| state.directories.get(p).map(|r| (p.clone(), r.clone())))
            .collect())
    }

    async fn directories_by_parent_path(&self, parent: &str) -> Result<Vec<DirectoryRecord>> {
        let state = self.read()?;
        let mut dirs: Vec<DirectoryRecord> = state
            .directories
            .values()
            .filter(|d| d.parent_path == parent)
            .cloned()
            .collect();
        dirs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(dirs)
    }

    async fn create_file(&self, file: &NewFileRecord) -> Result<FileRecord> {
        let mut state = self.write()?;
        if state.files.contains_key(&file.path) {
            return Err(DepotError::Conflict(format!(
                "file record already exists for '{}'",
                file.path
            )));
        }
        let id = state.next_id();
        let record = FileRecord {
            id,
            path: file.path.clone(),
            directory_path: file.directory_path().to_string(),
            name: file.name().to_string(),
            is_protected: file.is_protected,
            content_hash: file.content_hash.clone(),
            created: Utc::now(),
            updated: None,
        };
        state.files.insert(record.path.clone(), record.clone());
        Ok(record)
    }

    async fn update_file(
        &self,
        path: &str,
        update: &FileRecordUpdate,
    ) -> Result<Option<FileRecord>> {
        let mut state = self.write()?;
        let Some(mut record) = state.files.remove(path) else {
            return Ok(None);
        };
        if let Some(new_path) = &update.path {
            record.path = new_path.clone();
            record.directory_path = path::parent_path(new_path).to_string();
            record.name = path::file_name(new_path).to_string();
            // Usage records follow the file across renames
            for usage in state.usages.values_mut() {
                if usage.file_path == path {
                    usage.file_path = new_path.clone();
                }
            }
        }
        if let Some(is_protected) = update.is_protected {
            record.is_protected = is_protected;
        }
        if let Some(content_hash) = &update.content_hash {
            record.content_hash = content_hash.clone();
        }
        record.updated = Some(Utc::now());
        state.files.insert(record.path.clone(), record.clone());
        Ok(Some(record))
    }

    async fn delete_file(&self, path: &str) -> Result<bool> {
        let mut state = self.write()?;
        let removed = state.files.remove(path).is_some();
        if removed {
            state.usages.retain(|_, u| u.file_path != path);
        }
        Ok(removed)
    }

    async fn create_directory(&self, dir: &NewDirectoryRecord) -> Result<DirectoryRecord> {
        let mut state = self.write()?;
        if state.directories.contains_key(&dir.path) {
            return Err(DepotError::Conflict(format!(
                "directory record already exists for '{}'",
                dir.path
            )));
        }
        let id = state.next_id();
        let record = DirectoryRecord {
            id,
            path: dir.path.clone(),
            parent_path: dir.parent_path().to_string(),
            name: dir.name().to_string(),
            permissions: dir.permissions,
            is_protected: dir.is_protected,
            protect_children: dir.protect_children,
            created: Utc::now(),
            updated: None,
        };
        state
            .directories
            .insert(record.path.clone(), record.clone());
        Ok(record)
    }

    async fn update_directory(
        &self,
        path: &str,
        update: &DirectoryRecordUpdate,
    ) -> Result<Option<DirectoryRecord>> {
        let mut state = self.write()?;
        let Some(mut record) = state.directories.remove(path) else {
            return Ok(None);
        };
        if let Some(new_path) = &update.path {
            record.path = new_path.clone();
            record.parent_path = path::parent_path(new_path).to_string();
            record.name = path::file_name(new_path).to_string();
        }
        if let Some(permissions) = update.permissions {
            record.permissions = permissions;
        }
        if let Some(is_protected) = update.is_protected {
            record.is_protected = is_protected;
        }
        if let Some(protect_children) = update.protect_children {
            record.protect_children = protect_children;
        }
        record.updated = Some(Utc::now());
        state
            .directories
            .insert(record.path.clone(), record.clone());
        Ok(Some(record))
    }

    async fn delete_directory(&self, path: &str) -> Result<bool> {
        Ok(self.write()?.directories.remove(path).is_some())
    }

    async fn check_file_usage(&self, path: &str) -> Result<FileUsage> {
        let state = self.read()?;
        Ok(FileUsage::from_usages(Self::usages_for(&state, path)))
    }

    async fn usages_by_paths(&self, paths: &[String]) -> Result<HashMap<String, Vec<UsageRecord>>> {
        let state = self.read()?;
        let mut result = HashMap::new();
        for path in paths {
            let usages = Self::usages_for(&state, path);
            if !usages.is_empty() {
                result.insert(path.clone(), usages);
            }
        }
        Ok(result)
    }

    async fn add_usage(&self, usage: &NewUsageRecord) -> Result<UsageRecord> {
        let mut state = self.write()?;
        let id = state.next_id();
        let record = UsageRecord {
            id,
            file_path: usage.file_path.clone(),
            usage_type: usage.usage_type.clone(),
            reference_id: usage.reference_id.clone(),
            reference_table: usage.reference_table.clone(),
            created: Utc::now(),
        };
        state.usages.insert(id, record.clone());
        Ok(record)
    }

    async fn remove_usage(&self, id: i64) -> Result<bool> {
        Ok(self.write()?.usages.remove(&id).is_some())
    }
}
