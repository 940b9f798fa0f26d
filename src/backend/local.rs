//! Local filesystem backend.
//!
//! Stores files under a configured base directory. Every resolved path is
//! verified to stay inside the base directory; traversal outside it is a
//! validation error, never a filesystem call. Directories are native, but
//! listings normalize them into the same prefix/marker shape the object
//! backends produce.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use uuid::Uuid;

use crate::error::{DepotError, Result};
use crate::path::ValidationError;

use super::{content_type_for, BackendObject, ObjectListing, SignedUpload, StoragePort};

/// Filesystem storage backend confined to a base directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base_path: PathBuf,
    public_url: Option<String>,
}

impl LocalBackend {
    /// Create a new backend rooted at the given base path.
    ///
    /// The base directory is created if it doesn't exist.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        let base_path = base_path.canonicalize()?;

        Ok(Self {
            base_path,
            public_url: None,
        })
    }

    /// Set the public URL base used when building access URLs.
    pub fn with_public_url(mut self, public_url: impl Into<String>) -> Self {
        self.public_url = Some(public_url.into());
        self
    }

    /// Get the base path of this backend.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a logical path to an absolute path under the base
    /// directory, rejecting anything that would escape it.
    fn resolve(&self, logical_path: &str) -> Result<PathBuf> {
        let logical_path = logical_path.trim_end_matches('/');
        let relative = Path::new(logical_path);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => return Err(ValidationError::PathTraversal.into()),
            }
        }

        let resolved = self.base_path.join(relative);
        if !resolved.starts_with(&self.base_path) {
            return Err(ValidationError::PathTraversal.into());
        }
        Ok(resolved)
    }

    fn object_from_metadata(
        &self,
        logical_path: &str,
        metadata: &std::fs::Metadata,
    ) -> BackendObject {
        BackendObject {
            path: logical_path.to_string(),
            size: metadata.len(),
            content_type: content_type_for(logical_path),
            content_hash: None,
            url: self.url_for(logical_path),
            created: metadata.created().ok().map(DateTime::<Utc>::from),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        }
    }

    fn marker_object(&self, logical_path: &str, metadata: &std::fs::Metadata) -> BackendObject {
        BackendObject {
            path: format!("{logical_path}/"),
            size: 0,
            content_type: "application/x-directory".to_string(),
            content_hash: None,
            url: self.url_for(logical_path),
            created: metadata.created().ok().map(DateTime::<Utc>::from),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        }
    }

    /// Collect the whole subtree (or a single level) under a prefix as
    /// (logical path, metadata) pairs. Directories carry their logical
    /// path without a slash here; listing shapes them afterwards.
    async fn collect(
        &self,
        prefix: &str,
        single_level: bool,
    ) -> Result<(Vec<(String, std::fs::Metadata)>, Vec<(String, std::fs::Metadata)>)> {
        let root = self.resolve(prefix)?;
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        let root_meta = match fs::metadata(&root).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((files, dirs)),
            Err(e) => return Err(e.into()),
        };
        if !root_meta.is_dir() {
            return Ok((files, dirs));
        }

        let mut pending = vec![(root, prefix.trim_end_matches('/').to_string())];
        while let Some((dir, logical_dir)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                let logical = if logical_dir.is_empty() {
                    name.to_string()
                } else {
                    format!("{logical_dir}/{name}")
                };
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    if !single_level {
                        pending.push((entry.path(), logical.clone()));
                    }
                    dirs.push((logical, metadata));
                } else {
                    files.push((logical, metadata));
                }
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        dirs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok((files, dirs))
    }
}

#[async_trait]
impl StoragePort for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn url_for(&self, path: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), path),
            None => format!("file://{}", self.base_path.join(path).display()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let resolved = self.resolve(path)?;
        match fs::metadata(&resolved).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(
        &self,
        path: &str,
        content: &[u8],
        _content_type: &str,
    ) -> Result<BackendObject> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&resolved, content).await?;

        let metadata = fs::metadata(&resolved).await?;
        Ok(self.object_from_metadata(path, &metadata))
    }

    async fn list(
        &self,
        prefix: &str,
        delimited: bool,
        cursor: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectListing> {
        let (files, dirs) = self.collect(prefix, delimited).await?;

        if delimited {
            // Single level: files become objects, directories become
            // common prefixes. Pagination applies to the file set.
            let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
            let total = files.len();
            let objects: Vec<BackendObject> = files
                .into_iter()
                .skip(offset)
                .take(max_keys)
                .map(|(logical, metadata)| self.object_from_metadata(&logical, &metadata))
                .collect();
            let consumed = offset + objects.len();
            return Ok(ObjectListing {
                objects,
                common_prefixes: dirs.into_iter().map(|(logical, _)| logical).collect(),
                next_cursor: (consumed < total).then(|| consumed.to_string()),
            });
        }

        // Full walk: interleave files and directory markers, sorted by
        // logical path, so cursors stay stable.
        let mut combined: Vec<BackendObject> = files
            .iter()
            .map(|(logical, metadata)| self.object_from_metadata(logical, metadata))
            .chain(
                dirs.iter()
                    .map(|(logical, metadata)| self.marker_object(logical, metadata)),
            )
            .collect();
        combined.sort_by(|a, b| a.path.cmp(&b.path));

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let total = combined.len();
        let objects: Vec<BackendObject> =
            combined.into_iter().skip(offset).take(max_keys).collect();
        let consumed = offset + objects.len();

        Ok(ObjectListing {
            objects,
            common_prefixes: Vec::new(),
            next_cursor: (consumed < total).then(|| consumed.to_string()),
        })
    }

    async fn create_marker(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        fs::create_dir_all(&resolved).await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&source, &dest).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let resolved = self.resolve(path)?;
        let metadata = match fs::metadata(&resolved).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            // Only empty directories go away here; descendant files are
            // deleted individually by the callers that own the policy
            // checks.
            match fs::remove_dir(&resolved).await {
                Ok(()) => Ok(true),
                Err(e) => Err(DepotError::Backend(format!(
                    "failed to remove directory '{path}': {e}"
                ))),
            }
        } else {
            fs::remove_file(&resolved).await?;
            Ok(true)
        }
    }

    async fn metadata(&self, path: &str) -> Result<Option<BackendObject>> {
        let resolved = self.resolve(path)?;
        match fs::metadata(&resolved).await {
            Ok(m) if m.is_file() => Ok(Some(self.object_from_metadata(path, &m))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn signed_upload_url(
        &self,
        path: &str,
        _content_type: &str,
        _content_md5: Option<&str>,
        expires_secs: u64,
    ) -> Result<SignedUpload> {
        // Development parity with the cloud backends: a token-stamped URL
        // the local transport can honor.
        let token = Uuid::new_v4();
        let expires_at = Utc::now() + chrono::Duration::seconds(expires_secs as i64);
        Ok(SignedUpload {
            url: format!("{}?upload_token={token}", self.url_for(path)),
            method: "PUT".to_string(),
            headers: Vec::new(),
            expires_at,
        })
    }
}
