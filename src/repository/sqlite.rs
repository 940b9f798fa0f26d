//! SQLite metadata repository.
//!
//! sqlx-backed implementation of [`MetadataRepository`]. Migrations are
//! applied sequentially when the repository is opened; the
//! `schema_version` table tracks which migrations have run.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::{DepotError, Result};
use crate::model::{DirectoryPermissions, UsageRecord};
use crate::path;

use super::{
    DirectoryRecord, DirectoryRecordUpdate, FileRecord, FileRecordUpdate, FileUsage,
    MetadataRepository, NewDirectoryRecord, NewFileRecord, NewUsageRecord,
};

/// Database migrations, executed in order.
pub const MIGRATIONS: &[&str] = &[
    // v1: files, directories, and usage records
    r#"
CREATE TABLE files (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    path            TEXT NOT NULL UNIQUE,
    directory_path  TEXT NOT NULL,
    name            TEXT NOT NULL,
    is_protected    INTEGER NOT NULL DEFAULT 0,
    content_hash    TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at      TEXT
);

CREATE INDEX idx_files_directory_path ON files(directory_path);

CREATE TABLE directories (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    path                  TEXT NOT NULL UNIQUE,
    parent_path           TEXT NOT NULL,
    name                  TEXT NOT NULL,
    allow_uploads         INTEGER NOT NULL DEFAULT 1,
    allow_delete          INTEGER NOT NULL DEFAULT 1,
    allow_create_sub_dirs INTEGER NOT NULL DEFAULT 1,
    allow_move            INTEGER NOT NULL DEFAULT 1,
    allow_delete_files    INTEGER NOT NULL DEFAULT 1,
    allow_move_files      INTEGER NOT NULL DEFAULT 1,
    is_protected          INTEGER NOT NULL DEFAULT 0,
    protect_children      INTEGER NOT NULL DEFAULT 0,
    created_at            TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at            TEXT
);

CREATE INDEX idx_directories_parent_path ON directories(parent_path);

CREATE TABLE usage_records (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path       TEXT NOT NULL,
    usage_type      TEXT NOT NULL,
    reference_id    TEXT NOT NULL,
    reference_table TEXT NOT NULL,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_usage_records_file_path ON usage_records(file_path);
"#,
];

/// Parse a `datetime('now')`-style or RFC 3339 timestamp column.
fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            DateTime::parse_from_rfc3339(&format!("{}Z", raw.replacen(' ', "T", 1)))
                .map(|dt| dt.with_timezone(&Utc))
        })
        .unwrap_or_else(|_| Utc::now())
}

fn parse_timestamp_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_timestamp(&s))
}

fn file_from_row(row: &sqlx::sqlite::SqliteRow) -> FileRecord {
    FileRecord {
        id: row.get("id"),
        path: row.get("path"),
        directory_path: row.get("directory_path"),
        name: row.get("name"),
        is_protected: row.get::<i64, _>("is_protected") != 0,
        content_hash: row.get("content_hash"),
        created: parse_timestamp(&row.get::<String, _>("created_at")),
        updated: parse_timestamp_opt(row.get("updated_at")),
    }
}

fn directory_from_row(row: &sqlx::sqlite::SqliteRow) -> DirectoryRecord {
    DirectoryRecord {
        id: row.get("id"),
        path: row.get("path"),
        parent_path: row.get("parent_path"),
        name: row.get("name"),
        permissions: DirectoryPermissions {
            allow_uploads: row.get::<i64, _>("allow_uploads") != 0,
            allow_delete: row.get::<i64, _>("allow_delete") != 0,
            allow_create_sub_dirs: row.get::<i64, _>("allow_create_sub_dirs") != 0,
            allow_move: row.get::<i64, _>("allow_move") != 0,
            allow_delete_files: row.get::<i64, _>("allow_delete_files") != 0,
            allow_move_files: row.get::<i64, _>("allow_move_files") != 0,
        },
        is_protected: row.get::<i64, _>("is_protected") != 0,
        protect_children: row.get::<i64, _>("protect_children") != 0,
        created: parse_timestamp(&row.get::<String, _>("created_at")),
        updated: parse_timestamp_opt(row.get("updated_at")),
    }
}

fn usage_from_row(row: &sqlx::sqlite::SqliteRow) -> UsageRecord {
    UsageRecord {
        id: row.get("id"),
        file_path: row.get("file_path"),
        usage_type: row.get("usage_type"),
        reference_id: row.get("reference_id"),
        reference_table: row.get("reference_table"),
        created: parse_timestamp(&row.get::<String, _>("created_at")),
    }
}

/// Build a `(?, ?, ...)` placeholder list for an IN clause.
fn placeholders(count: usize) -> String {
    std::iter::repeat("?").take(count).collect::<Vec<_>>().join(", ")
}

/// Map a unique-constraint violation to a conflict, everything else to a
/// database error.
fn constraint_error(e: sqlx::Error, record_path: &str) -> DepotError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return DepotError::Conflict(format!("record already exists for '{record_path}'"));
        }
    }
    DepotError::Database(e.to_string())
}

/// SQLite-backed [`MetadataRepository`] implementation.
pub struct SqliteMetadataRepository {
    pool: SqlitePool,
}

impl SqliteMetadataRepository {
    /// Connect to a SQLite database and apply pending migrations.
    ///
    /// Use `sqlite::memory:` for an in-memory database.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Opening metadata database at {url}");
        // An in-memory database exists per connection, so the pool must
        // not hand out more than one.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    /// Wrap an existing pool, applying pending migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current schema version (0 when no migration has been applied).
    pub async fn schema_version(&self) -> Result<i64> {
        let table_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        )
        .fetch_one(&self.pool)
        .await?;

        if !table_exists {
            return Ok(0);
        }

        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&self.pool)
                .await?;
        Ok(version)
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        let current = self.schema_version().await?;
        for (idx, migration) in MIGRATIONS.iter().enumerate() {
            let version = (idx + 1) as i64;
            if version <= current {
                continue;
            }
            debug!("Applying metadata migration v{version}");
            let mut tx = self.pool.begin().await?;
            for statement in migration.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataRepository for SqliteMetadataRepository {
    async fn file_by_path(&self, file_path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE path = ?")
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(file_from_row))
    }

    async fn files_by_paths(&self, paths: &[String]) -> Result<HashMap<String, FileRecord>> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let query = format!(
            "SELECT * FROM files WHERE path IN ({})",
            placeholders(paths.len())
        );
        let mut q = sqlx::query(&query);
        for p in paths {
            q = q.bind(p);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let record = file_from_row(row);
                (record.path.clone(), record)
            })
            .collect())
    }

    async fn directory_by_path(&self, dir_path: &str) -> Result<Option<DirectoryRecord>> {
        let row = sqlx::query("SELECT * FROM directories WHERE path = ?")
            .bind(dir_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(directory_from_row))
    }

    async fn directories_by_paths(
        &self,
        paths: &[String],
    ) -> Result<HashMap<String, DirectoryRecord>> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let query = format!(
            "SELECT * FROM directories WHERE path IN ({})",
            placeholders(paths.len())
        );
        let mut q = sqlx::query(&query);
        for p in paths {
            q = q.bind(p);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let record = directory_from_row(row);
                (record.path.clone(), record)
            })
            .collect())
    }

    async fn directories_by_parent_path(&self, parent: &str) -> Result<Vec<DirectoryRecord>> {
        let rows = sqlx::query("SELECT * FROM directories WHERE parent_path = ? ORDER BY path")
            .bind(parent)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(directory_from_row).collect())
    }

    async fn create_file(&self, file: &NewFileRecord) -> Result<FileRecord> {
        let result = sqlx::query(
            "INSERT INTO files (path, directory_path, name, is_protected, content_hash)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&file.path)
        .bind(file.directory_path())
        .bind(file.name())
        .bind(file.is_protected as i64)
        .bind(&file.content_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| constraint_error(e, &file.path))?;

        let id = result.last_insert_rowid();
        self.file_by_path(&file.path)
            .await?
            .filter(|r| r.id == id)
            .ok_or_else(|| DepotError::Database("inserted file record not found".to_string()))
    }

    async fn update_file(
        &self,
        file_path: &str,
        update: &FileRecordUpdate,
    ) -> Result<Option<FileRecord>> {
        if update.is_empty() {
            return self.file_by_path(file_path).await;
        }

        let existing = self.file_by_path(file_path).await?;
        let Some(existing) = existing else {
            return Ok(None);
        };

        let new_path = update.path.clone().unwrap_or_else(|| existing.path.clone());
        let is_protected = update.is_protected.unwrap_or(existing.is_protected);
        let content_hash = match &update.content_hash {
            Some(hash) => hash.clone(),
            None => existing.content_hash.clone(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE files
             SET path = ?, directory_path = ?, name = ?, is_protected = ?, content_hash = ?,
                 updated_at = datetime('now')
             WHERE path = ?",
        )
        .bind(&new_path)
        .bind(path::parent_path(&new_path))
        .bind(path::file_name(&new_path))
        .bind(is_protected as i64)
        .bind(&content_hash)
        .bind(file_path)
        .execute(&mut *tx)
        .await?;

        // Usage records follow the file across renames
        if new_path != existing.path {
            sqlx::query("UPDATE usage_records SET file_path = ? WHERE file_path = ?")
                .bind(&new_path)
                .bind(file_path)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.file_by_path(&new_path).await
    }

    async fn delete_file(&self, file_path: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM usage_records WHERE file_path = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_directory(&self, dir: &NewDirectoryRecord) -> Result<DirectoryRecord> {
        sqlx::query(
            "INSERT INTO directories
                 (path, parent_path, name, allow_uploads, allow_delete, allow_create_sub_dirs,
                  allow_move, allow_delete_files, allow_move_files, is_protected, protect_children)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&dir.path)
        .bind(dir.parent_path())
        .bind(dir.name())
        .bind(dir.permissions.allow_uploads as i64)
        .bind(dir.permissions.allow_delete as i64)
        .bind(dir.permissions.allow_create_sub_dirs as i64)
        .bind(dir.permissions.allow_move as i64)
        .bind(dir.permissions.allow_delete_files as i64)
        .bind(dir.permissions.allow_move_files as i64)
        .bind(dir.is_protected as i64)
        .bind(dir.protect_children as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| constraint_error(e, &dir.path))?;

        self.directory_by_path(&dir.path)
            .await?
            .ok_or_else(|| DepotError::Database("inserted directory record not found".to_string()))
    }

    async fn update_directory(
        &self,
        dir_path: &str,
        update: &DirectoryRecordUpdate,
    ) -> Result<Option<DirectoryRecord>> {
        if update.is_empty() {
            return self.directory_by_path(dir_path).await;
        }

        let existing = self.directory_by_path(dir_path).await?;
        let Some(existing) = existing else {
            return Ok(None);
        };

        let new_path = update.path.clone().unwrap_or_else(|| existing.path.clone());
        let permissions = update.permissions.unwrap_or(existing.permissions);
        let is_protected = update.is_protected.unwrap_or(existing.is_protected);
        let protect_children = update.protect_children.unwrap_or(existing.protect_children);

        sqlx::query(
            "UPDATE directories
             SET path = ?, parent_path = ?, name = ?,
                 allow_uploads = ?, allow_delete = ?, allow_create_sub_dirs = ?,
                 allow_move = ?, allow_delete_files = ?, allow_move_files = ?,
                 is_protected = ?, protect_children = ?, updated_at = datetime('now')
             WHERE path = ?",
        )
        .bind(&new_path)
        .bind(path::parent_path(&new_path))
        .bind(path::file_name(&new_path))
        .bind(permissions.allow_uploads as i64)
        .bind(permissions.allow_delete as i64)
        .bind(permissions.allow_create_sub_dirs as i64)
        .bind(permissions.allow_move as i64)
        .bind(permissions.allow_delete_files as i64)
        .bind(permissions.allow_move_files as i64)
        .bind(is_protected as i64)
        .bind(protect_children as i64)
        .bind(dir_path)
        .execute(&self.pool)
        .await?;

        self.directory_by_path(&new_path).await
    }

    async fn delete_directory(&self, dir_path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM directories WHERE path = ?")
            .bind(dir_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn check_file_usage(&self, file_path: &str) -> Result<FileUsage> {
        let rows = sqlx::query(
            "SELECT * FROM usage_records WHERE file_path = ? ORDER BY created_at, id",
        )
        .bind(file_path)
        .fetch_all(&self.pool)
        .await?;
        Ok(FileUsage::from_usages(
            rows.iter().map(usage_from_row).collect(),
        ))
    }

    async fn usages_by_paths(&self, paths: &[String]) -> Result<HashMap<String, Vec<UsageRecord>>> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let query = format!(
            "SELECT * FROM usage_records WHERE file_path IN ({}) ORDER BY created_at, id",
            placeholders(paths.len())
        );
        let mut q = sqlx::query(&query);
        for p in paths {
            q = q.bind(p);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut result: HashMap<String, Vec<UsageRecord>> = HashMap::new();
        for row in &rows {
            let usage = usage_from_row(row);
            result.entry(usage.file_path.clone()).or_default().push(usage);
        }
        Ok(result)
    }

    async fn add_usage(&self, usage: &NewUsageRecord) -> Result<UsageRecord> {
        let result = sqlx::query(
            "INSERT INTO usage_records (file_path, usage_type, reference_id, reference_table)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&usage.file_path)
        .bind(&usage.usage_type)
        .bind(&usage.reference_id)
        .bind(&usage.reference_table)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        let row = sqlx::query("SELECT * FROM usage_records WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(usage_from_row(&row))
    }

    async fn remove_usage(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM usage_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
