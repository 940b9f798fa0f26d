//! Metadata merge layer.
//!
//! Combines what the physical backend reports about an item with the
//! optional database record into the unified view model. Backend fields
//! always win for physical facts (size, timestamps, URL, content type);
//! database fields always win for policy facts (protection, permissions,
//! usages). Pure functions, no I/O.

use chrono::{DateTime, Utc};

use crate::backend::BackendObject;
use crate::model::{file_identity, DirectoryInfo, DirectoryPermissions, FileInfo, FileType, UsageRecord};
use crate::path;
use crate::repository::{DirectoryRecord, FileRecord};

/// Aggregated physical facts about a directory subtree.
#[derive(Debug, Clone, Default)]
pub struct DirectoryTally {
    /// Number of descendant files.
    pub file_count: u64,
    /// Number of immediate subdirectories.
    pub folder_count: u64,
    /// Total size of descendant files in bytes.
    pub total_size: u64,
    /// Earliest observed timestamp.
    pub created: Option<DateTime<Utc>>,
    /// Latest observed timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

impl DirectoryTally {
    /// Fold one observed file into the tally.
    pub fn observe_file(&mut self, object: &BackendObject) {
        self.file_count += 1;
        self.total_size += object.size;
        self.observe_timestamps(object.created, object.last_modified);
    }

    /// Fold observed timestamps into the tally without counting a file.
    pub fn observe_timestamps(
        &mut self,
        created: Option<DateTime<Utc>>,
        last_modified: Option<DateTime<Utc>>,
    ) {
        let earliest = created.or(last_modified);
        if let Some(ts) = earliest {
            self.created = Some(self.created.map_or(ts, |cur| cur.min(ts)));
        }
        if let Some(ts) = last_modified.or(created) {
            self.last_modified = Some(self.last_modified.map_or(ts, |cur| cur.max(ts)));
        }
    }
}

/// Merge a backend-reported file and an optional database record into a
/// [`FileInfo`].
///
/// When the backend object is absent the result represents an orphaned
/// database record (`is_from_backend == false`). When the record is
/// absent, policy facts default to unprotected with no usages.
pub fn combine_file_data(
    logical_path: &str,
    object: Option<&BackendObject>,
    record: Option<&FileRecord>,
    usages: Vec<UsageRecord>,
) -> FileInfo {
    let (name, directory_path, is_public) = file_identity(logical_path);
    let content_type = object
        .map(|o| o.content_type.clone())
        .unwrap_or_else(|| crate::backend::content_type_for(logical_path));
    let is_in_use = !usages.is_empty();

    FileInfo {
        path: logical_path.to_string(),
        name,
        directory_path,
        size: object.map(|o| o.size).unwrap_or(0),
        file_type: FileType::from_content_type(&content_type),
        content_type,
        content_hash: object
            .and_then(|o| o.content_hash.clone())
            .or_else(|| record.and_then(|r| r.content_hash.clone())),
        url: object.map(|o| o.url.clone()).unwrap_or_default(),
        is_public,
        is_protected: record.map(|r| r.is_protected).unwrap_or(false),
        is_in_use,
        usages,
        is_from_backend: object.is_some(),
        created: object.and_then(|o| o.created).or(record.map(|r| r.created)),
        last_modified: object
            .and_then(|o| o.last_modified)
            .or(record.and_then(|r| r.updated)),
    }
}

/// Merge backend observations and an optional database record into a
/// [`DirectoryInfo`].
///
/// Permission flags default to fully permissive when no record exists.
pub fn combine_directory_data(
    logical_path: &str,
    record: Option<&DirectoryRecord>,
    tally: &DirectoryTally,
    is_from_backend: bool,
) -> DirectoryInfo {
    DirectoryInfo {
        path: logical_path.to_string(),
        name: path::file_name(logical_path).to_string(),
        permissions: record
            .map(|r| r.permissions)
            .unwrap_or_else(DirectoryPermissions::permissive),
        is_protected: record.map(|r| r.is_protected).unwrap_or(false),
        protect_children: record.map(|r| r.protect_children).unwrap_or(false),
        file_count: tally.file_count,
        folder_count: tally.folder_count,
        total_size: tally.total_size,
        is_from_backend,
        created: tally.created.or(record.map(|r| r.created)),
        last_modified: tally.last_modified.or(record.and_then(|r| r.updated)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn object(path: &str, size: u64) -> BackendObject {
        BackendObject {
            path: path.to_string(),
            size,
            content_type: "image/png".to_string(),
            content_hash: Some("etag-1".to_string()),
            url: format!("https://cdn.example.com/{path}"),
            created: Some(Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap()),
            last_modified: Some(Utc.with_ymd_and_hms(2026, 1, 12, 8, 0, 0).unwrap()),
        }
    }

    fn record(path: &str, is_protected: bool) -> FileRecord {
        FileRecord {
            id: 1,
            path: path.to_string(),
            directory_path: path::parent_path(path).to_string(),
            name: path::file_name(path).to_string(),
            is_protected,
            content_hash: Some("db-hash".to_string()),
            created: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            updated: None,
        }
    }

    fn usage(path: &str) -> UsageRecord {
        UsageRecord {
            id: 9,
            file_path: path.to_string(),
            usage_type: "template-background".to_string(),
            reference_id: "tpl-3".to_string(),
            reference_table: "templates".to_string(),
            created: Utc::now(),
        }
    }

    #[test]
    fn test_backend_wins_physical_facts() {
        let obj = object("public/a.png", 2048);
        let rec = record("public/a.png", true);
        let info = combine_file_data("public/a.png", Some(&obj), Some(&rec), vec![]);

        assert_eq!(info.size, 2048);
        assert_eq!(info.content_type, "image/png");
        assert_eq!(info.content_hash.as_deref(), Some("etag-1"));
        assert_eq!(info.url, "https://cdn.example.com/public/a.png");
        assert_eq!(info.created, obj.created);
        // Policy facts come from the record
        assert!(info.is_protected);
        assert!(info.is_public);
        assert!(info.is_from_backend);
        assert_eq!(info.file_type, FileType::Image);
    }

    #[test]
    fn test_missing_record_defaults_to_unprotected() {
        let obj = object("a.png", 10);
        let info = combine_file_data("a.png", Some(&obj), None, vec![]);
        assert!(!info.is_protected);
        assert!(!info.is_in_use);
        assert!(info.usages.is_empty());
    }

    #[test]
    fn test_orphaned_record() {
        let rec = record("gone.png", false);
        let info = combine_file_data("gone.png", None, Some(&rec), vec![]);
        assert!(!info.is_from_backend);
        assert_eq!(info.size, 0);
        assert_eq!(info.content_hash.as_deref(), Some("db-hash"));
        assert_eq!(info.created, Some(rec.created));
    }

    #[test]
    fn test_usages_drive_is_in_use() {
        let obj = object("bg.png", 1);
        let info = combine_file_data("bg.png", Some(&obj), None, vec![usage("bg.png")]);
        assert!(info.is_in_use);
        assert_eq!(info.usages.len(), 1);
    }

    #[test]
    fn test_directory_defaults_are_permissive() {
        let tally = DirectoryTally::default();
        let info = combine_directory_data("assets", None, &tally, true);

        assert!(info.permissions.allow_uploads);
        assert!(info.permissions.allow_delete);
        assert!(info.permissions.allow_create_sub_dirs);
        assert!(info.permissions.allow_move);
        assert!(info.permissions.allow_delete_files);
        assert!(info.permissions.allow_move_files);
        assert!(!info.is_protected);
        assert!(!info.protect_children);
        assert_eq!(info.name, "assets");
    }

    #[test]
    fn test_directory_record_wins_policy() {
        let rec = DirectoryRecord {
            id: 2,
            path: "assets/icons".to_string(),
            parent_path: "assets".to_string(),
            name: "icons".to_string(),
            permissions: DirectoryPermissions::locked(),
            is_protected: true,
            protect_children: true,
            created: Utc::now(),
            updated: None,
        };
        let mut tally = DirectoryTally::default();
        tally.observe_file(&object("assets/icons/x.png", 5));
        tally.folder_count = 2;

        let info = combine_directory_data("assets/icons", Some(&rec), &tally, true);
        assert!(!info.permissions.allow_uploads);
        assert!(info.is_protected);
        assert!(info.protect_children);
        assert_eq!(info.file_count, 1);
        assert_eq!(info.folder_count, 2);
        assert_eq!(info.total_size, 5);
    }

    #[test]
    fn test_tally_timestamp_folding() {
        let mut tally = DirectoryTally::default();
        tally.observe_file(&object("a", 1));
        let mut later = object("b", 1);
        later.created = Some(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
        later.last_modified = Some(Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap());
        tally.observe_file(&later);

        assert_eq!(
            tally.created,
            Some(Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap())
        );
        assert_eq!(
            tally.last_modified,
            Some(Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(tally.file_count, 2);
    }
}
