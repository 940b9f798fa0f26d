//! Path and filename validation for depot.
//!
//! Logical storage paths are forward-slash separated, carry no leading or
//! trailing slash, and may not contain traversal segments. Every entry point
//! into the service validates its paths here before any backend or
//! repository I/O happens.

use thiserror::Error;

/// Maximum length for a logical path (in characters).
pub const MAX_PATH_LENGTH: usize = 1024;

/// Maximum length for a single file or folder name (in characters).
pub const MAX_FILE_NAME_LENGTH: usize = 255;

/// Prefix under which items are considered publicly accessible.
pub const PUBLIC_PREFIX: &str = "public/";

/// Validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Path is empty.
    #[error("path cannot be empty")]
    PathEmpty,

    /// Path is too long.
    #[error("path must be at most {MAX_PATH_LENGTH} characters")]
    PathTooLong,

    /// Path contains a `..` or `.` traversal segment.
    #[error("path cannot contain traversal segments")]
    PathTraversal,

    /// Path contains an empty segment (leading, trailing, or doubled slash).
    #[error("path cannot contain empty segments")]
    PathEmptySegment,

    /// Path contains disallowed characters.
    #[error("path contains invalid characters")]
    PathInvalidChars,

    /// File name is empty.
    #[error("file name cannot be empty")]
    FileNameEmpty,

    /// File name is too long.
    #[error("file name must be at most {MAX_FILE_NAME_LENGTH} characters")]
    FileNameTooLong,

    /// File name contains a path separator.
    #[error("file name cannot contain '/'")]
    FileNameIsPath,

    /// File name contains disallowed characters.
    #[error("file name contains invalid characters")]
    FileNameInvalidChars,

    /// Upload exceeds the configured size ceiling.
    #[error("file size {size} exceeds maximum {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    /// Content type is not allowed at the targeted upload location.
    #[error("content type '{content_type}' is not allowed for {location}")]
    ContentTypeNotAllowed {
        content_type: String,
        location: String,
    },
}

/// Check whether a character is allowed inside a path segment.
fn is_allowed_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ' | '(' | ')')
}

/// Validate a logical storage path.
///
/// Rejects empty paths, traversal segments (`..`, `.`), empty segments
/// (leading, trailing, or doubled slashes), disallowed characters, and
/// paths longer than [`MAX_PATH_LENGTH`].
pub fn validate_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::PathEmpty);
    }
    if path.chars().count() > MAX_PATH_LENGTH {
        return Err(ValidationError::PathTooLong);
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(ValidationError::PathEmptySegment);
        }
        if segment == ".." || segment == "." {
            return Err(ValidationError::PathTraversal);
        }
        if !segment.chars().all(is_allowed_char) {
            return Err(ValidationError::PathInvalidChars);
        }
    }
    Ok(())
}

/// Validate a single file or folder name.
pub fn validate_file_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::FileNameEmpty);
    }
    if name.chars().count() > MAX_FILE_NAME_LENGTH {
        return Err(ValidationError::FileNameTooLong);
    }
    if name.contains('/') {
        return Err(ValidationError::FileNameIsPath);
    }
    if name == ".." || name == "." {
        return Err(ValidationError::PathTraversal);
    }
    if !name.chars().all(is_allowed_char) {
        return Err(ValidationError::FileNameInvalidChars);
    }
    Ok(())
}

/// Extract the basename of a path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Extract the parent path. Top-level items have an empty parent.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Join a directory path and a name into a logical path.
///
/// An empty directory path refers to the root.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Whether a path falls under the public prefix.
pub fn is_public(path: &str) -> bool {
    path.starts_with(PUBLIC_PREFIX) || path == PUBLIC_PREFIX.trim_end_matches('/')
}

/// Turn a directory path into a listing prefix (`"a/b"` -> `"a/b/"`,
/// root stays empty).
pub fn as_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

/// The path of a descendant relative to a directory prefix, if it is one.
pub fn relative_to<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    if dir.is_empty() {
        return Some(path);
    }
    path.strip_prefix(dir)
        .and_then(|rest| rest.strip_prefix('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_ok() {
        assert!(validate_path("file.txt").is_ok());
        assert!(validate_path("templates/covers/summer.png").is_ok());
        assert!(validate_path("public/hero image (1).jpg").is_ok());
        assert!(validate_path("docs/レポート.pdf").is_ok());
    }

    #[test]
    fn test_validate_path_empty() {
        assert_eq!(validate_path(""), Err(ValidationError::PathEmpty));
    }

    #[test]
    fn test_validate_path_traversal() {
        assert_eq!(
            validate_path("a/../b.txt"),
            Err(ValidationError::PathTraversal)
        );
        assert_eq!(validate_path(".."), Err(ValidationError::PathTraversal));
        assert_eq!(
            validate_path("a/./b.txt"),
            Err(ValidationError::PathTraversal)
        );
    }

    #[test]
    fn test_validate_path_empty_segments() {
        assert_eq!(
            validate_path("a//b.txt"),
            Err(ValidationError::PathEmptySegment)
        );
        assert_eq!(
            validate_path("/a/b.txt"),
            Err(ValidationError::PathEmptySegment)
        );
        assert_eq!(
            validate_path("a/b/"),
            Err(ValidationError::PathEmptySegment)
        );
    }

    #[test]
    fn test_validate_path_invalid_chars() {
        assert_eq!(
            validate_path("a/b\\c.txt"),
            Err(ValidationError::PathInvalidChars)
        );
        assert_eq!(
            validate_path("a/b?.txt"),
            Err(ValidationError::PathInvalidChars)
        );
        assert_eq!(
            validate_path("a/b\0.txt"),
            Err(ValidationError::PathInvalidChars)
        );
    }

    #[test]
    fn test_validate_path_too_long() {
        let long = "a/".repeat(600) + "f.txt";
        assert_eq!(validate_path(&long), Err(ValidationError::PathTooLong));
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("report.pdf").is_ok());
        assert!(validate_file_name("cover (final).png").is_ok());
        assert_eq!(validate_file_name(""), Err(ValidationError::FileNameEmpty));
        assert_eq!(
            validate_file_name("a/b.txt"),
            Err(ValidationError::FileNameIsPath)
        );
        assert_eq!(
            validate_file_name("nul\0"),
            Err(ValidationError::FileNameInvalidChars)
        );
        let long = "a".repeat(256);
        assert_eq!(
            validate_file_name(&long),
            Err(ValidationError::FileNameTooLong)
        );
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(file_name("c.txt"), "c.txt");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("a/b/c.txt"), "a/b");
        assert_eq!(parent_path("c.txt"), "");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("a/b", "c.txt"), "a/b/c.txt");
        assert_eq!(join("", "c.txt"), "c.txt");
    }

    #[test]
    fn test_is_public() {
        assert!(is_public("public/banner.png"));
        assert!(is_public("public"));
        assert!(!is_public("private/banner.png"));
        assert!(!is_public("publicity/banner.png"));
    }

    #[test]
    fn test_as_prefix() {
        assert_eq!(as_prefix(""), "");
        assert_eq!(as_prefix("a/b"), "a/b/");
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("a/b/c.txt", "a/b"), Some("c.txt"));
        assert_eq!(relative_to("a/b/c.txt", ""), Some("a/b/c.txt"));
        assert_eq!(relative_to("a/bc/c.txt", "a/b"), None);
    }
}
