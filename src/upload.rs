//! Upload validation and the upload-location policy table.
//!
//! Upload locations map logical tags to a base path and a content-type
//! allow-list. Validation consults the policy before any signed-URL
//! issuance: a path under a policed location only accepts the listed
//! content types.

use crate::path::{self, ValidationError};

/// Default maximum upload size (100MB).
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// A logical upload location with its content-type policy.
#[derive(Debug, Clone, Copy)]
pub struct UploadLocation {
    /// Logical tag, e.g. "template-cover".
    pub tag: &'static str,
    /// Base path the location covers.
    pub base_path: &'static str,
    /// Allowed content types. Empty means unrestricted.
    pub allowed_types: &'static [&'static str],
}

/// Static policy table. Longest base path wins when locations nest.
pub const UPLOAD_LOCATIONS: &[UploadLocation] = &[
    UploadLocation {
        tag: "template-cover",
        base_path: "templates/covers",
        allowed_types: &["image/jpeg", "image/png", "image/webp"],
    },
    UploadLocation {
        tag: "template-asset",
        base_path: "templates/assets",
        allowed_types: &[
            "image/jpeg",
            "image/png",
            "image/webp",
            "image/gif",
            "image/svg+xml",
            "video/mp4",
            "video/webm",
            "audio/mpeg",
            "audio/ogg",
        ],
    },
    UploadLocation {
        tag: "avatar",
        base_path: "users/avatars",
        allowed_types: &["image/jpeg", "image/png", "image/webp"],
    },
    UploadLocation {
        tag: "public-asset",
        base_path: "public",
        allowed_types: &[],
    },
];

/// Find the upload location governing a path, if any.
///
/// The longest matching base path wins, so nested locations can tighten
/// the policy of their parent.
pub fn location_for_path(logical_path: &str) -> Option<&'static UploadLocation> {
    UPLOAD_LOCATIONS
        .iter()
        .filter(|loc| {
            logical_path == loc.base_path
                || logical_path.starts_with(&format!("{}/", loc.base_path))
        })
        .max_by_key(|loc| loc.base_path.len())
}

/// Look up an upload location by its logical tag.
pub fn location_by_tag(tag: &str) -> Option<&'static UploadLocation> {
    UPLOAD_LOCATIONS.iter().find(|loc| loc.tag == tag)
}

/// Validate an upload before any backend or repository I/O.
///
/// Composes path and filename checks, enforces the size ceiling, and
/// applies the location policy when one covers the path.
pub fn validate_upload(
    logical_path: &str,
    size: u64,
    content_type: &str,
    max_size: u64,
) -> Result<(), ValidationError> {
    path::validate_path(logical_path)?;
    path::validate_file_name(path::file_name(logical_path))?;

    if size > max_size {
        return Err(ValidationError::FileTooLarge {
            size,
            max: max_size,
        });
    }

    if let Some(location) = location_for_path(logical_path) {
        if !location.allowed_types.is_empty() {
            let ct = content_type
                .split(';')
                .next()
                .unwrap_or(content_type)
                .trim()
                .to_ascii_lowercase();
            if !location.allowed_types.contains(&ct.as_str()) {
                return Err(ValidationError::ContentTypeNotAllowed {
                    content_type: content_type.to_string(),
                    location: location.tag.to_string(),
                });
            }
        }
    }

    Ok(())
}
