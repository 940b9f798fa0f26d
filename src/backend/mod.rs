//! Storage backend adapters for depot.
//!
//! Every physical storage technology implements the same [`StoragePort`]
//! contract: existence checks, uploads, paginated prefix listings with
//! delimiter semantics, copy, delete, and single-item metadata. The rest
//! of the crate only ever talks to `dyn StoragePort`.
//!
//! Normalization rules shared by all adapters:
//! - Directories are reported through `common_prefixes` (logical paths
//!   without a trailing slash) and, in non-delimited walks, as zero-byte
//!   objects whose path carries a trailing slash (directory markers).
//!   Marker objects never surface as files.
//! - No path outside the configured root/bucket/container is ever
//!   touched.
//! - Listings paginate through an opaque `cursor`; a session terminates
//!   once an adapter reports no further cursor.

mod blob;
mod bucket;
mod local;

pub use blob::{BlobBackend, BlobConfig};
pub use bucket::{BucketBackend, BucketConfig};
pub use local::LocalBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Default page size for listings.
pub const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

/// A file (or directory marker) as observed in a physical backend.
#[derive(Debug, Clone)]
pub struct BackendObject {
    /// Logical path. Directory markers carry a trailing slash.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME content type.
    pub content_type: String,
    /// Backend-dependent content hash (etag, MD5, ...), when available.
    pub content_hash: Option<String>,
    /// Access URL.
    pub url: String,
    /// Creation timestamp, when the backend reports one.
    pub created: Option<DateTime<Utc>>,
    /// Last modification timestamp, when the backend reports one.
    pub last_modified: Option<DateTime<Utc>>,
}

impl BackendObject {
    /// Whether this object is a zero-byte directory marker.
    pub fn is_marker(&self) -> bool {
        self.path.ends_with('/')
    }
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    /// Objects on this page.
    pub objects: Vec<BackendObject>,
    /// Distinct immediate child-directory paths (delimited listings
    /// only), without trailing slashes.
    pub common_prefixes: Vec<String>,
    /// Opaque cursor for the next page, absent on the last page.
    pub next_cursor: Option<String>,
}

/// A signed upload target issued by a backend.
#[derive(Debug, Clone)]
pub struct SignedUpload {
    /// URL the client PUTs the content to.
    pub url: String,
    /// HTTP method to use.
    pub method: String,
    /// Headers the client must send.
    pub headers: Vec<(String, String)>,
    /// When the URL stops being valid.
    pub expires_at: DateTime<Utc>,
}

/// Technology-neutral contract implemented by every backend adapter.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Short technology name ("local", "bucket", "blob").
    fn name(&self) -> &'static str;

    /// Public access URL for a logical path.
    fn url_for(&self, path: &str) -> String;

    /// Whether a file or (simulated or native) directory exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Upload content to a logical path.
    async fn upload(&self, path: &str, content: &[u8], content_type: &str)
        -> Result<BackendObject>;

    /// List one page under a prefix.
    ///
    /// With `delimited` set, the listing stops at the first level:
    /// immediate files land in `objects` and immediate child directories
    /// in `common_prefixes`. Without it, the listing walks the whole
    /// subtree (directory markers included, with trailing slashes).
    async fn list(
        &self,
        prefix: &str,
        delimited: bool,
        cursor: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectListing>;

    /// Create an empty-directory marker so the directory is observable
    /// before it holds any file.
    async fn create_marker(&self, path: &str) -> Result<()>;

    /// Copy a single file to a new logical path.
    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Delete a single file (or directory marker). Returns whether
    /// something was removed.
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Metadata for a single file, or `None` when the path does not
    /// name a file.
    async fn metadata(&self, path: &str) -> Result<Option<BackendObject>>;

    /// Issue a signed upload URL for a logical path.
    async fn signed_upload_url(
        &self,
        path: &str,
        content_type: &str,
        content_md5: Option<&str>,
        expires_secs: u64,
    ) -> Result<SignedUpload>;
}

/// Drain every page of a listing into one aggregate.
///
/// Converges as soon as the adapter stops reporting a next cursor.
pub async fn list_all(
    port: &dyn StoragePort,
    prefix: &str,
    delimited: bool,
) -> Result<ObjectListing> {
    let mut aggregate = ObjectListing::default();
    let mut cursor: Option<String> = None;

    loop {
        let page = port
            .list(prefix, delimited, cursor.as_deref(), DEFAULT_LIST_PAGE_SIZE)
            .await?;
        aggregate.objects.extend(page.objects);
        for p in page.common_prefixes {
            if !aggregate.common_prefixes.contains(&p) {
                aggregate.common_prefixes.push(p);
            }
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(aggregate)
}

/// Guess a MIME content type from a path's extension.
pub(crate) fn content_type_for(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// HMAC-SHA256 of `data` under `key`.
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac =
        <Hmac<Sha256>>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Lowercase hex SHA-256 digest of `data`.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Extract the text content of the first `<tag>...</tag>` occurrence.
pub(crate) fn extract_xml_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    let text = xml[start..end].trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Iterate the inner content of every `<tag>...</tag>` block.
pub(crate) fn xml_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let inner_start = start + open.len();
        let Some(end) = rest[inner_start..].find(&close) else {
            break;
        };
        blocks.push(&rest[inner_start..inner_start + end]);
        rest = &rest[inner_start + end + close.len()..];
    }
    blocks
}

/// Decode the XML entities that appear in listing responses.
pub(crate) fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_detection() {
        let marker = BackendObject {
            path: "a/b/".to_string(),
            size: 0,
            content_type: "application/x-directory".to_string(),
            content_hash: None,
            url: String::new(),
            created: None,
            last_modified: None,
        };
        assert!(marker.is_marker());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a/b/photo.png"), "image/png");
        assert_eq!(content_type_for("doc.pdf"), "application/pdf");
        assert_eq!(content_type_for("blob.unknownext"), "application/octet-stream");
    }

    #[test]
    fn test_extract_xml_tag() {
        let xml = "<Result><Key>a/b.txt</Key><Size>42</Size><Empty></Empty></Result>";
        assert_eq!(extract_xml_tag(xml, "Key").as_deref(), Some("a/b.txt"));
        assert_eq!(extract_xml_tag(xml, "Size").as_deref(), Some("42"));
        assert_eq!(extract_xml_tag(xml, "Empty"), None);
        assert_eq!(extract_xml_tag(xml, "Missing"), None);
    }

    #[test]
    fn test_xml_blocks() {
        let xml = "<L><C><Key>a</Key></C><C><Key>b</Key></C></L>";
        let blocks = xml_blocks(xml, "C");
        assert_eq!(blocks.len(), 2);
        assert_eq!(extract_xml_tag(blocks[0], "Key").as_deref(), Some("a"));
        assert_eq!(extract_xml_tag(blocks[1], "Key").as_deref(), Some("b"));
    }

    #[test]
    fn test_xml_unescape() {
        assert_eq!(xml_unescape("a &amp; b &lt;c&gt;"), "a & b <c>");
    }

    #[test]
    fn test_sha256_hex_of_empty_payload() {
        // Well-known digest of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hmac_sha256_is_keyed() {
        assert_ne!(hmac_sha256(b"key-a", b"data"), hmac_sha256(b"key-b", b"data"));
        assert_eq!(hmac_sha256(b"key-a", b"data").len(), 32);
    }
}
