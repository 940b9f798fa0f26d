//! S3-compatible object storage backend.
//!
//! Talks to any ListObjectsV2-era object store (AWS S3, MinIO, R2, ...)
//! over plain REST with AWS Signature Version 4, avoiding a heavyweight
//! vendor SDK. Directories are simulated: a zero-byte key with a trailing
//! slash marks an empty folder, and delimited listings surface child
//! prefixes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;

use crate::error::{DepotError, Result};

use super::{
    content_type_for, extract_xml_tag, hmac_sha256, sha256_hex, xml_blocks, xml_unescape,
    BackendObject, ObjectListing, SignedUpload, StoragePort,
};

/// Configuration for an S3-compatible bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Bucket name.
    pub bucket: String,
    /// Region used in the signature scope.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services. Defaults to AWS.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Access key ID.
    pub access_key: String,
    /// Secret access key.
    #[serde(default)]
    pub secret_key: String,
    /// Use path-style addressing (`endpoint/bucket/key`) instead of
    /// virtual-hosted style.
    #[serde(default)]
    pub path_style: bool,
    /// Public base URL for access links (e.g. a CDN). Defaults to the
    /// bucket endpoint.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// S3-compatible [`StoragePort`] implementation.
pub struct BucketBackend {
    config: BucketConfig,
    client: Client,
}

impl BucketBackend {
    /// Create a new bucket backend.
    pub fn new(config: BucketConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.config.region),
        }
    }

    /// Percent-encode a key, keeping `/` separators intact.
    fn encode_key(key: &str) -> String {
        key.split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Build the request URL for a key (without query string).
    fn build_url(&self, key: &str) -> String {
        let endpoint = self.endpoint();
        let key = Self::encode_key(key);

        if self.config.path_style {
            if key.is_empty() {
                format!("{}/{}", endpoint, self.config.bucket)
            } else {
                format!("{}/{}/{}", endpoint, self.config.bucket, key)
            }
        } else {
            let stripped = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            let scheme = if endpoint.starts_with("http://") {
                "http"
            } else {
                "https"
            };
            if key.is_empty() {
                format!("{}://{}.{}", scheme, self.config.bucket, stripped)
            } else {
                format!("{}://{}.{}/{}", scheme, self.config.bucket, stripped, key)
            }
        }
    }

    /// Build a sorted, encoded canonical query string.
    fn canonical_query(params: &[(String, String)]) -> String {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();
        sorted
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Sign a request with AWS Signature Version 4, returning the
    /// `Authorization` header value.
    fn sign_request(
        &self,
        method: &str,
        url: &str,
        query: &str,
        headers: &mut BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        let parsed =
            url::Url::parse(url).map_err(|e| DepotError::Config(format!("bad bucket URL: {e}")))?;
        headers.insert(
            "host".to_string(),
            parsed.host_str().unwrap_or_default().to_string(),
        );

        let signed_headers = headers
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            parsed.path(),
            query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signature = hex::encode(self.signing_key(&date_stamp, string_to_sign.as_bytes()));

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key, credential_scope, signed_headers, signature
        ))
    }

    /// Derive the SigV4 signing key for a date and sign `data` with it.
    fn signing_key(&self, date_stamp: &str, data: &[u8]) -> Vec<u8> {
        let k_date = hmac_sha256(
            format!("AWS4{}", self.config.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.config.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        hmac_sha256(&k_signing, data)
    }

    /// Make a signed request against the bucket.
    async fn request(
        &self,
        method: Method,
        key: &str,
        params: &[(String, String)],
        body: Option<Vec<u8>>,
        extra_headers: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let query = Self::canonical_query(params);
        let base_url = self.build_url(key);
        let url = if query.is_empty() {
            base_url
        } else {
            format!("{base_url}?{query}")
        };

        let payload_hash = sha256_hex(body.as_deref().unwrap_or_default());

        let mut headers = BTreeMap::new();
        for (k, v) in extra_headers {
            headers.insert(k.to_string(), v.to_string());
        }
        let authorization = self.sign_request(
            method.as_str(),
            &url,
            &query,
            &mut headers,
            &payload_hash,
            Utc::now(),
        )?;

        let mut request = self.client.request(method, &url);
        for (k, v) in &headers {
            if k != "host" {
                request = request.header(k, v);
            }
        }
        request = request.header("Authorization", authorization);
        if let Some(body) = body {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }

    /// Parse a ListObjectsV2 response into a listing page.
    fn parse_list_response(&self, xml: &str) -> ObjectListing {
        let mut listing = ObjectListing::default();

        for block in xml_blocks(xml, "CommonPrefixes") {
            if let Some(prefix) = extract_xml_tag(block, "Prefix") {
                let prefix = xml_unescape(&prefix);
                let logical = prefix.trim_end_matches('/').to_string();
                if !logical.is_empty() && !listing.common_prefixes.contains(&logical) {
                    listing.common_prefixes.push(logical);
                }
            }
        }

        for block in xml_blocks(xml, "Contents") {
            let Some(key) = extract_xml_tag(block, "Key") else {
                continue;
            };
            let key = xml_unescape(&key);
            let size: u64 = extract_xml_tag(block, "Size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let last_modified = extract_xml_tag(block, "LastModified")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            let etag = extract_xml_tag(block, "ETag")
                .map(|s| xml_unescape(&s).trim_matches('"').to_string());

            listing.objects.push(BackendObject {
                content_type: if key.ends_with('/') {
                    "application/x-directory".to_string()
                } else {
                    content_type_for(&key)
                },
                url: self.url_for(key.trim_end_matches('/')),
                path: key,
                size,
                content_hash: etag,
                created: None,
                last_modified,
            });
        }

        listing.next_cursor =
            extract_xml_tag(xml, "NextContinuationToken").map(|t| xml_unescape(&t));
        listing
    }

    /// Build a backend object from a HEAD response.
    fn object_from_head(&self, path: &str, response: &reqwest::Response) -> BackendObject {
        let headers = response.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        BackendObject {
            path: path.to_string(),
            size: header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            content_type: header("content-type").unwrap_or_else(|| content_type_for(path)),
            content_hash: header("etag").map(|v| v.trim_matches('"').to_string()),
            url: self.url_for(path),
            created: None,
            last_modified: header("last-modified")
                .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<reqwest::Response>> {
        let response = self.request(Method::HEAD, key, &[], None, &[]).await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(DepotError::Backend(format!(
                "HEAD '{key}' failed with status {status}"
            ))),
        }
    }
}

#[async_trait]
impl StoragePort for BucketBackend {
    fn name(&self) -> &'static str {
        "bucket"
    }

    fn url_for(&self, path: &str) -> String {
        match &self.config.public_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                Self::encode_key(path)
            ),
            None => self.build_url(path),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        if self.head(path).await?.is_some() {
            return Ok(true);
        }
        // Simulated directory: a marker key or any key under the prefix
        if self.head(&format!("{path}/")).await?.is_some() {
            return Ok(true);
        }
        let page = self.list(path, false, None, 1).await?;
        Ok(!page.objects.is_empty())
    }

    async fn upload(
        &self,
        path: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<BackendObject> {
        let response = self
            .request(
                Method::PUT,
                path,
                &[],
                Some(content.to_vec()),
                &[("content-type", content_type)],
            )
            .await?;
        if !response.status().is_success() {
            return Err(DepotError::Backend(format!(
                "upload of '{path}' failed with status {}",
                response.status()
            )));
        }

        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        Ok(BackendObject {
            path: path.to_string(),
            size: content.len() as u64,
            content_type: content_type.to_string(),
            content_hash: etag,
            url: self.url_for(path),
            created: Some(Utc::now()),
            last_modified: Some(Utc::now()),
        })
    }

    async fn list(
        &self,
        prefix: &str,
        delimited: bool,
        cursor: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectListing> {
        let mut params: Vec<(String, String)> = vec![
            ("list-type".to_string(), "2".to_string()),
            ("max-keys".to_string(), max_keys.to_string()),
        ];
        let prefix = crate::path::as_prefix(prefix.trim_end_matches('/'));
        if !prefix.is_empty() {
            params.push(("prefix".to_string(), prefix));
        }
        if delimited {
            params.push(("delimiter".to_string(), "/".to_string()));
        }
        if let Some(token) = cursor {
            params.push(("continuation-token".to_string(), token.to_string()));
        }

        let response = self.request(Method::GET, "", &params, None, &[]).await?;
        if response.status() != StatusCode::OK {
            return Err(DepotError::Backend(format!(
                "listing failed with status {}",
                response.status()
            )));
        }

        let xml = response.text().await?;
        Ok(self.parse_list_response(&xml))
    }

    async fn create_marker(&self, path: &str) -> Result<()> {
        let marker = format!("{}/", path.trim_end_matches('/'));
        let response = self
            .request(
                Method::PUT,
                &marker,
                &[],
                Some(Vec::new()),
                &[("content-type", "application/x-directory")],
            )
            .await?;
        if !response.status().is_success() {
            return Err(DepotError::Backend(format!(
                "creating folder marker '{marker}' failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = format!(
            "/{}/{}",
            self.config.bucket,
            Self::encode_key(from)
        );
        let response = self
            .request(
                Method::PUT,
                to,
                &[],
                None,
                &[("x-amz-copy-source", source.as_str())],
            )
            .await?;
        if !response.status().is_success() {
            return Err(DepotError::Backend(format!(
                "copy '{from}' -> '{to}' failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        // DELETE is idempotent in object stores, so probe first to keep
        // the "was something removed" contract.
        if self.head(path).await?.is_none() {
            return Ok(false);
        }
        let response = self.request(Method::DELETE, path, &[], None, &[]).await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
            status => Err(DepotError::Backend(format!(
                "delete of '{path}' failed with status {status}"
            ))),
        }
    }

    async fn metadata(&self, path: &str) -> Result<Option<BackendObject>> {
        Ok(self
            .head(path)
            .await?
            .map(|response| self.object_from_head(path, &response)))
    }

    async fn signed_upload_url(
        &self,
        path: &str,
        content_type: &str,
        content_md5: Option<&str>,
        expires_secs: u64,
    ) -> Result<SignedUpload> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);

        let base_url = self.build_url(path);
        let parsed = url::Url::parse(&base_url)
            .map_err(|e| DepotError::Config(format!("bad bucket URL: {e}")))?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let params: Vec<(String, String)> = vec![
            (
                "X-Amz-Algorithm".to_string(),
                "AWS4-HMAC-SHA256".to_string(),
            ),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.config.access_key, credential_scope),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expires_secs.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        let query = Self::canonical_query(&params);

        let canonical_request = format!(
            "PUT\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            parsed.path(),
            query,
            host
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(self.signing_key(&date_stamp, string_to_sign.as_bytes()));

        let mut headers = vec![("Content-Type".to_string(), content_type.to_string())];
        if let Some(md5) = content_md5 {
            headers.push(("Content-MD5".to_string(), md5.to_string()));
        }

        Ok(SignedUpload {
            url: format!("{base_url}?{query}&X-Amz-Signature={signature}"),
            method: "PUT".to_string(),
            headers,
            expires_at: now + chrono::Duration::seconds(expires_secs as i64),
        })
    }
}

impl std::fmt::Debug for BucketBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketBackend")
            .field("bucket", &self.config.bucket)
            .field("region", &self.config.region)
            .field("endpoint", &self.config.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BucketConfig {
        BucketConfig {
            bucket: "assets".to_string(),
            region: "eu-west-1".to_string(),
            endpoint: None,
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
            path_style: false,
            public_url: None,
        }
    }

    fn backend(config: BucketConfig) -> BucketBackend {
        BucketBackend::new(config).unwrap()
    }

    #[test]
    fn test_build_url_virtual_hosted() {
        let b = backend(test_config());
        assert_eq!(
            b.build_url("a/b.png"),
            "https://assets.s3.eu-west-1.amazonaws.com/a/b.png"
        );
        assert_eq!(b.build_url(""), "https://assets.s3.eu-west-1.amazonaws.com");
    }

    #[test]
    fn test_build_url_path_style_custom_endpoint() {
        let mut config = test_config();
        config.endpoint = Some("http://localhost:9000".to_string());
        config.path_style = true;
        let b = backend(config);
        assert_eq!(b.build_url("a/b.png"), "http://localhost:9000/assets/a/b.png");
    }

    #[test]
    fn test_build_url_encodes_segments() {
        let b = backend(test_config());
        assert_eq!(
            b.build_url("covers/summer sale.png"),
            "https://assets.s3.eu-west-1.amazonaws.com/covers/summer%20sale.png"
        );
    }

    #[test]
    fn test_sign_request_shape() {
        let b = backend(test_config());
        let mut headers = BTreeMap::new();
        let now = DateTime::parse_from_rfc3339("2026-01-15T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let auth = b
            .sign_request(
                "GET",
                "https://assets.s3.eu-west-1.amazonaws.com/a.png",
                "",
                &mut headers,
                &sha256_hex(b""),
                now,
            )
            .unwrap();

        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260115/eu-west-1/s3/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert!(auth.contains("Signature="));
        assert_eq!(headers.get("x-amz-date").unwrap(), "20260115T103000Z");
    }

    #[test]
    fn test_signing_is_deterministic() {
        let b = backend(test_config());
        let a = b.signing_key("20260115", b"payload");
        let c = b.signing_key("20260115", b"payload");
        assert_eq!(a, c);
        assert_ne!(a, b.signing_key("20260116", b"payload"));
    }

    #[test]
    fn test_parse_list_response() {
        let b = backend(test_config());
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
    <Name>assets</Name>
    <Prefix>covers/</Prefix>
    <Contents>
        <Key>covers/summer.png</Key>
        <LastModified>2026-01-10T08:00:00.000Z</LastModified>
        <ETag>&quot;abc123&quot;</ETag>
        <Size>2048</Size>
    </Contents>
    <Contents>
        <Key>covers/archive/</Key>
        <LastModified>2026-01-09T08:00:00.000Z</LastModified>
        <Size>0</Size>
    </Contents>
    <CommonPrefixes>
        <Prefix>covers/archive/</Prefix>
    </CommonPrefixes>
    <NextContinuationToken>token-1</NextContinuationToken>
</ListBucketResult>"#;

        let listing = b.parse_list_response(xml);
        assert_eq!(listing.objects.len(), 2);
        assert_eq!(listing.objects[0].path, "covers/summer.png");
        assert_eq!(listing.objects[0].size, 2048);
        assert_eq!(listing.objects[0].content_hash.as_deref(), Some("abc123"));
        assert!(listing.objects[0].last_modified.is_some());
        assert!(listing.objects[1].is_marker());
        assert_eq!(listing.common_prefixes, vec!["covers/archive".to_string()]);
        assert_eq!(listing.next_cursor.as_deref(), Some("token-1"));
    }

    #[test]
    fn test_parse_list_response_last_page() {
        let b = backend(test_config());
        let listing = b.parse_list_response("<ListBucketResult></ListBucketResult>");
        assert!(listing.objects.is_empty());
        assert!(listing.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_signed_upload_url_shape() {
        let b = backend(test_config());
        let signed = b
            .signed_upload_url("covers/new.png", "image/png", Some("md5base64=="), 900)
            .await
            .unwrap();

        assert_eq!(signed.method, "PUT");
        assert!(signed.url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(signed.url.contains("X-Amz-Signature="));
        assert!(signed.url.contains("X-Amz-Expires=900"));
        assert!(signed
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "image/png"));
        assert!(signed
            .headers
            .iter()
            .any(|(k, v)| k == "Content-MD5" && v == "md5base64=="));
        assert!(signed.expires_at > Utc::now());
    }

    #[test]
    fn test_url_for_prefers_public_base() {
        let mut config = test_config();
        config.public_url = Some("https://cdn.example.com".to_string());
        let b = backend(config);
        assert_eq!(b.url_for("a/b.png"), "https://cdn.example.com/a/b.png");
    }
}
