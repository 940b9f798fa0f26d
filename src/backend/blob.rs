//! Shared-key blob service backend.
//!
//! Talks to an Azure-style blob REST API: container-scoped listing with
//! `NextMarker` paging, block-blob uploads, server-side copy via
//! `x-ms-copy-source`, and a shared-key authorization header computed as
//! an HMAC-SHA256 over the canonicalized request. Directories are
//! simulated exactly as in the bucket backend (trailing-slash marker
//! blobs plus `BlobPrefix` entries in delimited listings).

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;

use crate::error::{DepotError, Result};

use super::{
    content_type_for, extract_xml_tag, hmac_sha256, xml_blocks, xml_unescape, BackendObject,
    ObjectListing, SignedUpload, StoragePort,
};

const API_VERSION: &str = "2021-08-06";

/// Configuration for a shared-key blob service.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// Storage account name.
    pub account: String,
    /// Container name.
    pub container: String,
    /// Base64-encoded shared access key.
    #[serde(default)]
    pub access_key: String,
    /// Custom endpoint. Defaults to the account's public blob endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Public base URL for access links.
    #[serde(default)]
    pub public_url: Option<String>,
}

/// Shared-key blob [`StoragePort`] implementation.
pub struct BlobBackend {
    config: BlobConfig,
    client: Client,
    key: Vec<u8>,
}

impl BlobBackend {
    /// Create a new blob backend. Fails when the access key is not valid
    /// base64.
    pub fn new(config: BlobConfig) -> Result<Self> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(&config.access_key)
            .map_err(|e| DepotError::Config(format!("blob access key is not valid base64: {e}")))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            config,
            client,
            key,
        })
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.config.account),
        }
    }

    /// Percent-encode a blob name, keeping `/` separators intact.
    fn encode_name(name: &str) -> String {
        name.split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn blob_url(&self, name: &str) -> String {
        if name.is_empty() {
            format!("{}/{}", self.endpoint(), self.config.container)
        } else {
            format!(
                "{}/{}/{}",
                self.endpoint(),
                self.config.container,
                Self::encode_name(name)
            )
        }
    }

    /// Shared-key authorization header for a request.
    fn authorization(
        &self,
        method: &str,
        name: &str,
        params: &[(String, String)],
        headers: &BTreeMap<String, String>,
        content_length: usize,
        content_type: &str,
    ) -> String {
        let canonicalized_headers: String = headers
            .iter()
            .filter(|(k, _)| k.starts_with("x-ms-"))
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let mut resource = format!("/{}/{}", self.config.account, self.config.container);
        if !name.is_empty() {
            resource.push('/');
            resource.push_str(name);
        }
        let mut sorted_params: Vec<&(String, String)> = params.iter().collect();
        sorted_params.sort();
        for (k, v) in sorted_params {
            resource.push_str(&format!("\n{}:{}", k.to_ascii_lowercase(), v));
        }

        let content_length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };

        // VERB, Content-Encoding, Content-Language, Content-Length,
        // Content-MD5, Content-Type, Date, If-*, Range, then the
        // canonicalized x-ms headers and resource.
        let string_to_sign = format!(
            "{method}\n\n\n{content_length}\n\n{content_type}\n\n\n\n\n\n\n{canonicalized_headers}{resource}"
        );

        let signature = base64::engine::general_purpose::STANDARD
            .encode(hmac_sha256(&self.key, string_to_sign.as_bytes()));
        format!("SharedKey {}:{}", self.config.account, signature)
    }

    /// Make a signed request against the container.
    async fn request(
        &self,
        method: Method,
        name: &str,
        params: &[(String, String)],
        body: Option<Vec<u8>>,
        content_type: Option<&str>,
        extra_headers: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert(
            "x-ms-date".to_string(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        headers.insert("x-ms-version".to_string(), API_VERSION.to_string());
        for (k, v) in extra_headers {
            headers.insert(k.to_string(), v.to_string());
        }

        let content_length = body.as_ref().map(Vec::len).unwrap_or(0);
        let authorization = self.authorization(
            method.as_str(),
            name,
            params,
            &headers,
            content_length,
            content_type.unwrap_or(""),
        );

        let mut url = self.blob_url(name);
        if !params.is_empty() {
            let query = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{url}?{query}");
        }

        let mut request = self.client.request(method, &url);
        for (k, v) in &headers {
            request = request.header(k, v);
        }
        request = request.header("Authorization", authorization);
        if let Some(ct) = content_type {
            request = request.header("Content-Type", ct);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }

    /// Parse a container listing response into a listing page.
    fn parse_list_response(&self, xml: &str) -> ObjectListing {
        let mut listing = ObjectListing::default();

        for block in xml_blocks(xml, "BlobPrefix") {
            if let Some(name) = extract_xml_tag(block, "Name") {
                let logical = xml_unescape(&name).trim_end_matches('/').to_string();
                if !logical.is_empty() && !listing.common_prefixes.contains(&logical) {
                    listing.common_prefixes.push(logical);
                }
            }
        }

        for block in xml_blocks(xml, "Blob") {
            let Some(name) = extract_xml_tag(block, "Name") else {
                continue;
            };
            let name = xml_unescape(&name);
            let size: u64 = extract_xml_tag(block, "Content-Length")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let content_type = extract_xml_tag(block, "Content-Type")
                .map(|s| xml_unescape(&s))
                .unwrap_or_else(|| {
                    if name.ends_with('/') {
                        "application/x-directory".to_string()
                    } else {
                        content_type_for(&name)
                    }
                });
            let last_modified = extract_xml_tag(block, "Last-Modified")
                .and_then(|s| DateTime::parse_from_rfc2822(&s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            let created = extract_xml_tag(block, "Creation-Time")
                .and_then(|s| DateTime::parse_from_rfc2822(&s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            let etag = extract_xml_tag(block, "Etag").map(|s| xml_unescape(&s));

            listing.objects.push(BackendObject {
                url: self.url_for(name.trim_end_matches('/')),
                path: name,
                size,
                content_type,
                content_hash: etag,
                created,
                last_modified,
            });
        }

        listing.next_cursor = extract_xml_tag(xml, "NextMarker").map(|t| xml_unescape(&t));
        listing
    }

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
            created: header("x-ms-creation-time")
                .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            last_modified: header("last-modified")
                .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }

    async fn head(&self, name: &str) -> Result<Option<reqwest::Response>> {
        let response = self
            .request(Method::HEAD, name, &[], None, None, &[])
            .await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(DepotError::Backend(format!(
                "HEAD '{name}' failed with status {status}"
            ))),
        }
    }
}

#[async_trait]
impl StoragePort for BlobBackend {
    fn name(&self) -> &'static str {
        "blob"
    }

    fn url_for(&self, path: &str) -> String {
        match &self.config.public_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                Self::encode_name(path)
            ),
            None => self.blob_url(path),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        if self.head(path).await?.is_some() {
            return Ok(true);
        }
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
                Some(content_type),
                &[("x-ms-blob-type", "BlockBlob")],
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
            ("restype".to_string(), "container".to_string()),
            ("comp".to_string(), "list".to_string()),
            ("maxresults".to_string(), max_keys.to_string()),
        ];
        let prefix = crate::path::as_prefix(prefix.trim_end_matches('/'));
        if !prefix.is_empty() {
            params.push(("prefix".to_string(), prefix));
        }
        if delimited {
            params.push(("delimiter".to_string(), "/".to_string()));
        }
        if let Some(marker) = cursor {
            params.push(("marker".to_string(), marker.to_string()));
        }

        let response = self
            .request(Method::GET, "", &params, None, None, &[])
            .await?;
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
                Some("application/x-directory"),
                &[("x-ms-blob-type", "BlockBlob")],
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
        let source = self.blob_url(from);
        let response = self
            .request(
                Method::PUT,
                to,
                &[],
                None,
                None,
                &[("x-ms-copy-source", source.as_str())],
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
        if self.head(path).await?.is_none() {
            return Ok(false);
        }
        let response = self
            .request(Method::DELETE, path, &[], None, None, &[])
            .await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK | StatusCode::NO_CONTENT => Ok(true),
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
        let expires_at = Utc::now() + chrono::Duration::seconds(expires_secs as i64);
        let expiry = expires_at.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        // Write-only token over method, resource, and expiry, in the
        // shared-key style of the service.
        let string_to_sign = format!(
            "PUT\n/{}/{}/{}\n{}\nw",
            self.config.account, self.config.container, path, expiry
        );
        let signature = base64::engine::general_purpose::STANDARD
            .encode(hmac_sha256(&self.key, string_to_sign.as_bytes()));

        let mut headers = vec![
            ("Content-Type".to_string(), content_type.to_string()),
            ("x-ms-blob-type".to_string(), "BlockBlob".to_string()),
        ];
        if let Some(md5) = content_md5 {
            headers.push(("Content-MD5".to_string(), md5.to_string()));
        }

        Ok(SignedUpload {
            url: format!(
                "{}?sp=w&se={}&sv={}&sig={}",
                self.blob_url(path),
                urlencoding::encode(&expiry),
                API_VERSION,
                urlencoding::encode(&signature)
            ),
            method: "PUT".to_string(),
            headers,
            expires_at,
        })
    }
}

impl std::fmt::Debug for BlobBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobBackend")
            .field("account", &self.config.account)
            .field("container", &self.config.container)
            .field("endpoint", &self.config.endpoint)
            .finish()
    }
}
