//! Configuration module for depot.

use serde::Deserialize;
use std::path::Path;

use crate::backend::{BlobConfig, BucketConfig};
use crate::{DepotError, Result};

/// Storage backend selection and per-technology settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend to serve: "local", "bucket", or "blob".
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Local filesystem settings.
    #[serde(default)]
    pub local: LocalStorageConfig,
    /// S3-compatible bucket settings (required when backend = "bucket").
    #[serde(default)]
    pub bucket: Option<BucketConfig>,
    /// Blob service settings (required when backend = "blob").
    #[serde(default)]
    pub blob: Option<BlobConfig>,
}

fn default_backend() -> String {
    "local".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            local: LocalStorageConfig::default(),
            bucket: None,
            blob: None,
        }
    }
}

/// Local filesystem backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Base directory for stored files.
    #[serde(default = "default_local_root")]
    pub root: String,
    /// Public base URL for access links.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_local_root() -> String {
    "data/storage".to_string()
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root: default_local_root(),
            public_url: None,
        }
    }
}

/// Upload and listing limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum upload size in megabytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size_mb: u64,
    /// Lifetime of signed upload URLs in seconds.
    #[serde(default = "default_signed_url_ttl")]
    pub signed_url_ttl_secs: u64,
}

fn default_max_upload_size() -> u64 {
    100
}

fn default_signed_url_ttl() -> u64 {
    900
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_size_mb: default_max_upload_size(),
            signed_url_ttl_secs: default_signed_url_ttl(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/depot.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Limits configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(DepotError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment
    /// variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| DepotError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `DEPOT_BUCKET_SECRET_KEY`: secret key for the bucket backend
    /// - `DEPOT_BLOB_ACCESS_KEY`: shared key for the blob backend
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("DEPOT_BUCKET_SECRET_KEY") {
            if !secret.is_empty() {
                if let Some(bucket) = &mut self.storage.bucket {
                    bucket.secret_key = secret;
                }
            }
        }
        if let Ok(key) = std::env::var("DEPOT_BLOB_ACCESS_KEY") {
            if !key.is_empty() {
                if let Some(blob) = &mut self.storage.blob {
                    blob.access_key = key;
                }
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - the backend selection is not one of local/bucket/blob
    /// - the selected backend's section or credentials are missing
    pub fn validate(&self) -> Result<()> {
        match self.storage.backend.as_str() {
            "local" => {
                if self.storage.local.root.is_empty() {
                    return Err(DepotError::Config(
                        "storage.local.root must not be empty".to_string(),
                    ));
                }
            }
            "bucket" => match &self.storage.bucket {
                None => {
                    return Err(DepotError::Config(
                        "backend 'bucket' selected but [storage.bucket] is missing".to_string(),
                    ))
                }
                Some(bucket) => {
                    if bucket.bucket.is_empty() || bucket.access_key.is_empty() {
                        return Err(DepotError::Config(
                            "storage.bucket requires bucket and access_key. \
                             Set the secret via DEPOT_BUCKET_SECRET_KEY if not in the file."
                                .to_string(),
                        ));
                    }
                    if bucket.secret_key.is_empty() {
                        return Err(DepotError::Config(
                            "storage.bucket.secret_key is not set. \
                             Set it in the config file or via DEPOT_BUCKET_SECRET_KEY."
                                .to_string(),
                        ));
                    }
                }
            },
            "blob" => match &self.storage.blob {
                None => {
                    return Err(DepotError::Config(
                        "backend 'blob' selected but [storage.blob] is missing".to_string(),
                    ))
                }
                Some(blob) => {
                    if blob.account.is_empty() || blob.container.is_empty() {
                        return Err(DepotError::Config(
                            "storage.blob requires account and container".to_string(),
                        ));
                    }
                    if blob.access_key.is_empty() {
                        return Err(DepotError::Config(
                            "storage.blob.access_key is not set. \
                             Set it in the config file or via DEPOT_BLOB_ACCESS_KEY."
                                .to_string(),
                        ));
                    }
                }
            },
            other => {
                return Err(DepotError::Config(format!(
                    "unknown storage backend '{other}' (expected local, bucket, or blob)"
                )))
            }
        }
        Ok(())
    }
}
