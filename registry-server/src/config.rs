//! # Configuration Management
//!
//! Server settings, storage location, publisher allow-list, upload limits and
//! staging janitor timing. Every section has defaults, so an empty JSON object
//! (or no file at all) is a valid configuration.
//!
//! ```rust,no_run
//! # use registry_server::config::Config;
//! // Load from file with fallback to defaults
//! let config = Config::load_or_default("registry.json")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure for the registry server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub staging: StagingConfig,
}

/// Network settings for the HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host/IP address to bind to
    pub host: String,
    /// Port number to listen on
    pub port: u16,
    /// Externally visible URL used in generated tarball links.
    /// Defaults to `http://localhost:{port}/`.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: None,
        }
    }
}

/// Location of the package tree and staging area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Publisher allow-list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Identities allowed to obtain the publisher session
    #[serde(default)]
    pub publishers: Vec<String>,
    /// Optional JSON file of the form `{"publishers": ["alice", "bob"]}`
    #[serde(default)]
    pub publishers_file: Option<PathBuf>,
}

/// Upload and request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_upload_size_mb: usize,
    /// JSON publishes carry the tarball base64-encoded, so this must exceed
    /// `max_upload_size_mb` by roughly a third.
    pub max_request_body_size_mb: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_upload_size_mb: 100,
            max_request_body_size_mb: 150,
        }
    }
}

/// Staging area janitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub sweep_interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        StagingConfig {
            sweep_interval_secs: 600,
            max_age_secs: 3600,
        }
    }
}

#[derive(Deserialize)]
struct PublishersFile {
    publishers: Vec<String>,
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or does not match the expected shape.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config_str = fs::read_to_string(path)?;
        let config = serde_json::from_str(&config_str)?;
        Ok(config)
    }

    /// Load configuration from file with fallback to defaults when the file
    /// does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// The registry URL embedded in generated documents, always ending in `/`.
    pub fn registry_url(&self) -> String {
        let url = self
            .server
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}/", self.server.port));
        normalize_url(&url)
    }

    /// Maximum tarball size in bytes.
    pub fn max_upload_size_bytes(&self) -> usize {
        self.limits.max_upload_size_mb * 1024 * 1024
    }

    /// Maximum request body size in bytes.
    pub fn max_request_body_size_bytes(&self) -> usize {
        self.limits.max_request_body_size_mb * 1024 * 1024
    }

    /// The full allow-list: inline publishers plus those in `publishers_file`.
    ///
    /// # Errors
    ///
    /// Fails when `publishers_file` is set but unreadable or malformed.
    pub fn load_publishers(&self) -> AppResult<Vec<String>> {
        let mut publishers = self.security.publishers.clone();
        if let Some(path) = &self.security.publishers_file {
            let content = fs::read_to_string(path).map_err(|e| {
                AppError::Storage(format!(
                    "Cannot read publishers file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let file: PublishersFile = serde_json::from_str(&content)?;
            publishers.extend(file.publishers);
        }
        publishers.sort();
        publishers.dedup();
        Ok(publishers)
    }
}

/// Append a trailing slash if missing.
pub fn normalize_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}
