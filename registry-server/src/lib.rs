//! # Package Registry Server
//!
//! A private npm-compatible registry. Packages are persisted on the local
//! filesystem and served from an in-memory index rebuilt at startup.
//!
//! ## Key Modules
//!
//! - [`store`]: durable package persistence and the in-memory index
//! - [`resolver`]: semantic-version range parsing and matching
//! - [`upload`]: artifact validation, staging and commit
//! - [`auth`]: publisher allow-list and session token
//! - [`npm`] and [`api`]: HTTP handlers
//! - [`documents`]: npm document shapes
//! - [`config`], [`state`], [`error`], [`server`], [`janitor`]

// Module declarations
pub mod api;
pub mod auth;
pub mod config;
pub mod documents;
pub mod error;
pub mod janitor;
pub mod npm;
pub mod resolver;
pub mod server;
pub mod state;
pub mod store;
pub mod upload;
pub mod validation;

// Re-export key types for convenience
pub use config::Config;
pub use error::{AppError, AppResult, ErrorCode};
pub use server::{build_router, run_server};
pub use state::{AppState, OkResponse};
pub use store::{PackageStore, PutOutcome};

/// Calculate SHA1 hash of data (for npm `dist.shasum`).
///
/// ```
/// # use registry_server::sha1_hash;
/// assert_eq!(sha1_hash(b"hello world").len(), 40);
/// ```
pub fn sha1_hash(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Subresource-integrity string for data: `sha512-<base64 digest>`.
///
/// ```
/// # use registry_server::sha512_integrity;
/// assert!(sha512_integrity(b"hello world").starts_with("sha512-"));
/// ```
pub fn sha512_integrity(data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use sha2::{Digest, Sha512};
    let mut hasher = Sha512::new();
    hasher.update(data);
    format!("sha512-{}", STANDARD.encode(hasher.finalize()))
}
