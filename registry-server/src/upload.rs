//! # Upload Pipeline
//!
//! Validates an incoming artifact, stages it in the staging area and commits
//! it through [`PackageStore::put_version`].
//!
//! Archive inspection and hashing are CPU-bound and run on the blocking pool.
//! The staging file is owned by a [`StagingFile`] guard, so it is removed on
//! every exit path, including early returns and errors.

use bytes::Bytes;
use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar::Archive;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::{ArtifactDigest, PackageStore, PutOutcome};
use crate::validation;
use crate::{sha1_hash, sha512_integrity};

/// Upper bound for the `package.json` read out of an archive.
const MAX_MANIFEST_SIZE: u64 = 10 * 1024 * 1024;

/// One publish request as it arrives from the protocol layer.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    /// Declared version, when the request carries one
    pub version: Option<String>,
    pub bytes: Bytes,
    /// Manifest supplied alongside the artifact (JSON publish). When absent the
    /// manifest inside the archive is stored.
    pub manifest: Option<Value>,
}

/// What a successful publish did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub name: String,
    pub version: String,
    pub outcome: PutOutcome,
}

/// Result of inspecting an archive on the blocking pool.
#[derive(Debug)]
struct InspectedArchive {
    manifest: Value,
    digest: ArtifactDigest,
}

/// Removes the staged file when dropped.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
}

impl StagingFile {
    /// Write `bytes` to a uniquely named file in `staging_dir`.
    pub async fn create(staging_dir: &Path, name: &str, version: &str, bytes: &[u8]) -> AppResult<Self> {
        let file_name = format!(
            "{}-{}-{}.tgz",
            Uuid::new_v4(),
            validation::base_name(name),
            version
        );
        let guard = StagingFile {
            path: staging_dir.join(file_name),
        };
        fs::write(&guard.path, bytes).await?;
        debug!(path = %guard.path.display(), size = bytes.len(), "Artifact staged");
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Staging file removed"),
            // Already moved into the store
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staging file"),
        }
    }
}

pub struct UploadPipeline {
    store: Arc<PackageStore>,
    staging_dir: PathBuf,
    max_size: usize,
}

impl UploadPipeline {
    pub fn new(store: Arc<PackageStore>, max_size: usize) -> Self {
        let staging_dir = store.layout().temp_dir();
        UploadPipeline {
            store,
            staging_dir,
            max_size,
        }
    }

    /// Validate, stage and commit one artifact.
    ///
    /// # Errors
    ///
    /// - `PayloadTooLarge` when the artifact exceeds the configured limit
    /// - `Validation` for a bad archive or a name/version mismatch
    /// - `Conflict` when the version exists with different content
    /// - `Storage` for disk failures
    pub async fn publish(&self, request: UploadRequest) -> AppResult<PublishReceipt> {
        let UploadRequest {
            name,
            version: declared_version,
            bytes,
            manifest: supplied_manifest,
        } = request;

        if bytes.len() > self.max_size {
            return Err(AppError::PayloadTooLarge(format!(
                "Artifact is {} bytes (max: {})",
                bytes.len(),
                self.max_size
            )));
        }
        validation::validate_package_name(&name)?;
        if let Some(version) = &declared_version {
            validation::validate_version(version)?;
        }

        let inspected = inspect_archive(bytes.clone()).await?;
        let version = check_identity(&inspected.manifest, &name, declared_version.as_deref())?;

        let manifest = match supplied_manifest {
            Some(manifest) => {
                check_identity(&manifest, &name, Some(&version))?;
                manifest
            }
            None => inspected.manifest,
        };

        let staged = StagingFile::create(&self.staging_dir, &name, &version, &bytes).await?;
        let outcome = self
            .store
            .put_version(&name, &version, manifest, staged.path(), &inspected.digest)
            .await?;

        info!(package = %name, version = %version, outcome = ?outcome, "Publish processed");
        Ok(PublishReceipt {
            name,
            version,
            outcome,
        })
    }
}

/// Check a manifest's `name`/`version` against the declared ones and return
/// the validated version.
fn check_identity(manifest: &Value, name: &str, version: Option<&str>) -> AppResult<String> {
    let manifest_name = manifest
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Manifest has no name".to_string()))?;
    let manifest_version = manifest
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Manifest has no version".to_string()))?;

    if manifest_name != name {
        return Err(AppError::Validation(format!(
            "Manifest name '{}' does not match '{}'",
            manifest_name, name
        )));
    }
    if let Some(version) = version {
        if manifest_version != version {
            return Err(AppError::Validation(format!(
                "Manifest version '{}' does not match '{}'",
                manifest_version, version
            )));
        }
    }

    validation::validate_version(manifest_version)?;
    Ok(manifest_version.to_string())
}

async fn inspect_archive(bytes: Bytes) -> AppResult<InspectedArchive> {
    tokio::task::spawn_blocking(move || {
        let manifest = read_manifest(&bytes)?;
        let digest = ArtifactDigest {
            shasum: sha1_hash(&bytes),
            integrity: sha512_integrity(&bytes),
            size: bytes.len() as u64,
        };
        Ok::<_, AppError>(InspectedArchive { manifest, digest })
    })
    .await
    .map_err(|e| AppError::Storage(format!("Archive inspection task failed: {}", e)))?
}

/// Find `<top>/package.json` in a gzip-compressed tar archive.
fn read_manifest(bytes: &[u8]) -> AppResult<Value> {
    let not_an_archive =
        |e: std::io::Error| AppError::Validation(format!("Not a gzip-compressed tar archive: {}", e));

    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries().map_err(not_an_archive)? {
        let entry = entry.map_err(not_an_archive)?;
        let path = entry.path().map_err(not_an_archive)?.into_owned();
        if !is_root_manifest(&path) {
            continue;
        }

        let mut content = Vec::new();
        entry
            .take(MAX_MANIFEST_SIZE)
            .read_to_end(&mut content)
            .map_err(not_an_archive)?;
        return serde_json::from_slice(&content).map_err(|e| {
            AppError::Validation(format!("Invalid package.json in archive: {}", e))
        });
    }

    Err(AppError::Validation(
        "Archive has no package.json in its root directory".to_string(),
    ))
}

/// `package/package.json`, or `<any single dir>/package.json`.
fn is_root_manifest(path: &Path) -> bool {
    let components: Vec<Component<'_>> = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    matches!(
        components.as_slice(),
        [Component::Normal(_), Component::Normal(file)] if *file == "package.json"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::npm_tarball;
    use serde_json::json;
    use tempfile::TempDir;

    async fn pipeline() -> (UploadPipeline, Arc<PackageStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(PackageStore::new(temp_dir.path()));
        store.load_all().await.unwrap();
        (UploadPipeline::new(store.clone(), 1024 * 1024), store, temp_dir)
    }

    fn request(name: &str, version: Option<&str>, bytes: Vec<u8>) -> UploadRequest {
        UploadRequest {
            name: name.to_string(),
            version: version.map(str::to_string),
            bytes: Bytes::from(bytes),
            manifest: None,
        }
    }

    fn staging_is_empty(temp: &TempDir) -> bool {
        std::fs::read_dir(temp.path().join("temp")).unwrap().next().is_none()
    }

    #[test]
    fn test_root_manifest_detection() {
        assert!(is_root_manifest(Path::new("package/package.json")));
        assert!(is_root_manifest(Path::new("./left-pad/package.json")));
        assert!(!is_root_manifest(Path::new("package.json")));
        assert!(!is_root_manifest(Path::new("package/lib/package.json")));
    }

    #[tokio::test]
    async fn test_publish_uses_archive_manifest() {
        let (pipeline, store, temp) = pipeline().await;
        let tarball = npm_tarball("left-pad", "1.0.0");

        let receipt = pipeline
            .publish(request("left-pad", Some("1.0.0"), tarball.clone()))
            .await
            .unwrap();
        assert_eq!(receipt.outcome, PutOutcome::Created);

        let record = store.get_version("left-pad", "1.0.0").unwrap();
        assert_eq!(record.manifest["name"], "left-pad");
        assert_eq!(record.digest.shasum, sha1_hash(&tarball));
        assert!(record.digest.integrity.starts_with("sha512-"));
        assert!(staging_is_empty(&temp));
    }

    #[tokio::test]
    async fn test_version_taken_from_archive_when_not_declared() {
        let (pipeline, _store, _temp) = pipeline().await;
        let receipt = pipeline
            .publish(request("left-pad", None, npm_tarball("left-pad", "2.1.0")))
            .await
            .unwrap();
        assert_eq!(receipt.version, "2.1.0");
    }

    #[tokio::test]
    async fn test_mismatches_rejected_without_side_effects() {
        let (pipeline, store, temp) = pipeline().await;

        let wrong_version = pipeline
            .publish(request("left-pad", Some("1.0.1"), npm_tarball("left-pad", "1.0.0")))
            .await;
        assert!(matches!(wrong_version, Err(AppError::Validation(_))));

        let wrong_name = pipeline
            .publish(request("right-pad", Some("1.0.0"), npm_tarball("left-pad", "1.0.0")))
            .await;
        assert!(matches!(wrong_name, Err(AppError::Validation(_))));

        let mut supplied = request("left-pad", Some("1.0.0"), npm_tarball("left-pad", "1.0.0"));
        supplied.manifest = Some(json!({"name": "left-pad", "version": "9.9.9"}));
        assert!(matches!(
            pipeline.publish(supplied).await,
            Err(AppError::Validation(_))
        ));

        assert!(store.snapshot().is_empty());
        assert!(staging_is_empty(&temp));
    }

    #[tokio::test]
    async fn test_garbage_and_oversized_payloads() {
        let (pipeline, _store, _temp) = pipeline().await;
        assert!(matches!(
            pipeline
                .publish(request("left-pad", Some("1.0.0"), b"not a tarball".to_vec()))
                .await,
            Err(AppError::Validation(_))
        ));

        let small = UploadPipeline::new(pipeline.store.clone(), 16);
        assert!(matches!(
            small
                .publish(request("left-pad", Some("1.0.0"), npm_tarball("left-pad", "1.0.0")))
                .await,
            Err(AppError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_conflict_leaves_no_staging_file() {
        let (pipeline, _store, temp) = pipeline().await;
        pipeline
            .publish(request("left-pad", Some("1.0.0"), npm_tarball("left-pad", "1.0.0")))
            .await
            .unwrap();

        let mut divergent = request("left-pad", Some("1.0.0"), npm_tarball("left-pad", "1.0.0"));
        divergent.manifest = Some(json!({"name": "left-pad", "version": "1.0.0", "main": "other.js"}));
        assert!(matches!(
            pipeline.publish(divergent).await,
            Err(AppError::Conflict(_))
        ));
        assert!(staging_is_empty(&temp));
    }

    #[tokio::test]
    async fn test_staging_file_guard_removes_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = {
            let staged = StagingFile::create(temp.path(), "@acme/widgets", "1.0.0", b"bytes")
                .await
                .unwrap();
            assert!(staged.path().exists());
            let name = staged.path().file_name().unwrap().to_string_lossy().to_string();
            assert!(name.ends_with("-widgets-1.0.0.tgz"));
            staged.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
