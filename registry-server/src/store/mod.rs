//! # Package Store
//!
//! Filesystem-backed persistence of package versions plus the in-memory index
//! that serves every read.
//!
//! ## Consistency
//!
//! A version directory is assembled privately inside the staging area and made
//! visible with a single `rename`. The index is updated only after the rename
//! succeeded, so readers never observe a half-written version. Deletion works
//! in reverse: the directory is renamed out of the tree first, then removed.
//!
//! Mutations on one package are serialized by a per-package async mutex held
//! only across the check-rename-index step. Reads clone an `Arc<Package>`
//! snapshot under a short `RwLock` read guard and never wait on those mutexes.

mod layout;
mod package;

pub use layout::StoreLayout;
pub use package::{
    ArtifactDigest, LoadReport, Package, PackageMetadata, PublishInfo, PutOutcome, SkippedEntry,
    VersionRecord,
};

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::resolver::{self, VersionRange};
use crate::validation;
use layout::{ARTIFACT_FILE, MANIFEST_FILE, METADATA_FILE, PUBLISH_FILE};

type Index = BTreeMap<String, Arc<Package>>;

pub struct PackageStore {
    layout: StoreLayout,
    index: RwLock<Index>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PackageStore {
    /// Create a store rooted at `data_dir`. The index starts empty; call
    /// [`PackageStore::load_all`] before serving.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        PackageStore {
            layout: StoreLayout::new(data_dir),
            index: RwLock::new(Index::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Drop the caller's handle and forget the mutex of a package that is not
    /// indexed, unless another task still holds or awaits it.
    fn release_lock(&self, name: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        if self.read_index().contains_key(name) {
            return;
        }
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(name)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(name);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Reads ---

    /// Snapshot of one package.
    pub fn get_package(&self, name: &str) -> AppResult<Arc<Package>> {
        self.read_index()
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Package '{}' not found", name)))
    }

    /// Known version strings; empty for an unknown package.
    pub fn get_versions(&self, name: &str) -> Vec<String> {
        self.read_index()
            .get(name)
            .map(|package| package.versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_version(&self, name: &str, version: &str) -> AppResult<VersionRecord> {
        self.get_package(name)?
            .versions
            .get(version)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("Version '{}' of '{}' not found", version, name))
            })
    }

    /// Snapshot of the whole index.
    pub fn snapshot(&self) -> BTreeMap<String, Arc<Package>> {
        self.read_index().clone()
    }

    /// Best version of `name` satisfying `range`.
    pub fn resolve(&self, name: &str, range: &VersionRange) -> AppResult<String> {
        let versions = self.get_versions(name);
        resolver::resolve(versions.iter().map(String::as_str), range).ok_or_else(|| {
            info!(package = %name, range = %range, "No version satisfies range");
            AppError::NotFound(format!("No version of '{}' satisfies '{}'", name, range))
        })
    }

    /// Open a committed artifact for streaming. Returns the file and its size.
    pub async fn stream_artifact(&self, name: &str, version: &str) -> AppResult<(fs::File, u64)> {
        let record = self.get_version(name, version)?;
        match fs::File::open(&record.artifact_path).await {
            Ok(file) => Ok((file, record.digest.size)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(package = %name, version = %version, "Indexed artifact missing on disk");
                Err(AppError::NotFound(format!(
                    "Artifact for {}@{} not found",
                    name, version
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    // --- Mutations ---

    /// Commit a version. `staged` is moved into the store (or copied when the
    /// rename is not possible); callers must treat it as consumed.
    ///
    /// Name and version are expected to be validated by the caller.
    pub async fn put_version(
        &self,
        name: &str,
        version: &str,
        manifest: Value,
        staged: &Path,
        digest: &ArtifactDigest,
    ) -> AppResult<PutOutcome> {
        if let Some(outcome) = self.check_existing(name, version, &manifest, digest)? {
            return Ok(outcome);
        }

        let commit_dir = self.layout.private_temp_path("commit");
        let result = self
            .commit_version(name, version, manifest, staged, digest, &commit_dir)
            .await;
        discard(&commit_dir).await;
        result
    }

    fn check_existing(
        &self,
        name: &str,
        version: &str,
        manifest: &Value,
        digest: &ArtifactDigest,
    ) -> AppResult<Option<PutOutcome>> {
        let index = self.read_index();
        let Some(existing) = index
            .get(name)
            .and_then(|package| package.versions.get(version))
        else {
            return Ok(None);
        };

        if existing.same_content(manifest, digest) {
            info!(package = %name, version = %version, "Identical republish, nothing to do");
            Ok(Some(PutOutcome::Unchanged))
        } else {
            Err(AppError::Conflict(format!(
                "{}@{} is already published with different content",
                name, version
            )))
        }
    }

    async fn commit_version(
        &self,
        name: &str,
        version: &str,
        manifest: Value,
        staged: &Path,
        digest: &ArtifactDigest,
        commit_dir: &Path,
    ) -> AppResult<PutOutcome> {
        fs::create_dir_all(commit_dir).await?;
        move_or_copy(staged, &commit_dir.join(ARTIFACT_FILE)).await?;
        fs::write(
            commit_dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;
        let publish = PublishInfo {
            time: Utc::now(),
            digest: digest.clone(),
        };
        fs::write(
            commit_dir.join(PUBLISH_FILE),
            serde_json::to_vec_pretty(&publish)?,
        )
        .await?;

        let lock = self.lock_for(name);
        let result = {
            let _guard = lock.lock().await;
            self.promote_version(name, version, manifest, digest, publish, commit_dir)
                .await
        };
        self.release_lock(name, lock);
        result
    }

    async fn promote_version(
        &self,
        name: &str,
        version: &str,
        manifest: Value,
        digest: &ArtifactDigest,
        publish: PublishInfo,
        commit_dir: &Path,
    ) -> AppResult<PutOutcome> {
        // A concurrent publish of the same version may have won the race
        if let Some(outcome) = self.check_existing(name, version, &manifest, digest)? {
            return Ok(outcome);
        }

        let version_dir = self.layout.version_dir(name, version);
        if fs::try_exists(&version_dir).await? {
            // Left behind by a crash or skipped by load_all as malformed
            warn!(path = %version_dir.display(), "Replacing unindexed version directory");
            self.remove_tree(&version_dir).await?;
        }

        fs::create_dir_all(self.layout.package_dir(name)).await?;
        fs::rename(commit_dir, &version_dir).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to commit {}@{}: {}",
                name, version, e
            ))
        })?;

        let record = VersionRecord {
            version: version.to_string(),
            time: publish.time,
            manifest,
            digest: publish.digest,
            artifact_path: version_dir.join(ARTIFACT_FILE),
        };
        self.update_package(name, |package| {
            package.versions.insert(version.to_string(), record);
        });

        info!(package = %name, version = %version, size = digest.size, "Version committed");
        Ok(PutOutcome::Created)
    }

    /// Remove one version. Removing the last version removes the package.
    pub async fn delete_version(&self, name: &str, version: &str) -> AppResult<()> {
        let lock = self.lock_for(name);
        let result = {
            let _guard = lock.lock().await;
            self.delete_version_locked(name, version).await
        };
        self.release_lock(name, lock);
        result
    }

    async fn delete_version_locked(&self, name: &str, version: &str) -> AppResult<()> {
        let package = self.get_package(name)?;
        if !package.versions.contains_key(version) {
            return Err(AppError::NotFound(format!(
                "Version '{}' of '{}' not found",
                version, name
            )));
        }

        if package.versions.len() == 1 {
            self.remove_tree(&self.layout.package_dir(name)).await?;
            self.write_index().remove(name);
            self.remove_empty_scope_dir(name).await;
            info!(package = %name, version = %version, "Last version deleted, package removed");
            return Ok(());
        }

        self.remove_tree(&self.layout.version_dir(name, version))
            .await?;

        let mut metadata = package.metadata.clone();
        if metadata.untag_version(version) {
            if let Err(e) = self.write_metadata(name, &metadata).await {
                // metadata.json still holds the old tags
                warn!(package = %name, error = %e, "Failed to drop dist-tags of deleted version");
                metadata = package.metadata.clone();
            }
        }

        self.update_package(name, |package| {
            package.versions.remove(version);
            package.metadata = metadata;
        });

        info!(package = %name, version = %version, "Version deleted");
        Ok(())
    }

    /// Remove every version of a package at once.
    pub async fn delete_package(&self, name: &str) -> AppResult<()> {
        let lock = self.lock_for(name);
        let result = {
            let _guard = lock.lock().await;
            self.delete_package_locked(name).await
        };
        self.release_lock(name, lock);
        result
    }

    async fn delete_package_locked(&self, name: &str) -> AppResult<()> {
        let package = self.get_package(name)?;
        self.remove_tree(&self.layout.package_dir(name)).await?;
        self.write_index().remove(name);
        self.remove_empty_scope_dir(name).await;

        info!(package = %name, versions = package.versions.len(), "Package deleted");
        Ok(())
    }

    /// Point `tag` at an existing version. `latest` is computed and cannot be
    /// reassigned; such requests are acknowledged without a change.
    pub async fn set_dist_tag(&self, name: &str, tag: &str, version: &str) -> AppResult<()> {
        let lock = self.lock_for(name);
        let result = {
            let _guard = lock.lock().await;
            self.set_dist_tag_locked(name, tag, version).await
        };
        self.release_lock(name, lock);
        result
    }

    async fn set_dist_tag_locked(&self, name: &str, tag: &str, version: &str) -> AppResult<()> {
        let package = self.get_package(name)?;
        if !package.versions.contains_key(version) {
            return Err(AppError::NotFound(format!(
                "Version '{}' of '{}' not found",
                version, name
            )));
        }

        if tag == "latest" {
            info!(package = %name, version = %version, "Ignoring assignment of computed 'latest' tag");
            return Ok(());
        }

        let mut metadata = package.metadata.clone();
        metadata
            .dist_tags
            .insert(tag.to_string(), version.to_string());
        self.write_metadata(name, &metadata).await?;
        self.update_package(name, |package| package.metadata = metadata);

        info!(package = %name, tag = %tag, version = %version, "Dist-tag set");
        Ok(())
    }

    /// Apply a package-level metadata document (`description`, `author`,
    /// `repository`, `dist-tags`). Returns `false` when the package does not
    /// exist; the update is then acknowledged but not persisted.
    pub async fn update_metadata(&self, name: &str, doc: &Value) -> AppResult<bool> {
        let lock = self.lock_for(name);
        let result = {
            let _guard = lock.lock().await;
            self.update_metadata_locked(name, doc).await
        };
        self.release_lock(name, lock);
        result
    }

    async fn update_metadata_locked(&self, name: &str, doc: &Value) -> AppResult<bool> {
        let Ok(package) = self.get_package(name) else {
            info!(package = %name, "Metadata update for unknown package not persisted");
            return Ok(false);
        };

        let mut metadata = package.metadata.clone();
        if let Some(description) = doc.get("description").and_then(Value::as_str) {
            metadata.description = Some(description.to_string());
        }
        if let Some(author) = doc.get("author").filter(|v| !v.is_null()) {
            metadata.author = Some(author.clone());
        }
        if let Some(repository) = doc.get("repository").filter(|v| !v.is_null()) {
            metadata.repository = Some(repository.clone());
        }
        if let Some(tags) = doc.get("dist-tags").and_then(Value::as_object) {
            for (tag, version) in tags {
                let Some(version) = version.as_str() else {
                    continue;
                };
                if tag != "latest"
                    && package.versions.contains_key(version)
                    && validation::validate_tag(tag).is_ok()
                {
                    metadata.dist_tags.insert(tag.clone(), version.to_string());
                }
            }
        }

        if metadata == package.metadata {
            debug!(package = %name, "Metadata unchanged");
            return Ok(true);
        }

        self.write_metadata(name, &metadata).await?;
        self.update_package(name, |package| package.metadata = metadata);
        info!(package = %name, "Package metadata updated");
        Ok(true)
    }

    // --- Index rebuild ---

    /// Rebuild the index from disk. Bad entries are skipped and reported, they
    /// never fail the load.
    pub async fn load_all(&self) -> AppResult<LoadReport> {
        let packages_dir = self.layout.packages_dir();
        fs::create_dir_all(&packages_dir).await?;
        fs::create_dir_all(self.layout.temp_dir()).await?;

        let mut report = LoadReport::default();
        let mut index = Index::new();

        for (name, dir) in self.discover_packages(&packages_dir, &mut report).await? {
            if let Some(package) = self.load_package(&name, &dir, &mut report).await? {
                report.versions += package.versions.len();
                index.insert(name, Arc::new(package));
            }
        }

        report.packages = index.len();
        for skipped in &report.skipped {
            warn!(path = %skipped.path.display(), reason = %skipped.reason, "Skipped entry during load");
        }

        *self.write_index() = index;
        info!(
            packages = report.packages,
            versions = report.versions,
            skipped = report.skipped.len(),
            "Index loaded"
        );
        Ok(report)
    }

    async fn discover_packages(
        &self,
        packages_dir: &Path,
        report: &mut LoadReport,
    ) -> AppResult<Vec<(String, PathBuf)>> {
        let mut found = Vec::new();
        for (entry_name, path) in list_dirs(packages_dir).await? {
            if entry_name.starts_with('@') {
                for (inner, inner_path) in list_dirs(&path).await? {
                    found.push((format!("{}/{}", entry_name, inner), inner_path));
                }
            } else {
                found.push((entry_name, path));
            }
        }

        found.retain(|(name, path)| match validation::validate_package_name(name) {
            Ok(()) => true,
            Err(e) => {
                report.skipped.push(SkippedEntry {
                    path: path.clone(),
                    reason: e.to_string(),
                });
                false
            }
        });
        Ok(found)
    }

    async fn load_package(
        &self,
        name: &str,
        dir: &Path,
        report: &mut LoadReport,
    ) -> AppResult<Option<Package>> {
        let mut package = Package::new(name);

        let loads = list_dirs(dir)
            .await?
            .into_iter()
            .map(|(version, path)| async move {
                let outcome = load_version(name, &version, &path).await;
                (path, outcome)
            });

        for (path, outcome) in join_all(loads).await {
            match outcome {
                Ok(record) => {
                    package.versions.insert(record.version.clone(), record);
                }
                Err(reason) => report.skipped.push(SkippedEntry { path, reason }),
            }
        }

        if package.versions.is_empty() {
            report.skipped.push(SkippedEntry {
                path: dir.to_path_buf(),
                reason: "no valid versions".to_string(),
            });
            return Ok(None);
        }

        let metadata_path = dir.join(METADATA_FILE);
        match fs::read(&metadata_path).await {
            Ok(bytes) => match serde_json::from_slice::<PackageMetadata>(&bytes) {
                Ok(metadata) => package.metadata = metadata,
                Err(e) => report.skipped.push(SkippedEntry {
                    path: metadata_path,
                    reason: format!("malformed metadata: {}", e),
                }),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Some(package))
    }

    // --- Helpers ---

    fn update_package(&self, name: &str, apply: impl FnOnce(&mut Package)) {
        let mut index = self.write_index();
        let mut package = index
            .get(name)
            .map(|existing| Package::clone(existing))
            .unwrap_or_else(|| Package::new(name));
        apply(&mut package);
        index.insert(name.to_string(), Arc::new(package));
    }

    async fn write_metadata(&self, name: &str, metadata: &PackageMetadata) -> AppResult<()> {
        let temp = self.layout.private_temp_path("metadata");
        fs::write(&temp, serde_json::to_vec_pretty(metadata)?).await?;
        if let Err(e) = fs::rename(&temp, self.layout.metadata_path(name)).await {
            discard(&temp).await;
            return Err(AppError::Storage(format!(
                "Failed to write metadata for {}: {}",
                name, e
            )));
        }
        Ok(())
    }

    /// Rename `path` into the staging area, then remove it. Once the rename
    /// succeeded the tree is invisible, so a failed removal is only logged.
    async fn remove_tree(&self, path: &Path) -> AppResult<()> {
        let trash = self.layout.private_temp_path("trash");
        fs::rename(path, &trash).await.map_err(|e| {
            AppError::Storage(format!("Failed to remove {}: {}", path.display(), e))
        })?;
        if let Err(e) = fs::remove_dir_all(&trash).await {
            warn!(path = %trash.display(), error = %e, "Failed to clean up removed tree");
        }
        Ok(())
    }

    async fn remove_empty_scope_dir(&self, name: &str) {
        if let Some((scope, _)) = name.split_once('/') {
            // Fails harmlessly while other packages remain in the scope
            let _ = fs::remove_dir(self.layout.packages_dir().join(scope)).await;
        }
    }
}

async fn load_version(name: &str, version: &str, dir: &Path) -> Result<VersionRecord, String> {
    validation::validate_version(version).map_err(|e| e.to_string())?;

    let manifest: Value = read_json(&dir.join(MANIFEST_FILE)).await?;
    let publish: PublishInfo = read_json(&dir.join(PUBLISH_FILE)).await?;

    let declared_name = manifest.get("name").and_then(Value::as_str);
    let declared_version = manifest.get("version").and_then(Value::as_str);
    if declared_name != Some(name) || declared_version != Some(version) {
        return Err(format!(
            "manifest declares {}@{}",
            declared_name.unwrap_or("?"),
            declared_version.unwrap_or("?")
        ));
    }

    let artifact_path = dir.join(ARTIFACT_FILE);
    let size = fs::metadata(&artifact_path)
        .await
        .map_err(|e| format!("{}: {}", ARTIFACT_FILE, e))?
        .len();
    if size != publish.digest.size {
        return Err(format!(
            "{} is {} bytes, expected {}",
            ARTIFACT_FILE, size, publish.digest.size
        ));
    }

    Ok(VersionRecord {
        version: version.to_string(),
        time: publish.time,
        manifest,
        digest: publish.digest,
        artifact_path,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let bytes = fs::read(path)
        .await
        .map_err(|e| format!("{}: {}", file_name, e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("{}: {}", file_name, e))
}

/// Subdirectories of `dir` as `(file name, path)`.
async fn list_dirs(dir: &Path) -> AppResult<Vec<(String, PathBuf)>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
        }
    }
    Ok(dirs)
}

async fn move_or_copy(from: &Path, to: &Path) -> AppResult<()> {
    if fs::rename(from, to).await.is_err() {
        fs::copy(from, to).await?;
    }
    Ok(())
}

/// Best-effort removal of a private staging path.
async fn discard(path: &Path) {
    let result = match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to discard staging path");
    }
}
