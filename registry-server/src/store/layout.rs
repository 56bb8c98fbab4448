//! On-disk layout of the data root.
//!
//! ```text
//! <root>/packages/<name>/<version>/package.json
//! <root>/packages/<name>/<version>/package.tgz
//! <root>/packages/<name>/<version>/publish.json
//! <root>/packages/<name>/metadata.json
//! <root>/temp/
//! ```
//!
//! Scoped names nest one level: `packages/@scope/pkg`.

use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const PACKAGES_DIR: &str = "packages";
pub const TEMP_DIR: &str = "temp";
pub const MANIFEST_FILE: &str = "package.json";
pub const ARTIFACT_FILE: &str = "package.tgz";
pub const PUBLISH_FILE: &str = "publish.json";
pub const METADATA_FILE: &str = "metadata.json";

/// Prefix of private directories inside the staging area.
pub const PRIVATE_PREFIX: char = '.';

#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join(PACKAGES_DIR)
    }

    /// The staging area. Lives under the data root so renames out of it
    /// stay on one filesystem.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        name.split('/')
            .fold(self.packages_dir(), |path, part| path.join(part))
    }

    pub fn version_dir(&self, name: &str, version: &str) -> PathBuf {
        self.package_dir(name).join(version)
    }

    pub fn artifact_path(&self, name: &str, version: &str) -> PathBuf {
        self.version_dir(name, version).join(ARTIFACT_FILE)
    }

    pub fn metadata_path(&self, name: &str) -> PathBuf {
        self.package_dir(name).join(METADATA_FILE)
    }

    /// A fresh private path in the staging area, e.g. `temp/.commit-<uuid>`.
    pub fn private_temp_path(&self, purpose: &str) -> PathBuf {
        self.temp_dir()
            .join(format!("{}{}-{}", PRIVATE_PREFIX, purpose, Uuid::new_v4()))
    }
}
