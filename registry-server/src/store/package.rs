//! Package and version records held by the in-memory index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::resolver;

/// Hashes and size of an artifact, computed once when it is staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDigest {
    /// Hex SHA-1, the npm `dist.shasum`
    pub shasum: String,
    /// Subresource-integrity string, `sha512-<base64>`
    pub integrity: String,
    pub size: u64,
}

/// Contents of `publish.json` next to each committed version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishInfo {
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub digest: ArtifactDigest,
}

/// One committed version. Immutable once in the index.
#[derive(Debug, Clone, Serialize)]
pub struct VersionRecord {
    pub version: String,
    pub time: DateTime<Utc>,
    /// Manifest exactly as supplied at publish time
    pub manifest: Value,
    #[serde(flatten)]
    pub digest: ArtifactDigest,
    #[serde(skip)]
    pub artifact_path: PathBuf,
}

impl VersionRecord {
    /// Whether a republish of `manifest` + `digest` is the same content.
    ///
    /// `dist` is server-computed and excluded from the manifest comparison.
    pub fn same_content(&self, manifest: &Value, digest: &ArtifactDigest) -> bool {
        self.digest.integrity == digest.integrity
            && self.digest.size == digest.size
            && without_dist(&self.manifest) == without_dist(manifest)
    }
}

fn without_dist(manifest: &Value) -> Value {
    let mut copy = manifest.clone();
    if let Some(object) = copy.as_object_mut() {
        object.remove("dist");
    }
    copy
}

/// Package-level overrides persisted in `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Value>,
    /// Stored tags. `latest` is never stored; it is always computed.
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
}

impl PackageMetadata {
    /// Drop tags pointing at `version`. Returns whether anything changed.
    pub fn untag_version(&mut self, version: &str) -> bool {
        let before = self.dist_tags.len();
        self.dist_tags.retain(|_, tagged| tagged != version);
        before != self.dist_tags.len()
    }
}

/// Snapshot of a package. Never empty while in the index.
#[derive(Debug, Clone, Serialize)]
pub struct Package {
    pub name: String,
    pub versions: BTreeMap<String, VersionRecord>,
    pub metadata: PackageMetadata,
}

impl Package {
    pub fn new(name: impl Into<String>) -> Self {
        Package {
            name: name.into(),
            versions: BTreeMap::new(),
            metadata: PackageMetadata::default(),
        }
    }

    /// Highest version by semver precedence.
    pub fn latest_version(&self) -> Option<String> {
        resolver::max_version(self.versions.keys().map(String::as_str))
    }

    pub fn latest_record(&self) -> Option<&VersionRecord> {
        self.latest_version()
            .and_then(|version| self.versions.get(&version))
    }

    /// Version strings sorted ascending by semver precedence.
    pub fn sorted_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.versions.keys().cloned().collect();
        resolver::sort_versions(&mut versions);
        versions
    }

    fn latest_manifest_field(&self, field: &str) -> Option<Value> {
        self.latest_record()
            .and_then(|record| record.manifest.get(field))
            .filter(|value| !value.is_null())
            .cloned()
    }

    pub fn description(&self) -> Option<String> {
        self.metadata.description.clone().or_else(|| {
            self.latest_manifest_field("description")
                .and_then(|value| value.as_str().map(str::to_string))
        })
    }

    pub fn author(&self) -> Option<Value> {
        self.metadata
            .author
            .clone()
            .or_else(|| self.latest_manifest_field("author"))
    }

    pub fn repository(&self) -> Option<Value> {
        self.metadata
            .repository
            .clone()
            .or_else(|| self.latest_manifest_field("repository"))
    }

    /// Stored tags plus the computed `latest`.
    pub fn dist_tags(&self) -> BTreeMap<String, String> {
        let mut tags: BTreeMap<String, String> = self
            .metadata
            .dist_tags
            .iter()
            .filter(|(_, version)| self.versions.contains_key(*version))
            .map(|(tag, version)| (tag.clone(), version.clone()))
            .collect();
        if let Some(latest) = self.latest_version() {
            tags.insert("latest".to_string(), latest);
        }
        tags
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.versions.values().map(|record| record.time).min()
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.versions.values().map(|record| record.time).max()
    }
}

/// Result of [`super::PackageStore::put_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New version committed
    Created,
    /// Identical content was already committed; nothing rewritten
    Unchanged,
}

/// An entry `load_all` could not index.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

/// Summary of an index rebuild.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub packages: usize,
    pub versions: usize,
    pub skipped: Vec<SkippedEntry>,
}
