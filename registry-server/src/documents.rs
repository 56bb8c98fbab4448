//! npm registry document shapes.
//!
//! Stored manifests are kept exactly as published. The `dist` block is always
//! rebuilt here from the server's own URL and digests, so documents stay
//! correct when the registry URL changes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::store::{Package, VersionRecord};
use crate::validation::tarball_filename;

/// Revision reported for every document; the registry keeps no revision history.
pub const DOCUMENT_REV: &str = "1-0";

pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Package name as it appears in a URL path segment.
pub fn encode_name(name: &str) -> String {
    name.replace('/', "%2f")
}

pub fn tarball_url(registry_url: &str, name: &str, version: &str) -> String {
    format!(
        "{}{}/-/{}",
        registry_url,
        encode_name(name),
        tarball_filename(name, version)
    )
}

/// One version's manifest with server-computed `dist`.
pub fn version_document(name: &str, record: &VersionRecord, registry_url: &str) -> Value {
    let mut doc = match &record.manifest {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    doc.insert("name".to_string(), json!(name));
    doc.insert("version".to_string(), json!(record.version));
    doc.insert(
        "_id".to_string(),
        json!(format!("{}@{}", name, record.version)),
    );
    doc.insert(
        "dist".to_string(),
        json!({
            "tarball": tarball_url(registry_url, name, &record.version),
            "shasum": record.digest.shasum,
            "integrity": record.digest.integrity,
        }),
    );
    Value::Object(doc)
}

fn insert_package_fields(doc: &mut Map<String, Value>, package: &Package) {
    if let Some(description) = package.description() {
        doc.insert("description".to_string(), json!(description));
    }
    if let Some(author) = package.author() {
        doc.insert("author".to_string(), author);
    }
    if let Some(repository) = package.repository() {
        doc.insert("repository".to_string(), repository);
    }
}

/// The full package document served at `GET /:name`.
pub fn package_document(package: &Package, registry_url: &str) -> Value {
    let versions: Map<String, Value> = package
        .versions
        .values()
        .map(|record| {
            (
                record.version.clone(),
                version_document(&package.name, record, registry_url),
            )
        })
        .collect();

    let mut time = Map::new();
    if let Some(created) = package.created() {
        time.insert("created".to_string(), json!(format_time(created)));
    }
    if let Some(modified) = package.modified() {
        time.insert("modified".to_string(), json!(format_time(modified)));
    }
    for record in package.versions.values() {
        time.insert(record.version.clone(), json!(format_time(record.time)));
    }

    let mut doc = Map::new();
    doc.insert("_id".to_string(), json!(package.name));
    doc.insert("_rev".to_string(), json!(DOCUMENT_REV));
    doc.insert("name".to_string(), json!(package.name));
    doc.insert("dist-tags".to_string(), json!(package.dist_tags()));
    doc.insert("versions".to_string(), Value::Object(versions));
    doc.insert("maintainers".to_string(), json!([]));
    doc.insert("time".to_string(), Value::Object(time));
    insert_package_fields(&mut doc, package);
    Value::Object(doc)
}

/// Abbreviated entry of the bulk listing.
pub fn abbreviated_document(package: &Package) -> Value {
    let versions: Map<String, Value> = package
        .sorted_versions()
        .into_iter()
        .map(|version| (version, json!("latest")))
        .collect();

    let mut doc = Map::new();
    doc.insert("name".to_string(), json!(package.name));
    doc.insert("dist-tags".to_string(), json!(package.dist_tags()));
    doc.insert("versions".to_string(), Value::Object(versions));
    if let Some(modified) = package.modified() {
        doc.insert("time".to_string(), json!({"modified": format_time(modified)}));
    }
    insert_package_fields(&mut doc, package);
    Value::Object(doc)
}

/// Bulk listing keyed by package name, plus `_updated`. With `since`, only
/// packages modified at or after that instant are listed.
pub fn bulk_listing(
    packages: &BTreeMap<String, Arc<Package>>,
    since: Option<DateTime<Utc>>,
    updated: DateTime<Utc>,
) -> Value {
    let mut listing = Map::new();
    listing.insert("_updated".to_string(), json!(updated.timestamp_millis()));
    for (name, package) in packages {
        let fresh = match (since, package.modified()) {
            (Some(since), Some(modified)) => modified >= since,
            _ => true,
        };
        if fresh {
            listing.insert(name.clone(), abbreviated_document(package));
        }
    }
    Value::Object(listing)
}
