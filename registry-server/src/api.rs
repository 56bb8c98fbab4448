//! Registry-native endpoints outside the npm protocol: range fetches under
//! `/package`, raw tarball publish/unpublish, version listing, and index
//! inspection.

use axum::{
    extract::{rejection::BytesRejection, Path, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::auth::Publisher;
use crate::error::{AppError, AppResult};
use crate::resolver::VersionRange;
use crate::state::{AppState, OkResponse};
use crate::store::{Package, PutOutcome};
use crate::upload::UploadRequest;
use crate::validation;

/// The version segment of a `/package/:name/...` mutation. Comparator paths
/// are only meaningful for reads.
fn single_version(spec: &str) -> AppResult<String> {
    if spec.contains('/') {
        return Err(AppError::Validation(format!(
            "Expected a single version, got '{}'",
            spec
        )));
    }
    validation::validate_version(spec)?;
    Ok(spec.to_string())
}

/// `GET /`
pub async fn banner(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "registry": state.registry_url,
        "packages": state.store.snapshot().len(),
    }))
}

/// `GET /package/:name/*spec`: manifest of the best version for a range,
/// either as one expression (`>=1.0.0 <2.0.0`, `latest`) or as comparator
/// path segments (`gte/1.0.0/lt/2.0.0`).
pub async fn resolve_package(
    State(state): State<Arc<AppState>>,
    Path((name, spec)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    validation::validate_package_name(&name)?;

    let segments: Vec<&str> = spec.split('/').filter(|s| !s.is_empty()).collect();
    let range = VersionRange::from_path_segments(&segments)?;
    let version = state.store.resolve(&name, &range)?;
    let record = state.store.get_version(&name, &version)?;

    info!(package = %name, range = %range, version = %version, "Range resolved");
    Ok(Json(record.manifest))
}

/// `PUT /package/:name/:version`: raw tarball body.
pub async fn put_package(
    _publisher: Publisher,
    State(state): State<Arc<AppState>>,
    Path((name, spec)): Path<(String, String)>,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<(StatusCode, Json<OkResponse>)> {
    validation::validate_package_name(&name)?;
    let version = single_version(&spec)?;

    let receipt = state
        .uploads
        .publish(UploadRequest {
            name: name.clone(),
            version: Some(version.clone()),
            bytes: body?,
            manifest: None,
        })
        .await?;

    let status = match receipt.outcome {
        PutOutcome::Created => StatusCode::CREATED,
        PutOutcome::Unchanged => StatusCode::OK,
    };
    Ok((status, Json(OkResponse::new(format!("{}@{}", name, version)))))
}

/// `DELETE /package/:name/:version`
pub async fn delete_package_version(
    _publisher: Publisher,
    State(state): State<Arc<AppState>>,
    Path((name, spec)): Path<(String, String)>,
) -> AppResult<Json<OkResponse>> {
    validation::validate_package_name(&name)?;
    let version = single_version(&spec)?;

    state.store.delete_version(&name, &version).await?;
    Ok(Json(OkResponse::new(format!("{}@{}", name, version))))
}

/// `GET /versions/:name`: ascending by semver precedence, `[]` when unknown.
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<Vec<String>>> {
    validation::validate_package_name(&name)?;

    let versions = state
        .store
        .get_package(&name)
        .map(|package| package.sorted_versions())
        .unwrap_or_default();
    Ok(Json(versions))
}

/// `GET /index`: the raw in-memory index.
pub async fn dump_index(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, Package>> {
    let index = state
        .store
        .snapshot()
        .into_iter()
        .map(|(name, package)| (name, Package::clone(&package)))
        .collect();
    Json(index)
}

/// `GET /info/:name`: raw package record.
pub async fn package_info(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    validation::validate_package_name(&name)?;

    let package = state.store.get_package(&name)?;
    Ok(Json(json!({
        "name": package.name,
        "description": package.description(),
        "author": package.author(),
        "repository": package.repository(),
        "dist-tags": package.dist_tags(),
        "versions": package.sorted_versions(),
        "created": package.created(),
        "modified": package.modified(),
    })))
}
