//! npm registry protocol handlers.
//!
//! Covers what `npm install`, `npm publish`, `npm unpublish`, `npm dist-tag`
//! and `npm login`/`adduser` need. Mutating handlers take the [`Publisher`]
//! extractor first, so unauthenticated requests are refused before the body is
//! read.

use axum::{
    body::Body,
    extract::{rejection::BytesRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::auth::{session_cookie, Publisher};
use crate::documents::{self, DOCUMENT_REV};
use crate::error::{AppError, AppResult};
use crate::resolver::{self, VersionRange};
use crate::state::{AppState, OkResponse};
use crate::store::{Package, PackageStore, PutOutcome};
use crate::upload::UploadRequest;
use crate::validation;

/// CouchDB-style user document id prefix used by `npm adduser`.
const USER_ID_PREFIX: &str = "org.couchdb.user:";

fn publish_status(outcome: PutOutcome) -> StatusCode {
    match outcome {
        PutOutcome::Created => StatusCode::CREATED,
        PutOutcome::Unchanged => StatusCode::OK,
    }
}

/// Pick a version of `package` for a path segment: an exact version, a
/// dist-tag, or a range expression.
fn select_version(package: &Package, spec: &str) -> AppResult<String> {
    if package.versions.contains_key(spec) {
        return Ok(spec.to_string());
    }
    if let Some(tagged) = package.dist_tags().get(spec) {
        return Ok(tagged.clone());
    }

    let range: VersionRange = spec.parse()?;
    resolver::resolve(package.versions.keys().map(String::as_str), &range).ok_or_else(|| {
        info!(package = %package.name, range = %range, "No version satisfies range");
        AppError::NotFound(format!("No version of '{}' satisfies '{}'", package.name, spec))
    })
}

/// `GET /:name`
pub async fn package_document(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    validation::validate_package_name(&name)?;
    debug!(package = %name, "Serving package document");

    let package = state.store.get_package(&name)?;
    Ok(Json(documents::package_document(&package, &state.registry_url)))
}

/// `GET /:name/:version` where the second segment may also be a dist-tag or
/// a range.
pub async fn version_document(
    State(state): State<Arc<AppState>>,
    Path((name, spec)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    validation::validate_package_name(&name)?;

    let package = state.store.get_package(&name)?;
    let version = select_version(&package, &spec)?;
    let record = package
        .versions
        .get(&version)
        .ok_or_else(|| AppError::NotFound(format!("{}@{} not found", name, version)))?;

    Ok(Json(documents::version_document(
        &name,
        record,
        &state.registry_url,
    )))
}

/// `GET /:name/-/:filename`, streamed from disk.
pub async fn download_tarball(
    State(state): State<Arc<AppState>>,
    Path((name, filename)): Path<(String, String)>,
) -> AppResult<Response> {
    validation::validate_package_name(&name)?;
    let version = validation::version_from_tarball_filename(&name, &filename)?;

    let (file, size) = state.store.stream_artifact(&name, &version).await?;
    info!(package = %name, version = %version, size, "Serving tarball");

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        body,
    )
        .into_response())
}

/// `PUT /:name`: a full publish when the document carries `_attachments`,
/// otherwise a package-level metadata update.
pub async fn publish_package(
    _publisher: Publisher,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    validation::validate_package_name(&name)?;
    let doc: Value = serde_json::from_slice(&body?)?;

    if let Some(doc_name) = doc.get("name").and_then(Value::as_str) {
        if doc_name != name {
            return Err(AppError::Validation(format!(
                "Document name '{}' does not match '{}'",
                doc_name, name
            )));
        }
    }

    let has_attachments = doc
        .get("_attachments")
        .and_then(Value::as_object)
        .is_some_and(|attachments| !attachments.is_empty());
    if !has_attachments {
        let persisted = state.store.update_metadata(&name, &doc).await?;
        debug!(package = %name, persisted, "Metadata update acknowledged");
        return Ok((StatusCode::CREATED, Json(OkResponse::new(name))).into_response());
    }

    publish_document(&state, &name, &doc).await
}

async fn publish_document(state: &AppState, name: &str, doc: &Value) -> AppResult<Response> {
    let versions = doc
        .get("versions")
        .and_then(Value::as_object)
        .ok_or_else(|| AppError::Validation("Publish document has no versions".to_string()))?;
    let mut versions = versions.iter();
    let (version, manifest) = match (versions.next(), versions.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(AppError::Validation(
                "Publish document must carry exactly one version".to_string(),
            ))
        }
    };

    let data = doc
        .get("_attachments")
        .and_then(Value::as_object)
        .and_then(|attachments| attachments.values().next())
        .and_then(|attachment| attachment.get("data"))
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Attachment has no data".to_string()))?;
    let bytes = BASE64_STANDARD.decode(data)?;

    info!(package = %name, version = %version, size = bytes.len(), "Publishing package");
    let receipt = state
        .uploads
        .publish(UploadRequest {
            name: name.to_string(),
            version: Some(version.clone()),
            bytes: Bytes::from(bytes),
            manifest: Some(manifest.clone()),
        })
        .await?;

    if let Some(tags) = doc.get("dist-tags").and_then(Value::as_object) {
        apply_publish_tags(&state.store, name, version, tags).await;
    }

    Ok((
        publish_status(receipt.outcome),
        Json(json!({
            "ok": true,
            "id": name,
            "rev": DOCUMENT_REV,
            "success": true,
        })),
    )
        .into_response())
}

/// Point the publish document's dist-tags at the committed version. The
/// version is already published, so tag failures are logged, not returned.
async fn apply_publish_tags(
    store: &PackageStore,
    name: &str,
    version: &str,
    tags: &serde_json::Map<String, Value>,
) {
    for (tag, tagged) in tags {
        if tag == "latest" || tagged.as_str() != Some(version) {
            continue;
        }
        if let Err(e) = validation::validate_tag(tag) {
            warn!(package = %name, tag = %tag, error = %e, "Ignoring invalid dist-tag");
            continue;
        }
        if let Err(e) = store.set_dist_tag(name, tag, version).await {
            warn!(package = %name, version = %version, tag = %tag, error = %e, "Published, but dist-tag was not applied");
        }
    }
}

/// `PUT /:name/-/:filename/-rev/:rev`: raw tarball upload.
pub async fn upload_tarball(
    _publisher: Publisher,
    State(state): State<Arc<AppState>>,
    Path((name, filename, _rev)): Path<(String, String, String)>,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    validation::validate_package_name(&name)?;
    let version = validation::version_from_tarball_filename(&name, &filename)?;

    let receipt = state
        .uploads
        .publish(UploadRequest {
            name: name.clone(),
            version: Some(version),
            bytes: body?,
            manifest: None,
        })
        .await?;

    Ok((publish_status(receipt.outcome), Json(OkResponse::new(name))).into_response())
}

/// `PUT /:name/:version/-tag/:tag`
pub async fn set_tag(
    _publisher: Publisher,
    State(state): State<Arc<AppState>>,
    Path((name, version, tag)): Path<(String, String, String)>,
) -> AppResult<(StatusCode, Json<OkResponse>)> {
    validation::validate_package_name(&name)?;
    validation::validate_version(&version)?;
    validation::validate_tag(&tag)?;

    state.store.set_dist_tag(&name, &tag, &version).await?;
    Ok((StatusCode::CREATED, Json(OkResponse::new(tag))))
}

/// `DELETE /:name/-/:filename/-rev/:rev`: unpublish the tarball's version.
pub async fn unpublish_tarball(
    _publisher: Publisher,
    State(state): State<Arc<AppState>>,
    Path((name, filename, _rev)): Path<(String, String, String)>,
) -> AppResult<Json<OkResponse>> {
    validation::validate_package_name(&name)?;
    let version = validation::version_from_tarball_filename(&name, &filename)?;

    state.store.delete_version(&name, &version).await?;
    Ok(Json(OkResponse::new(name)))
}

/// `DELETE /:name/-rev/:rev`: unpublish every version.
pub async fn unpublish_package(
    _publisher: Publisher,
    State(state): State<Arc<AppState>>,
    Path((name, _rev)): Path<(String, String)>,
) -> AppResult<Json<OkResponse>> {
    validation::validate_package_name(&name)?;

    state.store.delete_package(&name).await?;
    Ok(Json(OkResponse::new(name)))
}

#[derive(Debug, Deserialize)]
struct Credentials {
    name: String,
}

/// Login bodies arrive as JSON or as a form.
fn parse_credentials(body: &[u8]) -> AppResult<Credentials> {
    if let Ok(credentials) = serde_json::from_slice::<Credentials>(body) {
        return Ok(credentials);
    }
    url::form_urlencoded::parse(body)
        .find(|(key, _)| key == "name")
        .map(|(_, name)| Credentials {
            name: name.into_owned(),
        })
        .ok_or_else(|| AppError::Validation("Login requires a name".to_string()))
}

/// `POST /_session`: sets the `AuthSession` cookie.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    let credentials = parse_credentials(&body?)?;
    let token = state.auth.login(&credentials.name)?;

    Ok((
        [(header::SET_COOKIE, session_cookie(&token))],
        Json(json!({
            "ok": true,
            "name": credentials.name,
            "roles": [],
        })),
    )
        .into_response())
}

/// `PUT /-/user/:user`: `npm adduser` / `npm login`. Returns the token.
pub async fn add_user(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> AppResult<Response> {
    let identity = user.strip_prefix(USER_ID_PREFIX).unwrap_or(&user);
    let token = state.auth.login(identity)?;

    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, session_cookie(&token))],
        Json(json!({
            "ok": true,
            "id": format!("{}{}", USER_ID_PREFIX, identity),
            "rev": DOCUMENT_REV,
            "token": token,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    /// Epoch milliseconds
    startkey: Option<i64>,
}

/// `GET /-/all`
pub async fn all_packages(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(documents::bulk_listing(
        &state.store.snapshot(),
        None,
        Utc::now(),
    ))
}

/// `GET /-/all/since?startkey=<epoch ms>`
pub async fn all_packages_since(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SinceQuery>,
) -> Json<Value> {
    let since = query.startkey.and_then(DateTime::<Utc>::from_timestamp_millis);
    Json(documents::bulk_listing(
        &state.store.snapshot(),
        since,
        Utc::now(),
    ))
}

/// `GET /-/ping`
pub async fn ping() -> Json<Value> {
    Json(json!({}))
}
