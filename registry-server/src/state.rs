//! # Application State Management
//!
//! [`AppState`] bundles the package store, upload pipeline, auth gate and
//! configuration shared by every request handler. It is built once at startup
//! by [`AppState::initialize`], which prepares the data directory and rebuilds
//! the index before the listener is bound.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::auth::AuthGate;
use crate::config::Config;
use crate::documents::DOCUMENT_REV;
use crate::error::AppResult;
use crate::janitor;
use crate::store::{LoadReport, PackageStore};
use crate::upload::UploadPipeline;

/// Application state containing shared configuration and resources.
///
/// Wrapped in an `Arc` and handed to the router with `with_state`.
pub struct AppState {
    pub store: Arc<PackageStore>,
    pub uploads: UploadPipeline,
    pub auth: AuthGate,
    pub config: Arc<Config>,
    /// Externally visible URL, always ending in `/`
    pub registry_url: String,
}

impl AppState {
    /// Prepare the data directory, clear the staging area, load the
    /// publisher allow-list and rebuild the index.
    pub async fn initialize(config: Config) -> AppResult<(Self, LoadReport)> {
        let store = Arc::new(PackageStore::new(&config.storage.data_dir));

        let staging_dir = store.layout().temp_dir();
        tokio::fs::create_dir_all(&staging_dir).await?;
        let swept = janitor::sweep_staging(&staging_dir, None).await?;
        if swept > 0 {
            info!(entries = swept, "Cleared staging area left by a previous run");
        }

        let report = store.load_all().await?;

        let publishers = config.load_publishers()?;
        info!(publishers = publishers.len(), "Publisher allow-list loaded");

        let state = AppState {
            uploads: UploadPipeline::new(store.clone(), config.max_upload_size_bytes()),
            store,
            auth: AuthGate::new(publishers),
            registry_url: config.registry_url(),
            config: Arc::new(config),
        };
        Ok((state, report))
    }
}

/// Acknowledgement document for successful mutations.
///
/// Serializes to: `{"ok": true, "id": "...", "rev": "1-0"}`
#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
    pub id: String,
    pub rev: String,
}

impl OkResponse {
    pub fn new(id: impl Into<String>) -> Self {
        OkResponse {
            ok: true,
            id: id.into(),
            rev: DOCUMENT_REV.to_string(),
        }
    }
}
