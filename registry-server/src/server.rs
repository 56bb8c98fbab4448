//! Router assembly and the serve loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{api, config::Config, janitor, npm, state::AppState};

/// Build the full router over an initialized state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_request_body_size_bytes();

    Router::new()
        .route("/", get(api::banner))
        .route("/-/ping", get(npm::ping))
        .route("/-/all", get(npm::all_packages))
        .route("/-/all/since", get(npm::all_packages_since))
        .route("/-/user/{user}", put(npm::add_user))
        .route("/_session", post(npm::create_session))
        .route("/index", get(api::dump_index))
        .route("/info/{name}", get(api::package_info))
        .route("/versions/{name}", get(api::list_versions))
        .route(
            "/package/{name}/{*spec}",
            get(api::resolve_package)
                .put(api::put_package)
                .delete(api::delete_package_version),
        )
        .route(
            "/{name}",
            get(npm::package_document).put(npm::publish_package),
        )
        .route("/{name}/{version}", get(npm::version_document))
        .route("/{name}/{version}/-tag/{tag}", put(npm::set_tag))
        .route("/{name}/-/{filename}", get(npm::download_tarball))
        .route(
            "/{name}/-/{filename}/-rev/{rev}",
            put(npm::upload_tarball).delete(npm::unpublish_tarball),
        )
        .route(
            "/{name}/-rev/{rev}",
            axum::routing::delete(npm::unpublish_package),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Initialize state, start the staging janitor and serve until the listener
/// fails.
pub async fn run_server(config: Config) -> Result<()> {
    info!("Starting package registry");

    let host = config.server.host.clone();
    let port = config.server.port;
    let addr: SocketAddr = format!("{}:{}", host, port).parse().map_err(|e| {
        error!(host = %host, port = %port, error = %e, "Invalid socket address");
        anyhow::anyhow!("Invalid socket address {}:{}: {}", host, port, e)
    })?;

    let (state, report) = AppState::initialize(config).await.map_err(|e| {
        error!(error = %e, "Failed to initialize registry state");
        anyhow::anyhow!("Failed to initialize registry state: {}", e)
    })?;
    if !report.skipped.is_empty() {
        warn!(
            skipped = report.skipped.len(),
            "Some entries in the data directory were not loaded"
        );
    }
    info!(
        data_dir = %state.store.layout().root().display(),
        registry_url = %state.registry_url,
        packages = report.packages,
        versions = report.versions,
        "Registry state ready"
    );

    let state = Arc::new(state);
    tokio::spawn(janitor::start_janitor_task(
        state.store.layout().temp_dir(),
        state.config.staging.clone(),
    ));

    let app = build_router(state);

    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "Failed to bind to address");
        anyhow::anyhow!("Failed to bind to {}:{}: {}", host, port, e)
    })?;

    info!("Server listening on {}", addr);
    axum::serve(listener, app).await.map_err(|e| {
        error!(error = %e, "Server error");
        anyhow::anyhow!("Server error: {}", e)
    })?;

    Ok(())
}
