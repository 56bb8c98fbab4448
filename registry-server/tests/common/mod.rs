//! Common test utilities and helpers
//!
//! Builds a full registry router over a temporary data directory and provides
//! npm tarball and publish-document fixtures.

#![allow(dead_code)]

use axum_test::TestServer;
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{write::GzEncoder, Compression};
use registry_server::{build_router, AppState, Config};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

pub const PUBLISHER: &str = "alice";
pub const REGISTRY_URL: &str = "http://registry.test/";

/// Test server setup result
pub struct TestSetup {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub temp_dir: TempDir,
}

pub fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = temp_dir.path().to_path_buf();
    config.server.base_url = Some(REGISTRY_URL.to_string());
    config.security.publishers = vec![PUBLISHER.to_string()];
    config
}

/// Creates a registry over a fresh temporary data directory.
pub async fn create_test_setup() -> TestSetup {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    create_test_setup_with(temp_dir, |_| {}).await
}

/// Creates a registry over `temp_dir`, letting the caller adjust the config.
pub async fn create_test_setup_with(temp_dir: TempDir, adjust: impl FnOnce(&mut Config)) -> TestSetup {
    let mut config = test_config(&temp_dir);
    adjust(&mut config);

    let (state, _report) = AppState::initialize(config)
        .await
        .expect("Failed to initialize registry state");
    let state = Arc::new(state);
    let server =
        TestServer::new(build_router(state.clone())).expect("Failed to create test server");

    TestSetup {
        server,
        state,
        temp_dir,
    }
}

/// Log in as the allow-listed publisher and return the session token.
pub async fn login(server: &TestServer) -> String {
    let response = server
        .post("/_session")
        .json(&json!({"name": PUBLISHER, "password": "irrelevant"}))
        .await;
    response.assert_status_ok();

    let cookie = response
        .header("set-cookie")
        .to_str()
        .expect("cookie is ASCII")
        .to_string();
    cookie
        .split(';')
        .next()
        .and_then(|pair| pair.strip_prefix("AuthSession="))
        .expect("AuthSession cookie")
        .to_string()
}

pub fn session_header(token: &str) -> String {
    format!("AuthSession={}", token)
}

/// A deterministic npm tarball with `package/package.json`.
pub fn npm_tarball(name: &str, version: &str) -> Vec<u8> {
    let manifest = manifest(name, version).to_string();

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, content) in [
        ("package/package.json", manifest.as_bytes()),
        ("package/index.js", b"module.exports = 42;\n".as_slice()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content)
            .expect("append tar entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

pub fn manifest(name: &str, version: &str) -> Value {
    json!({
        "name": name,
        "version": version,
        "description": format!("{} test package", name),
        "main": "index.js",
    })
}

/// The document `npm publish` sends to `PUT /:name`.
pub fn publish_document(name: &str, version: &str, tarball: &[u8]) -> Value {
    let filename = format!("{}-{}.tgz", name, version);
    json!({
        "_id": name,
        "name": name,
        "dist-tags": {"latest": version},
        "versions": {version: manifest(name, version)},
        "_attachments": {
            filename: {
                "content_type": "application/octet-stream",
                "data": STANDARD.encode(tarball),
                "length": tarball.len(),
            }
        }
    })
}

/// URL path segment for a package name.
pub fn encoded(name: &str) -> String {
    name.replace('/', "%2f")
}
