//! Integration tests for the registry HTTP surface
//!
//! Drives the full router through axum-test: npm publish/install flows, range
//! resolution, unpublish, dist-tags, authentication and persistence across a
//! restart.

use axum::http::StatusCode;
use serde_json::{json, Value};

mod common;
use common::{
    create_test_setup, create_test_setup_with, encoded, login, manifest, npm_tarball,
    publish_document, session_header, TestSetup, REGISTRY_URL,
};

async fn publish_raw(setup: &TestSetup, token: &str, name: &str, version: &str) {
    setup
        .server
        .put(&format!("/package/{}/{}", encoded(name), version))
        .add_header("Cookie", session_header(token))
        .bytes(npm_tarball(name, version).into())
        .await
        .assert_status(StatusCode::CREATED);
}

fn assert_not_found(body: &Value) {
    assert_eq!(
        body,
        &json!({"error": "not_found", "reason": "document not found"})
    );
}

#[tokio::test]
async fn test_npm_publish_then_install() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;
    let tarball = npm_tarball("left-pad", "1.0.0");

    setup
        .server
        .put("/left-pad")
        .add_header("Cookie", session_header(&token))
        .json(&publish_document("left-pad", "1.0.0", &tarball))
        .await
        .assert_status(StatusCode::CREATED);

    let response = setup.server.get("/left-pad").await;
    response.assert_status_ok();
    let doc: Value = response.json();
    assert_eq!(doc["_id"], "left-pad");
    assert_eq!(doc["dist-tags"]["latest"], "1.0.0");
    assert_eq!(doc["description"], "left-pad test package");
    let dist = &doc["versions"]["1.0.0"]["dist"];
    assert_eq!(
        dist["tarball"],
        format!("{}left-pad/-/left-pad-1.0.0.tgz", REGISTRY_URL)
    );
    assert_eq!(dist["shasum"], registry_server::sha1_hash(&tarball));
    assert_eq!(dist["integrity"], registry_server::sha512_integrity(&tarball));
    assert!(doc["time"]["1.0.0"].is_string());

    let download = setup.server.get("/left-pad/-/left-pad-1.0.0.tgz").await;
    download.assert_status_ok();
    assert_eq!(
        download.header("content-type").to_str().unwrap(),
        "application/octet-stream"
    );
    assert_eq!(download.as_bytes().as_ref(), tarball.as_slice());

    let version_doc: Value = setup.server.get("/left-pad/1.0.0").await.json();
    assert_eq!(version_doc["main"], "index.js");
    assert_eq!(version_doc["dist"]["shasum"], dist["shasum"]);
}

#[tokio::test]
async fn test_scoped_package_round_trip() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;
    let tarball = npm_tarball("@acme/widgets", "0.1.0");

    setup
        .server
        .put("/@acme%2fwidgets")
        .add_header("Cookie", session_header(&token))
        .json(&publish_document("@acme/widgets", "0.1.0", &tarball))
        .await
        .assert_status(StatusCode::CREATED);

    let doc: Value = setup.server.get("/@acme%2fwidgets").await.json();
    assert_eq!(
        doc["versions"]["0.1.0"]["dist"]["tarball"],
        format!("{}@acme%2fwidgets/-/widgets-0.1.0.tgz", REGISTRY_URL)
    );

    let download = setup.server.get("/@acme%2fwidgets/-/widgets-0.1.0.tgz").await;
    download.assert_status_ok();
    assert_eq!(download.as_bytes().as_ref(), tarball.as_slice());
}

#[tokio::test]
async fn test_unauthenticated_mutations_refused() {
    let setup = create_test_setup().await;
    let tarball = npm_tarball("left-pad", "1.0.0");

    let response = setup
        .server
        .put("/left-pad")
        .json(&publish_document("left-pad", "1.0.0", &tarball))
        .await;
    response.assert_status(StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["ok"], false);
    assert_eq!(body["rev"], "1-0");

    setup
        .server
        .put("/package/left-pad/1.0.0")
        .add_header("Cookie", "AuthSession=forged")
        .bytes(tarball.into())
        .await
        .assert_status(StatusCode::FORBIDDEN);

    setup
        .server
        .delete("/left-pad/-rev/1-0")
        .await
        .assert_status(StatusCode::FORBIDDEN);

    let missing = setup.server.get("/left-pad").await;
    missing.assert_status(StatusCode::NOT_FOUND);
    assert_not_found(&missing.json());
    assert!(std::fs::read_dir(setup.temp_dir.path().join("packages"))
        .unwrap()
        .next()
        .is_none());
}

fn disk_listing(root: &std::path::Path) -> Vec<(String, u64)> {
    let mut listing = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let metadata = entry.metadata().unwrap();
            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                let relative = entry.path().strip_prefix(root).unwrap().display().to_string();
                listing.push((relative, metadata.len()));
            }
        }
    }
    listing.sort();
    listing
}

#[tokio::test]
async fn test_unauthenticated_mutations_leave_existing_package_intact() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;
    publish_raw(&setup, &token, "left-pad", "1.0.0").await;

    let data_dir = setup.temp_dir.path();
    let disk_before = disk_listing(data_dir);
    let document_before: Value = setup.server.get("/left-pad").await.json();

    let forged = session_header("forged");
    let next = npm_tarball("left-pad", "1.1.0");
    let attempts = [
        setup
            .server
            .put("/left-pad/1.0.0/-tag/beta")
            .json(&json!("1.0.0"))
            .await,
        setup
            .server
            .put("/left-pad/1.0.0/-tag/beta")
            .add_header("Cookie", forged.clone())
            .json(&json!("1.0.0"))
            .await,
        setup.server.delete("/package/left-pad/1.0.0").await,
        setup
            .server
            .delete("/package/left-pad/1.0.0")
            .add_header("Cookie", forged.clone())
            .await,
        setup
            .server
            .put("/left-pad/-/left-pad-1.1.0.tgz/-rev/1-0")
            .bytes(next.clone().into())
            .await,
        setup
            .server
            .put("/left-pad/-/left-pad-1.1.0.tgz/-rev/1-0")
            .add_header("Authorization", "Bearer forged")
            .bytes(next.into())
            .await,
        setup
            .server
            .delete("/left-pad/-/left-pad-1.0.0.tgz/-rev/1-0")
            .await,
        setup.server.delete("/left-pad/-rev/1-0").await,
        setup
            .server
            .put("/left-pad")
            .json(&json!({"name": "left-pad", "description": "hijacked"}))
            .await,
    ];
    for response in attempts {
        response.assert_status(StatusCode::FORBIDDEN);
    }

    assert_eq!(disk_listing(data_dir), disk_before);
    let document_after: Value = setup.server.get("/left-pad").await.json();
    assert_eq!(document_after, document_before);
    assert_eq!(
        setup.state.store.get_versions("left-pad"),
        vec!["1.0.0".to_string()]
    );
    assert!(!setup
        .state
        .store
        .get_package("left-pad")
        .unwrap()
        .dist_tags()
        .contains_key("beta"));
}

#[tokio::test]
async fn test_login_and_adduser() {
    let setup = create_test_setup().await;

    setup
        .server
        .post("/_session")
        .json(&json!({"name": "mallory", "password": "pw"}))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let form_login = setup
        .server
        .post("/_session")
        .text("name=alice&password=pw")
        .await;
    form_login.assert_status_ok();
    assert_eq!(form_login.json::<Value>()["name"], "alice");

    let response = setup
        .server
        .put("/-/user/org.couchdb.user:alice")
        .json(&json!({"name": "alice", "password": "pw"}))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["id"], "org.couchdb.user:alice");
    let token = body["token"].as_str().unwrap().to_string();

    // The bearer form is what npm sends after adduser
    setup
        .server
        .put("/package/left-pad/1.0.0")
        .add_header("Authorization", format!("Bearer {}", token))
        .bytes(npm_tarball("left-pad", "1.0.0").into())
        .await
        .assert_status(StatusCode::CREATED);

    setup
        .server
        .put("/-/user/org.couchdb.user:mallory")
        .json(&json!({"name": "mallory", "password": "pw"}))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_republish_idempotent_and_conflicting() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;
    publish_raw(&setup, &token, "left-pad", "1.0.0").await;

    setup
        .server
        .put("/package/left-pad/1.0.0")
        .add_header("Cookie", session_header(&token))
        .bytes(npm_tarball("left-pad", "1.0.0").into())
        .await
        .assert_status_ok();

    let mut divergent = manifest("left-pad", "1.0.0");
    divergent["main"] = json!("other.js");
    let mut doc = publish_document("left-pad", "1.0.0", &npm_tarball("left-pad", "1.0.0"));
    doc["versions"]["1.0.0"] = divergent;

    let response = setup
        .server
        .put("/left-pad")
        .add_header("Cookie", session_header(&token))
        .json(&doc)
        .await;
    response.assert_status(StatusCode::CONFLICT);
    assert_eq!(response.json::<Value>()["error"], "conflict");

    let stored: Value = setup.server.get("/left-pad/1.0.0").await.json();
    assert_eq!(stored["main"], "index.js");
}

#[tokio::test]
async fn test_version_mismatch_rejected() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;

    let response = setup
        .server
        .put("/package/left-pad/1.0.1")
        .add_header("Cookie", session_header(&token))
        .bytes(npm_tarball("left-pad", "1.0.0").into())
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "bad_request");

    setup
        .server
        .get("/left-pad")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_range_resolution() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;
    for version in ["1.0.0", "1.2.0", "2.0.0"] {
        publish_raw(&setup, &token, "foo", version).await;
    }

    let interval: Value = setup
        .server
        .get("/package/foo/%3E%3D1.0.0%20%3C2.0.0")
        .await
        .json();
    assert_eq!(interval["version"], "1.2.0");

    let path_form: Value = setup.server.get("/package/foo/gte/1.0.0/lt/2.0.0").await.json();
    assert_eq!(path_form["version"], "1.2.0");

    let latest: Value = setup.server.get("/package/foo/latest").await.json();
    assert_eq!(latest["version"], "2.0.0");

    let npm_range: Value = setup.server.get("/foo/%3C2.0.0").await.json();
    assert_eq!(npm_range["version"], "1.2.0");

    let unknown = setup.server.get("/package/bar/1.0.0").await;
    unknown.assert_status(StatusCode::NOT_FOUND);
    assert_not_found(&unknown.json());

    setup
        .server
        .get("/package/foo/%3E2.0.0")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    setup
        .server
        .get("/package/foo/gte/banana")
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let versions: Vec<String> = setup.server.get("/versions/foo").await.json();
    assert_eq!(versions, vec!["1.0.0", "1.2.0", "2.0.0"]);
    let none: Vec<String> = setup.server.get("/versions/bar").await.json();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_delete_last_version_removes_package() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;
    publish_raw(&setup, &token, "foo", "1.0.0").await;
    publish_raw(&setup, &token, "bar", "1.0.0").await;

    setup
        .server
        .delete("/package/foo/1.0.0")
        .add_header("Cookie", session_header(&token))
        .await
        .assert_status_ok();

    let missing = setup.server.get("/foo").await;
    missing.assert_status(StatusCode::NOT_FOUND);
    assert_not_found(&missing.json());

    let listing: Value = setup.server.get("/-/all").await.json();
    assert!(listing.get("foo").is_none());
    assert_eq!(listing["bar"]["dist-tags"]["latest"], "1.0.0");
    assert!(listing["_updated"].is_number());
}

#[tokio::test]
async fn test_npm_unpublish_routes() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;
    for version in ["1.0.0", "1.1.0"] {
        publish_raw(&setup, &token, "foo", version).await;
    }

    setup
        .server
        .delete("/foo/-/foo-1.0.0.tgz/-rev/1-0")
        .add_header("Cookie", session_header(&token))
        .await
        .assert_status_ok();
    let doc: Value = setup.server.get("/foo").await.json();
    assert!(doc["versions"].get("1.0.0").is_none());
    assert_eq!(doc["dist-tags"]["latest"], "1.1.0");

    setup
        .server
        .delete("/foo/-rev/1-0")
        .add_header("Cookie", session_header(&token))
        .await
        .assert_status_ok();
    setup
        .server
        .get("/foo")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dist_tags_and_metadata_update() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;
    for version in ["1.0.0", "2.0.0"] {
        publish_raw(&setup, &token, "foo", version).await;
    }

    let response = setup
        .server
        .put("/foo/1.0.0/-tag/legacy")
        .add_header("Cookie", session_header(&token))
        .await;
    response.assert_status(StatusCode::CREATED);
    assert_eq!(response.json::<Value>()["id"], "legacy");

    setup
        .server
        .put("/foo")
        .add_header("Cookie", session_header(&token))
        .json(&json!({"name": "foo", "description": "Updated description"}))
        .await
        .assert_status(StatusCode::CREATED);

    let doc: Value = setup.server.get("/foo").await.json();
    assert_eq!(doc["dist-tags"]["legacy"], "1.0.0");
    assert_eq!(doc["dist-tags"]["latest"], "2.0.0");
    assert_eq!(doc["description"], "Updated description");

    let tagged: Value = setup.server.get("/foo/legacy").await.json();
    assert_eq!(tagged["version"], "1.0.0");

    let info: Value = setup.server.get("/info/foo").await.json();
    assert_eq!(info["versions"], json!(["1.0.0", "2.0.0"]));
}

#[tokio::test]
async fn test_index_survives_restart() {
    let setup = create_test_setup().await;
    let token = login(&setup.server).await;
    publish_raw(&setup, &token, "foo", "1.0.0").await;
    publish_raw(&setup, &token, "@acme/widgets", "0.1.0").await;

    let before: Value = setup.server.get("/index").await.json();
    let TestSetup { temp_dir, .. } = setup;

    let restarted = create_test_setup_with(temp_dir, |_| {}).await;
    let after: Value = restarted.server.get("/index").await.json();
    assert_eq!(before, after);

    let download = restarted.server.get("/foo/-/foo-1.0.0.tgz").await;
    download.assert_status_ok();
    assert_eq!(download.as_bytes().as_ref(), npm_tarball("foo", "1.0.0").as_slice());
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let setup = create_test_setup_with(temp_dir, |config| {
        config.limits.max_request_body_size_mb = 1;
    })
    .await;
    let token = login(&setup.server).await;

    let response = setup
        .server
        .put("/package/foo/1.0.0")
        .add_header("Cookie", session_header(&token))
        .bytes(vec![0u8; 2 * 1024 * 1024].into())
        .await;
    response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(response.json::<Value>()["error"], "payload_too_large");
}

#[tokio::test]
async fn test_banner_and_ping() {
    let setup = create_test_setup().await;

    let ping: Value = setup.server.get("/-/ping").await.json();
    assert_eq!(ping, json!({}));

    let banner: Value = setup.server.get("/").await.json();
    assert_eq!(banner["name"], "registry-server");
    assert_eq!(banner["registry"], REGISTRY_URL);
}
