//! End-to-end coverage of the HTTP surface: authentication, error
//! envelopes and the stage endpoints driving a batch through its
//! lifecycle against a stubbed replication service.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};
use tempfile::TempDir;

use shutterflow_core::catalog::{BatchMember, Catalog};
use shutterflow_core::pipeline::PipelineRunner;
use shutterflow_core::settings::{PathSettings, Settings};
use shutterflow_core::syncthing::{ReplicationApi, ReplicationError};
use shutterflow_server::auth::API_KEY_HEADER;
use shutterflow_server::routes;
use shutterflow_server::state::AppState;

/// Replication double that accepts every rescan and reports instant
/// full completion.
#[derive(Debug)]
struct StaticReplication;

#[async_trait]
impl ReplicationApi for StaticReplication {
    async fn rescan_folder(
        &self,
        _folder: &str,
        _subdirs: &[String],
    ) -> Result<(), ReplicationError> {
        Ok(())
    }

    async fn rescan_path(&self, _path: &str) -> Result<(), ReplicationError> {
        Ok(())
    }

    async fn folder_completion(
        &self,
        _folder: &str,
        _device: Option<&str>,
    ) -> Result<f64, ReplicationError> {
        Ok(100.0)
    }

    async fn ping(&self) -> Result<(), ReplicationError> {
        Ok(())
    }
}

struct TestApp {
    server: TestServer,
    catalog: Catalog,
    settings: Settings,
    _root: TempDir,
}

async fn spawn_app(api_key: Option<&str>) -> TestApp {
    let root = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::default();
    settings.paths = PathSettings::rooted_at(root.path());
    settings.catalog.db_path = root.path().join("catalog.sqlite");
    settings.server.api_key = api_key.map(str::to_string);
    settings.syncthing.folder_id = "photos".to_string();
    settings.syncthing.rescan_settle_secs = 0;
    settings.pipeline.poll_interval_secs = 0;
    settings.ensure_directories().expect("pipeline directories");

    let catalog = Catalog::open(&settings.catalog.db_path)
        .await
        .expect("open catalog");
    let api: Arc<dyn ReplicationApi> = Arc::new(StaticReplication);
    let pipeline = PipelineRunner::new(catalog.clone(), api, &settings);
    let state = AppState::new(catalog.clone(), pipeline, settings.server.api_key.clone());
    let server = TestServer::new(routes::create_app(state)).expect("test server");

    TestApp {
        server,
        catalog,
        settings,
        _root: root,
    }
}

fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, bytes).expect("write file");
}

/// Polls `path` until `done` accepts the body, failing after one second.
async fn wait_for<F>(server: &TestServer, path: &str, done: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    for _ in 0..100 {
        let response = server.get(path).await;
        response.assert_status_ok();
        let body: Value = response.json();
        if done(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting on {path}");
}

async fn seed_pending_batch(catalog: &Catalog, name: &str) -> i64 {
    let files = catalog.files();
    let path = format!("/pool/{name}/seed.jpg");
    files
        .upsert_discovered(&path, 10, None, None)
        .await
        .unwrap();
    let file = files.get_by_path(&path).await.unwrap().unwrap();
    files.mark_unique(file.id, name).await.unwrap();

    let batches = catalog.batches();
    let (batch, _) = batches
        .create_with_members(
            name,
            &[BatchMember {
                file_id: file.id,
                size: 10,
            }],
        )
        .await
        .unwrap()
        .unwrap();
    batches
        .finalize_pending(batch.id, 10, 1, &format!("/batches/{name}/manifest.json"))
        .await
        .unwrap();
    batch.id
}

#[tokio::test]
async fn api_requests_require_the_configured_key() {
    let app = spawn_app(Some("secret")).await;
    let server = &app.server;

    // Health stays open for probes.
    let health = server.get("/health").await;
    health.assert_status_ok();

    let missing = server.get("/api/v1/pipeline/status").await;
    missing.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = missing.json();
    assert_eq!(body["error"]["message"], json!("missing API key"));
    assert_eq!(body["error"]["status"], json!(401));

    let wrong = server
        .get("/api/v1/pipeline/status")
        .add_header(API_KEY_HEADER, "nope")
        .await;
    wrong.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = wrong.json();
    assert_eq!(body["error"]["message"], json!("invalid API key"));

    let accepted = server
        .get("/api/v1/pipeline/status")
        .add_header(API_KEY_HEADER, "secret")
        .await;
    accepted.assert_status_ok();
}

#[tokio::test]
async fn an_open_server_skips_authentication() {
    let app = spawn_app(None).await;

    let status = app.server.get("/api/v1/pipeline/status").await;
    status.assert_status_ok();
    let body: Value = status.json();
    assert_eq!(body["running"], json!(false));
    assert!(body["last_run"].is_null());
}

#[tokio::test]
async fn unknown_batches_surface_the_error_envelope() {
    let app = spawn_app(None).await;

    let missing = app.server.get("/api/v1/batches/999").await;
    missing.assert_status(StatusCode::NOT_FOUND);
    let body: Value = missing.json();
    assert_eq!(body["error"]["status"], json!(404));
    assert!(
        body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("batch 999")
    );
}

#[tokio::test]
async fn sorting_an_unsynced_batch_is_a_conflict() {
    let app = spawn_app(None).await;
    let batch_id = seed_pending_batch(&app.catalog, "batch_001").await;

    let response = app
        .server
        .post(&format!("/api/v1/batches/{batch_id}/sort"))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"]["status"], json!(409));
}

#[tokio::test]
async fn batch_listing_filters_by_status() {
    let app = spawn_app(None).await;
    seed_pending_batch(&app.catalog, "batch_001").await;

    let all = app.server.get("/api/v1/batches").await;
    all.assert_status_ok();
    let body: Value = all.json();
    assert_eq!(body.as_array().expect("list").len(), 1);

    let pending = app.server.get("/api/v1/batches?status=PENDING").await;
    pending.assert_status_ok();
    let body: Value = pending.json();
    assert_eq!(body.as_array().expect("list").len(), 1);
    assert_eq!(body[0]["name"], json!("batch_001"));

    let synced = app.server.get("/api/v1/batches?status=SYNCED").await;
    synced.assert_status_ok();
    let body: Value = synced.json();
    assert!(body.as_array().expect("list").is_empty());

    let bogus = app.server.get("/api/v1/batches?status=BOGUS").await;
    bogus.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn drives_a_batch_from_pool_to_archive_over_http() {
    let app = spawn_app(None).await;
    let server = &app.server;

    write_file(&app.settings.paths.source_dir.join("a.jpg"), &[0xAA; 2048]);
    write_file(&app.settings.paths.source_dir.join("b.jpg"), &[0xBB; 2048]);

    // Dedup hashes the pool in the background.
    let run = server.post("/api/v1/dedup/run").await;
    run.assert_status(StatusCode::ACCEPTED);
    let body: Value = run.json();
    assert_eq!(body["started"], json!(true));

    let snapshot = wait_for(server, "/api/v1/dedup/status", |body| {
        body["running"] == json!(false) && body["processed_files"].as_i64() == Some(2)
    })
    .await;
    assert_eq!(snapshot["unique_files"], json!(2));

    // Batch the unique pool.
    let created = server.post("/api/v1/batches").await;
    created.assert_status_ok();
    let body: Value = created.json();
    assert_eq!(body["outcome"], json!("created"));
    assert_eq!(body["batch"]["name"], json!("batch_001"));
    let batch_id = body["batch"]["id"].as_i64().expect("batch id");

    // Hand the batch to replication; the stub completes instantly.
    let started = server
        .post(&format!("/api/v1/batches/{batch_id}/sync"))
        .await;
    started.assert_status_ok();
    let body: Value = started.json();
    assert_eq!(body["started"], json!(true));

    let polled = server.get(&format!("/api/v1/batches/{batch_id}/sync")).await;
    polled.assert_status_ok();
    let body: Value = polled.json();
    assert_eq!(body["status"], json!("SYNCED"));
    assert_eq!(body["sync_progress"], json!(100.0));

    // Sort into the dated archive.
    let sorted = server
        .post(&format!("/api/v1/batches/{batch_id}/sort"))
        .await;
    sorted.assert_status_ok();
    let report: Value = sorted.json();
    assert_eq!(report["sorted_files"], json!(2));
    assert_eq!(report["failed_files"], json!(0));

    let detail = server.get(&format!("/api/v1/batches/{batch_id}")).await;
    detail.assert_status_ok();
    let body: Value = detail.json();
    assert_eq!(body["batch"]["status"], json!("SORTED"));
    let members = body["files"].as_array().expect("files");
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|f| f["status"] == json!("SORTED")));

    // Cleanup reclaims the emptied batch directory.
    let cleanup = server.post("/api/v1/cleanup/run").await;
    cleanup.assert_status_ok();
    let report: Value = cleanup.json();
    let removed = report["removed_batch_dirs"].as_array().expect("removed");
    assert_eq!(removed.len(), 1);
    assert!(
        removed[0]
            .as_str()
            .expect("path")
            .ends_with("batch_001")
    );
}

#[tokio::test]
async fn a_triggered_cycle_completes_in_the_background() {
    let app = spawn_app(None).await;
    write_file(&app.settings.paths.source_dir.join("a.jpg"), &[0x11; 1024]);

    let run = app.server.post("/api/v1/pipeline/run").await;
    run.assert_status(StatusCode::ACCEPTED);
    let body: Value = run.json();
    assert_eq!(body["started"], json!(true));

    let status = wait_for(&app.server, "/api/v1/pipeline/status", |body| {
        body["running"] == json!(false) && !body["last_run"].is_null()
    })
    .await;

    let steps = status["last_run"]["steps"].as_array().expect("steps");
    let names: Vec<&str> = steps
        .iter()
        .map(|step| step["name"].as_str().expect("name"))
        .collect();
    assert_eq!(names, ["dedup", "batch", "sync", "sort", "cleanup"]);
    assert!(steps.iter().all(|step| step["status"] == json!("completed")));

    let overview = app.server.get("/api/v1/overview").await;
    overview.assert_status_ok();
    let body: Value = overview.json();
    assert_eq!(body["file_counts"]["SORTED"], json!(1));
    assert_eq!(body["recent_batches"].as_array().expect("batches").len(), 1);
    assert_eq!(body["running"], json!(false));
}
