//! Housekeeping pass: batch-directory reclamation is catalog-aware,
//! temp pruning honors the retention window and oversized logs rotate.

mod support;

use shutterflow_core::catalog::Catalog;
use shutterflow_core::stages::CleanupRunner;

use support::{open_catalog, test_settings, write_file};

async fn seed_batch_row(catalog: &Catalog, name: &str, walk_to_sorted: bool) -> i64 {
    let files = catalog.files();
    let path = format!("/pool/{name}/seed.jpg");
    files.upsert_discovered(&path, 10, None, None).await.unwrap();
    let file = files.get_by_path(&path).await.unwrap().unwrap();
    files.mark_unique(file.id, name).await.unwrap();

    let batches = catalog.batches();
    let (batch, _) = batches
        .create_with_members(
            name,
            &[shutterflow_core::catalog::BatchMember {
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
    if walk_to_sorted {
        assert!(batches.begin_sync(batch.id).await.unwrap());
        assert!(batches.mark_synced(batch.id).await.unwrap());
        assert!(batches.begin_sort(batch.id).await.unwrap());
        assert!(batches.mark_sorted(batch.id).await.unwrap());
    }
    batch.id
}

#[tokio::test]
async fn reclaims_only_directories_of_sorted_batches() {
    let root = tempfile::tempdir().unwrap();
    let settings = test_settings(root.path());
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    // SORTED batch: directory holds only the manifest left by sorting.
    seed_batch_row(&catalog, "batch_001", true).await;
    write_file(
        &settings.paths.batch_dir.join("batch_001/manifest.json"),
        b"{}",
    )
    .await;

    // PENDING batch: still staging its files, untouchable.
    seed_batch_row(&catalog, "batch_002", false).await;
    write_file(&settings.paths.batch_dir.join("batch_002/a.jpg"), b"x").await;

    // Unknown directory matching the pattern, empty: leftover, reclaimed.
    tokio::fs::create_dir_all(settings.paths.batch_dir.join("batch_099"))
        .await
        .unwrap();

    // Unknown directory with a foreign name: never touched.
    write_file(&settings.paths.batch_dir.join("holiday/img.jpg"), b"x").await;

    let cleanup = CleanupRunner::new(catalog.clone(), &settings);
    let report = cleanup.run().await.unwrap();

    let removed: Vec<_> = report
        .removed_batch_dirs
        .iter()
        .map(|path| path.rsplit('/').next().unwrap().to_string())
        .collect();
    assert_eq!(removed, ["batch_001", "batch_099"]);

    assert!(!settings.paths.batch_dir.join("batch_001").exists());
    assert!(!settings.paths.batch_dir.join("batch_099").exists());
    assert!(settings.paths.batch_dir.join("batch_002/a.jpg").exists());
    assert!(settings.paths.batch_dir.join("holiday/img.jpg").exists());
}

#[tokio::test]
async fn sorted_batch_directory_with_leftover_files_is_kept() {
    let root = tempfile::tempdir().unwrap();
    let settings = test_settings(root.path());
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    seed_batch_row(&catalog, "batch_001", true).await;
    write_file(
        &settings.paths.batch_dir.join("batch_001/manifest.json"),
        b"{}",
    )
    .await;
    write_file(&settings.paths.batch_dir.join("batch_001/straggler.jpg"), b"x").await;

    let cleanup = CleanupRunner::new(catalog.clone(), &settings);
    let report = cleanup.run().await.unwrap();

    assert!(report.removed_batch_dirs.is_empty());
    assert!(settings.paths.batch_dir.join("batch_001/straggler.jpg").exists());
}

#[tokio::test]
async fn temp_files_outside_the_retention_window_are_pruned() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = test_settings(root.path());
    settings.cleanup.temp_retention_days = 0;
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    write_file(&settings.paths.temp_dir.join("stale.part"), b"x").await;
    write_file(&settings.paths.temp_dir.join("nested/old.tmp"), b"x").await;

    let cleanup = CleanupRunner::new(catalog, &settings);
    let report = cleanup.run().await.unwrap();

    assert_eq!(report.deleted_temp_files.len(), 2);
    assert!(!settings.paths.temp_dir.join("stale.part").exists());
    assert!(!settings.paths.temp_dir.join("nested/old.tmp").exists());
}

#[tokio::test]
async fn recent_temp_files_survive_the_default_retention() {
    let root = tempfile::tempdir().unwrap();
    let settings = test_settings(root.path());
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    write_file(&settings.paths.temp_dir.join("fresh.part"), b"x").await;

    let cleanup = CleanupRunner::new(catalog, &settings);
    let report = cleanup.run().await.unwrap();

    assert!(report.deleted_temp_files.is_empty());
    assert!(settings.paths.temp_dir.join("fresh.part").exists());
}

#[tokio::test]
async fn oversized_logs_rotate_and_restart_empty() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = test_settings(root.path());
    settings.cleanup.log_dir = Some(root.path().join("logs"));
    settings.cleanup.log_max_bytes = 16;
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    let logs = root.path().join("logs");
    write_file(&logs.join("pipeline.log"), &[b'x'; 64]).await;
    write_file(&logs.join("quiet.log"), b"short").await;

    let cleanup = CleanupRunner::new(catalog, &settings);
    let report = cleanup.run().await.unwrap();

    assert_eq!(report.rotated_logs.len(), 1);
    assert!(report.rotated_logs[0].ends_with("pipeline.log.1"));
    assert_eq!(
        tokio::fs::read(logs.join("pipeline.log.1")).await.unwrap(),
        vec![b'x'; 64]
    );
    assert_eq!(
        tokio::fs::metadata(logs.join("pipeline.log"))
            .await
            .unwrap()
            .len(),
        0
    );
    assert_eq!(
        tokio::fs::read(logs.join("quiet.log")).await.unwrap(),
        b"short"
    );
}
