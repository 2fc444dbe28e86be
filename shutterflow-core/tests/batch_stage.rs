//! Batch creation: deterministic selection, the sequential guard and the
//! staged layout on disk.

mod support;

use std::path::Path;

use shutterflow_core::catalog::{BatchStatus, Catalog, FileStatus};
use shutterflow_core::manifest::Manifest;
use shutterflow_core::settings::{SelectionMode, Settings};
use shutterflow_core::stages::{BatchOutcome, BatchRunner};

use support::{open_catalog, payload, test_settings, write_file};

const KIB: usize = 1024;

/// 15 KiB byte budget expressed in the GiB-denominated setting.
fn small_budget(settings: &mut Settings) {
    settings.batch.max_size_gb = 15.0 / 1048576.0;
}

async fn seed_unique(catalog: &Catalog, path: &Path, size: usize, tag: u8) -> i64 {
    write_file(path, &payload(tag, size)).await;
    let files = catalog.files();
    let path_text = path.to_string_lossy();
    files
        .upsert_discovered(&path_text, size as i64, None, None)
        .await
        .unwrap();
    let record = files.get_by_path(&path_text).await.unwrap().unwrap();
    files
        .mark_unique(record.id, &format!("digest{tag:02}"))
        .await
        .unwrap();
    record.id
}

#[tokio::test]
async fn fills_the_size_budget_in_path_order() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = test_settings(root.path());
    small_budget(&mut settings);
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    let source = settings.paths.source_dir.clone();
    for (tag, name) in ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"]
        .iter()
        .enumerate()
    {
        seed_unique(&catalog, &source.join(name), 4 * KIB, tag as u8).await;
    }

    let runner = BatchRunner::new(catalog.clone(), &settings);
    let outcome = runner.create().await.unwrap();
    let BatchOutcome::Created { batch } = outcome else {
        panic!("expected a created batch, got {outcome:?}");
    };

    // Three 4 KiB files fit the 15 KiB budget; the fourth would overflow.
    assert_eq!(batch.name, "batch_001");
    assert_eq!(batch.status, BatchStatus::Pending);
    assert_eq!(batch.file_count, 3);
    assert_eq!(batch.size_bytes, 3 * 4 * KIB as i64);

    let members = catalog.files().list_for_batch(batch.id).await.unwrap();
    let staged: Vec<_> = members
        .iter()
        .map(|m| {
            Path::new(&m.path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    assert_eq!(staged, ["a.jpg", "b.jpg", "c.jpg"]);
    for member in &members {
        assert_eq!(member.status, FileStatus::Batched);
        assert_eq!(member.batch_id, Some(batch.id));
        assert!(Path::new(&member.path).starts_with(&settings.paths.batch_dir));
        assert!(Path::new(&member.path).exists());
    }

    // Unselected files keep their place in line.
    let d = catalog
        .files()
        .get_by_path(&source.join("d.jpg").to_string_lossy())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(d.status, FileStatus::Unique);
    assert!(d.batch_id.is_none());
}

#[tokio::test]
async fn oversized_leading_file_forms_a_singleton_batch() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = test_settings(root.path());
    small_budget(&mut settings);
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    let source = settings.paths.source_dir.clone();
    seed_unique(&catalog, &source.join("aa_huge.bin"), 20 * KIB, 1).await;
    seed_unique(&catalog, &source.join("zz_small.bin"), 4 * KIB, 2).await;

    let runner = BatchRunner::new(catalog.clone(), &settings);
    let BatchOutcome::Created { batch } = runner.create().await.unwrap() else {
        panic!("expected a created batch");
    };

    assert_eq!(batch.file_count, 1);
    assert_eq!(batch.size_bytes, 20 * KIB as i64);
    let members = catalog.files().list_for_batch(batch.id).await.unwrap();
    assert!(members[0].path.ends_with("aa_huge.bin"));
}

#[tokio::test]
async fn sequential_guard_blocks_until_the_previous_batch_sorts() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = test_settings(root.path());
    small_budget(&mut settings);
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    let source = settings.paths.source_dir.clone();
    seed_unique(&catalog, &source.join("a.jpg"), 4 * KIB, 1).await;
    seed_unique(&catalog, &source.join("b.jpg"), 4 * KIB, 2).await;

    let runner = BatchRunner::new(catalog.clone(), &settings);
    let BatchOutcome::Created { batch } = runner.create().await.unwrap() else {
        panic!("expected a created batch");
    };

    seed_unique(&catalog, &source.join("late.jpg"), 4 * KIB, 3).await;
    let blocked = runner.create().await.unwrap();
    let BatchOutcome::Blocked {
        batch_id,
        name,
        status,
        reason,
    } = blocked
    else {
        panic!("expected the guard to block, got {blocked:?}");
    };
    assert_eq!(batch_id, batch.id);
    assert_eq!(name, batch.name);
    assert_eq!(status, BatchStatus::Pending);
    assert!(reason.contains("pending"));

    // Walk the blocker to SORTED; creation unblocks.
    let batches = catalog.batches();
    assert!(batches.begin_sync(batch.id).await.unwrap());
    assert!(batches.mark_synced(batch.id).await.unwrap());
    assert!(batches.begin_sort(batch.id).await.unwrap());
    assert!(batches.mark_sorted(batch.id).await.unwrap());

    let BatchOutcome::Created { batch: second } = runner.create().await.unwrap() else {
        panic!("expected creation to unblock");
    };
    assert_eq!(second.name, "batch_002");
    assert_eq!(second.file_count, 1);
}

#[tokio::test]
async fn count_mode_takes_the_first_n_files() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = test_settings(root.path());
    settings.batch.selection_mode = SelectionMode::Count;
    settings.batch.max_files = 2;
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    let source = settings.paths.source_dir.clone();
    for (tag, name) in ["a.jpg", "b.jpg", "c.jpg"].iter().enumerate() {
        seed_unique(&catalog, &source.join(name), KIB, tag as u8).await;
    }

    let runner = BatchRunner::new(catalog.clone(), &settings);
    let BatchOutcome::Created { batch } = runner.create().await.unwrap() else {
        panic!("expected a created batch");
    };
    assert_eq!(batch.file_count, 2);
}

#[tokio::test]
async fn empty_pool_reports_nothing_to_do() {
    let root = tempfile::tempdir().unwrap();
    let settings = test_settings(root.path());
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    let runner = BatchRunner::new(catalog, &settings);
    assert!(matches!(
        runner.create().await.unwrap(),
        BatchOutcome::NothingToDo
    ));
}

#[tokio::test]
async fn manifest_freezes_the_staged_membership() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = test_settings(root.path());
    small_budget(&mut settings);
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    let source = settings.paths.source_dir.clone();
    seed_unique(&catalog, &source.join("nested/a.jpg"), 4 * KIB, 1).await;
    seed_unique(&catalog, &source.join("b.jpg"), 4 * KIB, 2).await;

    let runner = BatchRunner::new(catalog.clone(), &settings);
    let BatchOutcome::Created { batch } = runner.create().await.unwrap() else {
        panic!("expected a created batch");
    };

    let manifest_path = settings
        .paths
        .batch_dir
        .join(&batch.name)
        .join("manifest.json");
    assert_eq!(batch.manifest_path.as_deref(), manifest_path.to_str());

    let manifest = Manifest::read(&manifest_path).await.unwrap();
    assert_eq!(manifest.batch, batch.name);
    assert_eq!(manifest.file_count, 2);
    assert_eq!(manifest.size_bytes, batch.size_bytes);

    let relative: Vec<_> = manifest
        .files
        .iter()
        .map(|entry| entry.relative_path.as_str())
        .collect();
    assert_eq!(relative, ["b.jpg", "nested/a.jpg"]);
    assert!(manifest.files.iter().all(|entry| entry.sha256.is_some()));
    for entry in &manifest.files {
        assert!(Path::new(&entry.batch_path).exists());
        assert!(!Path::new(&entry.source_path).exists());
    }
}

#[tokio::test]
async fn leftover_directory_from_a_crashed_run_is_not_reused() {
    let root = tempfile::tempdir().unwrap();
    let settings = test_settings(root.path());
    settings.ensure_directories().unwrap();
    let catalog = open_catalog().await;

    tokio::fs::create_dir_all(settings.paths.batch_dir.join("batch_001"))
        .await
        .unwrap();

    let source = settings.paths.source_dir.clone();
    seed_unique(&catalog, &source.join("a.jpg"), KIB, 1).await;

    let runner = BatchRunner::new(catalog, &settings);
    let BatchOutcome::Created { batch } = runner.create().await.unwrap() else {
        panic!("expected a created batch");
    };
    assert_eq!(batch.name, "batch_002");
}
