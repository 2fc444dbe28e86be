#![allow(dead_code)]

pub mod replication;

use std::path::Path;

use shutterflow_core::catalog::Catalog;
use shutterflow_core::settings::{PathSettings, Settings};

/// Settings rooted in a scratch directory, tuned so tests never wait on
/// real-world delays.
pub fn test_settings(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.paths = PathSettings::rooted_at(root);
    settings.catalog.db_path = root.join("catalog.sqlite");
    settings.syncthing.rescan_settle_secs = 0;
    settings.pipeline.poll_interval_secs = 1;
    settings.pipeline.poll_samples = 1;
    settings.pipeline.post_sync_delay_secs = 0;
    settings
}

pub async fn open_catalog() -> Catalog {
    Catalog::in_memory().await.expect("in-memory catalog")
}

/// Write a file, creating parent directories as needed.
pub async fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.expect("create parents");
    }
    tokio::fs::write(path, contents).await.expect("write file");
}

/// Distinct file contents of a given size; the tag keeps digests unique.
pub fn payload(tag: u8, size: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; size];
    if let Some(first) = bytes.first_mut() {
        *first = tag;
    }
    bytes
}
