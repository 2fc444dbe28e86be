use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::catalog::{Catalog, EventLevel, FileStatus};
use crate::digest;
use crate::error::{PipelineError, Result};
use crate::fsops;
use crate::settings::Settings;

/// Live view of a dedup pass, kept current while the pass runs and left
/// holding the final numbers afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupSnapshot {
    pub running: bool,
    pub total_files: u64,
    pub processed_files: u64,
    pub unique_files: u64,
    pub duplicate_files: u64,
    pub error_files: u64,
    pub last_processed: Option<String>,
    pub error: Option<String>,
}

/// Walks the source pool, hashes NEW files and splits them into UNIQUE
/// and DUPLICATE. Passes are single-flight; a pass over already-processed
/// files is a no-op because only NEW rows are ever considered.
#[derive(Debug, Clone)]
pub struct DedupRunner {
    catalog: Catalog,
    source_dir: PathBuf,
    duplicates_dir: PathBuf,
    move_duplicates: bool,
    state: Arc<RwLock<DedupSnapshot>>,
    gate: Arc<Mutex<()>>,
}

impl DedupRunner {
    pub fn new(catalog: Catalog, settings: &Settings) -> Self {
        Self {
            catalog,
            source_dir: settings.paths.source_dir.clone(),
            duplicates_dir: settings.paths.duplicates_dir.clone(),
            move_duplicates: settings.dedup.move_duplicates,
            state: Arc::new(RwLock::new(DedupSnapshot::default())),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub async fn status(&self) -> DedupSnapshot {
        self.state.read().await.clone()
    }

    /// Kick off a background pass. Returns false when one is already
    /// running; the caller is expected to poll [`DedupRunner::status`].
    pub fn spawn(&self) -> bool {
        let Ok(guard) = self.gate.clone().try_lock_owned() else {
            return false;
        };
        let runner = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(error) = runner.run_locked().await {
                warn!(%error, "dedup pass failed");
            }
        });
        true
    }

    /// Run a full pass to completion, waiting for any in-flight pass to
    /// finish first.
    pub async fn run(&self) -> Result<DedupSnapshot> {
        let _guard = self.gate.lock().await;
        self.run_locked().await
    }

    async fn run_locked(&self) -> Result<DedupSnapshot> {
        {
            let mut state = self.state.write().await;
            *state = DedupSnapshot {
                running: true,
                ..DedupSnapshot::default()
            };
        }

        let result = self.process_pool().await;

        let mut state = self.state.write().await;
        state.running = false;
        if let Err(error) = &result {
            state.error = Some(error.to_string());
        }
        result?;
        Ok(state.clone())
    }

    async fn process_pool(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.source_dir).await? {
            return Err(PipelineError::Config(format!(
                "source directory does not exist: {}",
                self.source_dir.display()
            )));
        }

        let discovered = self.discover().await?;
        {
            let mut state = self.state.write().await;
            state.total_files = discovered.len() as u64;
        }

        let files = self.catalog.files();
        for path in discovered {
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!(path = %path.display(), %error, "file vanished before hashing");
                    continue;
                }
            };

            let path_text = path.to_string_lossy().into_owned();
            files
                .upsert_discovered(
                    &path_text,
                    metadata.len() as i64,
                    metadata.created().ok().map(epoch_secs),
                    metadata.modified().ok().map(epoch_secs),
                )
                .await?;
            let Some(record) = files.get_by_path(&path_text).await? else {
                continue;
            };

            // Only NEW rows get hashed; anything already split or in
            // flight from an earlier pass is just counted.
            match record.status {
                FileStatus::New => {}
                FileStatus::Unique => {
                    let mut state = self.state.write().await;
                    state.processed_files += 1;
                    state.unique_files += 1;
                    continue;
                }
                FileStatus::Duplicate => {
                    let mut state = self.state.write().await;
                    state.processed_files += 1;
                    state.duplicate_files += 1;
                    continue;
                }
                other => {
                    warn!(path = %path_text, status = %other, "unexpected status under source pool");
                    let mut state = self.state.write().await;
                    state.processed_files += 1;
                    continue;
                }
            }

            match digest::hash_file(&path).await {
                Ok(sha256) => {
                    if files.digest_known(&sha256).await? {
                        files.mark_duplicate(record.id, &sha256).await?;
                        let quarantined = if self.move_duplicates {
                            self.quarantine(record.id, &path).await?
                        } else {
                            true
                        };
                        let mut state = self.state.write().await;
                        if quarantined {
                            state.duplicate_files += 1;
                        } else {
                            state.error_files += 1;
                        }
                        state.processed_files += 1;
                        state.last_processed = Some(path_text);
                    } else {
                        files.mark_unique(record.id, &sha256).await?;
                        let mut state = self.state.write().await;
                        state.unique_files += 1;
                        state.processed_files += 1;
                        state.last_processed = Some(path_text);
                    }
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "failed to hash file");
                    files.mark_error(record.id, &error.to_string()).await?;
                    let mut state = self.state.write().await;
                    state.error_files += 1;
                    state.processed_files += 1;
                    state.last_processed = Some(path_text);
                }
            }
        }

        let state = self.state.read().await.clone();
        info!(
            processed = state.processed_files,
            unique = state.unique_files,
            duplicates = state.duplicate_files,
            errors = state.error_files,
            "dedup pass complete"
        );
        self.catalog
            .events()
            .record(
                "dedup",
                EventLevel::Info,
                "dedup pass complete",
                Some(json!({
                    "total": state.total_files,
                    "processed": state.processed_files,
                    "unique": state.unique_files,
                    "duplicates": state.duplicate_files,
                    "errors": state.error_files,
                })),
            )
            .await?;
        Ok(())
    }

    /// Move a duplicate out of the pool, preserving its path relative to
    /// the source root and suffixing on name collisions. A failed move
    /// demotes the file to ERROR and leaves it where it is; returns
    /// whether the file is still a healthy duplicate.
    async fn quarantine(&self, file_id: i64, path: &Path) -> Result<bool> {
        let relative = fsops::relative_to_root(path, &self.source_dir);
        let destination = self.duplicates_dir.join(relative);
        let destination = fsops::resolve_collision(&destination).await?;
        match fsops::move_file(path, &destination).await {
            Ok(()) => {
                self.catalog
                    .files()
                    .update_path(file_id, &destination.to_string_lossy())
                    .await?;
                Ok(true)
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to quarantine duplicate");
                self.catalog
                    .files()
                    .mark_error(file_id, &format!("quarantine move failed: {error}"))
                    .await?;
                Ok(false)
            }
        }
    }

    async fn discover(&self) -> Result<Vec<PathBuf>> {
        let mut stack = vec![self.source_dir.clone()];
        let mut found = Vec::new();
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() {
                    found.push(entry.path());
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

fn epoch_secs(time: std::time::SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
