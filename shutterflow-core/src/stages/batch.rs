use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::catalog::{
    BatchMember, BatchRecord, BatchStatus, Catalog, EventLevel, FileRecord,
};
use crate::error::Result;
use crate::fsops;
use crate::manifest::{self, Manifest, ManifestEntry};
use crate::settings::{BatchSettings, SelectionMode, Settings};

/// Result of one batch-creation attempt. Never an `Err` for the ordinary
/// "nothing eligible" and "previous batch still in flight" cases; those
/// are outcomes, not failures.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Created { batch: BatchRecord },
    /// No selectable files right now.
    NothingToDo,
    /// Sequential guard: an earlier batch has not reached SORTED yet.
    Blocked {
        batch_id: i64,
        name: String,
        status: BatchStatus,
        reason: String,
    },
    /// A batch row exists but staging left it unusable.
    Failed {
        batch_id: i64,
        name: String,
        reason: String,
    },
}

/// Creates batches: deterministic selection within the configured budget,
/// claim-then-stage with per-file failure isolation, and a manifest
/// frozen next to the staged files.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    catalog: Catalog,
    source_dir: PathBuf,
    batch_dir: PathBuf,
    settings: BatchSettings,
}

impl BatchRunner {
    pub fn new(catalog: Catalog, settings: &Settings) -> Self {
        Self {
            catalog,
            source_dir: settings.paths.source_dir.clone(),
            batch_dir: settings.paths.batch_dir.clone(),
            settings: settings.batch.clone(),
        }
    }

    pub async fn create(&self) -> Result<BatchOutcome> {
        if !self.settings.allow_parallel {
            if let Some(blocker) = self.catalog.batches().first_unfinished().await? {
                let reason = format!(
                    "batch '{}' is still {}",
                    blocker.name,
                    blocker.status.as_str().to_lowercase()
                );
                info!(
                    batch = %blocker.name,
                    status = %blocker.status,
                    "batch creation blocked"
                );
                return Ok(BatchOutcome::Blocked {
                    batch_id: blocker.id,
                    name: blocker.name,
                    status: blocker.status,
                    reason,
                });
            }
        }

        let candidates = self.catalog.files().list_selectable().await?;
        let selected = select_within_budget(candidates, &self.settings);
        if selected.is_empty() {
            return Ok(BatchOutcome::NothingToDo);
        }

        let name = self.next_batch_name().await?;
        let members: Vec<BatchMember> = selected
            .iter()
            .map(|record| BatchMember {
                file_id: record.id,
                size: record.size,
            })
            .collect();

        let Some((batch, winners)) = self
            .catalog
            .batches()
            .create_with_members(&name, &members)
            .await?
        else {
            // Every claim lost to a parallel runner between selection and
            // the transaction; nothing was inserted.
            return Ok(BatchOutcome::NothingToDo);
        };

        let by_id: HashMap<i64, &FileRecord> =
            selected.iter().map(|record| (record.id, record)).collect();
        let batch_path = self.batch_dir.join(&name);
        tokio::fs::create_dir_all(&batch_path).await?;

        let files = self.catalog.files();
        let mut entries: Vec<ManifestEntry> = Vec::with_capacity(winners.len());
        let mut staged_bytes: i64 = 0;
        for file_id in winners {
            let Some(record) = by_id.get(&file_id) else {
                continue;
            };
            let source = PathBuf::from(&record.path);
            let relative = fsops::relative_to_root(&source, &self.source_dir);
            let destination = batch_path.join(&relative);

            if let Err(error) = fsops::move_file(&source, &destination).await {
                warn!(path = %source.display(), %error, "failed to stage file");
                files
                    .release_with_error(file_id, &format!("staging move failed: {error}"))
                    .await?;
                continue;
            }

            let destination_text = destination.to_string_lossy().into_owned();
            files.update_path(file_id, &destination_text).await?;
            staged_bytes += record.size;
            entries.push(ManifestEntry {
                source_path: record.path.clone(),
                batch_path: destination_text,
                relative_path: relative.to_string_lossy().into_owned(),
                size: record.size,
                sha256: record.sha256.clone(),
            });
        }

        if entries.is_empty() {
            let reason = "no files could be staged".to_string();
            self.catalog.batches().mark_error(batch.id, &reason).await?;
            self.catalog
                .events()
                .record(
                    "batch",
                    EventLevel::Error,
                    &format!("batch '{name}' failed: {reason}"),
                    Some(json!({ "batch_id": batch.id })),
                )
                .await?;
            return Ok(BatchOutcome::Failed {
                batch_id: batch.id,
                name,
                reason,
            });
        }

        let manifest = Manifest {
            batch: name.clone(),
            created_at: batch.created_at,
            file_count: entries.len(),
            size_bytes: staged_bytes,
            files: entries,
        };
        let manifest_path = batch_path.join(manifest::FILE_NAME);
        manifest.write(&manifest_path).await?;

        self.catalog
            .batches()
            .finalize_pending(
                batch.id,
                staged_bytes,
                manifest.file_count as i64,
                &manifest_path.to_string_lossy(),
            )
            .await?;

        let record = self
            .catalog
            .batches()
            .get(batch.id)
            .await?
            .unwrap_or(batch);
        info!(
            batch = %record.name,
            files = record.file_count,
            bytes = record.size_bytes,
            "created batch"
        );
        self.catalog
            .events()
            .record(
                "batch",
                EventLevel::Info,
                &format!("created batch '{}'", record.name),
                Some(json!({
                    "batch_id": record.id,
                    "files": record.file_count,
                    "bytes": record.size_bytes,
                })),
            )
            .await?;
        Ok(BatchOutcome::Created { batch: record })
    }

    /// First unused index per the naming pattern, checked against both the
    /// catalog and the filesystem; a leftover directory from a crashed run
    /// must not be reused.
    async fn next_batch_name(&self) -> Result<String> {
        let batches = self.catalog.batches();
        let mut index = 1u32;
        loop {
            let candidate = render_batch_name(&self.settings.naming_pattern, index);
            let in_catalog = batches.name_exists(&candidate).await?;
            let on_disk = tokio::fs::try_exists(&self.batch_dir.join(&candidate)).await?;
            if !in_catalog && !on_disk {
                return Ok(candidate);
            }
            index += 1;
        }
    }
}

/// Deterministic prefix of `candidates` (already path-ordered) that fits
/// the configured budget. In size mode an oversized file forms a
/// singleton batch when it leads the selection; skipping it forever would
/// wedge the pipeline behind it.
pub fn select_within_budget(
    candidates: Vec<FileRecord>,
    settings: &BatchSettings,
) -> Vec<FileRecord> {
    let mut selected = Vec::new();

    match settings.selection_mode {
        SelectionMode::Count => {
            let limit = settings.max_files as usize;
            selected.extend(candidates.into_iter().take(limit));
        }
        SelectionMode::Size => {
            let budget = settings.size_budget_bytes();
            let mut running: u64 = 0;
            for record in candidates {
                let size = record.size.max(0) as u64;
                if running + size > budget {
                    if selected.is_empty() {
                        selected.push(record);
                    }
                    break;
                }
                running += size;
                selected.push(record);
            }
        }
    }

    selected
}

/// Render `pattern` with the 1-based batch index, honoring an optional
/// zero-pad width as in `batch_{index:03}`.
pub fn render_batch_name(pattern: &str, index: u32) -> String {
    let Some(start) = pattern.find("{index") else {
        return format!("{pattern}_{index}");
    };
    let Some(end) = pattern[start..].find('}') else {
        return format!("{pattern}_{index}");
    };

    let spec = &pattern[start + "{index".len()..start + end];
    let rendered = spec
        .strip_prefix(":0")
        .and_then(|width| width.trim_end_matches('d').parse::<usize>().ok())
        .map(|width| format!("{index:0width$}"))
        .unwrap_or_else(|| index.to_string());

    format!(
        "{}{}{}",
        &pattern[..start],
        rendered,
        &pattern[start + end + 1..]
    )
}
