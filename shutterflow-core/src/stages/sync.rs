use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::catalog::{BatchRecord, BatchStatus, Catalog, EventLevel};
use crate::error::{PipelineError, Result};
use crate::settings::Settings;
use crate::syncthing::ReplicationApi;

/// Result of a sync-start request. `started` is false when the batch was
/// already syncing or synced; starting is idempotent.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStart {
    pub started: bool,
    pub batch: BatchRecord,
}

/// Outcome of one refresh pass over every SYNCING batch. Failures are
/// isolated per batch: one unreachable poll never stops the others.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    pub examined: usize,
    pub synced: usize,
    pub still_syncing: usize,
    pub failed: usize,
}

/// Drives batches through replication: requests rescans, polls folder
/// completion, caches progress on the batch row and fans SYNCED out to
/// the member files exactly once.
#[derive(Clone)]
pub struct SyncTracker {
    catalog: Catalog,
    api: Arc<dyn ReplicationApi>,
    batch_dir: PathBuf,
    folder_id: Option<String>,
    device_id: Option<String>,
}

impl std::fmt::Debug for SyncTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTracker")
            .field("batch_dir", &self.batch_dir)
            .field("folder_id", &self.folder_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl SyncTracker {
    pub fn new(
        catalog: Catalog,
        api: Arc<dyn ReplicationApi>,
        settings: &Settings,
    ) -> Self {
        let folder_id = match settings.syncthing.folder_id.trim() {
            "" => None,
            folder => Some(folder.to_string()),
        };
        Self {
            catalog,
            api,
            batch_dir: settings.paths.batch_dir.clone(),
            folder_id,
            device_id: settings.syncthing.device_id.clone(),
        }
    }

    /// PENDING -> SYNCING plus a rescan request so the replication service
    /// notices the staged files promptly.
    pub async fn start(&self, batch_id: i64) -> Result<SyncStart> {
        let batches = self.catalog.batches();
        let record = batches
            .get(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;

        match record.status {
            BatchStatus::Pending => {}
            BatchStatus::Syncing | BatchStatus::Synced => {
                return Ok(SyncStart {
                    started: false,
                    batch: record,
                });
            }
            other => {
                return Err(PipelineError::InvalidState(format!(
                    "cannot start sync for batch '{}' in status {other}",
                    record.name
                )));
            }
        }

        let batch_path = self.batch_dir.join(&record.name);
        if !tokio::fs::try_exists(&batch_path).await? {
            return Err(PipelineError::InvalidState(format!(
                "batch directory missing: {}",
                batch_path.display()
            )));
        }

        if !batches.begin_sync(batch_id).await? {
            // Lost the transition race; report whatever state won.
            let record = batches
                .get(batch_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;
            return Ok(SyncStart {
                started: false,
                batch: record,
            });
        }

        let rescan = match &self.folder_id {
            Some(folder) => {
                self.api
                    .rescan_folder(folder, &[record.name.clone()])
                    .await
            }
            None => {
                self.api
                    .rescan_path(&batch_path.to_string_lossy())
                    .await
            }
        };
        if let Err(error) = rescan {
            // Stay SYNCING: Syncthing rescans on its own schedule, so a
            // failed nudge is surfaced but not fatal.
            warn!(batch = %record.name, %error, "rescan request failed");
            batches
                .record_sync_error(batch_id, &error.to_string())
                .await?;
            return Err(error.into());
        }

        info!(batch = %record.name, "sync started");
        self.catalog
            .events()
            .record(
                "sync",
                EventLevel::Info,
                &format!("sync started for batch '{}'", record.name),
                Some(json!({ "batch_id": batch_id })),
            )
            .await?;

        let record = batches
            .get(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;
        Ok(SyncStart {
            started: true,
            batch: record,
        })
    }

    /// Consult the replication service for a SYNCING batch and apply the
    /// observation. SYNCED is terminal: once reached, polling never
    /// consults the service again and no later observation can regress
    /// the batch. Non-SYNCING batches report their cached row as-is.
    pub async fn poll(&self, batch_id: i64) -> Result<BatchRecord> {
        let batches = self.catalog.batches();
        let record = batches
            .get(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;

        if record.status != BatchStatus::Syncing {
            return Ok(record);
        }

        let folder = self.folder_id.as_deref().unwrap_or(&record.name);
        let completion = self
            .api
            .folder_completion(folder, self.device_id.as_deref())
            .await;

        match completion {
            Ok(percent) if percent >= 100.0 => {
                if batches.mark_synced(batch_id).await? {
                    info!(batch = %record.name, "batch synced");
                    self.catalog
                        .events()
                        .record(
                            "sync",
                            EventLevel::Info,
                            &format!("batch '{}' fully replicated", record.name),
                            Some(json!({ "batch_id": batch_id })),
                        )
                        .await?;
                }
            }
            Ok(percent) => {
                batches.record_progress(batch_id, percent).await?;
            }
            Err(error) => {
                // Classified upstream: auth failures carry remediation
                // text, connectivity failures the transport detail. Both
                // leave the batch SYNCING for the next attempt.
                warn!(batch = %record.name, %error, "completion poll failed");
                batches
                    .record_sync_error(batch_id, &error.to_string())
                    .await?;
                self.catalog
                    .events()
                    .record(
                        "sync",
                        EventLevel::Warning,
                        &format!(
                            "completion poll failed for batch '{}': {error}",
                            record.name
                        ),
                        Some(json!({ "batch_id": batch_id })),
                    )
                    .await?;
                return Err(error.into());
            }
        }

        batches
            .get(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))
    }

    /// Poll every SYNCING batch once, isolating failures per batch.
    pub async fn refresh_all(&self) -> Result<RefreshSummary> {
        let syncing = self
            .catalog
            .batches()
            .list_with_status(BatchStatus::Syncing)
            .await?;

        let mut summary = RefreshSummary {
            examined: syncing.len(),
            ..RefreshSummary::default()
        };

        let polls = syncing.iter().map(|record| self.poll(record.id));
        for (record, outcome) in syncing.iter().zip(futures::future::join_all(polls).await)
        {
            match outcome {
                Ok(refreshed) if refreshed.status == BatchStatus::Synced => {
                    summary.synced += 1;
                }
                Ok(_) => summary.still_syncing += 1,
                Err(error) => {
                    warn!(batch = %record.name, %error, "refresh failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
