use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{BatchRecord, BatchStatus, Catalog, EventLevel, EventRecord};
use crate::error::{PipelineError, Result};
use crate::settings::Settings;
use crate::stages::{
    BatchOutcome, BatchRunner, CleanupRunner, DedupRunner, DedupSnapshot,
    RefreshSummary, SortRunner, SyncTracker,
};
use crate::syncthing::ReplicationApi;

const RECENT_BATCHES: i64 = 5;
const RECENT_EVENTS: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
    Warning,
    Error,
}

/// One stage's outcome within a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: &'static str,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl StepReport {
    fn completed(name: &'static str, data: serde_json::Value) -> Self {
        Self {
            name,
            status: StepStatus::Completed,
            message: None,
            data,
        }
    }

    fn skipped(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: StepStatus::Skipped,
            message: Some(message.into()),
            data: serde_json::Value::Null,
        }
    }

    fn warning(
        name: &'static str,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            name,
            status: StepStatus::Warning,
            message: Some(message.into()),
            data,
        }
    }

    fn failed(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: StepStatus::Error,
            message: Some(message.into()),
            data: serde_json::Value::Null,
        }
    }
}

/// Aggregate summary for one full pipeline cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    pub errors: Vec<String>,
}

/// Snapshot readable between and during runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub last_run: Option<RunReport>,
    /// Set when a run aborted before producing a report.
    pub last_error: Option<String>,
}

/// Which stage an operator retry re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPhase {
    Sync,
    Sort,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub batch_id: i64,
    pub batch: String,
    pub phase: RetryPhase,
    pub status: BatchStatus,
}

/// Aggregated dashboard view over every part of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub running: bool,
    pub dedup: DedupSnapshot,
    pub recent_batches: Vec<BatchRecord>,
    pub file_counts: BTreeMap<String, i64>,
    pub syncing: RefreshSummary,
    pub recent_events: Vec<EventRecord>,
    pub last_run: Option<RunReport>,
}

/// Sequences the stages of one archival cycle: dedup, guarded batch
/// creation, sync trigger plus bounded polling, sort, cleanup. Exactly
/// one cycle runs per process at a time; a second trigger is a no-op
/// that reports "not started". Every transition lands in the catalog
/// before the next stage begins, so a crashed run resumes from durable
/// state on the next trigger.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    catalog: Catalog,
    dedup: DedupRunner,
    batch: BatchRunner,
    sync: SyncTracker,
    sort: SortRunner,
    cleanup: CleanupRunner,
    poll_interval: Duration,
    poll_samples: u32,
    settle: Duration,
    post_sync_delay: Duration,
    state: Arc<tokio::sync::RwLock<PipelineStatus>>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl PipelineRunner {
    pub fn new(
        catalog: Catalog,
        api: Arc<dyn ReplicationApi>,
        settings: &Settings,
    ) -> Self {
        Self {
            dedup: DedupRunner::new(catalog.clone(), settings),
            batch: BatchRunner::new(catalog.clone(), settings),
            sync: SyncTracker::new(catalog.clone(), api, settings),
            sort: SortRunner::new(catalog.clone(), settings),
            cleanup: CleanupRunner::new(catalog.clone(), settings),
            catalog,
            poll_interval: Duration::from_secs(settings.pipeline.poll_interval_secs.max(1)),
            poll_samples: settings.pipeline.poll_samples.max(1),
            settle: Duration::from_secs(settings.syncthing.rescan_settle_secs),
            post_sync_delay: Duration::from_secs(settings.pipeline.post_sync_delay_secs),
            state: Arc::new(tokio::sync::RwLock::new(PipelineStatus::default())),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn dedup(&self) -> &DedupRunner {
        &self.dedup
    }

    pub fn batch(&self) -> &BatchRunner {
        &self.batch
    }

    pub fn sync(&self) -> &SyncTracker {
        &self.sync
    }

    pub fn sort(&self) -> &SortRunner {
        &self.sort
    }

    pub fn cleanup(&self) -> &CleanupRunner {
        &self.cleanup
    }

    pub async fn status(&self) -> PipelineStatus {
        self.state.read().await.clone()
    }

    /// Start a cycle in the background. Returns false without queuing
    /// when one is already running.
    pub async fn trigger(&self) -> bool {
        let Ok(permit) = self.gate.clone().try_lock_owned() else {
            return false;
        };
        self.state.write().await.running = true;

        let runner = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = runner.execute_cycle().await;
            runner.record_outcome(&outcome).await;
        });
        true
    }

    /// Run one cycle to completion, waiting for any in-flight cycle
    /// first.
    pub async fn run(&self) -> Result<RunReport> {
        let _permit = self.gate.clone().lock_owned().await;
        self.state.write().await.running = true;
        let outcome = self.execute_cycle().await;
        self.record_outcome(&outcome).await;
        outcome
    }

    async fn record_outcome(&self, outcome: &Result<RunReport>) {
        let mut state = self.state.write().await;
        state.running = false;
        match outcome {
            Ok(report) => {
                info!(
                    run = %report.run_id,
                    steps = report.steps.len(),
                    errors = report.errors.len(),
                    "pipeline run finished"
                );
                state.last_run = Some(report.clone());
                state.last_error = None;
            }
            Err(error) => {
                error!(%error, "pipeline run aborted");
                state.last_error = Some(error.to_string());
            }
        }
    }

    /// One full cycle. Stage-level problems become step reports; only a
    /// failure to reach the catalog itself aborts the cycle.
    async fn execute_cycle(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut steps: Vec<StepReport> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        info!(run = %run_id, "pipeline run started");
        self.catalog
            .events()
            .record(
                "pipeline",
                EventLevel::Info,
                "pipeline run started",
                Some(json!({ "run_id": run_id })),
            )
            .await?;

        self.push(&mut steps, &mut errors, self.dedup_step().await);

        let active = self.batch_phase(&mut steps, &mut errors).await?;

        match active {
            Some(batch_id) => {
                let synced = self.sync_phase(batch_id, &mut steps, &mut errors).await?;
                if synced {
                    if !self.post_sync_delay.is_zero() {
                        tokio::time::sleep(self.post_sync_delay).await;
                    }
                    self.push(&mut steps, &mut errors, self.sort_step(batch_id).await);
                } else {
                    self.push(
                        &mut steps,
                        &mut errors,
                        StepReport::skipped("sort", "sorting deferred until sync completes"),
                    );
                }
            }
            None => {
                self.push(
                    &mut steps,
                    &mut errors,
                    StepReport::skipped("sync", "no batch to sync"),
                );
                self.push(
                    &mut steps,
                    &mut errors,
                    StepReport::skipped("sort", "no batch to sort"),
                );
            }
        }

        self.push(&mut steps, &mut errors, self.cleanup_step().await);

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            steps,
            errors,
        };
        self.catalog
            .events()
            .record(
                "pipeline",
                EventLevel::Info,
                "pipeline run finished",
                Some(json!({ "run_id": run_id, "errors": report.errors.len() })),
            )
            .await?;
        Ok(report)
    }

    fn push(&self, steps: &mut Vec<StepReport>, errors: &mut Vec<String>, step: StepReport) {
        if matches!(step.status, StepStatus::Error | StepStatus::Warning) {
            if let Some(message) = &step.message {
                errors.push(format!("{}: {message}", step.name));
            }
        }
        steps.push(step);
    }

    async fn dedup_step(&self) -> StepReport {
        match self.dedup.run().await {
            Ok(snapshot) => {
                let data = serde_json::to_value(&snapshot).unwrap_or_default();
                StepReport::completed("dedup", data)
            }
            Err(error) => StepReport::failed("dedup", error.to_string()),
        }
    }

    /// Batch creation plus blocker remediation: a fully synced blocker
    /// is sorted out of the way and creation retried once. A PENDING or
    /// SYNCING blocker is adopted as this cycle's batch so the run
    /// skips straight to polling it.
    async fn batch_phase(
        &self,
        steps: &mut Vec<StepReport>,
        errors: &mut Vec<String>,
    ) -> Result<Option<i64>> {
        let outcome = self.batch.create().await?;
        match outcome {
            BatchOutcome::Created { ref batch } => {
                let id = batch.id;
                self.push(steps, errors, Self::batch_step(&outcome));
                Ok(Some(id))
            }
            BatchOutcome::NothingToDo | BatchOutcome::Failed { .. } => {
                self.push(steps, errors, Self::batch_step(&outcome));
                Ok(None)
            }
            BatchOutcome::Blocked {
                batch_id, status, ..
            } => {
                self.push(steps, errors, Self::batch_step(&outcome));
                match status {
                    BatchStatus::Synced => {
                        let sort = self.sort_step(batch_id).await;
                        let sorted = sort.status != StepStatus::Error;
                        self.push(steps, errors, sort);
                        if !sorted {
                            return Ok(None);
                        }
                        let retry = self.batch.create().await?;
                        let id = match &retry {
                            BatchOutcome::Created { batch } => Some(batch.id),
                            _ => None,
                        };
                        self.push(steps, errors, Self::batch_step(&retry));
                        Ok(id)
                    }
                    BatchStatus::Pending | BatchStatus::Syncing => Ok(Some(batch_id)),
                    _ => Ok(None),
                }
            }
        }
    }

    fn batch_step(outcome: &BatchOutcome) -> StepReport {
        let data = serde_json::to_value(outcome).unwrap_or_default();
        match outcome {
            BatchOutcome::Created { .. } => StepReport::completed("batch", data),
            BatchOutcome::NothingToDo => {
                StepReport::skipped("batch", "no eligible files for batching")
            }
            BatchOutcome::Blocked { reason, .. } => StepReport {
                name: "batch",
                status: StepStatus::Skipped,
                message: Some(reason.clone()),
                data,
            },
            BatchOutcome::Failed { reason, .. } => StepReport::failed("batch", reason.clone()),
        }
    }

    /// Start sync for the batch if needed, then poll on a bounded
    /// budget. Returns whether the batch reached SYNCED.
    async fn sync_phase(
        &self,
        batch_id: i64,
        steps: &mut Vec<StepReport>,
        errors: &mut Vec<String>,
    ) -> Result<bool> {
        let record = self
            .catalog
            .batches()
            .get(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;

        let started = match record.status {
            BatchStatus::Synced => {
                self.push(
                    steps,
                    errors,
                    StepReport::completed(
                        "sync",
                        json!({ "batch_id": batch_id, "batch": record.name, "progress": 100.0 }),
                    ),
                );
                return Ok(true);
            }
            BatchStatus::Pending => match self.sync.start(batch_id).await {
                Ok(start) => start.started,
                Err(error) => {
                    self.push(steps, errors, StepReport::failed("sync", error.to_string()));
                    return Ok(false);
                }
            },
            BatchStatus::Syncing => false,
            other => {
                self.push(
                    steps,
                    errors,
                    StepReport::skipped(
                        "sync",
                        format!("batch '{}' is {other}, not syncable", record.name),
                    ),
                );
                return Ok(false);
            }
        };

        if started && !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let mut last = self.catalog.batches().get(batch_id).await?;
        let mut poll_failures = 0u32;
        for attempt in 0..self.poll_samples {
            match self.sync.poll(batch_id).await {
                Ok(record) => {
                    if record.status == BatchStatus::Synced {
                        last = Some(record);
                        break;
                    }
                    last = Some(record);
                }
                Err(error) => {
                    // Transient by classification; the error is already
                    // on the batch row. Keep polling within the budget.
                    poll_failures += 1;
                    warn!(batch_id, %error, "sync poll failed");
                }
            }
            if attempt + 1 < self.poll_samples {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        let record = last.ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;
        let synced = record.status == BatchStatus::Synced;
        let data = json!({
            "batch_id": batch_id,
            "batch": record.name,
            "status": record.status,
            "progress": record.sync_progress,
            "synced_at": record.synced_at,
            "started": started,
            "poll_failures": poll_failures,
            "last_error": record.last_error,
        });
        if synced {
            self.push(steps, errors, StepReport::completed("sync", data));
        } else {
            self.push(
                steps,
                errors,
                StepReport::warning(
                    "sync",
                    "sync did not reach completion within the polling budget",
                    data,
                ),
            );
        }
        Ok(synced)
    }

    async fn sort_step(&self, batch_id: i64) -> StepReport {
        match self.sort.sort_batch(batch_id).await {
            Ok(report) => {
                let data = serde_json::to_value(&report).unwrap_or_default();
                if !report.started {
                    StepReport {
                        name: "sort",
                        status: StepStatus::Skipped,
                        message: Some("batch already sorted".to_string()),
                        data,
                    }
                } else if report.failed_files > 0 {
                    StepReport {
                        name: "sort",
                        status: StepStatus::Error,
                        message: Some(format!(
                            "{} of {} file(s) failed to sort",
                            report.failed_files, report.total_files
                        )),
                        data,
                    }
                } else {
                    StepReport::completed("sort", data)
                }
            }
            Err(error) => StepReport::failed("sort", error.to_string()),
        }
    }

    async fn cleanup_step(&self) -> StepReport {
        match self.cleanup.run().await {
            Ok(report) => {
                let data = serde_json::to_value(&report).unwrap_or_default();
                StepReport::completed("cleanup", data)
            }
            Err(error) => StepReport::failed("cleanup", error.to_string()),
        }
    }

    /// Operator retry for a batch in ERROR. The failed phase is derived
    /// from the stamped timestamps: a batch that was ever synced re-runs
    /// sorting, anything earlier re-enters the sync path from PENDING.
    pub async fn retry_batch(&self, batch_id: i64) -> Result<RetryOutcome> {
        let batches = self.catalog.batches();
        let record = batches
            .get(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;

        if record.status != BatchStatus::Error {
            return Err(PipelineError::InvalidState(format!(
                "batch '{}' is {} and cannot be retried",
                record.name, record.status
            )));
        }

        let phase = if record.synced_at.is_some() {
            self.catalog
                .files()
                .reset_errors_for_batch(batch_id)
                .await?;
            batches.reset_to_synced(batch_id).await?;
            self.sort.sort_batch(batch_id).await?;
            RetryPhase::Sort
        } else {
            batches.reset_to_pending(batch_id).await?;
            self.sync.start(batch_id).await?;
            RetryPhase::Sync
        };

        info!(batch = %record.name, ?phase, "batch retry requested");
        self.catalog
            .events()
            .record(
                "pipeline",
                EventLevel::Info,
                &format!("retry requested for batch '{}'", record.name),
                Some(json!({ "batch_id": batch_id, "phase": phase })),
            )
            .await?;

        let record = batches
            .get(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;
        Ok(RetryOutcome {
            batch_id,
            batch: record.name,
            phase,
            status: record.status,
        })
    }

    /// Dashboard aggregation: refreshes every SYNCING batch, then reads
    /// the rest from the catalog.
    pub async fn overview(&self) -> Result<Overview> {
        let status = self.status().await;
        let dedup = self.dedup.status().await;
        let syncing = self.sync.refresh_all().await?;
        let recent_batches = self.catalog.batches().recent(RECENT_BATCHES).await?;
        let recent_events = self.catalog.events().recent(RECENT_EVENTS).await?;
        let file_counts = self
            .catalog
            .files()
            .status_counts()
            .await?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        Ok(Overview {
            running: status.running,
            dedup,
            recent_batches,
            file_counts,
            syncing,
            recent_events,
            last_run: status.last_run,
        })
    }
}
