use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::capture;
use crate::catalog::{BatchStatus, Catalog, EventLevel, FileRecord, FileStatus};
use crate::error::{PipelineError, Result};
use crate::fsops;
use crate::settings::Settings;

/// Outcome of one sort pass over a batch. `started` is false when the
/// batch was already sorted or another pass claimed it first.
#[derive(Debug, Clone, Serialize)]
pub struct SortReport {
    pub batch_id: i64,
    pub batch: String,
    pub started: bool,
    pub total_files: usize,
    pub sorted_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
}

impl SortReport {
    fn not_started(batch_id: i64, batch: &str) -> Self {
        Self {
            batch_id,
            batch: batch.to_string(),
            started: false,
            total_files: 0,
            sorted_files: 0,
            failed_files: 0,
            skipped_files: 0,
        }
    }
}

enum FileOutcome {
    Sorted,
    /// Left as-is for a later pass; the reason is logged, not persisted.
    Skipped,
    Failed(PipelineError),
}

/// Moves the files of a synced batch into date-based archive folders,
/// resolving the capture date from the catalog, EXIF metadata or the
/// filesystem modification time.
#[derive(Debug, Clone)]
pub struct SortRunner {
    catalog: Catalog,
    sorted_dir: PathBuf,
    folder_pattern: String,
    modified_fallback: bool,
}

impl SortRunner {
    pub fn new(catalog: Catalog, settings: &Settings) -> Self {
        Self {
            catalog,
            sorted_dir: settings.paths.sorted_dir.clone(),
            folder_pattern: settings.sorter.folder_pattern.clone(),
            modified_fallback: settings.sorter.modified_fallback,
        }
    }

    /// SYNCED -> SORTING, then per-file moves. A pass over a batch that
    /// is already SORTING resumes its outstanding files. A file that
    /// cannot be moved is marked ERROR and keeps its batch membership;
    /// a file without a determinable capture date stays SYNCED for a
    /// later pass. The batch ends SORTED only when every member is.
    pub async fn sort_batch(&self, batch_id: i64) -> Result<SortReport> {
        let batches = self.catalog.batches();
        let files = self.catalog.files();

        let record = batches
            .get(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;

        match record.status {
            BatchStatus::Synced => {
                if !batches.begin_sort(batch_id).await? {
                    return Ok(SortReport::not_started(batch_id, &record.name));
                }
            }
            BatchStatus::Sorting => {
                // Resume: a previous pass left dateless files behind.
            }
            BatchStatus::Sorted => {
                return Ok(SortReport::not_started(batch_id, &record.name));
            }
            other => {
                return Err(PipelineError::InvalidState(format!(
                    "cannot sort batch '{}' in status {other}",
                    record.name
                )));
            }
        }

        let members = files.list_for_batch(batch_id).await?;
        let mut report = SortReport {
            batch_id,
            batch: record.name.clone(),
            started: true,
            total_files: members.len(),
            sorted_files: 0,
            failed_files: 0,
            skipped_files: 0,
        };

        for member in &members {
            // The listing can be stale by the time we get here.
            let Some(current) = files.get(member.id).await? else {
                report.skipped_files += 1;
                continue;
            };

            match current.status {
                FileStatus::Synced => {}
                FileStatus::Sorted => {
                    report.skipped_files += 1;
                    continue;
                }
                other => {
                    warn!(path = %current.path, status = %other, "file not ready for sorting");
                    report.skipped_files += 1;
                    continue;
                }
            }

            match self.sort_file(&current).await {
                FileOutcome::Sorted => report.sorted_files += 1,
                FileOutcome::Skipped => report.skipped_files += 1,
                FileOutcome::Failed(error) => {
                    warn!(path = %current.path, %error, "sort failed");
                    files.mark_error(current.id, &error.to_string()).await?;
                    report.failed_files += 1;
                }
            }
        }

        self.settle_batch(batch_id, &record.name, &report).await?;
        Ok(report)
    }

    /// Decide the batch status from the member rows after a pass.
    async fn settle_batch(
        &self,
        batch_id: i64,
        name: &str,
        report: &SortReport,
    ) -> Result<()> {
        let batches = self.catalog.batches();
        let members = self.catalog.files().list_for_batch(batch_id).await?;
        let errored = members
            .iter()
            .filter(|f| f.status == FileStatus::Error)
            .count();
        let unsorted = members
            .iter()
            .filter(|f| f.status != FileStatus::Sorted)
            .count();

        if errored > 0 {
            let reason = format!("{errored} of {} file(s) failed to sort", members.len());
            batches.mark_error(batch_id, &reason).await?;
            self.catalog
                .events()
                .record(
                    "sort",
                    EventLevel::Error,
                    &format!("sort of batch '{name}' incomplete: {reason}"),
                    Some(json!({ "batch_id": batch_id })),
                )
                .await?;
        } else if unsorted == 0 {
            batches.mark_sorted(batch_id).await?;
            info!(
                batch = %name,
                sorted = report.sorted_files,
                skipped = report.skipped_files,
                "batch sorted"
            );
            self.catalog
                .events()
                .record(
                    "sort",
                    EventLevel::Info,
                    &format!("batch '{name}' sorted"),
                    Some(json!({
                        "batch_id": batch_id,
                        "sorted": report.sorted_files,
                        "skipped": report.skipped_files,
                    })),
                )
                .await?;
        } else {
            // Stays SORTING; another pass can pick the stragglers up.
            warn!(batch = %name, outstanding = unsorted, "sort pass left files behind");
            self.catalog
                .events()
                .record(
                    "sort",
                    EventLevel::Warning,
                    &format!(
                        "sort of batch '{name}' left {unsorted} file(s) without a capture date"
                    ),
                    Some(json!({ "batch_id": batch_id })),
                )
                .await?;
        }
        Ok(())
    }

    async fn sort_file(&self, member: &FileRecord) -> FileOutcome {
        match self.try_sort_file(member).await {
            Ok(outcome) => outcome,
            Err(error) => FileOutcome::Failed(error),
        }
    }

    async fn try_sort_file(&self, member: &FileRecord) -> Result<FileOutcome> {
        let source = PathBuf::from(&member.path);
        if !tokio::fs::try_exists(&source).await? {
            return Ok(FileOutcome::Failed(PipelineError::InvalidState(format!(
                "source file missing: {}",
                source.display()
            ))));
        }

        let Some(capture) = self.capture_date(member, &source).await? else {
            warn!(path = %member.path, "no capture date; leaving for a later pass");
            return Ok(FileOutcome::Skipped);
        };

        let folder = render_date_path(&self.folder_pattern, capture);
        let file_name = source.file_name().ok_or_else(|| {
            PipelineError::InvalidState(format!(
                "path has no file name: {}",
                source.display()
            ))
        })?;

        let candidate = self.sorted_dir.join(&folder).join(file_name);
        let destination = fsops::resolve_collision(&candidate).await?;
        fsops::move_file(&source, &destination).await?;

        let files = self.catalog.files();
        let target = destination.to_string_lossy().into_owned();
        files.mark_sorted(member.id, &target).await?;
        files.update_path(member.id, &target).await?;
        Ok(FileOutcome::Sorted)
    }

    /// Stored catalog timestamp first, then an EXIF read (cached back to
    /// the catalog), then the filesystem mtime when the fallback is on.
    async fn capture_date(
        &self,
        member: &FileRecord,
        source: &Path,
    ) -> Result<Option<DateTime<Utc>>> {
        if let Some(stored) = member.capture_time {
            return Ok(Some(stored));
        }

        if let Some(read) = capture::read_capture_time(source).await {
            self.catalog
                .files()
                .set_capture_time(member.id, read)
                .await?;
            return Ok(Some(read));
        }

        if self.modified_fallback {
            let metadata = tokio::fs::metadata(source).await?;
            let modified = metadata.modified()?;
            return Ok(Some(DateTime::<Utc>::from(modified)));
        }

        Ok(None)
    }
}

/// Render a `{year}/{month}/{day}` style pattern into a relative archive
/// path. Month and day are always zero padded to two digits; explicit
/// width spellings like `{month:02d}` are accepted as aliases.
pub fn render_date_path(pattern: &str, date: DateTime<Utc>) -> String {
    let year = format!("{:04}", date.year());
    let month = format!("{:02}", date.month());
    let day = format!("{:02}", date.day());
    pattern
        .replace("{year:04d}", &year)
        .replace("{year}", &year)
        .replace("{month:02d}", &month)
        .replace("{month}", &month)
        .replace("{day:02d}", &day)
        .replace("{day}", &day)
}
