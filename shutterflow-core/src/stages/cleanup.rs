use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::catalog::{BatchStatus, Catalog, EventLevel};
use crate::error::Result;
use crate::manifest;
use crate::settings::Settings;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Everything a cleanup pass touched. Purely advisory housekeeping:
/// cleanup never writes a file or batch status transition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed_batch_dirs: Vec<String>,
    pub deleted_temp_files: Vec<String>,
    pub rotated_logs: Vec<String>,
}

/// Reclaims batch directories whose batch finished sorting, prunes stale
/// temp files and rotates oversized logs.
#[derive(Debug, Clone)]
pub struct CleanupRunner {
    catalog: Catalog,
    batch_dir: PathBuf,
    temp_dir: PathBuf,
    log_dir: Option<PathBuf>,
    retention: Duration,
    log_max_bytes: u64,
    batch_name_regex: Option<Regex>,
}

impl CleanupRunner {
    pub fn new(catalog: Catalog, settings: &Settings) -> Self {
        Self {
            catalog,
            batch_dir: settings.paths.batch_dir.clone(),
            temp_dir: settings.paths.temp_dir.clone(),
            log_dir: settings.cleanup.log_dir.clone(),
            retention: Duration::from_secs(
                u64::from(settings.cleanup.temp_retention_days) * SECS_PER_DAY,
            ),
            log_max_bytes: settings.cleanup.log_max_bytes,
            batch_name_regex: batch_name_regex(&settings.batch.naming_pattern),
        }
    }

    pub async fn run(&self) -> Result<CleanupReport> {
        let report = CleanupReport {
            removed_batch_dirs: self.purge_batch_dirs().await?,
            deleted_temp_files: self.prune_temp_files().await?,
            rotated_logs: self.rotate_logs().await?,
        };

        info!(
            batch_dirs = report.removed_batch_dirs.len(),
            temp_files = report.deleted_temp_files.len(),
            logs = report.rotated_logs.len(),
            "cleanup pass complete"
        );
        self.catalog
            .events()
            .record(
                "cleanup",
                EventLevel::Info,
                "cleanup pass complete",
                Some(json!({
                    "batch_dirs": report.removed_batch_dirs.len(),
                    "temp_files": report.deleted_temp_files.len(),
                    "logs": report.rotated_logs.len(),
                })),
            )
            .await?;
        Ok(report)
    }

    /// A directory is reclaimed only when its batch row says SORTED (the
    /// manifest left behind by sorting is tolerated), or when no row
    /// exists, the name matches the naming pattern and the directory is
    /// literally empty. In-flight batches are never touched.
    async fn purge_batch_dirs(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        if !tokio::fs::try_exists(&self.batch_dir).await? {
            return Ok(removed);
        }

        let batches = self.catalog.batches();
        let mut entries = tokio::fs::read_dir(&self.batch_dir).await?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                candidates.push(entry.path());
            }
        }
        candidates.sort();

        for candidate in candidates {
            let Some(name) = candidate.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            let reclaim = match batches.get_by_name(name).await? {
                Some(batch) if batch.status == BatchStatus::Sorted => {
                    dir_holds_at_most_manifest(&candidate).await?
                }
                Some(_) => false,
                None => self.matches_batch_name(name) && dir_is_empty(&candidate).await?,
            };
            if !reclaim {
                continue;
            }

            match tokio::fs::remove_dir_all(&candidate).await {
                Ok(()) => {
                    info!(path = %candidate.display(), "removed batch directory");
                    removed.push(candidate.to_string_lossy().into_owned());
                }
                Err(error) => {
                    warn!(path = %candidate.display(), %error, "failed to remove batch directory");
                }
            }
        }
        Ok(removed)
    }

    async fn prune_temp_files(&self) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        if !tokio::fs::try_exists(&self.temp_dir).await? {
            return Ok(deleted);
        }

        let threshold = SystemTime::now()
            .checked_sub(self.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut stack = vec![self.temp_dir.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(path = %dir.display(), %error, "failed to read temp directory");
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                if modified > threshold {
                    continue;
                }
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        info!(path = %path.display(), "removed stale temp file");
                        deleted.push(path.to_string_lossy().into_owned());
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => {
                        warn!(path = %path.display(), %error, "failed to remove temp file");
                    }
                }
            }
        }
        Ok(deleted)
    }

    /// `<name>.log` over the size threshold becomes `<name>.log.1`,
    /// replacing any previous rotation, and an empty log takes its place.
    async fn rotate_logs(&self) -> Result<Vec<String>> {
        let mut rotated = Vec::new();
        let Some(log_dir) = &self.log_dir else {
            return Ok(rotated);
        };
        if !tokio::fs::try_exists(log_dir).await? {
            return Ok(rotated);
        }

        let mut entries = tokio::fs::read_dir(log_dir).await?;
        let mut logs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("log")
                && entry.file_type().await?.is_file()
            {
                logs.push(path);
            }
        }
        logs.sort();

        for log in logs {
            let Ok(metadata) = tokio::fs::metadata(&log).await else {
                continue;
            };
            if metadata.len() < self.log_max_bytes {
                continue;
            }

            let Some(file_name) = log.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let target = log.with_file_name(format!("{file_name}.1"));
            match tokio::fs::rename(&log, &target).await {
                Ok(()) => {
                    drop(tokio::fs::File::create(&log).await?);
                    info!(path = %log.display(), rotated = %target.display(), "rotated log");
                    rotated.push(target.to_string_lossy().into_owned());
                }
                Err(error) => {
                    warn!(path = %log.display(), %error, "failed to rotate log");
                }
            }
        }
        Ok(rotated)
    }

    fn matches_batch_name(&self, name: &str) -> bool {
        self.batch_name_regex
            .as_ref()
            .is_some_and(|regex| regex.is_match(name))
    }
}

/// Turn a naming pattern like `batch_{index:03}` into an anchored regex
/// matching the names it can produce. Patterns without an `{index}`
/// token yield no regex, so unknown directories are left alone.
fn batch_name_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern);
    let token = Regex::new(r"\\\{index.*?\}").ok()?;
    let source = match token.replace(&escaped, r"\d+") {
        std::borrow::Cow::Borrowed(_) => return None,
        std::borrow::Cow::Owned(source) => source,
    };
    Regex::new(&format!("^{source}$")).ok()
}

async fn dir_is_empty(dir: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}

async fn dir_holds_at_most_manifest(dir: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() != manifest::FILE_NAME {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_pattern_compiles_to_anchored_regex() {
        let regex = batch_name_regex("batch_{index:03}").unwrap();
        assert!(regex.is_match("batch_001"));
        assert!(regex.is_match("batch_1234"));
        assert!(!regex.is_match("batch_001_old"));
        assert!(!regex.is_match("holiday"));
    }

    #[test]
    fn pattern_without_index_token_yields_none() {
        assert!(batch_name_regex("batches").is_none());
    }

    #[tokio::test]
    async fn empty_and_manifest_only_checks() {
        let dir = tempfile::tempdir().unwrap();
        assert!(dir_is_empty(dir.path()).await.unwrap());
        assert!(dir_holds_at_most_manifest(dir.path()).await.unwrap());

        tokio::fs::write(dir.path().join(manifest::FILE_NAME), b"{}")
            .await
            .unwrap();
        assert!(!dir_is_empty(dir.path()).await.unwrap());
        assert!(dir_holds_at_most_manifest(dir.path()).await.unwrap());

        tokio::fs::write(dir.path().join("left_behind.jpg"), b"x")
            .await
            .unwrap();
        assert!(!dir_holds_at_most_manifest(dir.path()).await.unwrap());
    }
}
