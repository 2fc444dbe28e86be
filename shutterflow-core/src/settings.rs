use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{PipelineError, Result};

const GIB: f64 = (1024u64 * 1024 * 1024) as f64;

/// Resolved runtime settings for the whole pipeline.
///
/// Construction and file/env layering live in the server crate; the core
/// only sees the final values.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub paths: PathSettings,
    pub catalog: CatalogSettings,
    pub batch: BatchSettings,
    pub dedup: DedupSettings,
    pub syncthing: SyncthingSettings,
    pub sorter: SorterSettings,
    pub cleanup: CleanupSettings,
    pub pipeline: PipelineSettings,
}

impl Settings {
    /// Reject degenerate values before any stage is allowed to mutate state.
    pub fn validate(&self) -> Result<()> {
        match self.batch.selection_mode {
            SelectionMode::Size if self.batch.max_size_gb <= 0.0 => {
                return Err(PipelineError::Config(format!(
                    "batch.max_size_gb must be positive in size mode, got {}",
                    self.batch.max_size_gb
                )));
            }
            SelectionMode::Count if self.batch.max_files == 0 => {
                return Err(PipelineError::Config(
                    "batch.max_files must be positive in count mode".to_string(),
                ));
            }
            _ => {}
        }

        if !self.batch.naming_pattern.contains("{index") {
            return Err(PipelineError::Config(format!(
                "batch.naming_pattern must contain an {{index}} placeholder, got {:?}",
                self.batch.naming_pattern
            )));
        }

        Url::parse(&self.syncthing.api_url).map_err(|e| {
            PipelineError::Config(format!(
                "syncthing.api_url is not a valid URL ({}): {e}",
                self.syncthing.api_url
            ))
        })?;

        if self.pipeline.poll_samples == 0 {
            return Err(PipelineError::Config(
                "pipeline.poll_samples must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.paths.duplicates_dir)?;
        std::fs::create_dir_all(&self.paths.batch_dir)?;
        std::fs::create_dir_all(&self.paths.sorted_dir)?;
        std::fs::create_dir_all(&self.paths.temp_dir)?;
        if let Some(parent) = self.catalog.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            paths: PathSettings::default(),
            catalog: CatalogSettings::default(),
            batch: BatchSettings::default(),
            dedup: DedupSettings::default(),
            syncthing: SyncthingSettings::default(),
            sorter: SorterSettings::default(),
            cleanup: CleanupSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Shared key for the HTTP surface; `None` disables auth entirely.
    pub api_key: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathSettings {
    pub source_dir: PathBuf,
    pub duplicates_dir: PathBuf,
    pub batch_dir: PathBuf,
    pub sorted_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("/mnt/nas/photos_raw"),
            duplicates_dir: PathBuf::from("/mnt/nas/duplicates"),
            batch_dir: PathBuf::from("/mnt/nas/syncthing/upload"),
            sorted_dir: PathBuf::from("/mnt/nas/photos_sorted"),
            temp_dir: PathBuf::from("/var/lib/shutterflow/temp"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub db_path: PathBuf,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/shutterflow/catalog.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Fill each batch up to `max_size_gb`.
    Size,
    /// Fill each batch up to `max_files` entries.
    Count,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_size_gb: f64,
    pub naming_pattern: String,
    pub selection_mode: SelectionMode,
    pub max_files: u32,
    /// When false (the default), batch creation is serialized behind the
    /// sequential guard: a new batch only forms once the previous one is
    /// fully sorted.
    pub allow_parallel: bool,
}

impl BatchSettings {
    pub fn size_budget_bytes(&self) -> u64 {
        (self.max_size_gb * GIB) as u64
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_size_gb: 15.0,
            naming_pattern: "batch_{index:03}".to_string(),
            selection_mode: SelectionMode::Size,
            max_files: 0,
            allow_parallel: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupSettings {
    /// Move later copies of a known digest into `duplicates_dir` instead of
    /// leaving them in place.
    pub move_duplicates: bool,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            move_duplicates: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncthingSettings {
    pub api_url: String,
    pub api_key: String,
    pub folder_id: String,
    /// Completion is scoped to this device when set; otherwise the minimum
    /// across all reported devices wins.
    pub device_id: Option<String>,
    pub timeout_secs: u64,
    /// Grace period between requesting a rescan and the first poll.
    pub rescan_settle_secs: u64,
}

impl Default for SyncthingSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8384/rest".to_string(),
            api_key: String::new(),
            folder_id: String::new(),
            device_id: None,
            timeout_secs: 10,
            rescan_settle_secs: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SorterSettings {
    pub folder_pattern: String,
    /// Fall back to filesystem mtime when no embedded capture time exists.
    pub modified_fallback: bool,
}

impl Default for SorterSettings {
    fn default() -> Self {
        Self {
            folder_pattern: "{year}/{month}/{day}".to_string(),
            modified_fallback: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub temp_retention_days: u32,
    pub log_max_bytes: u64,
    pub log_dir: Option<PathBuf>,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            temp_retention_days: 7,
            log_max_bytes: 5 * 1024 * 1024,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub poll_interval_secs: u64,
    /// Upper bound on completion polls per cycle; the cycle reports the
    /// batch as still syncing once the budget is spent.
    pub poll_samples: u32,
    pub post_sync_delay_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            poll_samples: 25,
            post_sync_delay_secs: 0,
        }
    }
}

impl PathSettings {
    /// Root every pipeline directory under `root`. Used by the CLI's
    /// relative-root mode and by tests working in scratch directories.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            source_dir: root.join("source"),
            duplicates_dir: root.join("duplicates"),
            batch_dir: root.join("batches"),
            sorted_dir: root.join("sorted"),
            temp_dir: root.join("temp"),
        }
    }
}
